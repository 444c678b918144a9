//! The decision oracle: an external, untrusted, replaceable text generator.
//!
//! One-method capability interface. The engine renders a context, hands it
//! over, and gets raw text back with no guarantee beyond "it returned".
//! Timeouts, refusals and malformed output are all recovered by the decision
//! validator downstream.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::time::{sleep, Duration};

use crate::config::Config;
use crate::ledger::Agent;
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::market::MarketSnapshot;

/// Everything the oracle is shown for one tick. The validator later checks
/// market ids against this same snapshot.
pub struct DecisionContext<'a> {
    pub agent: &'a Agent,
    pub snapshot: &'a MarketSnapshot,
    pub max_items: usize,
}

impl DecisionContext<'_> {
    pub fn render(&self) -> String {
        let markets: Vec<String> = self
            .snapshot
            .markets
            .iter()
            .map(|m| format!("- {} (deadline {}): {}", m.id, m.deadline, m.question))
            .collect();
        let commitments: Vec<String> = self
            .snapshot
            .commitments
            .iter()
            .map(|c| format!("- {} on {} ({}), stake {}", c.id, c.market_id, c.side.as_str(), c.stake))
            .collect();
        format!(
            "You are {name}, an autonomous agent with balance {balance}. A per-tick \
existence cost applies whether or not you act.\n\n\
Open markets:\n{markets}\n\n\
Your pending commitments:\n{commitments}\n\n\
Reply with ONLY a JSON object. Either {{\"action\":\"pass\"}} or \
{{\"action\":\"stake\",\"items\":[{{\"market_id\":\"...\",\"side\":\"yes|no\",\
\"confidence\":0.0-1.0}}]}} with at most {max} items. Never state amounts; \
stake sizes are computed for you.",
            name = self.agent.display_name,
            balance = self.agent.balance,
            markets = if markets.is_empty() { "(none)".to_string() } else { markets.join("\n") },
            commitments =
                if commitments.is_empty() { "(none)".to_string() } else { commitments.join("\n") },
            max = self.max_items,
        )
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<String>;
}

#[derive(Clone, Copy, Debug)]
pub enum OracleKind {
    Http,
    Stub,
}

impl OracleKind {
    pub fn from_env() -> Self {
        match std::env::var("ORACLE").unwrap_or_else(|_| "stub".to_string()).as_str() {
            "http" => OracleKind::Http,
            _ => OracleKind::Stub,
        }
    }

    pub fn build(self, cfg: &Config) -> Result<Box<dyn Oracle>> {
        match self {
            OracleKind::Http => Ok(Box::new(HttpOracle::new(cfg)?)),
            OracleKind::Stub => Ok(Box::new(StubOracle)),
        }
    }
}

// =============================================================================
// Live implementation (OpenAI-style chat endpoint)
// =============================================================================

pub struct HttpOracle {
    client: reqwest::Client,
    url: String,
    model: String,
    key: String,
}

impl HttpOracle {
    pub fn new(cfg: &Config) -> Result<Self> {
        let key = cfg
            .oracle_key
            .clone()
            .ok_or_else(|| anyhow!("ORACLE_KEY required for the http oracle"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.oracle_timeout_secs))
            .build()?;
        Ok(Self { client, url: cfg.oracle_url.clone(), model: cfg.oracle_model.clone(), key })
    }

    async fn post_once(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.7,
        });
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let v: serde_json::Value = resp.json().await?;
        v["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("oracle response missing message content"))
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<String> {
        let prompt = ctx.render();
        // One bounded retry with jitter for transient transport failures; a
        // second failure is this tick's oracle failure.
        match self.post_once(&prompt).await {
            Ok(out) => Ok(out),
            Err(first) => {
                let jitter_ms = rand::thread_rng().gen_range(100..500);
                log(
                    Level::Warn,
                    Domain::Oracle,
                    "retry",
                    obj(&[
                        ("agent_id", v_str(&ctx.agent.id)),
                        ("error", v_str(&first.to_string())),
                        ("delay_ms", v_int(jitter_ms)),
                    ]),
                );
                sleep(Duration::from_millis(jitter_ms as u64)).await;
                self.post_once(&prompt).await
            }
        }
    }
}

// =============================================================================
// Deterministic stub (tests, dry runs)
// =============================================================================

pub struct StubOracle;

#[async_trait]
impl Oracle for StubOracle {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<String> {
        let items: Vec<serde_json::Value> = ctx
            .snapshot
            .markets
            .iter()
            .take(ctx.max_items.min(2))
            .enumerate()
            .map(|(i, m)| {
                json!({
                    "market_id": m.id,
                    "side": if i % 2 == 0 { "yes" } else { "no" },
                    "confidence": 0.6 - 0.2 * i as f64,
                })
            })
            .collect();
        if items.is_empty() {
            Ok(json!({ "action": "pass" }).to_string())
        } else {
            Ok(json!({ "action": "stake", "items": items }).to_string())
        }
    }
}
