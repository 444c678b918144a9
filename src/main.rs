use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};

use agon::audit::Auditor;
use agon::config::Config;
use agon::ledger::LedgerStore;
use agon::logging::{json_log, log, obj, v_int, v_str, Domain, Level};
use agon::market::SqliteMarketFeed;
use agon::oracle::OracleKind;
use agon::tick::TickEngine;

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    json_log(
        Domain::System,
        "startup",
        obj(&[
            ("config_hash", v_str(&cfg.config_hash())),
            ("config", serde_json::from_str(&cfg.to_json()).unwrap_or_default()),
        ]),
    );

    let store = Arc::new(LedgerStore::open(&cfg.sqlite_path)?);
    store.init()?;

    // Agents named in AGENTS get a genesis grant if they do not exist yet.
    if let Ok(roster) = std::env::var("AGENTS") {
        for id in roster.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if store.agent(id)?.is_none() {
                let entry = store.create_agent(id, id, cfg.genesis_grant, now_ts())?;
                json_log(
                    Domain::System,
                    "agent_created",
                    obj(&[("agent_id", v_str(id)), ("genesis_hash", v_str(&entry.hash))]),
                );
            }
        }
    }

    let feed = Box::new(SqliteMarketFeed::new(store.clone()));
    let oracle = OracleKind::from_env().build(&cfg)?;
    let engine = Arc::new(TickEngine::new(store.clone(), feed, oracle, cfg.clone()));

    let mut round: u64 = 0;
    loop {
        round += 1;
        let now = now_ts();
        let agents = store.agents()?;
        json_log(
            Domain::System,
            "round_start",
            obj(&[("round", v_int(round as i64)), ("agents", v_int(agents.len() as i64))]),
        );

        // Agents are independent; one task per agent, faults stay per-agent.
        let mut set = JoinSet::new();
        for agent in agents {
            let engine = engine.clone();
            set.spawn(async move {
                let outcome = engine.execute_tick(&agent.id, now).await;
                (agent.id, outcome)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((agent_id, Ok(outcome))) => json_log(
                    Domain::Tick,
                    "outcome",
                    obj(&[
                        ("agent_id", v_str(&agent_id)),
                        ("outcome", v_str(&format!("{:?}", outcome))),
                    ]),
                ),
                Ok((agent_id, Err(e))) => log(
                    Level::Error,
                    Domain::Tick,
                    "tick_failed",
                    obj(&[("agent_id", v_str(&agent_id)), ("error", v_str(&e.to_string()))]),
                ),
                Err(e) => log(
                    Level::Error,
                    Domain::Tick,
                    "task_panicked",
                    obj(&[("error", v_str(&e.to_string()))]),
                ),
            }
        }

        if cfg.sweep_every_ticks > 0 && round % cfg.sweep_every_ticks == 0 {
            let flipped = engine.sweep(now_ts()).await?;
            if flipped > 0 {
                json_log(Domain::Sweep, "swept", obj(&[("liquidated", v_int(flipped as i64))]));
            }
        }

        if cfg.audit_every_ticks > 0 && round % cfg.audit_every_ticks == 0 {
            let report = Auditor::verify(&store)?;
            if report.ok {
                json_log(
                    Domain::Audit,
                    "clean",
                    obj(&[("entries", v_int(report.entries_checked as i64))]),
                );
            } else {
                log(
                    Level::Fatal,
                    Domain::Audit,
                    "invariant_breach",
                    obj(&[("violations", v_int(report.violations.len() as i64))]),
                );
            }
        }

        sleep(Duration::from_secs(cfg.tick_secs)).await;
    }
}
