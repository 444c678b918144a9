use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::entropy::{EntropyRate, Mode};
use crate::money::Credits;

#[derive(Clone, Serialize)]
pub struct Config {
    pub sqlite_path: String,
    pub tick_secs: u64,
    pub mode: Mode,
    pub entropy: EntropyRate,
    /// Fixed fraction of headroom a single stake may consume.
    pub stake_fraction: f64,
    /// Cap on total open stake as a fraction of balance (I5).
    pub max_open_fraction: f64,
    pub min_stake: Credits,
    pub max_decision_items: usize,
    pub oracle_timeout_secs: u64,
    pub oracle_url: String,
    pub oracle_model: String,
    #[serde(skip)]
    pub oracle_key: Option<String>,
    pub genesis_grant: Credits,
    pub sweep_every_ticks: u64,
    pub audit_every_ticks: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./agon.sqlite".to_string()),
            tick_secs: std::env::var("TICK_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600),
            mode: Mode::from_env(),
            entropy: EntropyRate::from_env(),
            stake_fraction: std::env::var("STAKE_FRACTION").ok().and_then(|v| v.parse().ok()).unwrap_or(0.25),
            max_open_fraction: std::env::var("MAX_OPEN_FRACTION").ok().and_then(|v| v.parse().ok()).unwrap_or(0.5),
            min_stake: Credits::from_f64(
                std::env::var("MIN_STAKE").ok().and_then(|v| v.parse().ok()).unwrap_or(1.0),
            ),
            max_decision_items: std::env::var("MAX_DECISION_ITEMS").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            oracle_timeout_secs: std::env::var("ORACLE_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            oracle_url: std::env::var("ORACLE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            oracle_model: std::env::var("ORACLE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            oracle_key: std::env::var("ORACLE_KEY").ok(),
            genesis_grant: Credits::from_f64(
                std::env::var("GENESIS_GRANT").ok().and_then(|v| v.parse().ok()).unwrap_or(100.0),
            ),
            sweep_every_ticks: std::env::var("SWEEP_EVERY_TICKS").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            audit_every_ticks: std::env::var("AUDIT_EVERY_TICKS").ok().and_then(|v| v.parse().ok()).unwrap_or(24),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// SHA256 of the canonical JSON form, for reproducibility logging.
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_hash_deterministic() {
        let a = Config::from_env();
        let b = Config::from_env();
        assert_eq!(a.config_hash(), b.config_hash());
        assert_eq!(a.config_hash().len(), 64);
    }

    #[test]
    fn config_json_is_valid() {
        let cfg = Config::from_env();
        let parsed: serde_json::Value = serde_json::from_str(&cfg.to_json()).unwrap();
        assert!(parsed.is_object());
        assert!(parsed["stake_fraction"].is_number());
    }
}
