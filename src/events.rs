//! Narration side records.
//!
//! Only WAGER, LIQUIDATION and ERROR outcomes are narrated, never inaction.
//! The row insert happens inside the same transaction as the ledger entry it
//! describes, so a narrated outcome can never exist without its entry.

use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NarrationKind {
    Wager,
    Liquidation,
    TickError,
}

impl NarrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NarrationKind::Wager => "wager",
            NarrationKind::Liquidation => "liquidation",
            NarrationKind::TickError => "tick_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Narration {
    pub kind: NarrationKind,
    pub payload: String,
}

pub fn narrate_wager(market_ids: &[String], total_stake: &str) -> Narration {
    Narration {
        kind: NarrationKind::Wager,
        payload: json!({ "markets": market_ids, "total_stake": total_stake }).to_string(),
    }
}

pub fn narrate_liquidation(drained: &str) -> Narration {
    Narration {
        kind: NarrationKind::Liquidation,
        payload: json!({ "drained": drained }).to_string(),
    }
}

pub fn narrate_error(detail: &str) -> Narration {
    Narration {
        kind: NarrationKind::TickError,
        payload: json!({ "detail": detail }).to_string(),
    }
}
