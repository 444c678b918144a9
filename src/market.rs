//! Markets and commitments.
//!
//! Markets are an external collaborator's records: external-truth-bound
//! questions with a deadline and a reward pool. This engine only reads them
//! as the counterpart of a commitment. Commitments are pending stakes, funded
//! and settled exclusively through the ledger store.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ledger::LedgerStore;
use crate::money::Credits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    Open,
    Resolved,
    Expired,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "OPEN",
            MarketStatus::Resolved => "RESOLVED",
            MarketStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(MarketStatus::Open),
            "RESOLVED" => Some(MarketStatus::Resolved),
            "EXPIRED" => Some(MarketStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub deadline: i64,
    pub pool: Credits,
    pub status: MarketStatus,
    pub outcome: Option<Side>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentStatus {
    Pending,
    Won,
    Lost,
}

impl CommitmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentStatus::Pending => "PENDING",
            CommitmentStatus::Won => "WON",
            CommitmentStatus::Lost => "LOST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CommitmentStatus::Pending),
            "WON" => Some(CommitmentStatus::Won),
            "LOST" => Some(CommitmentStatus::Lost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Commitment {
    pub id: String,
    pub agent_id: String,
    pub market_id: String,
    pub side: Side,
    pub stake: Credits,
    pub status: CommitmentStatus,
    pub funding_seq: i64,
    pub settlement_seq: Option<i64>,
    pub created_ts: i64,
}

/// What the oracle is actually shown for one tick. The decision validator
/// checks market ids against this exact snapshot, nothing wider.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub markets: Vec<Market>,
    pub commitments: Vec<Commitment>,
}

impl MarketSnapshot {
    pub fn contains_market(&self, id: &str) -> bool {
        self.markets.iter().any(|m| m.id == id)
    }
}

/// Market/positions query: open markets the agent has not yet committed to,
/// plus the agent's own open commitments.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn snapshot(&self, agent_id: &str) -> Result<MarketSnapshot>;
}

pub struct SqliteMarketFeed {
    store: Arc<LedgerStore>,
}

impl SqliteMarketFeed {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MarketFeed for SqliteMarketFeed {
    async fn snapshot(&self, agent_id: &str) -> Result<MarketSnapshot> {
        let commitments = self.store.open_commitments(agent_id)?;
        let markets = self.store.open_markets_excluding(agent_id)?;
        Ok(MarketSnapshot { markets, commitments })
    }
}
