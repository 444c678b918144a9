//! Append-only ledger with per-agent hash chaining.
//!
//! Every monetary change is one immutable entry: a strictly increasing
//! per-agent sequence, a signed fixed-point amount, and a SHA256 over the
//! canonical serialization of all fields except the hash itself, linked to
//! the previous entry's hash. `append` is the only code path that writes
//! ledger rows or touches the cached balance/status on the agent record.
//! The entry, its commitment side records, any narration row, and the
//! balance update commit as one sqlite transaction.

use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::events::Narration;
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::market::{Commitment, CommitmentStatus, Market, MarketStatus, Side};
use crate::money::Credits;

/// prev_hash of the first entry in every agent's chain.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentStatus {
    Alive,
    Dead,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Alive => "ALIVE",
            AgentStatus::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALIVE" => Some(AgentStatus::Alive),
            "DEAD" => Some(AgentStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    pub balance: Credits,
    pub status: AgentStatus,
    pub last_active: i64,
}

/// Transaction kinds. Open set: unknown strings round-trip as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TxKind {
    Genesis,
    Grant,
    Wager,
    Payout,
    Slash,
    Liquidation,
    Revive,
    Entropy,
    Portfolio,
    Stake,
    Settlement,
    TickError,
    Other(String),
}

impl TxKind {
    pub fn as_str(&self) -> &str {
        match self {
            TxKind::Genesis => "GENESIS",
            TxKind::Grant => "GRANT",
            TxKind::Wager => "WAGER",
            TxKind::Payout => "PAYOUT",
            TxKind::Slash => "SLASH",
            TxKind::Liquidation => "LIQUIDATION",
            TxKind::Revive => "REVIVE",
            TxKind::Entropy => "ENTROPY",
            TxKind::Portfolio => "PORTFOLIO",
            TxKind::Stake => "STAKE",
            TxKind::Settlement => "SETTLEMENT",
            TxKind::TickError => "ERROR",
            TxKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "GENESIS" => TxKind::Genesis,
            "GRANT" => TxKind::Grant,
            "WAGER" => TxKind::Wager,
            "PAYOUT" => TxKind::Payout,
            "SLASH" => TxKind::Slash,
            "LIQUIDATION" => TxKind::Liquidation,
            "REVIVE" => TxKind::Revive,
            "ENTROPY" => TxKind::Entropy,
            "PORTFOLIO" => TxKind::Portfolio,
            "STAKE" => TxKind::Stake,
            "SETTLEMENT" => TxKind::Settlement,
            "ERROR" => TxKind::TickError,
            other => TxKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub agent_id: String,
    pub seq: i64,
    pub amount: Credits,
    pub kind: TxKind,
    pub reference: String,
    pub ts: i64,
    pub prev_hash: String,
    pub hash: String,
}

/// A stake to fund atomically with the entry that pays for it. The
/// commitment id is derived from the entry's sequence number at insert time,
/// so two ticks can never mint the same id.
#[derive(Debug, Clone)]
pub struct StakeRecord {
    pub market_id: String,
    pub side: Side,
    pub stake: Credits,
}

/// Resolution of an existing commitment, applied in the same transaction.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub commitment_id: String,
    pub status: CommitmentStatus,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub agent_id: String,
    pub amount: Credits,
    pub kind: TxKind,
    pub reference: String,
    pub ts: i64,
    pub stakes: Vec<StakeRecord>,
    pub narration: Option<Narration>,
    pub set_status: Option<AgentStatus>,
    pub resolve: Option<Resolution>,
}

impl AppendRequest {
    pub fn new(agent_id: &str, amount: Credits, kind: TxKind, reference: &str, ts: i64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            amount,
            kind,
            reference: reference.to_string(),
            ts,
            stakes: Vec::new(),
            narration: None,
            set_status: None,
            resolve: None,
        }
    }
}

/// Canonical hash over all entry fields except the hash itself.
pub fn entry_hash(
    agent_id: &str,
    seq: i64,
    amount: Credits,
    kind: &TxKind,
    reference: &str,
    ts: i64,
    prev_hash: &str,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        agent_id,
        seq,
        amount.units(),
        kind.as_str(),
        reference,
        ts,
        prev_hash
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Store
// =============================================================================

pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn init(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                balance INTEGER NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('ALIVE','DEAD')),
                last_active INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ledger (
                agent_id TEXT NOT NULL REFERENCES agents(id),
                seq INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                kind TEXT NOT NULL,
                reference TEXT NOT NULL,
                ts INTEGER NOT NULL,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL,
                PRIMARY KEY (agent_id, seq)
            );
            CREATE TABLE IF NOT EXISTS commitments (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                market_id TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('yes','no')),
                stake INTEGER NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('PENDING','WON','LOST')),
                funding_seq INTEGER NOT NULL,
                settlement_seq INTEGER,
                created_ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                deadline INTEGER NOT NULL,
                pool INTEGER NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('OPEN','RESOLVED','EXPIRED')),
                outcome TEXT
            );
            CREATE TABLE IF NOT EXISTS shadow_charges (
                agent_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                would_liquidate INTEGER NOT NULL,
                note TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                agent_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("ledger store mutex poisoned"))
    }

    // -------------------------------------------------------------------------
    // append: the only writer
    // -------------------------------------------------------------------------

    /// Append one entry plus its side records atomically. A sequence conflict
    /// (another writer raced this one) is retried exactly once by re-reading
    /// the chain tail; a second conflict indicates a locking bug and is fatal.
    pub fn append(&self, req: &AppendRequest) -> Result<Entry> {
        let mut guard = self.lock()?;
        match Self::try_append(&mut guard, req) {
            Ok(entry) => Ok(entry),
            Err(err) if is_sequence_conflict(&err) => {
                log(
                    Level::Warn,
                    Domain::Ledger,
                    "sequence_conflict_retry",
                    obj(&[("agent_id", v_str(&req.agent_id))]),
                );
                Self::try_append(&mut guard, req).map_err(|e| {
                    anyhow!("sequence conflict persisted after retry for {}: {}", req.agent_id, e)
                })
            }
            Err(err) => Err(err),
        }
    }

    fn try_append(conn: &mut Connection, req: &AppendRequest) -> Result<Entry> {
        let tx = conn.transaction()?;
        let entry = Self::write_entry(&tx, req)?;
        tx.commit()?;
        Ok(entry)
    }

    fn write_entry(tx: &rusqlite::Transaction<'_>, req: &AppendRequest) -> Result<Entry> {
        let (balance_units, status): (i64, String) = tx
            .query_row(
                "SELECT balance, status FROM agents WHERE id = ?1",
                params![req.agent_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| anyhow!("unknown agent {}", req.agent_id))?;
        let balance = Credits::from_units(balance_units);
        let kind = &req.kind;

        if status == "DEAD" && *kind != TxKind::Revive {
            bail!("agent {} is DEAD; only REVIVE may append", req.agent_id);
        }
        if *kind == TxKind::Liquidation {
            // Exact drain, never partial; zero only when there was nothing
            // left to drain.
            if req.amount.is_zero() && !balance.is_zero() {
                bail!("zero-amount LIQUIDATION rejected for {}", req.agent_id);
            }
            if req.amount != balance.neg() {
                bail!(
                    "LIQUIDATION for {} must drain exactly {} (got {})",
                    req.agent_id,
                    balance.neg(),
                    req.amount
                );
            }
        }

        let tail: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, hash FROM ledger WHERE agent_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![req.agent_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (seq, prev_hash) = match tail {
            Some((s, h)) => (s + 1, h),
            None => (1, GENESIS_PREV_HASH.to_string()),
        };

        let hash = entry_hash(&req.agent_id, seq, req.amount, kind, &req.reference, req.ts, &prev_hash);
        tx.execute(
            "INSERT INTO ledger (agent_id, seq, amount, kind, reference, ts, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                req.agent_id,
                seq,
                req.amount.units(),
                kind.as_str(),
                req.reference,
                req.ts,
                prev_hash,
                hash
            ],
        )?;

        for stake in &req.stakes {
            let commitment_id = format!("c:{}:{}:{}", req.agent_id, seq, stake.market_id);
            tx.execute(
                "INSERT INTO commitments
                   (id, agent_id, market_id, side, stake, status, funding_seq, created_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, ?7)",
                params![
                    commitment_id,
                    req.agent_id,
                    stake.market_id,
                    stake.side.as_str(),
                    stake.stake.units(),
                    seq,
                    req.ts
                ],
            )?;
        }

        if let Some(res) = &req.resolve {
            let changed = tx.execute(
                "UPDATE commitments SET status = ?1, settlement_seq = ?2
                 WHERE id = ?3 AND status = 'PENDING'",
                params![res.status.as_str(), seq, res.commitment_id],
            )?;
            if changed != 1 {
                bail!("commitment {} already resolved or missing", res.commitment_id);
            }
        }

        if req.set_status == Some(AgentStatus::Dead) {
            // Liquidation forfeits whatever was still pending; the terminal
            // entry doubles as the settlement reference.
            tx.execute(
                "UPDATE commitments SET status = 'LOST', settlement_seq = ?1
                 WHERE agent_id = ?2 AND status = 'PENDING'",
                params![seq, req.agent_id],
            )?;
        }

        if let Some(n) = &req.narration {
            tx.execute(
                "INSERT INTO events (agent_id, ts, kind, payload) VALUES (?1, ?2, ?3, ?4)",
                params![req.agent_id, req.ts, n.kind.as_str(), n.payload],
            )?;
        }

        let new_balance = balance.checked_add(req.amount)?;
        let new_status = req.set_status.map(|s| s.as_str().to_string()).unwrap_or(status);
        tx.execute(
            "UPDATE agents SET balance = ?1, status = ?2, last_active = ?3 WHERE id = ?4",
            params![new_balance.units(), new_status, req.ts, req.agent_id],
        )?;

        Ok(Entry {
            agent_id: req.agent_id.clone(),
            seq,
            amount: req.amount,
            kind: kind.clone(),
            reference: req.reference.clone(),
            ts: req.ts,
            prev_hash,
            hash,
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle operations (all funnel through append)
    // -------------------------------------------------------------------------

    /// Create an agent with its paired GENESIS entry in one transaction; a
    /// failure anywhere rolls back both, so an entry-less agent cannot exist.
    pub fn create_agent(&self, id: &str, display_name: &str, grant: Credits, ts: i64) -> Result<Entry> {
        if !grant.is_positive() {
            bail!("genesis grant must be positive, got {}", grant);
        }
        let mut guard = self.lock()?;
        let tx = guard.transaction()?;
        tx.execute(
            "INSERT INTO agents (id, display_name, balance, status, last_active)
             VALUES (?1, ?2, 0, 'ALIVE', ?3)",
            params![id, display_name, ts],
        )?;
        let entry =
            Self::write_entry(&tx, &AppendRequest::new(id, grant, TxKind::Genesis, "genesis", ts))?;
        tx.commit()?;
        Ok(entry)
    }

    /// Administrative reentry from DEAD. The only path back.
    pub fn revive(&self, agent_id: &str, grant: Credits, ts: i64) -> Result<Entry> {
        let agent = self
            .agent(agent_id)?
            .ok_or_else(|| anyhow!("unknown agent {}", agent_id))?;
        if agent.status != AgentStatus::Dead {
            bail!("agent {} is not DEAD; refusing revive", agent_id);
        }
        if !grant.is_positive() {
            bail!("revive grant must be positive, got {}", grant);
        }
        let mut req = AppendRequest::new(agent_id, grant, TxKind::Revive, "revive", ts);
        req.set_status = Some(AgentStatus::Alive);
        self.append(&req)
    }

    /// Resolve a pending commitment exactly once. Wins pay even odds
    /// (2x stake, one PAYOUT entry); losses write a zero-amount SETTLEMENT
    /// entry since the stake was deducted at funding time. Settlement is real
    /// money in both operating modes.
    pub fn settle_commitment(&self, commitment_id: &str, won: bool, ts: i64) -> Result<Entry> {
        let c = self
            .commitment(commitment_id)?
            .ok_or_else(|| anyhow!("unknown commitment {}", commitment_id))?;
        if c.status != CommitmentStatus::Pending {
            bail!("commitment {} already resolved ({})", commitment_id, c.status.as_str());
        }
        let (amount, kind, status) = if won {
            (c.stake.checked_add(c.stake)?, TxKind::Payout, CommitmentStatus::Won)
        } else {
            (Credits::ZERO, TxKind::Settlement, CommitmentStatus::Lost)
        };
        let mut req = AppendRequest::new(&c.agent_id, amount, kind, commitment_id, ts);
        req.resolve = Some(Resolution { commitment_id: commitment_id.to_string(), status });
        self.append(&req)
    }

    /// Observe-mode side channel: what the charge would have been.
    pub fn record_shadow_charge(
        &self,
        agent_id: &str,
        ts: i64,
        amount: Credits,
        would_liquidate: bool,
        note: &str,
    ) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO shadow_charges (agent_id, ts, amount, would_liquidate, note)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![agent_id, ts, amount.units(), would_liquidate as i64, note],
        )?;
        log(
            Level::Debug,
            Domain::Ledger,
            "shadow_charge",
            obj(&[
                ("agent_id", v_str(agent_id)),
                ("amount", v_int(amount.units())),
                ("would_liquidate", v_str(if would_liquidate { "yes" } else { "no" })),
            ]),
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Read paths
    // -------------------------------------------------------------------------

    pub fn agent(&self, id: &str) -> Result<Option<Agent>> {
        let guard = self.lock()?;
        let row = guard
            .query_row(
                "SELECT id, display_name, balance, status, last_active FROM agents WHERE id = ?1",
                params![id],
                row_to_agent,
            )
            .optional()?;
        Ok(row)
    }

    pub fn agents(&self) -> Result<Vec<Agent>> {
        let guard = self.lock()?;
        let mut stmt = guard.prepare(
            "SELECT id, display_name, balance, status, last_active FROM agents ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_agent)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn alive_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents()?.into_iter().filter(|a| a.status == AgentStatus::Alive).collect())
    }

    /// ALIVE agents whose cached balance already hit zero or below; the
    /// out-of-band sweep turns these into proper liquidations.
    pub fn insolvent_alive_agents(&self) -> Result<Vec<Agent>> {
        Ok(self
            .alive_agents()?
            .into_iter()
            .filter(|a| !a.balance.is_positive())
            .collect())
    }

    pub fn entries(&self, agent_id: &str) -> Result<Vec<Entry>> {
        let guard = self.lock()?;
        let mut stmt = guard.prepare(
            "SELECT agent_id, seq, amount, kind, reference, ts, prev_hash, hash
             FROM ledger WHERE agent_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![agent_id], |r| {
                Ok(Entry {
                    agent_id: r.get(0)?,
                    seq: r.get(1)?,
                    amount: Credits::from_units(r.get(2)?),
                    kind: TxKind::parse(&r.get::<_, String>(3)?),
                    reference: r.get(4)?,
                    ts: r.get(5)?,
                    prev_hash: r.get(6)?,
                    hash: r.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn commitment(&self, id: &str) -> Result<Option<Commitment>> {
        let guard = self.lock()?;
        let row = guard
            .query_row(
                "SELECT id, agent_id, market_id, side, stake, status, funding_seq, settlement_seq, created_ts
                 FROM commitments WHERE id = ?1",
                params![id],
                row_to_commitment,
            )
            .optional()?;
        Ok(row)
    }

    pub fn open_commitments(&self, agent_id: &str) -> Result<Vec<Commitment>> {
        let guard = self.lock()?;
        let mut stmt = guard.prepare(
            "SELECT id, agent_id, market_id, side, stake, status, funding_seq, settlement_seq, created_ts
             FROM commitments WHERE agent_id = ?1 AND status = 'PENDING' ORDER BY created_ts",
        )?;
        let rows = stmt
            .query_map(params![agent_id], row_to_commitment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Open markets the agent has not already committed to.
    pub fn open_markets_excluding(&self, agent_id: &str) -> Result<Vec<Market>> {
        let guard = self.lock()?;
        let mut stmt = guard.prepare(
            "SELECT id, question, deadline, pool, status, outcome FROM markets
             WHERE status = 'OPEN'
               AND id NOT IN (SELECT market_id FROM commitments WHERE agent_id = ?1)
             ORDER BY deadline",
        )?;
        let rows = stmt
            .query_map(params![agent_id], row_to_market)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn upsert_market(&self, m: &Market) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO markets (id, question, deadline, pool, status, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               question = excluded.question, deadline = excluded.deadline,
               pool = excluded.pool, status = excluded.status, outcome = excluded.outcome",
            params![
                m.id,
                m.question,
                m.deadline,
                m.pool.units(),
                m.status.as_str(),
                m.outcome.map(|s| s.as_str())
            ],
        )?;
        Ok(())
    }

    pub fn narration_kinds(&self, agent_id: &str) -> Result<Vec<String>> {
        let guard = self.lock()?;
        let mut stmt =
            guard.prepare("SELECT kind FROM events WHERE agent_id = ?1 ORDER BY ts")?;
        let rows = stmt
            .query_map(params![agent_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    pub fn shadow_charge_count(&self, agent_id: &str) -> Result<i64> {
        let guard = self.lock()?;
        let n = guard.query_row(
            "SELECT COUNT(*) FROM shadow_charges WHERE agent_id = ?1",
            params![agent_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Test/diagnostic hook: raw row mutation outside `append`, used to prove
    /// the auditor catches tampering. Never called from the engine.
    #[doc(hidden)]
    pub fn tamper_with_amount(&self, agent_id: &str, seq: i64, new_units: i64) -> Result<()> {
        self.lock()?.execute(
            "UPDATE ledger SET amount = ?1 WHERE agent_id = ?2 AND seq = ?3",
            params![new_units, agent_id, seq],
        )?;
        Ok(())
    }
}

fn row_to_agent(r: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let status: String = r.get(3)?;
    Ok(Agent {
        id: r.get(0)?,
        display_name: r.get(1)?,
        balance: Credits::from_units(r.get(2)?),
        status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Dead),
        last_active: r.get(4)?,
    })
}

fn row_to_commitment(r: &rusqlite::Row<'_>) -> rusqlite::Result<Commitment> {
    let side: String = r.get(3)?;
    let status: String = r.get(5)?;
    Ok(Commitment {
        id: r.get(0)?,
        agent_id: r.get(1)?,
        market_id: r.get(2)?,
        side: Side::parse(&side).unwrap_or(Side::Yes),
        stake: Credits::from_units(r.get(4)?),
        status: CommitmentStatus::parse(&status).unwrap_or(CommitmentStatus::Pending),
        funding_seq: r.get(6)?,
        settlement_seq: r.get(7)?,
        created_ts: r.get(8)?,
    })
}

fn row_to_market(r: &rusqlite::Row<'_>) -> rusqlite::Result<Market> {
    let status: String = r.get(4)?;
    let outcome: Option<String> = r.get(5)?;
    Ok(Market {
        id: r.get(0)?,
        question: r.get(1)?,
        deadline: r.get(2)?,
        pool: Credits::from_units(r.get(3)?),
        status: MarketStatus::parse(&status).unwrap_or(MarketStatus::Expired),
        outcome: outcome.as_deref().and_then(Side::parse),
    })
}

/// Only a collision on the ledger (agent_id, seq) primary key means another
/// writer raced us; any other constraint violation is a genuine error.
fn is_sequence_conflict(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, Some(msg))) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation && msg.contains("ledger.agent_id")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LedgerStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        let store = LedgerStore::open(path.to_str().unwrap()).unwrap();
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn genesis_starts_the_chain() {
        let (_dir, store) = store();
        let entry = store.create_agent("a1", "Alpha", Credits::from_whole(100), 1000).unwrap();
        assert_eq!(entry.seq, 1);
        assert_eq!(entry.prev_hash, GENESIS_PREV_HASH);
        assert_eq!(entry.kind, TxKind::Genesis);

        let agent = store.agent("a1").unwrap().unwrap();
        assert_eq!(agent.balance, Credits::from_whole(100));
        assert_eq!(agent.status, AgentStatus::Alive);
    }

    #[test]
    fn sequences_are_gapless_and_linked() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(10), 1000).unwrap();
        for i in 0..5 {
            store
                .append(&AppendRequest::new(
                    "a1",
                    Credits::from_f64(-0.5),
                    TxKind::Entropy,
                    "tick",
                    1000 + i,
                ))
                .unwrap();
        }
        let entries = store.entries("a1").unwrap();
        assert_eq!(entries.len(), 6);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.seq, i as i64 + 1, "gapless run");
            if i > 0 {
                assert_eq!(e.prev_hash, entries[i - 1].hash, "chain linkage at seq {}", e.seq);
            }
        }
    }

    #[test]
    fn append_to_unknown_agent_fails_without_write() {
        let (_dir, store) = store();
        let err = store
            .append(&AppendRequest::new("ghost", Credits::from_whole(1), TxKind::Grant, "x", 1))
            .unwrap_err();
        assert!(err.to_string().contains("unknown agent"));
    }

    #[test]
    fn dead_agent_rejects_everything_but_revive() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(5), 1000).unwrap();
        let mut req = AppendRequest::new("a1", Credits::from_whole(-5), TxKind::Liquidation, "broke", 1001);
        req.set_status = Some(AgentStatus::Dead);
        store.append(&req).unwrap();

        let err = store
            .append(&AppendRequest::new("a1", Credits::from_whole(1), TxKind::Grant, "nope", 1002))
            .unwrap_err();
        assert!(err.to_string().contains("DEAD"));

        let entry = store.revive("a1", Credits::from_whole(20), 1003).unwrap();
        assert_eq!(entry.kind, TxKind::Revive);
        let agent = store.agent("a1").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Alive);
        assert_eq!(agent.balance, Credits::from_whole(20));
    }

    #[test]
    fn liquidation_must_drain_exactly() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_f64(0.5), 1000).unwrap();

        let mut zero = AppendRequest::new("a1", Credits::ZERO, TxKind::Liquidation, "x", 1001);
        zero.set_status = Some(AgentStatus::Dead);
        assert!(store.append(&zero).unwrap_err().to_string().contains("zero-amount"));

        let mut partial = AppendRequest::new("a1", Credits::from_f64(-0.75), TxKind::Liquidation, "x", 1001);
        partial.set_status = Some(AgentStatus::Dead);
        assert!(store.append(&partial).unwrap_err().to_string().contains("drain exactly"));

        let mut exact = AppendRequest::new("a1", Credits::from_f64(-0.5), TxKind::Liquidation, "x", 1001);
        exact.set_status = Some(AgentStatus::Dead);
        store.append(&exact).unwrap();
        let agent = store.agent("a1").unwrap().unwrap();
        assert!(agent.balance.is_zero());
        assert_eq!(agent.status, AgentStatus::Dead);
    }

    #[test]
    fn zero_balance_liquidation_is_the_zero_entry() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(10), 1000).unwrap();
        store
            .append(&AppendRequest::new("a1", Credits::from_whole(-10), TxKind::Slash, "penalty", 1001))
            .unwrap();

        // Balance is exactly zero; the drain is the zero amount.
        let mut liq = AppendRequest::new("a1", Credits::ZERO, TxKind::Liquidation, "broke", 1002);
        liq.set_status = Some(AgentStatus::Dead);
        let entry = store.append(&liq).unwrap();
        assert!(entry.amount.is_zero());

        let agent = store.agent("a1").unwrap().unwrap();
        assert!(agent.balance.is_zero());
        assert_eq!(agent.status, AgentStatus::Dead);
    }

    #[test]
    fn settlement_resolves_exactly_once() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(100), 1000).unwrap();
        let mut req = AppendRequest::new("a1", Credits::from_whole(-10), TxKind::Wager, "t1", 1001);
        req.stakes.push(StakeRecord {
            market_id: "m1".to_string(),
            side: Side::Yes,
            stake: Credits::from_whole(10),
        });
        store.append(&req).unwrap();
        let cid = store.open_commitments("a1").unwrap()[0].id.clone();

        let entry = store.settle_commitment(&cid, true, 1002).unwrap();
        assert_eq!(entry.kind, TxKind::Payout);
        assert_eq!(entry.amount, Credits::from_whole(20));
        let agent = store.agent("a1").unwrap().unwrap();
        assert_eq!(agent.balance, Credits::from_whole(110));

        let err = store.settle_commitment(&cid, true, 1003).unwrap_err();
        assert!(err.to_string().contains("already resolved"));
    }

    #[test]
    fn lost_settlement_is_a_zero_amount_entry() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(100), 1000).unwrap();
        let mut req = AppendRequest::new("a1", Credits::from_whole(-10), TxKind::Wager, "t1", 1001);
        req.stakes.push(StakeRecord {
            market_id: "m1".to_string(),
            side: Side::No,
            stake: Credits::from_whole(10),
        });
        store.append(&req).unwrap();
        let cid = store.open_commitments("a1").unwrap()[0].id.clone();

        let entry = store.settle_commitment(&cid, false, 1002).unwrap();
        assert_eq!(entry.kind, TxKind::Settlement);
        assert!(entry.amount.is_zero());
        let c = store.commitment(&cid).unwrap().unwrap();
        assert_eq!(c.status, CommitmentStatus::Lost);
        assert_eq!(c.settlement_seq, Some(entry.seq));
    }

    #[test]
    fn liquidation_forfeits_pending_commitments() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(10), 1000).unwrap();
        let mut wager = AppendRequest::new("a1", Credits::from_whole(-4), TxKind::Wager, "t1", 1001);
        wager.stakes.push(StakeRecord {
            market_id: "m1".to_string(),
            side: Side::Yes,
            stake: Credits::from_whole(4),
        });
        store.append(&wager).unwrap();
        let cid = store.open_commitments("a1").unwrap()[0].id.clone();

        let mut liq = AppendRequest::new("a1", Credits::from_whole(-6), TxKind::Liquidation, "broke", 1002);
        liq.set_status = Some(AgentStatus::Dead);
        store.append(&liq).unwrap();

        let c = store.commitment(&cid).unwrap().unwrap();
        assert_eq!(c.status, CommitmentStatus::Lost);
        let err = store.settle_commitment(&cid, true, 1003).unwrap_err();
        assert!(err.to_string().contains("already resolved"));
    }

    #[test]
    fn commitment_ids_embed_the_funding_seq() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(100), 1000).unwrap();
        // Two wagers on the same market at the same timestamp must still
        // mint distinct commitment ids.
        for _ in 0..2 {
            let mut req =
                AppendRequest::new("a1", Credits::from_whole(-5), TxKind::Wager, "t", 1001);
            req.stakes.push(StakeRecord {
                market_id: "m1".to_string(),
                side: Side::Yes,
                stake: Credits::from_whole(5),
            });
            store.append(&req).unwrap();
        }
        let cs = store.open_commitments("a1").unwrap();
        assert_eq!(cs.len(), 2);
        assert_ne!(cs[0].id, cs[1].id);
        for c in &cs {
            assert_eq!(c.id, format!("c:a1:{}:m1", c.funding_seq));
        }
    }

    #[test]
    fn duplicate_create_rolls_back_cleanly() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(10), 1000).unwrap();
        assert!(store.create_agent("a1", "Alpha", Credits::from_whole(10), 1001).is_err());
        // The failed create must not have grown the chain.
        assert_eq!(store.entries("a1").unwrap().len(), 1);
        assert_eq!(store.agent("a1").unwrap().unwrap().balance, Credits::from_whole(10));
    }

    #[test]
    fn market_exclusion_hides_committed_markets() {
        let (_dir, store) = store();
        store.create_agent("a1", "Alpha", Credits::from_whole(100), 1000).unwrap();
        for id in ["m1", "m2"] {
            store
                .upsert_market(&Market {
                    id: id.to_string(),
                    question: format!("q-{}", id),
                    deadline: 9999,
                    pool: Credits::from_whole(50),
                    status: MarketStatus::Open,
                    outcome: None,
                })
                .unwrap();
        }
        let mut req = AppendRequest::new("a1", Credits::from_whole(-5), TxKind::Wager, "t1", 1001);
        req.stakes.push(StakeRecord {
            market_id: "m1".to_string(),
            side: Side::Yes,
            stake: Credits::from_whole(5),
        });
        store.append(&req).unwrap();

        let open = store.open_markets_excluding("a1").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "m2");
    }
}
