//! Reconciliation auditor.
//!
//! Pure read path: replays every agent's chain and proves the cached balance,
//! the gapless sequence run, the hash linkage, and the terminal-liquidation
//! shape. Any violation is reported with enough context to diagnose it and is
//! never auto-repaired. Faults are per-agent; one broken chain does not stop
//! the walk over the others.

use anyhow::Result;
use serde::Serialize;

use crate::ledger::{entry_hash, AgentStatus, LedgerStore, TxKind, GENESIS_PREV_HASH};
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::money::Credits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationKind {
    SequenceGap,
    HashMismatch,
    BrokenLink,
    BalanceDrift,
    DeadWithBalance,
    BadTerminalEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub agent_id: String,
    pub seq: i64,
    pub kind: ViolationKind,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub ok: bool,
    pub agents_checked: usize,
    pub entries_checked: usize,
    pub violations: Vec<Violation>,
}

impl Report {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

pub struct Auditor;

impl Auditor {
    /// Walk every agent's chain on a consistent snapshot. First violation per
    /// agent wins; other agents keep being checked.
    pub fn verify(store: &LedgerStore) -> Result<Report> {
        let agents = store.agents()?;
        let mut report = Report {
            ok: true,
            agents_checked: agents.len(),
            entries_checked: 0,
            violations: Vec::new(),
        };

        for agent in &agents {
            let entries = store.entries(&agent.id)?;
            report.entries_checked += entries.len();

            let violation = Self::check_chain(&agent.id, agent.balance, agent.status, &entries);
            if let Some(v) = violation {
                log(
                    Level::Error,
                    Domain::Audit,
                    "violation",
                    obj(&[
                        ("agent_id", v_str(&v.agent_id)),
                        ("seq", v_int(v.seq)),
                        ("kind", v_str(&format!("{:?}", v.kind))),
                        ("expected", v_str(&v.expected)),
                        ("actual", v_str(&v.actual)),
                    ]),
                );
                report.violations.push(v);
            }
        }

        report.ok = report.violations.is_empty();
        Ok(report)
    }

    fn check_chain(
        agent_id: &str,
        cached_balance: Credits,
        status: AgentStatus,
        entries: &[crate::ledger::Entry],
    ) -> Option<Violation> {
        let mut running = Credits::ZERO;
        let mut prev_hash = GENESIS_PREV_HASH.to_string();

        for (i, e) in entries.iter().enumerate() {
            let expected_seq = i as i64 + 1;
            if e.seq != expected_seq {
                return Some(Violation {
                    agent_id: agent_id.to_string(),
                    seq: e.seq,
                    kind: ViolationKind::SequenceGap,
                    expected: expected_seq.to_string(),
                    actual: e.seq.to_string(),
                });
            }
            if e.prev_hash != prev_hash {
                return Some(Violation {
                    agent_id: agent_id.to_string(),
                    seq: e.seq,
                    kind: ViolationKind::BrokenLink,
                    expected: prev_hash,
                    actual: e.prev_hash.clone(),
                });
            }
            let recomputed =
                entry_hash(agent_id, e.seq, e.amount, &e.kind, &e.reference, e.ts, &e.prev_hash);
            if recomputed != e.hash {
                return Some(Violation {
                    agent_id: agent_id.to_string(),
                    seq: e.seq,
                    kind: ViolationKind::HashMismatch,
                    expected: recomputed,
                    actual: e.hash.clone(),
                });
            }
            running = match running.checked_add(e.amount) {
                Ok(v) => v,
                Err(_) => {
                    return Some(Violation {
                        agent_id: agent_id.to_string(),
                        seq: e.seq,
                        kind: ViolationKind::BalanceDrift,
                        expected: "representable sum".to_string(),
                        actual: "overflow".to_string(),
                    })
                }
            };
            prev_hash = e.hash.clone();
        }

        if running != cached_balance {
            return Some(Violation {
                agent_id: agent_id.to_string(),
                seq: entries.len() as i64,
                kind: ViolationKind::BalanceDrift,
                expected: running.to_string(),
                actual: cached_balance.to_string(),
            });
        }

        if status == AgentStatus::Dead {
            if !cached_balance.is_zero() {
                return Some(Violation {
                    agent_id: agent_id.to_string(),
                    seq: entries.len() as i64,
                    kind: ViolationKind::DeadWithBalance,
                    expected: "0.00".to_string(),
                    actual: cached_balance.to_string(),
                });
            }
            // The terminal entry must be the liquidation. Its amount is
            // already proven exact by the balance check above (the chain sums
            // to zero), and it is legitimately zero for an agent drained to
            // exactly nothing before the liquidation.
            match entries.last() {
                Some(last) if last.kind == TxKind::Liquidation => {}
                Some(last) => {
                    return Some(Violation {
                        agent_id: agent_id.to_string(),
                        seq: last.seq,
                        kind: ViolationKind::BadTerminalEntry,
                        expected: "terminal LIQUIDATION".to_string(),
                        actual: format!("{} {}", last.kind.as_str(), last.amount),
                    })
                }
                None => {
                    return Some(Violation {
                        agent_id: agent_id.to_string(),
                        seq: 0,
                        kind: ViolationKind::BadTerminalEntry,
                        expected: "terminal LIQUIDATION".to_string(),
                        actual: "empty chain".to_string(),
                    })
                }
            }
        }

        None
    }
}
