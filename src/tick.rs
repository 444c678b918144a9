//! Per-tick execution.
//!
//! LOAD -> LIQUIDATION_CHECK -> DECISION -> SIZE_AND_VALIDATE -> COMMIT, with
//! ERROR reachable from the middle states. Every tick for a live agent ends
//! in exactly one ledger append; a tick that vanished without trace would be
//! economically indistinguishable from a bug, so even caught faults book an
//! ERROR entry. The oracle is awaited before the per-agent lock so a slow
//! oracle never serializes other work for the same agent; the lock spans the
//! balance re-read through the durable commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Result};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{timeout, Duration};

use crate::config::Config;
use crate::decision::{self, Decision, SizingParams};
use crate::entropy::Protocol;
use crate::events::{narrate_error, narrate_liquidation, narrate_wager};
use crate::ledger::{Agent, AgentStatus, AppendRequest, LedgerStore, StakeRecord, TxKind};
use crate::logging::{json_log, log, obj, v_int, v_str, Domain, Level};
use crate::market::MarketFeed;
use crate::money::Credits;
use crate::oracle::{DecisionContext, Oracle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inaction,
    Action(usize),
    Liquidated,
    Errored,
}

// =============================================================================
// Per-agent serialization
// =============================================================================

/// Appends for the same agent must never overlap: sequence and hash chaining
/// is a sequential read-then-write. Agents partition cleanly, so one async
/// mutex per agent and no global lock.
#[derive(Default)]
pub struct LockRegistry {
    locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl LockRegistry {
    pub fn for_agent(&self, agent_id: &str) -> Arc<TokioMutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(agent_id.to_string()).or_default().clone()
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct TickEngine {
    store: Arc<LedgerStore>,
    feed: Box<dyn MarketFeed>,
    oracle: Box<dyn Oracle>,
    protocol: Protocol,
    cfg: Config,
    locks: LockRegistry,
}

/// What the pre-lock phases produced for COMMIT to collapse into one entry.
enum TickPlan {
    Decided(Result<Decision, String>),
    Faulted(String),
}

impl TickEngine {
    pub fn new(
        store: Arc<LedgerStore>,
        feed: Box<dyn MarketFeed>,
        oracle: Box<dyn Oracle>,
        cfg: Config,
    ) -> Self {
        let protocol = Protocol::new(cfg.mode, cfg.entropy);
        Self { store, feed, oracle, protocol, cfg, locks: LockRegistry::default() }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Advance one agent by one tick. `now` is the scheduling timestamp,
    /// passed explicitly so ticks are reproducible. Only total storage
    /// unavailability (or an unknown agent) surfaces as Err.
    pub async fn execute_tick(&self, agent_id: &str, now: i64) -> Result<Outcome> {
        // LOAD
        let agent = self
            .store
            .agent(agent_id)?
            .ok_or_else(|| anyhow!("unknown agent {}", agent_id))?;

        // LIQUIDATION_CHECK: the dead never reach DECISION, and never pay.
        if agent.status == AgentStatus::Dead {
            json_log(Domain::Tick, "dead_agent_noop", obj(&[("agent_id", v_str(agent_id))]));
            return Ok(Outcome::Liquidated);
        }

        // DECISION + SIZE_AND_VALIDATE (structural half), before any lock.
        let plan = self.decide(&agent).await;

        // COMMIT, under the per-agent exclusion scope.
        let lock = self.locks.for_agent(agent_id);
        let _guard = lock.lock().await;
        self.commit(agent_id, now, plan)
    }

    /// Consult the market feed and the oracle, then structurally validate.
    /// Oracle trouble degrades to an inaction-equivalent rejection; anything
    /// else unexpected becomes the fault path, which still books an entry.
    async fn decide(&self, agent: &Agent) -> TickPlan {
        let snapshot = match self.feed.snapshot(&agent.id).await {
            Ok(s) => s,
            Err(e) => return TickPlan::Faulted(format!("market feed: {}", e)),
        };

        let ctx = DecisionContext {
            agent,
            snapshot: &snapshot,
            max_items: self.cfg.max_decision_items,
        };
        let oracle_deadline = Duration::from_secs(self.cfg.oracle_timeout_secs);
        let raw = match timeout(oracle_deadline, self.oracle.decide(&ctx)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                log(
                    Level::Warn,
                    Domain::Oracle,
                    "oracle_failed",
                    obj(&[("agent_id", v_str(&agent.id)), ("error", v_str(&e.to_string()))]),
                );
                return TickPlan::Decided(Err(format!("oracle failure: {}", e)));
            }
            Err(_) => {
                log(
                    Level::Warn,
                    Domain::Oracle,
                    "oracle_timeout",
                    obj(&[
                        ("agent_id", v_str(&agent.id)),
                        ("timeout_secs", v_int(self.cfg.oracle_timeout_secs as i64)),
                    ]),
                );
                return TickPlan::Decided(Err("oracle timeout".to_string()));
            }
        };

        match decision::validate(&raw, &snapshot, self.cfg.max_decision_items) {
            Ok(d) => TickPlan::Decided(Ok(d)),
            Err(rej) => TickPlan::Decided(Err(format!("rejected: {}", rej.reason))),
        }
    }

    /// Collapse the tick to exactly one ledger mutation. Solvency is decided
    /// against the freshly re-read balance before any stake is sized, so a
    /// liquidating agent's bets are never placed. Timestamp `ts` tags the
    /// tick; sizing happens here, under the lock, never from a stale balance.
    fn commit(&self, agent_id: &str, ts: i64, plan: TickPlan) -> Result<Outcome> {
        let agent = self
            .store
            .agent(agent_id)?
            .ok_or_else(|| anyhow!("agent {} vanished mid-tick", agent_id))?;
        if agent.status == AgentStatus::Dead {
            // The sweep got here first.
            return Ok(Outcome::Liquidated);
        }

        let verdict = self.protocol.assess(agent.balance);
        if let Some(shadow) = verdict.shadow {
            self.store.record_shadow_charge(
                agent_id,
                ts,
                shadow.amount,
                shadow.would_liquidate,
                "tick",
            )?;
        }

        if verdict.liquidate {
            let mut req = AppendRequest::new(
                agent_id,
                agent.balance.neg(),
                TxKind::Liquidation,
                "insolvency",
                ts,
            );
            req.set_status = Some(AgentStatus::Dead);
            req.narration = Some(narrate_liquidation(&agent.balance.to_string()));
            let entry = self.store.append(&req)?;
            json_log(
                Domain::Tick,
                "liquidated",
                obj(&[("agent_id", v_str(agent_id)), ("seq", v_int(entry.seq))]),
            );
            return Ok(Outcome::Liquidated);
        }

        let charge = verdict.charge;
        let (req, outcome) = match plan {
            TickPlan::Faulted(detail) => {
                let mut req =
                    AppendRequest::new(agent_id, charge.neg(), TxKind::TickError, &detail, ts);
                req.narration = Some(narrate_error(&detail));
                (req, Outcome::Errored)
            }
            TickPlan::Decided(Err(reason)) => {
                (AppendRequest::new(agent_id, charge.neg(), TxKind::Entropy, &reason, ts), Outcome::Inaction)
            }
            TickPlan::Decided(Ok(Decision::Pass)) => {
                (AppendRequest::new(agent_id, charge.neg(), TxKind::Entropy, "pass", ts), Outcome::Inaction)
            }
            TickPlan::Decided(Ok(Decision::Stake(items))) => {
                self.plan_stakes(&agent, charge, items, ts)?
            }
        };

        let entry = self.store.append(&req)?;
        json_log(
            Domain::Tick,
            "committed",
            obj(&[
                ("agent_id", v_str(agent_id)),
                ("seq", v_int(entry.seq)),
                ("kind", v_str(entry.kind.as_str())),
                ("amount", v_int(entry.amount.units())),
            ]),
        );
        Ok(outcome)
    }

    /// Economic sizing under the lock. Headroom is consumed cumulatively
    /// across the items of one decision so the open-stake cap holds for the
    /// decision as a whole.
    fn plan_stakes(
        &self,
        agent: &Agent,
        charge: Credits,
        items: Vec<crate::decision::ValidatedItem>,
        ts: i64,
    ) -> Result<(AppendRequest, Outcome)> {
        let open_stake = self
            .store
            .open_commitments(&agent.id)?
            .iter()
            .try_fold(Credits::ZERO, |acc, c| acc.checked_add(c.stake))?;
        let after_charge = agent.balance.checked_sub(charge)?;
        let mut headroom =
            decision::stake_headroom(after_charge, open_stake, self.cfg.max_open_fraction);
        let params = SizingParams {
            stake_fraction: self.cfg.stake_fraction,
            min_stake: self.cfg.min_stake,
        };

        let mut stakes: Vec<StakeRecord> = Vec::new();
        let mut total = Credits::ZERO;
        for item in &items {
            let sized = decision::size_stake(item.confidence, headroom, &params);
            if sized.is_zero() {
                continue;
            }
            headroom = headroom.checked_sub(sized)?;
            total = total.checked_add(sized)?;
            stakes.push(StakeRecord {
                market_id: item.market_id.clone(),
                side: item.side,
                stake: sized,
            });
        }

        if stakes.is_empty() {
            // Valid decision, no affordable stake: the no-op path.
            return Ok((
                AppendRequest::new(&agent.id, charge.neg(), TxKind::Entropy, "sized_to_zero", ts),
                Outcome::Inaction,
            ));
        }

        let n = stakes.len();
        let market_ids: Vec<String> = stakes.iter().map(|s| s.market_id.clone()).collect();
        let amount = charge.checked_add(total)?.neg();
        let mut req = AppendRequest::new(&agent.id, amount, TxKind::Wager, "wager", ts);
        req.stakes = stakes;
        req.narration = Some(narrate_wager(&market_ids, &total.to_string()));
        Ok((req, Outcome::Action(n)))
    }

    /// Out-of-band sweep for balance<=0-but-ALIVE agents. Takes the same
    /// per-agent lock as COMMIT so it can never race a tick for that agent.
    pub async fn sweep(&self, now: i64) -> Result<usize> {
        let mut flipped = 0;
        for agent in self.store.insolvent_alive_agents()? {
            let lock = self.locks.for_agent(&agent.id);
            let _guard = lock.lock().await;

            let fresh = match self.store.agent(&agent.id)? {
                Some(a) if a.status == AgentStatus::Alive && !a.balance.is_positive() => a,
                _ => continue,
            };
            let verdict = self.protocol.assess(fresh.balance);
            if let Some(shadow) = verdict.shadow {
                self.store.record_shadow_charge(
                    &agent.id,
                    now,
                    shadow.amount,
                    shadow.would_liquidate,
                    "sweep",
                )?;
                continue;
            }
            if !verdict.liquidate {
                continue;
            }
            let mut req = AppendRequest::new(
                &agent.id,
                fresh.balance.neg(),
                TxKind::Liquidation,
                "sweep",
                now,
            );
            req.set_status = Some(AgentStatus::Dead);
            req.narration = Some(narrate_liquidation(&fresh.balance.to_string()));
            match self.store.append(&req) {
                Ok(entry) => {
                    flipped += 1;
                    json_log(
                        Domain::Sweep,
                        "liquidated",
                        obj(&[("agent_id", v_str(&agent.id)), ("seq", v_int(entry.seq))]),
                    );
                }
                Err(e) => {
                    // Per-agent fault: report and keep sweeping the rest.
                    log(
                        Level::Error,
                        Domain::Sweep,
                        "liquidation_failed",
                        obj(&[
                            ("agent_id", v_str(&agent.id)),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                }
            }
        }
        Ok(flipped)
    }
}
