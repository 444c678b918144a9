//! Entropy and liquidation rules.
//!
//! Evaluated once per tick, just before commit. Existence cost is fixed or
//! balance-proportional. Insolvency clamps the charge so the resulting
//! balance is exactly zero and forces the LIQUIDATION entry kind; a
//! liquidating agent's bets are never placed because solvency is decided
//! before action sizing. The observe/enforce branch lives here and nowhere
//! else: in observe mode the computed charge goes to the shadow side channel
//! and nothing real happens, while settlements elsewhere stay real money.

use serde::Serialize;

use crate::money::Credits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Counterfactual: charges and liquidations are recorded, never applied.
    Observe,
    /// Charges and liquidations mutate balance and status.
    Enforce,
}

impl Mode {
    pub fn from_env() -> Self {
        match std::env::var("MODE").as_deref() {
            Ok("enforce") => Mode::Enforce,
            _ => Mode::Observe,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase", tag = "rate", content = "value")]
pub enum EntropyRate {
    Fixed(Credits),
    /// Fraction of the pre-tick balance, in [0, 1].
    Proportional(f64),
}

impl EntropyRate {
    pub fn from_env() -> Self {
        match std::env::var("ENTROPY_RATE").as_deref() {
            Ok("proportional") => EntropyRate::Proportional(
                std::env::var("ENTROPY_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.01),
            ),
            _ => EntropyRate::Fixed(Credits::from_f64(
                std::env::var("ENTROPY_FIXED").ok().and_then(|v| v.parse().ok()).unwrap_or(0.75),
            )),
        }
    }

    pub fn charge_for(&self, balance: Credits) -> Credits {
        match self {
            EntropyRate::Fixed(c) => *c,
            EntropyRate::Proportional(pct) => balance.scale_by(*pct),
        }
    }
}

/// What the rest of this tick is allowed to do with money.
#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    /// The real charge to book this tick (zero in observe mode).
    pub charge: Credits,
    /// The tick must collapse to a LIQUIDATION entry; no stakes are placed.
    pub liquidate: bool,
    /// Observe-mode record of what enforcement would have done.
    pub shadow: Option<ShadowCharge>,
}

#[derive(Debug, Clone, Copy)]
pub struct ShadowCharge {
    pub amount: Credits,
    pub would_liquidate: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    pub mode: Mode,
    pub rate: EntropyRate,
}

impl Protocol {
    pub fn new(mode: Mode, rate: EntropyRate) -> Self {
        Self { mode, rate }
    }

    /// Decide this tick's existence cost against the pre-tick balance.
    pub fn assess(&self, balance: Credits) -> Verdict {
        let nominal = self.rate.charge_for(balance);
        let insolvent = balance.checked_sub(nominal).map(|b| !b.is_positive()).unwrap_or(true);

        match self.mode {
            Mode::Enforce => {
                if insolvent {
                    // Clamp to an exact drain: resulting balance is 0.00, the
                    // entry amount is the negation of the pre-tick balance.
                    Verdict { charge: balance, liquidate: true, shadow: None }
                } else {
                    Verdict { charge: nominal, liquidate: false, shadow: None }
                }
            }
            Mode::Observe => Verdict {
                charge: Credits::ZERO,
                liquidate: false,
                shadow: Some(ShadowCharge {
                    amount: if insolvent { balance } else { nominal },
                    would_liquidate: insolvent,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforce(rate: EntropyRate) -> Protocol {
        Protocol::new(Mode::Enforce, rate)
    }

    #[test]
    fn solvent_agent_pays_full_fixed_charge() {
        let p = enforce(EntropyRate::Fixed(Credits::from_f64(0.75)));
        let v = p.assess(Credits::from_whole(10));
        assert_eq!(v.charge, Credits::from_f64(0.75));
        assert!(!v.liquidate);
        assert!(v.shadow.is_none());
    }

    #[test]
    fn insolvency_clamps_to_exact_drain() {
        let p = enforce(EntropyRate::Fixed(Credits::from_f64(0.75)));
        let v = p.assess(Credits::from_f64(0.5));
        // 0.50 balance facing a 0.75 charge drains exactly 0.50, not 0.75.
        assert_eq!(v.charge, Credits::from_f64(0.5));
        assert!(v.liquidate);
    }

    #[test]
    fn exact_cover_still_liquidates() {
        // balance - charge == 0 is insolvency, not survival.
        let p = enforce(EntropyRate::Fixed(Credits::from_f64(0.75)));
        let v = p.assess(Credits::from_f64(0.75));
        assert!(v.liquidate);
        assert_eq!(v.charge, Credits::from_f64(0.75));
    }

    #[test]
    fn proportional_charge_scales_with_balance() {
        let p = enforce(EntropyRate::Proportional(0.01));
        let v = p.assess(Credits::from_whole(200));
        assert_eq!(v.charge, Credits::from_whole(2));
        assert!(!v.liquidate);
    }

    #[test]
    fn observe_mode_charges_nothing_and_records_shadow() {
        let p = Protocol::new(Mode::Observe, EntropyRate::Fixed(Credits::from_f64(0.75)));
        let v = p.assess(Credits::from_f64(0.5));
        assert_eq!(v.charge, Credits::ZERO);
        assert!(!v.liquidate);
        let shadow = v.shadow.unwrap();
        assert_eq!(shadow.amount, Credits::from_f64(0.5));
        assert!(shadow.would_liquidate);
    }
}
