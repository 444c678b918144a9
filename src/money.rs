//! Signed fixed-point money type.
//!
//! All ledger amounts are `Credits`: an i64 count of 1e-8 units. Floating
//! point never touches a balance; the only f64 crossings are config values
//! and oracle confidences, both converted through i128 intermediates with
//! rounding toward zero.

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Fractional units per whole credit (8 fractional digits).
pub const SCALE: i64 = 100_000_000;

/// One cent: the minimum stake granularity.
pub const CENT: i64 = SCALE / 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credits(i64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    pub fn from_units(units: i64) -> Self {
        Credits(units)
    }

    /// Whole credits, no fractional part.
    pub fn from_whole(n: i64) -> Self {
        Credits(n * SCALE)
    }

    /// Lossy entry point for config values. Rounds toward zero.
    pub fn from_f64(v: f64) -> Self {
        Credits((v * SCALE as f64) as i64)
    }

    pub fn units(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Credits) -> Result<Credits> {
        match self.0.checked_add(other.0) {
            Some(v) => Ok(Credits(v)),
            None => bail!("credits overflow: {} + {}", self.0, other.0),
        }
    }

    pub fn checked_sub(self, other: Credits) -> Result<Credits> {
        match self.0.checked_sub(other.0) {
            Some(v) => Ok(Credits(v)),
            None => bail!("credits overflow: {} - {}", self.0, other.0),
        }
    }

    pub fn neg(self) -> Credits {
        Credits(-self.0)
    }

    pub fn min(self, other: Credits) -> Credits {
        if self.0 <= other.0 { self } else { other }
    }

    pub fn max(self, other: Credits) -> Credits {
        if self.0 >= other.0 { self } else { other }
    }

    /// Multiply by a fraction in [0, 1], rounding toward zero.
    ///
    /// The fraction is snapped to 1e-8 resolution first so the product is a
    /// pure integer computation; an i128 intermediate makes overflow
    /// impossible for any representable balance.
    pub fn scale_by(self, frac: f64) -> Credits {
        let f = frac.clamp(0.0, 1.0);
        let frac_units = (f * SCALE as f64) as i128;
        let product = self.0 as i128 * frac_units / SCALE as i128;
        Credits(product as i64)
    }

    /// Round down (toward zero) to a multiple of `step`.
    pub fn floor_to(self, step: Credits) -> Credits {
        if step.0 <= 0 {
            return self;
        }
        Credits(self.0 / step.0 * step.0)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / SCALE as u64;
        let frac = abs % SCALE as u64;
        // Two digits is the display granularity; the stored value keeps all 8.
        if frac % (CENT as u64) == 0 {
            write!(f, "{}{}.{:02}", sign, whole, frac / CENT as u64)
        } else {
            write!(f, "{}{}.{:08}", sign, whole, frac)
        }
    }
}
