//! Proration for mid-cycle plan changes.
//!
//! Time is counted in whole days with the remainder rounded down, so a
//! merchant is never credited for a partial day.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Result of prorating a plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Proration {
    pub remaining_days: i64,
    pub total_days: i64,
    /// Unused value of the current plan.
    pub credit: Decimal,
    /// Value of the new plan over the remaining days.
    pub charge: Decimal,
    /// `charge - credit`; zero or negative means nothing is due.
    pub net: Decimal,
}

impl Proration {
    pub fn is_due(&self) -> bool {
        self.net > Decimal::ZERO
    }
}

fn money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Prorate switching from `current_price` to `new_price` at `at`, within the
/// cycle `period_start..period_end`. Both prices are per full cycle.
pub fn prorate(
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    at: DateTime<Utc>,
    current_price: Decimal,
    new_price: Decimal,
) -> Proration {
    let total_days = (period_end - period_start).num_days().max(0);
    let remaining_days = (period_end - at).num_days().clamp(0, total_days);

    let (credit, charge) = if total_days == 0 {
        (Decimal::ZERO, Decimal::ZERO)
    } else {
        let fraction = Decimal::from(remaining_days) / Decimal::from(total_days);
        (money(current_price * fraction), money(new_price * fraction))
    };

    Proration {
        remaining_days,
        total_days,
        credit,
        charge,
        net: charge - credit,
    }
}
