//! Mid-period plan change proration
//!
//! `delta = new_price - round_half_up(remaining_fraction * current_price)`, where
//! `remaining_fraction = (period_end - now) / (period_end - period_start)` clamped
//! to `[0, 1]`. A positive delta is charged now, a negative delta becomes credit.

use edubill_shared::{format_cents, scale_cents};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProratedAmount {
    /// Signed delta in cents: positive is owed by the campus, negative is credit
    pub amount_cents: i64,
    /// Unused value of the current period that was netted off
    pub unused_credit_cents: i64,
    pub description: String,
}

impl ProratedAmount {
    pub fn is_upgrade(&self) -> bool {
        self.amount_cents > 0
    }

    pub fn is_downgrade(&self) -> bool {
        self.amount_cents < 0
    }
}

/// Remaining share of the current period as an exact fraction `(num, den)`.
///
/// Degenerate periods (end not after start) count as fully consumed.
pub fn remaining_fraction(
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> (i128, i128) {
    let total = (period_end - period_start).whole_nanoseconds();
    if total <= 0 {
        return (0, 1);
    }
    let remaining = (period_end - now).whole_nanoseconds().clamp(0, total);
    (remaining, total)
}

pub fn calculate_proration(
    current_price_cents: i64,
    new_price_cents: i64,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
    currency: &str,
) -> ProratedAmount {
    let (remaining, total) = remaining_fraction(period_start, period_end, now);
    let unused = scale_cents(current_price_cents, remaining, total);
    let amount = new_price_cents - unused;

    let description = if amount > 0 {
        format!(
            "Upgrade charge {} (new price {} less {} unused)",
            format_cents(amount, currency),
            format_cents(new_price_cents, currency),
            format_cents(unused, currency)
        )
    } else if amount < 0 {
        format!(
            "Downgrade credit {} ({} unused less new price {})",
            format_cents(-amount, currency),
            format_cents(unused, currency),
            format_cents(new_price_cents, currency)
        )
    } else {
        "No proration adjustment".to_string()
    };

    ProratedAmount {
        amount_cents: amount,
        unused_credit_cents: unused,
        description,
    }
}
