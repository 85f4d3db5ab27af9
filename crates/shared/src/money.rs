//! Money arithmetic on integer minor units (cents)
//!
//! All amounts are carried as `i64` cents. Fractional results are rounded to the
//! nearest cent with halves rounded away from zero, so a 2-decimal half-up rule
//! holds for every non-negative amount.

/// Integer division rounding halves away from zero.
///
/// Returns `None` when `denominator` is zero.
pub fn div_round_half_up(numerator: i128, denominator: i128) -> Option<i128> {
    if denominator == 0 {
        return None;
    }

    let (n, d) = if denominator < 0 {
        (-numerator, -denominator)
    } else {
        (numerator, denominator)
    };

    let magnitude = (n.abs() * 2 + d) / (2 * d);
    Some(if n < 0 { -magnitude } else { magnitude })
}

/// Scale `amount_cents` by `numerator / denominator`, rounding half-up to the cent.
///
/// A zero denominator scales to zero.
pub fn scale_cents(amount_cents: i64, numerator: i128, denominator: i128) -> i64 {
    div_round_half_up(i128::from(amount_cents) * numerator, denominator)
        .map(|v| v.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64)
        .unwrap_or(0)
}

/// Apply a rate expressed in basis points (1/100 of a percent).
pub fn apply_basis_points(amount_cents: i64, basis_points: u32) -> i64 {
    scale_cents(amount_cents, i128::from(basis_points), 10_000)
}

/// Render cents as `"1234.56 USD"`.
pub fn format_cents(cents: i64, currency: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02} {}", sign, abs / 100, abs % 100, currency)
}
