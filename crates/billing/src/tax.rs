//! Tax applied to charges
//!
//! Tax is an opaque rate in basis points supplied by configuration. It is
//! computed on the charged subtotal (after any account credit) and rounded
//! half-up to the cent.

use edubill_shared::apply_basis_points;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub rate_bps: u32,
}

impl TaxBreakdown {
    pub fn compute(subtotal_cents: i64, rate_bps: u32) -> Self {
        let subtotal_cents = subtotal_cents.max(0);
        let tax_cents = apply_basis_points(subtotal_cents, rate_bps);
        Self {
            subtotal_cents,
            tax_cents,
            total_cents: subtotal_cents + tax_cents,
            rate_bps,
        }
    }

    /// Rate rendered as a percentage string, e.g. `"8.25%"`
    pub fn rate_display(&self) -> String {
        format!("{}.{:02}%", self.rate_bps / 100, self.rate_bps % 100)
    }
}

/// Split of a charge between account credit and the amount sent to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeAmount {
    pub credit_applied_cents: i64,
    pub tax: TaxBreakdown,
}

impl ChargeAmount {
    /// Apply available credit to `price_cents`, then tax the remainder
    pub fn with_credit(price_cents: i64, credit_balance_cents: i64, rate_bps: u32) -> Self {
        let credit_applied_cents = credit_balance_cents.clamp(0, price_cents.max(0));
        Self {
            credit_applied_cents,
            tax: TaxBreakdown::compute(price_cents - credit_applied_cents, rate_bps),
        }
    }

    pub fn total_cents(&self) -> i64 {
        self.tax.total_cents
    }
}
