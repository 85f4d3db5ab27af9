//! Billing invariants
//!
//! Runnable, read-only SQL consistency checks. The worker runs them daily; an
//! operator can run a single check by name after a manual repair or replay.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// One violated invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub campus_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Campus may be billed or entitled incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleLiveRow {
    campus_id: Uuid,
    live_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingGraceRow {
    subscription_id: Uuid,
    campus_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UninvoicedPaymentRow {
    payment_id: Uuid,
    campus_id: Uuid,
    amount_cents: i64,
    completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePaymentRow {
    payment_id: Uuid,
    campus_id: Uuid,
    created_at: OffsetDateTime,
    alerted_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct FlagMismatchRow {
    campus_id: Uuid,
    is_subscribed: bool,
    latest_status: Option<String>,
}

const CHECKS: [&str; 6] = [
    "single_live_subscription",
    "canceled_has_grace",
    "past_due_has_grace",
    "completed_payment_has_invoice",
    "no_stale_pending_payments",
    "subscribed_flag_matches_status",
];

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
    stale_pending_after: Duration,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, stale_pending_after: Duration) -> Self {
        Self {
            pool,
            stale_pending_after,
        }
    }

    /// Run every check and summarise
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let checked_at = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at,
            checks_run: CHECKS.len(),
            checks_passed: CHECKS.len() - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single check by name; unknown names report nothing
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_live_subscription" => self.check_single_live_subscription().await,
            "canceled_has_grace" => self.check_has_grace("canceled", ViolationSeverity::High).await,
            "past_due_has_grace" => {
                self.check_has_grace("past_due", ViolationSeverity::Critical)
                    .await
            }
            "completed_payment_has_invoice" => self.check_completed_payment_has_invoice().await,
            "no_stale_pending_payments" => self.check_stale_pending_payments().await,
            "subscribed_flag_matches_status" => self.check_subscribed_flag().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// The partial unique index should make this impossible; a hit means the
    /// index is missing or was bypassed.
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleLiveRow> = sqlx::query_as(
            r#"
            SELECT campus_id, COUNT(*) AS live_count
            FROM subscriptions
            WHERE status IN ('trial', 'active', 'past_due')
            GROUP BY campus_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                campus_ids: vec![row.campus_id],
                description: format!(
                    "Campus has {} live subscriptions (expected at most 1)",
                    row.live_count
                ),
                context: serde_json::json!({ "live_count": row.live_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// CANCELED and PAST_DUE subscriptions need a grace end to ever leave that state
    async fn check_has_grace(
        &self,
        status: &'static str,
        severity: ViolationSeverity,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingGraceRow> = sqlx::query_as(
            r#"
            SELECT id AS subscription_id, campus_id, status
            FROM subscriptions
            WHERE status = $1 AND grace_period_end IS NULL
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: format!("{}_has_grace", status),
                campus_ids: vec![row.campus_id],
                description: format!(
                    "{} subscription has no grace_period_end and will never be swept",
                    row.status
                ),
                context: serde_json::json!({ "subscription_id": row.subscription_id }),
                severity,
            })
            .collect())
    }

    async fn check_completed_payment_has_invoice(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UninvoicedPaymentRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, p.campus_id, p.amount_cents, p.completed_at
            FROM payments p
            LEFT JOIN invoices i ON i.payment_id = p.id
            WHERE p.status IN ('completed', 'refunded')
              AND i.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_payment_has_invoice".to_string(),
                campus_ids: vec![row.campus_id],
                description: "Completed payment has no invoice".to_string(),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "amount_cents": row.amount_cents,
                    "completed_at": row.completed_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_stale_pending_payments(&self) -> BillingResult<Vec<InvariantViolation>> {
        let cutoff = OffsetDateTime::now_utc() - self.stale_pending_after;
        let rows: Vec<StalePaymentRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, campus_id, created_at, alerted_at
            FROM payments
            WHERE status = 'pending' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_pending_payments".to_string(),
                campus_ids: vec![row.campus_id],
                description: "Payment has been PENDING past the alert timeout".to_string(),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "created_at": row.created_at,
                    "alerted": row.alerted_at.is_some(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// The access flag is on exactly when the latest subscription still grants access
    async fn check_subscribed_flag(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FlagMismatchRow> = sqlx::query_as(
            r#"
            WITH latest AS (
                SELECT DISTINCT ON (campus_id) campus_id, status
                FROM subscriptions
                ORDER BY campus_id, created_at DESC
            )
            SELECT
                COALESCE(f.campus_id, l.campus_id) AS campus_id,
                COALESCE(f.is_subscribed, FALSE) AS is_subscribed,
                l.status AS latest_status
            FROM campus_billing_status f
            FULL OUTER JOIN latest l ON l.campus_id = f.campus_id
            WHERE (COALESCE(f.is_subscribed, FALSE)
                   AND (l.status IS NULL OR l.status IN ('suspended', 'expired')))
               OR (NOT COALESCE(f.is_subscribed, FALSE)
                   AND l.status IN ('trial', 'active', 'past_due'))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscribed_flag_matches_status".to_string(),
                campus_ids: vec![row.campus_id],
                description: format!(
                    "Campus access flag is {} but latest subscription is {}",
                    row.is_subscribed,
                    row.latest_status.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "is_subscribed": row.is_subscribed,
                    "latest_status": row.latest_status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks_are_unique() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        let unique: std::collections::HashSet<_> = checks.iter().collect();
        assert_eq!(unique.len(), checks.len());
        assert!(checks.contains(&"subscribed_flag_matches_status"));
    }
}
