//! Time-driven billing sweeps
//!
//! The scheduler claims a due subscription by committing its PENDING payment
//! together with a version bump of the subscription. A second scheduler racing on
//! the same subscription loses the version check and skips it, so each billing
//! cycle is charged at most once.

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::events::{Actor, BillingEventBuilder, BillingEventType};
use crate::notifications::Notification;
use crate::payments::{ChargeOutcome, Payment, PaymentKind, PaymentProcessor, PaymentStatus};
use crate::state_machine::validate_transition;
use crate::store::{Changeset, PaymentFilter, SubscriptionFilter};
use crate::subscriptions::{
    load_subscription, payment_created_event, Subscription, SubscriptionService,
    SubscriptionStatus,
};
use crate::tax::ChargeAmount;

/// Reason recorded when a non-renewing subscription reaches its period end
pub const AUTO_RENEW_DISABLED: &str = "auto_renew_disabled";

const SWEEP_BATCH_SIZE: i64 = 500;

/// Bounded exponential backoff for failed charges
///
/// Retry `k` (0-based) is scheduled `base * 2^k` after the failure. No retry is
/// scheduled once `max_retries` is reached or when it would land at or after the
/// end of the grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            max_retries: config.max_payment_retries,
            base_delay: Duration::hours(config.retry_base_delay_hours),
        }
    }

    pub fn next_retry_at(
        &self,
        attempt: i32,
        now: OffsetDateTime,
        grace_end: OffsetDateTime,
    ) -> Option<OffsetDateTime> {
        if attempt < 0 || i64::from(attempt) >= i64::from(self.max_retries) {
            return None;
        }
        let factor = 1i32.checked_shl(attempt as u32)?;
        let delay = self.base_delay.checked_mul(factor)?;
        let at = now.checked_add(delay)?;
        (at < grace_end).then_some(at)
    }
}

/// What happened to one subscription in a billing pass
#[derive(Debug, Clone)]
pub enum BillingOutcome {
    Charged(Payment),
    Failed(Payment),
    /// The gateway accepted the charge but has not decided yet
    Processing(Payment),
    /// Auto-renew was off; the subscription was canceled at period end
    Canceled(Subscription),
    Skipped(&'static str),
}

/// Counters for one sweep, logged by the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: u32,
    pub charged: u32,
    pub failed: u32,
    pub processing: u32,
    pub skipped: u32,
    pub canceled: u32,
    pub suspended: u32,
    pub expired: u32,
    pub pending: u32,
    pub alerted: u32,
    pub errors: u32,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.examined += other.examined;
        self.charged += other.charged;
        self.failed += other.failed;
        self.processing += other.processing;
        self.skipped += other.skipped;
        self.canceled += other.canceled;
        self.suspended += other.suspended;
        self.expired += other.expired;
        self.pending += other.pending;
        self.alerted += other.alerted;
        self.errors += other.errors;
    }

    fn record(&mut self, outcome: &BillingOutcome) {
        match outcome {
            BillingOutcome::Charged(_) => self.charged += 1,
            BillingOutcome::Failed(_) => self.failed += 1,
            BillingOutcome::Processing(_) => self.processing += 1,
            BillingOutcome::Canceled(_) => self.canceled += 1,
            BillingOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

#[derive(Clone)]
pub struct BillingScheduler {
    ctx: BillingContext,
    subscriptions: SubscriptionService,
    payments: PaymentProcessor,
}

impl BillingScheduler {
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            subscriptions: SubscriptionService::new(ctx.clone()),
            payments: PaymentProcessor::new(ctx.clone()),
            ctx,
        }
    }

    /// Run every sweep once
    pub async fn run_all(&self) -> BillingResult<SweepReport> {
        let mut report = self.run_billing_sweep().await?;
        report.merge(self.run_retry_sweep().await?);
        report.merge(self.run_grace_sweep().await?);
        report.merge(self.run_stale_payment_sweep().await?);
        Ok(report)
    }

    /// Charge every TRIAL or ACTIVE subscription whose next billing date has passed
    pub async fn run_billing_sweep(&self) -> BillingResult<SweepReport> {
        let now = self.ctx.now();
        let due = self
            .ctx
            .store
            .list_subscriptions(&SubscriptionFilter {
                statuses: vec![SubscriptionStatus::Trial, SubscriptionStatus::Active],
                next_billing_at_or_before: Some(now),
                limit: Some(SWEEP_BATCH_SIZE),
                ..Default::default()
            })
            .await?;

        let report = self.process_batch(due).await;
        tracing::info!(
            examined = report.examined,
            charged = report.charged,
            failed = report.failed,
            processing = report.processing,
            canceled = report.canceled,
            skipped = report.skipped,
            pending = report.pending,
            "Billing sweep complete"
        );
        Ok(report)
    }

    /// Retry PAST_DUE subscriptions whose next retry is due and grace has not ended
    pub async fn run_retry_sweep(&self) -> BillingResult<SweepReport> {
        let now = self.ctx.now();
        let due: Vec<Subscription> = self
            .ctx
            .store
            .list_subscriptions(&SubscriptionFilter {
                statuses: vec![SubscriptionStatus::PastDue],
                next_retry_at_or_before: Some(now),
                limit: Some(SWEEP_BATCH_SIZE),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|s| s.grace_period_end.is_some_and(|g| g > now))
            .collect();

        let report = self.process_batch(due).await;
        tracing::info!(
            examined = report.examined,
            charged = report.charged,
            failed = report.failed,
            processing = report.processing,
            skipped = report.skipped,
            pending = report.pending,
            "Retry sweep complete"
        );
        Ok(report)
    }

    async fn process_batch(&self, due: Vec<Subscription>) -> SweepReport {
        let mut report = SweepReport::default();
        for subscription in due {
            report.examined += 1;
            match self.process_billing(subscription.id).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        subscription_id = %subscription.id,
                        campus_id = %subscription.campus_id,
                        error = %e,
                        "Billing failed for subscription"
                    );
                    match self
                        .subscriptions
                        .mark_pending(subscription.id, &e.to_string())
                        .await
                    {
                        Ok(s) if s.status == SubscriptionStatus::Pending => report.pending += 1,
                        Ok(_) => {}
                        Err(mark_err) => tracing::error!(
                            subscription_id = %subscription.id,
                            error = %mark_err,
                            "Failed to mark subscription pending"
                        ),
                    }
                }
            }
        }
        report
    }

    /// Run the charge workflow for one subscription if it is due.
    ///
    /// Errors other than a gateway verdict are returned so the caller can park
    /// the subscription in PENDING.
    pub async fn process_billing(&self, subscription_id: Uuid) -> BillingResult<BillingOutcome> {
        let mut subscription = load_subscription(&self.ctx, subscription_id).await?;
        let now = self.ctx.now();

        let due = match subscription.status {
            SubscriptionStatus::Trial | SubscriptionStatus::Active => {
                subscription.next_billing_date <= now
            }
            SubscriptionStatus::PastDue => {
                subscription.next_retry_at.is_some_and(|r| r <= now)
                    && subscription.grace_period_end.is_some_and(|g| g > now)
            }
            _ => false,
        };
        if !due {
            return Ok(BillingOutcome::Skipped("not due"));
        }

        if subscription.status != SubscriptionStatus::PastDue && !subscription.auto_renew {
            let canceled = self
                .subscriptions
                .cancel_loaded(
                    subscription,
                    false,
                    Some(AUTO_RENEW_DISABLED.to_string()),
                    Actor::system(),
                )
                .await?;
            return Ok(BillingOutcome::Canceled(canceled));
        }

        let in_flight = self
            .ctx
            .store
            .list_payments(&PaymentFilter {
                subscription_id: Some(subscription.id),
                statuses: vec![PaymentStatus::Pending],
                limit: Some(1),
                ..Default::default()
            })
            .await?;
        if !in_flight.is_empty() {
            tracing::info!(
                subscription_id = %subscription.id,
                payment_id = %in_flight[0].id,
                "Payment already in flight, skipping"
            );
            return Ok(BillingOutcome::Skipped("payment in flight"));
        }

        let payment = self.next_payment(&subscription, now).await?;

        subscription.updated_at = now;
        let mut changes = Changeset::new();
        changes.update_subscription(&mut subscription);
        changes.insert_payment(&payment);
        changes.event(payment_created_event(&payment, Actor::system(), now));
        match self.ctx.commit(changes).await {
            Ok(()) => {}
            Err(BillingError::ConcurrentModification(reason)) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    reason = %reason,
                    "Subscription claimed by another writer, skipping"
                );
                return Ok(BillingOutcome::Skipped("claimed concurrently"));
            }
            Err(e) => return Err(e),
        }

        match self.payments.execute(&payment).await? {
            ChargeOutcome::Succeeded(p) => Ok(BillingOutcome::Charged(p)),
            ChargeOutcome::Failed(p) => Ok(BillingOutcome::Failed(p)),
            ChargeOutcome::Processing(p) => Ok(BillingOutcome::Processing(p)),
        }
    }

    /// Renewals bill the next period; a PAST_DUE retry re-bills the period and
    /// kind of the payment that failed.
    async fn next_payment(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<Payment> {
        let tax_bps = self.ctx.config.tax_rate_bps;

        if subscription.status == SubscriptionStatus::PastDue {
            let last_failed = self
                .ctx
                .store
                .list_payments(&PaymentFilter {
                    subscription_id: Some(subscription.id),
                    statuses: vec![PaymentStatus::Failed],
                    limit: Some(1),
                    ..Default::default()
                })
                .await?
                .into_iter()
                .next();

            if let Some(failed) = last_failed {
                let base = failed.subtotal_cents() + failed.credit_applied_cents;
                let charge =
                    ChargeAmount::with_credit(base, subscription.credit_balance_cents, tax_bps);
                return Ok(Payment::new_pending(
                    subscription,
                    failed.kind,
                    &charge,
                    failed.period_start,
                    failed.period_end,
                    now,
                ));
            }
        }

        let charge = ChargeAmount::with_credit(
            subscription.price_cents,
            subscription.credit_balance_cents,
            tax_bps,
        );
        Ok(Payment::new_pending(
            subscription,
            PaymentKind::Recurring,
            &charge,
            subscription.end_date,
            subscription.period_end_after(subscription.end_date),
            now,
        ))
    }

    /// Close out subscriptions whose grace window has ended.
    ///
    /// PAST_DUE becomes SUSPENDED (EXPIRED when auto-renew is off), CANCELED
    /// becomes EXPIRED, and SUSPENDED expires after the retention window.
    pub async fn run_grace_sweep(&self) -> BillingResult<SweepReport> {
        let now = self.ctx.now();
        let mut report = SweepReport::default();

        let past_grace = self
            .ctx
            .store
            .list_subscriptions(&SubscriptionFilter {
                statuses: vec![SubscriptionStatus::PastDue, SubscriptionStatus::Canceled],
                grace_ended_at_or_before: Some(now),
                limit: Some(SWEEP_BATCH_SIZE),
                ..Default::default()
            })
            .await?;
        let retention_cutoff = now - self.ctx.config.suspended_retention();
        let stale_suspended = self
            .ctx
            .store
            .list_subscriptions(&SubscriptionFilter {
                statuses: vec![SubscriptionStatus::Suspended],
                grace_ended_at_or_before: Some(retention_cutoff),
                limit: Some(SWEEP_BATCH_SIZE),
                ..Default::default()
            })
            .await?;

        for subscription in past_grace.into_iter().chain(stale_suspended) {
            report.examined += 1;
            match self.close_out(subscription.id).await {
                Ok(Some(SubscriptionStatus::Suspended)) => report.suspended += 1,
                Ok(Some(_)) => report.expired += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "Grace sweep failed for subscription"
                    );
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            suspended = report.suspended,
            expired = report.expired,
            skipped = report.skipped,
            errors = report.errors,
            "Grace sweep complete"
        );
        Ok(report)
    }

    /// Apply the end-of-grace transition; `None` if the stored state no longer
    /// qualifies.
    async fn close_out(&self, subscription_id: Uuid) -> BillingResult<Option<SubscriptionStatus>> {
        let mut subscription = load_subscription(&self.ctx, subscription_id).await?;
        let now = self.ctx.now();
        let grace_ended = |cutoff: OffsetDateTime| {
            subscription.grace_period_end.is_some_and(|g| g <= cutoff)
        };

        let target = match subscription.status {
            SubscriptionStatus::PastDue if grace_ended(now) => {
                if subscription.auto_renew {
                    SubscriptionStatus::Suspended
                } else {
                    SubscriptionStatus::Expired
                }
            }
            SubscriptionStatus::Canceled if grace_ended(now) => SubscriptionStatus::Expired,
            SubscriptionStatus::Suspended
                if grace_ended(now - self.ctx.config.suspended_retention()) =>
            {
                SubscriptionStatus::Expired
            }
            _ => return Ok(None),
        };
        validate_transition(subscription.status, target, "close out grace period")?;

        let previous_status = subscription.status;
        subscription.status = target;
        subscription.next_retry_at = None;
        if target == SubscriptionStatus::Suspended {
            // Retention for suspended subscriptions is measured from here
            subscription.grace_period_end = Some(now);
        }
        subscription.updated_at = now;

        let event_type = if target == SubscriptionStatus::Suspended {
            BillingEventType::SubscriptionSuspended
        } else {
            BillingEventType::SubscriptionExpired
        };

        let mut changes = Changeset::new();
        changes.update_subscription(&mut subscription);
        changes.campus_flag(subscription.campus_id, false);
        changes.event(
            BillingEventBuilder::new(subscription.campus_id, event_type)
                .subscription(subscription.id)
                .data(serde_json::json!({
                    "previous_status": previous_status.as_str(),
                    "retry_count": subscription.retry_count,
                }))
                .build(now),
        );
        match self.ctx.commit(changes).await {
            Ok(()) => {}
            Err(BillingError::ConcurrentModification(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        tracing::info!(
            subscription_id = %subscription.id,
            campus_id = %subscription.campus_id,
            from = %previous_status,
            to = %target,
            "Grace period closed"
        );

        let email = subscription.billing_contact.email.clone();
        let notification = if target == SubscriptionStatus::Suspended {
            Notification::Suspended {
                campus_id: subscription.campus_id,
                email,
            }
        } else {
            Notification::Expired {
                campus_id: subscription.campus_id,
                email,
            }
        };
        self.ctx.notifier.notify(notification).await;

        Ok(Some(target))
    }

    /// Alert once for every payment stuck in PENDING past the configured timeout
    pub async fn run_stale_payment_sweep(&self) -> BillingResult<SweepReport> {
        let now = self.ctx.now();
        let mut report = SweepReport::default();
        let stale = self
            .ctx
            .store
            .list_payments(&PaymentFilter {
                statuses: vec![PaymentStatus::Pending],
                created_before: Some(now - self.ctx.config.stale_pending_after()),
                unalerted_only: true,
                limit: Some(SWEEP_BATCH_SIZE),
                ..Default::default()
            })
            .await?;

        for payment in stale {
            report.examined += 1;
            if !self.ctx.store.mark_payment_alerted(payment.id, now).await? {
                report.skipped += 1;
                continue;
            }
            report.alerted += 1;
            let age_minutes = (now - payment.created_at).whole_minutes();
            self.ctx
                .notifier
                .alert_admins(
                    "Payment stuck in PENDING",
                    format!(
                        "Payment {} ({} {}) for campus {} has been pending for {} minutes",
                        payment.id,
                        payment.kind.as_str(),
                        edubill_shared::format_cents(payment.amount_cents, &payment.currency),
                        payment.campus_id,
                        age_minutes
                    ),
                    Some(payment.subscription_id),
                    Some(payment.id),
                )
                .await;
        }

        if report.alerted > 0 {
            tracing::error!(alerted = report.alerted, "Stale pending payments found");
        } else {
            tracing::debug!(examined = report.examined, "Stale payment sweep complete");
        }
        Ok(report)
    }
}
