//! Read-only billing analytics for campuses and platform administrators

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::payments::{Payment, PaymentStatus};
use crate::plans::PlanCatalog;
use crate::store::{PaymentFilter, SubscriptionFilter};
use crate::subscriptions::{Subscription, SubscriptionStatus};
use crate::usage::{quota_report, QuotaUsage};

const REVENUE_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaymentCounts {
    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
    pub refunded: i64,
}

impl PaymentCounts {
    fn record(&mut self, status: PaymentStatus) {
        match status {
            PaymentStatus::Pending => self.pending += 1,
            PaymentStatus::Completed => self.completed += 1,
            PaymentStatus::Failed => self.failed += 1,
            PaymentStatus::Refunded => self.refunded += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampusAnalytics {
    pub campus_id: Uuid,
    pub subscription_id: Uuid,
    pub status: SubscriptionStatus,
    pub plan_name: String,
    pub total_paid_cents: i64,
    pub total_refunded_cents: i64,
    pub payments: PaymentCounts,
    pub days_until_renewal: i64,
    pub credit_balance_cents: i64,
    pub usage: Vec<QuotaUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: SubscriptionStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformStats {
    pub generated_at: OffsetDateTime,
    pub subscriptions_by_status: Vec<StatusCount>,
    /// Recurring revenue of paying subscriptions, normalised to one month
    pub mrr_cents: i64,
    pub revenue_last_30_days_cents: i64,
    pub failed_payments_last_30_days: i64,
    pub stale_pending_payments: i64,
}

/// Payment total net of refunds, for completed or refunded payments
fn net_collected(payment: &Payment) -> i64 {
    match payment.status {
        PaymentStatus::Completed | PaymentStatus::Refunded => {
            payment.amount_cents - payment.refund_amount_cents.unwrap_or(0)
        }
        _ => 0,
    }
}

/// Monthly recurring revenue across `subscriptions`, rounded half-up
pub fn monthly_recurring_revenue(subscriptions: &[Subscription]) -> i64 {
    let annual: i64 = subscriptions
        .iter()
        .filter(|s| matches!(s.status, SubscriptionStatus::Active | SubscriptionStatus::PastDue))
        .map(|s| s.price_cents * i64::from(12 / s.billing_period.months()))
        .sum();
    (annual + 6) / 12
}

#[derive(Clone)]
pub struct AnalyticsService {
    ctx: BillingContext,
    catalog: PlanCatalog,
}

impl AnalyticsService {
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            catalog: PlanCatalog::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn campus_analytics(&self, campus_id: Uuid) -> BillingResult<CampusAnalytics> {
        let now = self.ctx.now();
        let subscription = self
            .ctx
            .store
            .latest_subscription(campus_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription for campus {}", campus_id))
            })?;
        let plan = self.catalog.get_plan(subscription.plan_id).await?;

        let payments = self
            .ctx
            .store
            .list_payments(&PaymentFilter {
                campus_id: Some(campus_id),
                ..Default::default()
            })
            .await?;

        let mut counts = PaymentCounts::default();
        let mut total_paid_cents = 0;
        let mut total_refunded_cents = 0;
        for payment in &payments {
            counts.record(payment.status);
            if matches!(payment.status, PaymentStatus::Completed | PaymentStatus::Refunded) {
                total_paid_cents += payment.amount_cents;
            }
            total_refunded_cents += payment.refund_amount_cents.unwrap_or(0);
        }

        let days_until_renewal = if subscription.status.is_live() {
            subscription.days_until_renewal(now)
        } else {
            0
        };

        Ok(CampusAnalytics {
            campus_id,
            subscription_id: subscription.id,
            status: subscription.status,
            plan_name: plan.name,
            total_paid_cents,
            total_refunded_cents,
            payments: counts,
            days_until_renewal,
            credit_balance_cents: subscription.credit_balance_cents,
            usage: quota_report(&subscription.usage, &plan.quotas),
        })
    }

    pub async fn platform_stats(&self) -> BillingResult<PlatformStats> {
        let now = self.ctx.now();
        let window_start = now - Duration::days(REVENUE_WINDOW_DAYS);

        let subscriptions_by_status = self
            .ctx
            .store
            .subscription_status_counts()
            .await?
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect();

        let paying = self
            .ctx
            .store
            .list_subscriptions(&SubscriptionFilter::with_statuses(&[
                SubscriptionStatus::Active,
                SubscriptionStatus::PastDue,
            ]))
            .await?;

        let recent = self
            .ctx
            .store
            .list_payments(&PaymentFilter {
                created_at_or_after: Some(window_start),
                ..Default::default()
            })
            .await?;
        let revenue_last_30_days_cents = recent
            .iter()
            .filter(|p| p.completed_at.is_some_and(|at| at >= window_start))
            .map(net_collected)
            .sum();
        let failed_payments_last_30_days = recent
            .iter()
            .filter(|p| p.status == PaymentStatus::Failed)
            .count() as i64;

        let stale_pending_payments = self
            .ctx
            .store
            .list_payments(&PaymentFilter {
                statuses: vec![PaymentStatus::Pending],
                created_before: Some(now - self.ctx.config.stale_pending_after()),
                ..Default::default()
            })
            .await?
            .len() as i64;

        Ok(PlatformStats {
            generated_at: now,
            subscriptions_by_status,
            mrr_cents: monthly_recurring_revenue(&paying),
            revenue_last_30_days_cents,
            failed_payments_last_30_days,
            stale_pending_payments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ActorType;
    use crate::gateway::ChargeResponse;
    use crate::plans::{BillingPeriod, NewPlan};
    use crate::test_support::{harness, monthly_plan};

    #[tokio::test]
    async fn test_campus_analytics_totals() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;

        let initial = h
            .payments
            .list_payments(&PaymentFilter {
                subscription_id: Some(sub.id),
                ..Default::default()
            })
            .await
            .unwrap()
            .remove(0);
        h.payments
            .record_refund(initial.id, 2_500, Some("goodwill".into()), ActorType::Admin)
            .await
            .unwrap();

        let analytics = AnalyticsService::new(h.ctx.clone())
            .campus_analytics(sub.campus_id)
            .await
            .unwrap();
        assert_eq!(analytics.total_paid_cents, 10_000);
        assert_eq!(analytics.total_refunded_cents, 2_500);
        assert_eq!(analytics.payments.completed + analytics.payments.refunded, 1);
        assert!(analytics.days_until_renewal >= 28);
        assert_eq!(analytics.usage.len(), 4);
    }

    #[tokio::test]
    async fn test_campus_without_subscription_is_not_found() {
        let h = harness();
        let result = AnalyticsService::new(h.ctx.clone())
            .campus_analytics(Uuid::new_v4())
            .await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_platform_stats() {
        let h = harness();
        let monthly = h.plan(10_000, 0).await;
        let annual = h
            .catalog
            .create_plan(NewPlan {
                billing_period: BillingPeriod::Annual,
                ..monthly_plan("Annual", 120_000)
            })
            .await
            .unwrap();
        let trial = h.plan(5_000, 14).await;

        h.subscribe(monthly.id).await;
        h.subscribe(annual.id).await;
        h.subscribe(trial.id).await;

        h.gateway.push(ChargeResponse::declined("card_declined"));
        h.subscribe(monthly.id).await;

        let stats = AnalyticsService::new(h.ctx.clone())
            .platform_stats()
            .await
            .unwrap();
        // Active monthly + annual/12 + past-due monthly; trials are not revenue
        assert_eq!(stats.mrr_cents, 10_000 + 10_000 + 10_000);
        assert_eq!(stats.revenue_last_30_days_cents, 130_000);
        assert_eq!(stats.failed_payments_last_30_days, 1);
        assert_eq!(stats.stale_pending_payments, 0);
        let trials = stats
            .subscriptions_by_status
            .iter()
            .find(|c| c.status == SubscriptionStatus::Trial)
            .map(|c| c.count);
        assert_eq!(trials, Some(1));
    }
}
