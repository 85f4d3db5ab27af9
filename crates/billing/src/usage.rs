//! Resource usage counters and quota enforcement
//!
//! Counters live on the subscription row and are adjusted through the same
//! versioned changesets as lifecycle transitions. Limits come from the plan;
//! `None` is unlimited.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::events::{Actor, BillingEventBuilder, BillingEventType};
use crate::payments::MAX_COMMIT_ATTEMPTS;
use crate::plans::{PlanCatalog, PlanQuotas};
use crate::store::Changeset;
use crate::subscriptions::{Subscription, UsageCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageResource {
    Schools,
    Users,
    Appointments,
    StorageMb,
}

impl UsageResource {
    pub const ALL: [UsageResource; 4] = [
        UsageResource::Schools,
        UsageResource::Users,
        UsageResource::Appointments,
        UsageResource::StorageMb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageResource::Schools => "schools",
            UsageResource::Users => "users",
            UsageResource::Appointments => "appointments",
            UsageResource::StorageMb => "storage_mb",
        }
    }

    pub fn limit(&self, quotas: &PlanQuotas) -> Option<i64> {
        match self {
            UsageResource::Schools => quotas.max_schools,
            UsageResource::Users => quotas.max_users,
            UsageResource::Appointments => quotas.max_appointments,
            UsageResource::StorageMb => quotas.max_storage_mb,
        }
    }

    pub fn current(&self, usage: &UsageCounters) -> i64 {
        match self {
            UsageResource::Schools => usage.schools,
            UsageResource::Users => usage.users,
            UsageResource::Appointments => usage.appointments,
            UsageResource::StorageMb => usage.storage_mb,
        }
    }

    fn set(&self, usage: &mut UsageCounters, value: i64) {
        match self {
            UsageResource::Schools => usage.schools = value,
            UsageResource::Users => usage.users = value,
            UsageResource::Appointments => usage.appointments = value,
            UsageResource::StorageMb => usage.storage_mb = value,
        }
    }
}

/// One resource's consumption against its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub resource: UsageResource,
    pub used: i64,
    pub limit: Option<i64>,
}

impl QuotaUsage {
    pub fn remaining(&self) -> Option<i64> {
        self.limit.map(|limit| (limit - self.used).max(0))
    }
}

pub fn quota_report(usage: &UsageCounters, quotas: &PlanQuotas) -> Vec<QuotaUsage> {
    UsageResource::ALL
        .iter()
        .map(|resource| QuotaUsage {
            resource: *resource,
            used: resource.current(usage),
            limit: resource.limit(quotas),
        })
        .collect()
}

fn enforce(resource: UsageResource, quotas: &PlanQuotas, requested: i64) -> BillingResult<()> {
    match resource.limit(quotas) {
        Some(limit) if requested > limit => Err(BillingError::QuotaExceeded {
            resource: resource.as_str(),
            limit,
            requested,
        }),
        _ => Ok(()),
    }
}

#[derive(Clone)]
pub struct UsageService {
    ctx: BillingContext,
    catalog: PlanCatalog,
}

impl UsageService {
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            catalog: PlanCatalog::new(ctx.clone()),
            ctx,
        }
    }

    async fn live_subscription(&self, campus_id: Uuid) -> BillingResult<Subscription> {
        self.ctx
            .store
            .find_live_subscription(campus_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Live subscription for campus {}", campus_id))
            })
    }

    /// Fail with `QuotaExceeded` if adding `additional` would pass the plan limit
    pub async fn check_quota(
        &self,
        campus_id: Uuid,
        resource: UsageResource,
        additional: i64,
    ) -> BillingResult<()> {
        let subscription = self.live_subscription(campus_id).await?;
        let plan = self.catalog.get_plan(subscription.plan_id).await?;
        enforce(
            resource,
            &plan.quotas,
            resource.current(&subscription.usage) + additional.max(0),
        )
    }

    /// Add `delta` to a counter. Increases are checked against the plan quota;
    /// decreases never fail and stop at zero.
    pub async fn adjust_usage(
        &self,
        campus_id: Uuid,
        resource: UsageResource,
        delta: i64,
        actor: Actor,
    ) -> BillingResult<UsageCounters> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.ctx.now();
            let mut subscription = self.live_subscription(campus_id).await?;
            let plan = self.catalog.get_plan(subscription.plan_id).await?;

            let before = resource.current(&subscription.usage);
            let after = (before + delta).max(0);
            if delta > 0 {
                enforce(resource, &plan.quotas, after)?;
            }
            if after == before {
                return Ok(subscription.usage);
            }

            resource.set(&mut subscription.usage, after);
            subscription.updated_at = now;

            let mut changes = Changeset::new();
            changes.update_subscription(&mut subscription);
            changes.event(
                BillingEventBuilder::new(campus_id, BillingEventType::UsageAdjusted)
                    .subscription(subscription.id)
                    .by(actor)
                    .data(serde_json::json!({
                        "resource": resource.as_str(),
                        "before": before,
                        "after": after,
                    }))
                    .build(now),
            );

            match self.ctx.commit(changes).await {
                Ok(()) => {
                    tracing::debug!(
                        campus_id = %campus_id,
                        resource = resource.as_str(),
                        before = before,
                        after = after,
                        "Usage adjusted"
                    );
                    return Ok(subscription.usage);
                }
                Err(BillingError::ConcurrentModification(reason))
                    if attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    tracing::warn!(
                        campus_id = %campus_id,
                        attempt = attempt,
                        reason = %reason,
                        "Usage update lost a concurrent write, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::NewPlan;
    use crate::test_support::{harness, monthly_plan};
    use time::Duration;

    async fn limited_plan(h: &crate::test_support::Harness) -> crate::plans::Plan {
        h.catalog
            .create_plan(NewPlan {
                quotas: PlanQuotas {
                    max_schools: Some(2),
                    max_users: None,
                    max_appointments: Some(100),
                    max_storage_mb: Some(1_024),
                },
                ..monthly_plan("Limited", 10_000)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_increase_past_quota_is_rejected() {
        let h = harness();
        let plan = limited_plan(&h).await;
        let sub = h.subscribe(plan.id).await;
        let usage = UsageService::new(h.ctx.clone());

        usage
            .adjust_usage(sub.campus_id, UsageResource::Schools, 2, Actor::system())
            .await
            .unwrap();
        let err = usage
            .adjust_usage(sub.campus_id, UsageResource::Schools, 1, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::QuotaExceeded { resource: "schools", limit: 2, requested: 3 }
        ));
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert_eq!(h.reload(sub.id).await.usage.schools, 2);

        // Unlimited resources never fail
        usage
            .adjust_usage(sub.campus_id, UsageResource::Users, 10_000, Actor::system())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_decrease_floors_at_zero() {
        let h = harness();
        let plan = limited_plan(&h).await;
        let sub = h.subscribe(plan.id).await;
        let usage = UsageService::new(h.ctx.clone());

        usage
            .adjust_usage(sub.campus_id, UsageResource::StorageMb, 500, Actor::system())
            .await
            .unwrap();
        let counters = usage
            .adjust_usage(sub.campus_id, UsageResource::StorageMb, -800, Actor::system())
            .await
            .unwrap();
        assert_eq!(counters.storage_mb, 0);
    }

    #[tokio::test]
    async fn test_check_quota_does_not_write() {
        let h = harness();
        let plan = limited_plan(&h).await;
        let sub = h.subscribe(plan.id).await;
        let usage = UsageService::new(h.ctx.clone());

        assert!(usage
            .check_quota(sub.campus_id, UsageResource::Appointments, 100)
            .await
            .is_ok());
        assert!(usage
            .check_quota(sub.campus_id, UsageResource::Appointments, 101)
            .await
            .is_err());
        assert_eq!(h.reload(sub.id).await.version, sub.version);
    }

    #[tokio::test]
    async fn test_appointments_reset_on_renewal() {
        let h = harness();
        let plan = limited_plan(&h).await;
        let sub = h.subscribe(plan.id).await;
        let usage = UsageService::new(h.ctx.clone());
        usage
            .adjust_usage(sub.campus_id, UsageResource::Appointments, 90, Actor::system())
            .await
            .unwrap();
        usage
            .adjust_usage(sub.campus_id, UsageResource::Schools, 1, Actor::system())
            .await
            .unwrap();

        h.clock.set(sub.next_billing_date + Duration::minutes(5));
        h.scheduler.run_billing_sweep().await.unwrap();

        let renewed = h.reload(sub.id).await;
        assert_eq!(renewed.usage.appointments, 0);
        assert_eq!(renewed.usage.schools, 1);
    }

    #[test]
    fn test_quota_report_remaining() {
        let report = quota_report(
            &UsageCounters {
                schools: 3,
                users: 10,
                appointments: 0,
                storage_mb: 0,
            },
            &PlanQuotas {
                max_schools: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(report[0].remaining(), Some(0));
        assert_eq!(report[1].remaining(), None);
    }
}
