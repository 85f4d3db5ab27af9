//! Plan catalog
//!
//! Plans are read-mostly and cached. Commercial terms (price, currency, billing
//! period, trial length, quotas) are frozen while any live subscription references
//! the plan; display metadata may still change.

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::cache::BillingCache;
use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};

/// Longest free trial a plan may offer
pub const MAX_TRIAL_DAYS: i32 = 365;

/// Length of one billing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
}

impl BillingPeriod {
    pub fn months(&self) -> u32 {
        match self {
            BillingPeriod::Monthly => 1,
            BillingPeriod::Quarterly => 3,
            BillingPeriod::SemiAnnual => 6,
            BillingPeriod::Annual => 12,
        }
    }

    /// Period boundary following `start`
    pub fn advance(&self, start: OffsetDateTime) -> OffsetDateTime {
        add_months(start, self.months())
    }

    /// Period boundary following `start`, pinned to `anchor_day` whenever the
    /// target month is long enough (Jan 31, Feb 28, Mar 31, ...)
    pub fn advance_anchored(&self, start: OffsetDateTime, anchor_day: u8) -> OffsetDateTime {
        let next = self.advance(start);
        let date = next.date();
        let day = anchor_day
            .max(1)
            .min(time::util::days_in_year_month(date.year(), date.month()));
        match date.replace_day(day) {
            Ok(pinned) => next.replace_date(pinned),
            Err(_) => next,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Quarterly => "quarterly",
            BillingPeriod::SemiAnnual => "semi_annual",
            BillingPeriod::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingPeriod::Monthly),
            "quarterly" => Some(BillingPeriod::Quarterly),
            "semi_annual" => Some(BillingPeriod::SemiAnnual),
            "annual" => Some(BillingPeriod::Annual),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Add calendar months, clamping the day to the length of the target month
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(at: OffsetDateTime, months: u32) -> OffsetDateTime {
    let date = at.date();
    let zero_based = date.month() as i32 - 1 + months as i32;
    let year = date.year() + zero_based.div_euclid(12);
    let month = Month::January.nth_next(zero_based.rem_euclid(12) as u8);
    let day = date
        .day()
        .min(time::util::days_in_year_month(year, month));

    match Date::from_calendar_date(year, month, day) {
        Ok(target) => at.replace_date(target),
        Err(_) => at
            .checked_add(Duration::days(30 * i64::from(months)))
            .unwrap_or(at),
    }
}

/// Resource limits; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanQuotas {
    pub max_schools: Option<i64>,
    pub max_users: Option<i64>,
    pub max_appointments: Option<i64>,
    pub max_storage_mb: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub trial_days: i32,
    pub quotas: PlanQuotas,
    pub features: Vec<String>,
    pub is_visible: bool,
    pub sort_order: i32,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Admin request to publish a plan
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub currency: String,
    pub billing_period: BillingPeriod,
    #[serde(default)]
    pub trial_days: i32,
    #[serde(default)]
    pub quotas: PlanQuotas,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    #[serde(default)]
    pub sort_order: i32,
}

fn default_visible() -> bool {
    true
}

impl NewPlan {
    fn validate(&self) -> BillingResult<()> {
        if self.name.trim().is_empty() {
            return Err(BillingError::InvalidInput("Plan name is required".to_string()));
        }
        if self.price_cents < 0 {
            return Err(BillingError::InvalidInput(
                "Plan price cannot be negative".to_string(),
            ));
        }
        validate_trial_days(self.trial_days)?;
        validate_currency(&self.currency)?;
        validate_quotas(&self.quotas)
    }
}

/// Partial plan update; unset fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub features: Option<Vec<String>>,
    pub is_visible: Option<bool>,
    pub sort_order: Option<i32>,
    pub is_active: Option<bool>,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub billing_period: Option<BillingPeriod>,
    pub trial_days: Option<i32>,
    pub quotas: Option<PlanQuotas>,
}

impl PlanUpdate {
    /// Whether the update touches terms that live subscriptions depend on
    fn changes_commercial_terms(&self, plan: &Plan) -> bool {
        self.price_cents.is_some_and(|v| v != plan.price_cents)
            || self
                .currency
                .as_deref()
                .is_some_and(|v| !v.eq_ignore_ascii_case(&plan.currency))
            || self.billing_period.is_some_and(|v| v != plan.billing_period)
            || self.trial_days.is_some_and(|v| v != plan.trial_days)
            || self.quotas.is_some_and(|v| v != plan.quotas)
    }
}

fn validate_trial_days(trial_days: i32) -> BillingResult<()> {
    if !(0..=MAX_TRIAL_DAYS).contains(&trial_days) {
        return Err(BillingError::InvalidInput(format!(
            "Trial days must be between 0 and {}",
            MAX_TRIAL_DAYS
        )));
    }
    Ok(())
}

fn validate_currency(currency: &str) -> BillingResult<()> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(BillingError::InvalidInput(format!(
            "Invalid currency code: {}",
            currency
        )));
    }
    Ok(())
}

fn validate_quotas(quotas: &PlanQuotas) -> BillingResult<()> {
    let limits = [
        quotas.max_schools,
        quotas.max_users,
        quotas.max_appointments,
        quotas.max_storage_mb,
    ];
    if limits.iter().flatten().any(|v| *v < 0) {
        return Err(BillingError::InvalidInput(
            "Quota limits cannot be negative".to_string(),
        ));
    }
    Ok(())
}

/// Plan catalog service
#[derive(Clone)]
pub struct PlanCatalog {
    ctx: BillingContext,
}

impl PlanCatalog {
    pub fn new(ctx: BillingContext) -> Self {
        Self { ctx }
    }

    /// Fetch a plan by id (cached)
    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let key = BillingCache::plan_key(plan_id);
        if let Some(plan) = self.ctx.cache.get::<Plan>(&key).await {
            return Ok(plan);
        }

        let token = self.ctx.cache.fill_token(&key).await;
        let plan = self
            .ctx
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))?;
        self.ctx.cache.fill(&key, &plan, token).await;
        Ok(plan)
    }

    /// List the catalog ordered for display
    ///
    /// Customers see only visible, active plans; admins pass `include_hidden`.
    pub async fn list_plans(&self, include_hidden: bool) -> BillingResult<Vec<Plan>> {
        let key = BillingCache::catalog_key();
        let mut plans = match self.ctx.cache.get::<Vec<Plan>>(&key).await {
            Some(plans) => plans,
            None => {
                let token = self.ctx.cache.fill_token(&key).await;
                let plans = self.ctx.store.list_plans().await?;
                self.ctx.cache.fill(&key, &plans, token).await;
                plans
            }
        };

        if !include_hidden {
            plans.retain(|p| p.is_visible && p.is_active);
        }
        plans.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.name.cmp(&b.name)));
        Ok(plans)
    }

    pub async fn create_plan(&self, request: NewPlan) -> BillingResult<Plan> {
        request.validate()?;

        let now = self.ctx.now();
        let plan = Plan {
            id: Uuid::new_v4(),
            name: request.name.trim().to_string(),
            description: request.description,
            price_cents: request.price_cents,
            currency: request.currency.to_ascii_uppercase(),
            billing_period: request.billing_period,
            trial_days: request.trial_days,
            quotas: request.quotas,
            features: request.features,
            is_visible: request.is_visible,
            sort_order: request.sort_order,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.ctx.store.insert_plan(&plan).await?;
        self.ctx.cache.invalidate(&[BillingCache::catalog_key()]).await;

        tracing::info!(
            plan_id = %plan.id,
            name = %plan.name,
            price_cents = plan.price_cents,
            period = %plan.billing_period,
            "Plan created"
        );
        Ok(plan)
    }

    pub async fn update_plan(&self, plan_id: Uuid, update: PlanUpdate) -> BillingResult<Plan> {
        let mut plan = self
            .ctx
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))?;

        if update.changes_commercial_terms(&plan)
            && self
                .ctx
                .store
                .count_live_subscriptions_for_plan(plan_id)
                .await?
                > 0
        {
            return Err(BillingError::PlanInUse(plan_id));
        }

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(BillingError::InvalidInput("Plan name is required".to_string()));
            }
            plan.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            plan.description = Some(description);
        }
        if let Some(features) = update.features {
            plan.features = features;
        }
        if let Some(is_visible) = update.is_visible {
            plan.is_visible = is_visible;
        }
        if let Some(sort_order) = update.sort_order {
            plan.sort_order = sort_order;
        }
        if let Some(is_active) = update.is_active {
            plan.is_active = is_active;
        }
        if let Some(price_cents) = update.price_cents {
            if price_cents < 0 {
                return Err(BillingError::InvalidInput(
                    "Plan price cannot be negative".to_string(),
                ));
            }
            plan.price_cents = price_cents;
        }
        if let Some(currency) = update.currency {
            validate_currency(&currency)?;
            plan.currency = currency.to_ascii_uppercase();
        }
        if let Some(period) = update.billing_period {
            plan.billing_period = period;
        }
        if let Some(trial_days) = update.trial_days {
            validate_trial_days(trial_days)?;
            plan.trial_days = trial_days;
        }
        if let Some(quotas) = update.quotas {
            validate_quotas(&quotas)?;
            plan.quotas = quotas;
        }
        plan.updated_at = self.ctx.now();

        self.ctx.store.update_plan(&plan).await?;
        self.ctx
            .cache
            .invalidate(&[BillingCache::plan_key(plan_id), BillingCache::catalog_key()])
            .await;

        tracing::info!(plan_id = %plan_id, "Plan updated");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, monthly_plan};
    use time::macros::datetime;

    #[test]
    fn test_add_months_clamps_day() {
        assert_eq!(
            add_months(datetime!(2026-01-31 10:00 UTC), 1),
            datetime!(2026-02-28 10:00 UTC)
        );
        assert_eq!(
            add_months(datetime!(2028-01-31 00:00 UTC), 1),
            datetime!(2028-02-29 00:00 UTC)
        );
        assert_eq!(
            add_months(datetime!(2026-11-15 00:00 UTC), 3),
            datetime!(2027-02-15 00:00 UTC)
        );
        assert_eq!(
            BillingPeriod::Annual.advance(datetime!(2026-03-01 00:00 UTC)),
            datetime!(2027-03-01 00:00 UTC)
        );
    }

    #[test]
    fn test_anchored_advance_keeps_month_end() {
        let monthly = BillingPeriod::Monthly;
        let feb = monthly.advance_anchored(datetime!(2026-01-31 09:00 UTC), 31);
        assert_eq!(feb, datetime!(2026-02-28 09:00 UTC));
        let mar = monthly.advance_anchored(feb, 31);
        assert_eq!(mar, datetime!(2026-03-31 09:00 UTC));
        assert_eq!(
            monthly.advance_anchored(mar, 31),
            datetime!(2026-04-30 09:00 UTC)
        );
        assert_eq!(
            BillingPeriod::Quarterly.advance_anchored(datetime!(2026-02-28 00:00 UTC), 30),
            datetime!(2026-05-30 00:00 UTC)
        );
    }

    #[test]
    fn test_billing_period_parse() {
        for period in [
            BillingPeriod::Monthly,
            BillingPeriod::Quarterly,
            BillingPeriod::SemiAnnual,
            BillingPeriod::Annual,
        ] {
            assert_eq!(BillingPeriod::parse(period.as_str()), Some(period));
        }
        assert_eq!(BillingPeriod::parse("weekly"), None);
    }

    #[tokio::test]
    async fn test_hidden_plans_only_listed_for_admins() {
        let h = harness();
        let catalog = PlanCatalog::new(h.ctx.clone());
        catalog.create_plan(monthly_plan("Basic", 10_000)).await.unwrap();
        let hidden = catalog
            .create_plan(NewPlan {
                is_visible: false,
                ..monthly_plan("Legacy", 5_000)
            })
            .await
            .unwrap();

        let public = catalog.list_plans(false).await.unwrap();
        assert_eq!(public.len(), 1);
        assert!(public.iter().all(|p| p.id != hidden.id));
        assert_eq!(catalog.list_plans(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_price_change_rejected_while_referenced() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        h.subscribe(plan.id).await;

        let catalog = PlanCatalog::new(h.ctx.clone());
        let err = catalog
            .update_plan(
                plan.id,
                PlanUpdate {
                    price_cents: Some(12_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanInUse(id) if id == plan.id));

        // Display metadata may still change
        let renamed = catalog
            .update_plan(
                plan.id,
                PlanUpdate {
                    name: Some("Standard".to_string()),
                    sort_order: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Standard");
        assert_eq!(catalog.get_plan(plan.id).await.unwrap().name, "Standard");
    }

    #[tokio::test]
    async fn test_create_plan_validates_input() {
        let h = harness();
        let catalog = PlanCatalog::new(h.ctx.clone());
        let err = catalog
            .create_plan(NewPlan {
                currency: "US".to_string(),
                ..monthly_plan("Broken", 100)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_trial_length_is_bounded() {
        let h = harness();
        let catalog = PlanCatalog::new(h.ctx.clone());
        let err = catalog
            .create_plan(NewPlan {
                trial_days: 4_000_000,
                ..monthly_plan("Forever free", 10_000)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let plan = catalog
            .create_plan(NewPlan {
                trial_days: MAX_TRIAL_DAYS,
                ..monthly_plan("Long trial", 10_000)
            })
            .await
            .unwrap();
        let err = catalog
            .update_plan(
                plan.id,
                PlanUpdate {
                    trial_days: Some(MAX_TRIAL_DAYS + 1),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let sub = h.subscribe(plan.id).await;
        assert_eq!(
            sub.trial_end_date,
            Some(h.now() + time::Duration::days(i64::from(MAX_TRIAL_DAYS)))
        );
    }
}
