//! Subscription lifecycle
//!
//! Every mutating operation reloads the subscription, re-checks its precondition
//! against the stored state and commits one [`Changeset`]. A version mismatch at
//! commit time surfaces as [`BillingError::ConcurrentModification`] instead of
//! double-applying a change.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::cache::BillingCache;
use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::events::{Actor, BillingEvent, BillingEventBuilder, BillingEventType};
use crate::notifications::Notification;
use crate::payments::{
    Payment, PaymentKind, PaymentProcessor, PaymentStatus, MAX_COMMIT_ATTEMPTS, VOIDED_REASON,
};
use crate::plans::{BillingPeriod, Plan, PlanCatalog};
use crate::proration::{calculate_proration, ProratedAmount};
use crate::state_machine::validate_transition;
use crate::store::{Changeset, PaymentFilter};
use crate::tax::ChargeAmount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    /// A billing attempt failed before the gateway verdict was known
    Pending,
    Canceled,
    Suspended,
    Expired,
}

/// Statuses covered by the one-per-campus rule
pub const LIVE_STATUSES: [SubscriptionStatus; 3] = [
    SubscriptionStatus::Trial,
    SubscriptionStatus::Active,
    SubscriptionStatus::PastDue,
];

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trial" => Some(SubscriptionStatus::Trial),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "pending" => Some(SubscriptionStatus::Pending),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "suspended" => Some(SubscriptionStatus::Suspended),
            "expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        LIVE_STATUSES.contains(self)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Metered resource counters; appointments reset on every renewal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub schools: i64,
    pub users: i64,
    pub appointments: i64,
    pub storage_mb: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub campus_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub start_date: OffsetDateTime,
    pub current_period_start: OffsetDateTime,
    /// Current period boundary
    pub end_date: OffsetDateTime,
    pub trial_end_date: Option<OffsetDateTime>,
    pub next_billing_date: OffsetDateTime,
    pub grace_period_end: Option<OffsetDateTime>,
    /// Price snapshot taken from the plan at purchase or plan change
    pub price_cents: i64,
    pub currency: String,
    pub billing_period: BillingPeriod,
    /// Day of month renewals land on; set at purchase, trial end or plan change
    pub billing_anchor_day: u8,
    pub auto_renew: bool,
    pub billing_contact: BillingContact,
    pub gateway_customer_id: Option<String>,
    pub gateway_payment_method_id: Option<String>,
    pub cancellation_reason: Option<String>,
    pub canceled_at: Option<OffsetDateTime>,
    /// Downgrade credit consumed by the next charge
    pub credit_balance_cents: i64,
    pub retry_count: i32,
    pub next_retry_at: Option<OffsetDateTime>,
    pub pending_reason: Option<String>,
    pub usage: UsageCounters,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Whole days until the current period ends, never negative
    pub fn days_until_renewal(&self, now: OffsetDateTime) -> i64 {
        (self.end_date - now).whole_days().max(0)
    }

    /// Boundary of the period that starts at `from`, kept on the anchor day
    pub fn period_end_after(&self, from: OffsetDateTime) -> OffsetDateTime {
        self.billing_period
            .advance_anchored(from, self.billing_anchor_day)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub campus_id: Uuid,
    pub plan_id: Uuid,
    #[serde(default)]
    pub billing_contact: BillingContact,
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
    pub gateway_customer_id: Option<String>,
    pub gateway_payment_method_id: Option<String>,
}

fn default_auto_renew() -> bool {
    true
}

/// Partial update; unset fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSubscriptionRequest {
    pub billing_contact: Option<BillingContact>,
    pub auto_renew: Option<bool>,
    pub gateway_customer_id: Option<String>,
    pub gateway_payment_method_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    /// Revoke access now instead of at the end of the paid period
    #[serde(default)]
    pub immediate: bool,
    pub reason: Option<String>,
}

/// Administrator decision for a PENDING subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingResolution {
    Resume,
    Suspend,
}

#[derive(Debug, Clone)]
pub struct PlanChangeResult {
    pub subscription: Subscription,
    pub proration: ProratedAmount,
    /// Upgrade charge, settled or still pending
    pub payment: Option<Payment>,
}

pub(crate) async fn load_subscription(
    ctx: &BillingContext,
    subscription_id: Uuid,
) -> BillingResult<Subscription> {
    ctx.store
        .get_subscription(subscription_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))
}

/// Subscription lifecycle service
#[derive(Clone)]
pub struct SubscriptionService {
    ctx: BillingContext,
    catalog: PlanCatalog,
    payments: PaymentProcessor,
}

impl SubscriptionService {
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            catalog: PlanCatalog::new(ctx.clone()),
            payments: PaymentProcessor::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        load_subscription(&self.ctx, subscription_id).await
    }

    /// The campus's live subscription, falling back to its most recent one (cached)
    pub async fn get_for_campus(&self, campus_id: Uuid) -> BillingResult<Subscription> {
        let key = BillingCache::campus_subscription_key(campus_id);
        if let Some(subscription) = self.ctx.cache.get::<Subscription>(&key).await {
            return Ok(subscription);
        }

        let token = self.ctx.cache.fill_token(&key).await;
        let subscription = match self.ctx.store.find_live_subscription(campus_id).await? {
            Some(s) => s,
            None => self
                .ctx
                .store
                .latest_subscription(campus_id)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("Subscription for campus {}", campus_id))
                })?,
        };
        self.ctx.cache.fill(&key, &subscription, token).await;
        Ok(subscription)
    }

    /// Audit trail for a subscription, newest first
    pub async fn history(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        self.ctx
            .store
            .list_events(subscription_id, limit.clamp(1, 500))
            .await
    }

    /// Start a subscription for a campus.
    ///
    /// Plans with trial days start in TRIAL and bill at trial end. Paid plans
    /// without a trial start ACTIVE and charge the first period immediately.
    pub async fn create(
        &self,
        request: CreateSubscriptionRequest,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        let plan = self.catalog.get_plan(request.plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::PlanUnavailable(plan.id));
        }

        if let Some(existing) = self
            .ctx
            .store
            .find_live_subscription(request.campus_id)
            .await?
        {
            return Err(BillingError::DuplicateSubscription {
                campus_id: request.campus_id,
                existing_id: existing.id,
            });
        }
        // A PENDING subscription can still be resumed, so it blocks a new purchase
        if let Some(latest) = self.ctx.store.latest_subscription(request.campus_id).await? {
            if latest.status == SubscriptionStatus::Pending {
                return Err(BillingError::DuplicateSubscription {
                    campus_id: request.campus_id,
                    existing_id: latest.id,
                });
            }
        }

        let now = self.ctx.now();
        let subscription = new_subscription(&plan, &request, now)?;

        let mut changes = Changeset::new();
        changes.insert_subscription(&subscription);
        changes.campus_flag(subscription.campus_id, true);
        changes.event(
            BillingEventBuilder::new(subscription.campus_id, BillingEventType::SubscriptionCreated)
                .subscription(subscription.id)
                .by(actor)
                .data(serde_json::json!({
                    "plan_id": plan.id,
                    "status": subscription.status.as_str(),
                    "price_cents": subscription.price_cents,
                    "trial_end_date": subscription.trial_end_date.map(|t| t.to_string()),
                }))
                .build(now),
        );

        let initial_payment = if subscription.status == SubscriptionStatus::Active
            && subscription.price_cents > 0
        {
            let charge = ChargeAmount::with_credit(
                subscription.price_cents,
                0,
                self.ctx.config.tax_rate_bps,
            );
            let payment = Payment::new_pending(
                &subscription,
                PaymentKind::Initial,
                &charge,
                subscription.current_period_start,
                subscription.end_date,
                now,
            );
            changes.insert_payment(&payment);
            changes.event(payment_created_event(&payment, actor, now));
            Some(payment)
        } else {
            None
        };

        self.ctx.commit(changes).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            campus_id = %subscription.campus_id,
            plan_id = %plan.id,
            status = %subscription.status,
            "Subscription created"
        );

        self.ctx
            .notifier
            .notify(Notification::Welcome {
                campus_id: subscription.campus_id,
                email: subscription.billing_contact.email.clone(),
                plan_name: plan.name.clone(),
                trial_end: subscription.trial_end_date,
            })
            .await;

        if let Some(payment) = initial_payment {
            self.charge_or_mark_pending(&payment).await;
            return load_subscription(&self.ctx, subscription.id).await;
        }

        Ok(subscription)
    }

    /// Update contact details, renewal preference or payment method
    pub async fn update(
        &self,
        subscription_id: Uuid,
        request: UpdateSubscriptionRequest,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        let mut subscription = load_subscription(&self.ctx, subscription_id).await?;
        if subscription.status == SubscriptionStatus::Expired {
            return Err(BillingError::InvalidTransition {
                action: "update subscription",
                status: subscription.status,
            });
        }
        if request.auto_renew.is_some() && !subscription.status.is_live() {
            return Err(BillingError::InvalidTransition {
                action: "change auto-renew",
                status: subscription.status,
            });
        }

        let now = self.ctx.now();
        let mut changed = Vec::new();
        if let Some(contact) = request.billing_contact {
            if let Some(email) = &contact.email {
                if !email.contains('@') {
                    return Err(BillingError::InvalidInput(format!(
                        "Invalid billing email: {}",
                        email
                    )));
                }
            }
            subscription.billing_contact = contact;
            changed.push("billing_contact");
        }
        if let Some(auto_renew) = request.auto_renew {
            subscription.auto_renew = auto_renew;
            changed.push("auto_renew");
        }
        if let Some(customer_id) = request.gateway_customer_id {
            subscription.gateway_customer_id = Some(customer_id);
            changed.push("gateway_customer_id");
        }
        if let Some(method_id) = request.gateway_payment_method_id {
            subscription.gateway_payment_method_id = Some(method_id);
            changed.push("gateway_payment_method_id");
        }
        if changed.is_empty() {
            return Ok(subscription);
        }
        subscription.updated_at = now;

        let mut changes = Changeset::new();
        changes.update_subscription(&mut subscription);
        changes.event(
            BillingEventBuilder::new(subscription.campus_id, BillingEventType::SubscriptionUpdated)
                .subscription(subscription.id)
                .by(actor)
                .data(serde_json::json!({
                    "fields": changed,
                    "auto_renew": subscription.auto_renew,
                }))
                .build(now),
        );
        self.ctx.commit(changes).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            fields = ?changed,
            "Subscription updated"
        );
        Ok(subscription)
    }

    /// Cancel a TRIAL, ACTIVE or PAST_DUE subscription.
    ///
    /// Immediate cancellation revokes access now; otherwise access lasts until
    /// the end of the current period and the sweep expires it afterwards.
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        request: CancelRequest,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        let subscription = load_subscription(&self.ctx, subscription_id).await?;
        self.cancel_loaded(subscription, request.immediate, request.reason, actor)
            .await
    }

    pub(crate) async fn cancel_loaded(
        &self,
        mut subscription: Subscription,
        immediate: bool,
        reason: Option<String>,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        match subscription.status {
            SubscriptionStatus::Canceled => {
                return Err(BillingError::AlreadyCanceled(subscription.id))
            }
            SubscriptionStatus::Trial
            | SubscriptionStatus::Active
            | SubscriptionStatus::PastDue => {}
            status => {
                return Err(BillingError::InvalidTransition {
                    action: "cancel subscription",
                    status,
                })
            }
        }
        validate_transition(
            subscription.status,
            SubscriptionStatus::Canceled,
            "cancel subscription",
        )?;

        let now = self.ctx.now();
        let previous_status = subscription.status;
        let access_until = if immediate {
            now
        } else {
            subscription.end_date
        };

        subscription.status = SubscriptionStatus::Canceled;
        subscription.grace_period_end = Some(access_until);
        subscription.canceled_at = Some(now);
        subscription.cancellation_reason = reason.clone();
        subscription.auto_renew = false;
        subscription.next_retry_at = None;
        subscription.updated_at = now;

        let mut changes = Changeset::new();
        changes.update_subscription(&mut subscription);
        if immediate {
            changes.campus_flag(subscription.campus_id, false);
        }
        changes.event(
            BillingEventBuilder::new(subscription.campus_id, BillingEventType::SubscriptionCanceled)
                .subscription(subscription.id)
                .by(actor)
                .data(serde_json::json!({
                    "previous_status": previous_status.as_str(),
                    "immediate": immediate,
                    "reason": reason,
                    "access_until": access_until.to_string(),
                }))
                .build(now),
        );
        self.ctx.commit(changes).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            campus_id = %subscription.campus_id,
            immediate = immediate,
            access_until = %access_until,
            "Subscription canceled"
        );

        self.ctx
            .notifier
            .notify(Notification::Cancellation {
                campus_id: subscription.campus_id,
                email: subscription.billing_contact.email.clone(),
                access_until,
                immediate,
            })
            .await;

        Ok(subscription)
    }

    /// Move an ACTIVE subscription to another plan mid-period.
    ///
    /// The new period starts now. An upgrade is charged the prorated delta
    /// immediately; a downgrade banks the delta as credit.
    pub async fn change_plan(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        actor: Actor,
    ) -> BillingResult<PlanChangeResult> {
        let mut subscription = load_subscription(&self.ctx, subscription_id).await?;
        if subscription.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidTransition {
                action: "change plan",
                status: subscription.status,
            });
        }
        if subscription.plan_id == new_plan_id {
            return Err(BillingError::SamePlan(new_plan_id));
        }

        let new_plan = self.catalog.get_plan(new_plan_id).await?;
        if !new_plan.is_active {
            return Err(BillingError::PlanUnavailable(new_plan.id));
        }
        if !new_plan.currency.eq_ignore_ascii_case(&subscription.currency) {
            return Err(BillingError::InvalidInput(format!(
                "Plan currency {} does not match subscription currency {}",
                new_plan.currency, subscription.currency
            )));
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
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} has a payment in flight",
                subscription.id
            )));
        }

        let now = self.ctx.now();
        let from_plan_id = subscription.plan_id;
        let proration = calculate_proration(
            subscription.price_cents,
            new_plan.price_cents,
            subscription.current_period_start,
            subscription.end_date,
            now,
            &subscription.currency,
        );

        subscription.plan_id = new_plan.id;
        subscription.price_cents = new_plan.price_cents;
        subscription.billing_period = new_plan.billing_period;
        subscription.current_period_start = now;
        subscription.billing_anchor_day = now.day();
        subscription.end_date = new_plan.billing_period.advance(now);
        subscription.next_billing_date = subscription.end_date;
        subscription.updated_at = now;

        let mut changes = Changeset::new();
        let mut payment = None;
        if proration.is_upgrade() {
            let charge = ChargeAmount::with_credit(
                proration.amount_cents,
                subscription.credit_balance_cents,
                self.ctx.config.tax_rate_bps,
            );
            let upgrade = Payment::new_pending(
                &subscription,
                PaymentKind::Proration,
                &charge,
                now,
                subscription.end_date,
                now,
            );
            changes.insert_payment(&upgrade);
            changes.event(payment_created_event(&upgrade, actor, now));
            payment = Some(upgrade);
        } else if proration.is_downgrade() {
            let credit = -proration.amount_cents;
            subscription.credit_balance_cents += credit;
            changes.event(
                BillingEventBuilder::new(subscription.campus_id, BillingEventType::CreditApplied)
                    .subscription(subscription.id)
                    .by(actor)
                    .data(serde_json::json!({
                        "credit_cents": credit,
                        "credit_balance_cents": subscription.credit_balance_cents,
                    }))
                    .build(now),
            );
        }

        changes.update_subscription(&mut subscription);
        changes.event(
            BillingEventBuilder::new(subscription.campus_id, BillingEventType::PlanChanged)
                .subscription(subscription.id)
                .by(actor)
                .data(serde_json::json!({
                    "from_plan_id": from_plan_id,
                    "to_plan_id": new_plan.id,
                    "proration_cents": proration.amount_cents,
                    "description": proration.description,
                }))
                .build(now),
        );
        self.ctx.commit(changes).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            from_plan_id = %from_plan_id,
            to_plan_id = %new_plan.id,
            proration_cents = proration.amount_cents,
            "Plan changed"
        );

        let from_plan_name = match self.ctx.store.get_plan(from_plan_id).await {
            Ok(Some(plan)) => plan.name,
            _ => from_plan_id.to_string(),
        };
        self.ctx
            .notifier
            .notify(Notification::PlanChanged {
                campus_id: subscription.campus_id,
                email: subscription.billing_contact.email.clone(),
                from_plan: from_plan_name,
                to_plan: new_plan.name.clone(),
                proration_cents: proration.amount_cents,
                currency: subscription.currency.clone(),
            })
            .await;

        let payment = match payment {
            Some(p) => Some(self.charge_or_mark_pending(&p).await),
            None => None,
        };

        Ok(PlanChangeResult {
            subscription: load_subscription(&self.ctx, subscription.id).await?,
            proration,
            payment,
        })
    }

    /// Park a subscription whose billing attempt failed without a verdict.
    ///
    /// Administrators are alerted; nothing retries it until
    /// [`resolve_pending`](Self::resolve_pending) is called.
    pub async fn mark_pending(
        &self,
        subscription_id: Uuid,
        reason: &str,
    ) -> BillingResult<Subscription> {
        let mut attempt = 0;
        let subscription = loop {
            attempt += 1;
            let now = self.ctx.now();
            let mut subscription = load_subscription(&self.ctx, subscription_id).await?;
            if !matches!(
                subscription.status,
                SubscriptionStatus::Trial
                    | SubscriptionStatus::Active
                    | SubscriptionStatus::PastDue
            ) {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    status = %subscription.status,
                    "Not marking subscription pending from its current status"
                );
                break subscription;
            }
            validate_transition(
                subscription.status,
                SubscriptionStatus::Pending,
                "mark pending",
            )?;

            let previous_status = subscription.status;
            subscription.status = SubscriptionStatus::Pending;
            subscription.pending_reason = Some(reason.to_string());
            subscription.next_retry_at = None;
            subscription.updated_at = now;

            let mut changes = Changeset::new();
            changes.update_subscription(&mut subscription);
            changes.event(
                BillingEventBuilder::new(
                    subscription.campus_id,
                    BillingEventType::SubscriptionPending,
                )
                .subscription(subscription.id)
                .data(serde_json::json!({
                    "previous_status": previous_status.as_str(),
                    "reason": reason,
                }))
                .build(now),
            );

            match self.ctx.commit(changes).await {
                Ok(()) => break subscription,
                Err(BillingError::ConcurrentModification(_)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    continue
                }
                Err(e) => return Err(e),
            }
        };

        tracing::error!(
            subscription_id = %subscription.id,
            campus_id = %subscription.campus_id,
            reason = %reason,
            "Subscription moved to PENDING"
        );
        self.ctx
            .notifier
            .alert_admins(
                "Subscription requires manual resolution",
                format!(
                    "Billing for campus {} failed without a gateway verdict: {}",
                    subscription.campus_id, reason
                ),
                Some(subscription.id),
                None,
            )
            .await;

        Ok(subscription)
    }

    /// Administrator resolution of a PENDING subscription
    pub async fn resolve_pending(
        &self,
        subscription_id: Uuid,
        resolution: PendingResolution,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        let mut subscription = load_subscription(&self.ctx, subscription_id).await?;
        if subscription.status != SubscriptionStatus::Pending {
            return Err(BillingError::InvalidTransition {
                action: "resolve pending subscription",
                status: subscription.status,
            });
        }

        let now = self.ctx.now();
        let reason = subscription.pending_reason.take();
        let mut changes = Changeset::new();

        // The attempt that parked the subscription never got a verdict; close it
        // out so the period can be billed again
        let mut in_flight = self
            .ctx
            .store
            .list_payments(&PaymentFilter {
                subscription_id: Some(subscription.id),
                statuses: vec![PaymentStatus::Pending],
                ..Default::default()
            })
            .await?;
        let voided: Vec<Uuid> = in_flight.iter().map(|p| p.id).collect();
        for payment in &mut in_flight {
            payment.status = PaymentStatus::Failed;
            payment.failure_reason = Some(VOIDED_REASON.to_string());
            payment.updated_at = now;
            changes.update_payment(payment);
        }

        let mut reattempt = None;
        let event_type = match resolution {
            PendingResolution::Resume => {
                validate_transition(
                    subscription.status,
                    SubscriptionStatus::Active,
                    "resume subscription",
                )?;
                subscription.status = SubscriptionStatus::Active;
                subscription.grace_period_end = None;
                subscription.retry_count = 0;
                changes.campus_flag(subscription.campus_id, true);

                // Renewals are picked up by the next sweep; other kinds are
                // charged again right away
                if let Some(stuck) = in_flight.iter().find(|p| p.kind != PaymentKind::Recurring) {
                    let payment = stuck.reattempt(now);
                    changes.insert_payment(&payment);
                    changes.event(payment_created_event(&payment, actor, now));
                    reattempt = Some(payment);
                }
                BillingEventType::SubscriptionResumed
            }
            PendingResolution::Suspend => {
                validate_transition(
                    subscription.status,
                    SubscriptionStatus::Suspended,
                    "suspend subscription",
                )?;
                subscription.status = SubscriptionStatus::Suspended;
                subscription.grace_period_end = Some(now);
                changes.campus_flag(subscription.campus_id, false);
                BillingEventType::SubscriptionSuspended
            }
        };
        subscription.updated_at = now;

        changes.update_subscription(&mut subscription);
        changes.event(
            BillingEventBuilder::new(subscription.campus_id, event_type)
                .subscription(subscription.id)
                .by(actor)
                .data(serde_json::json!({
                    "resolution": resolution,
                    "pending_reason": reason,
                    "voided_payments": voided,
                }))
                .build(now),
        );
        self.ctx.commit(changes).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            resolution = ?resolution,
            status = %subscription.status,
            voided_payments = voided.len(),
            "Pending subscription resolved"
        );

        if subscription.status == SubscriptionStatus::Suspended {
            self.ctx
                .notifier
                .notify(Notification::Suspended {
                    campus_id: subscription.campus_id,
                    email: subscription.billing_contact.email.clone(),
                })
                .await;
        }

        if let Some(payment) = reattempt {
            self.charge_or_mark_pending(&payment).await;
            subscription = load_subscription(&self.ctx, subscription.id).await?;
        }

        Ok(subscription)
    }

    /// Execute a committed pending payment; an error without a gateway verdict
    /// parks the subscription in PENDING.
    pub(crate) async fn charge_or_mark_pending(&self, payment: &Payment) -> Payment {
        match self.payments.execute(payment).await {
            Ok(outcome) => outcome.payment().clone(),
            Err(e) => {
                tracing::error!(
                    payment_id = %payment.id,
                    subscription_id = %payment.subscription_id,
                    error = %e,
                    "Charge failed without a gateway verdict"
                );
                if let Err(mark_err) = self
                    .mark_pending(payment.subscription_id, &e.to_string())
                    .await
                {
                    tracing::error!(
                        subscription_id = %payment.subscription_id,
                        error = %mark_err,
                        "Failed to mark subscription pending"
                    );
                }
                payment.clone()
            }
        }
    }
}

fn new_subscription(
    plan: &Plan,
    request: &CreateSubscriptionRequest,
    now: OffsetDateTime,
) -> BillingResult<Subscription> {
    let (status, trial_end_date, end_date) = if plan.trial_days > 0 {
        let trial_end = now
            .checked_add(Duration::days(i64::from(plan.trial_days)))
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "Trial of {} days is out of range",
                    plan.trial_days
                ))
            })?;
        (SubscriptionStatus::Trial, Some(trial_end), trial_end)
    } else {
        (
            SubscriptionStatus::Active,
            None,
            plan.billing_period.advance(now),
        )
    };

    Ok(    Subscription {
        id: Uuid::new_v4(),
        campus_id: request.campus_id,
        plan_id: plan.id,
        status,
        start_date: now,
        current_period_start: now,
        end_date,
        trial_end_date,
        next_billing_date: end_date,
        grace_period_end: None,
        price_cents: plan.price_cents,
        currency: plan.currency.clone(),
        billing_period: plan.billing_period,
        billing_anchor_day: trial_end_date.unwrap_or(now).day(),
        auto_renew: request.auto_renew,
        billing_contact: request.billing_contact.clone(),
        gateway_customer_id: request.gateway_customer_id.clone(),
        gateway_payment_method_id: request.gateway_payment_method_id.clone(),
        cancellation_reason: None,
        canceled_at: None,
        credit_balance_cents: 0,
        retry_count: 0,
        next_retry_at: None,
        pending_reason: None,
        usage: UsageCounters::default(),
        version: 0,
        created_at: now,
        updated_at: now,
    })
}

pub(crate) fn payment_created_event(
    payment: &Payment,
    actor: Actor,
    now: OffsetDateTime,
) -> BillingEvent {
    BillingEventBuilder::new(payment.campus_id, BillingEventType::PaymentCreated)
        .subscription(payment.subscription_id)
        .by(actor)
        .data(serde_json::json!({
            "payment_id": payment.id,
            "kind": payment.kind.as_str(),
            "amount_cents": payment.amount_cents,
            "credit_applied_cents": payment.credit_applied_cents,
            "period_start": payment.period_start.to_string(),
            "period_end": payment.period_end.to_string(),
        }))
        .build(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ChargeResponse;
    use crate::test_support::harness;

    #[tokio::test]
    async fn test_trial_plan_starts_in_trial_without_charge() {
        let h = harness();
        let plan = h.plan(10_000, 14).await;
        let sub = h.subscribe(plan.id).await;

        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(sub.trial_end_date, Some(h.now() + Duration::days(14)));
        assert_eq!(sub.next_billing_date, h.now() + Duration::days(14));
        assert_eq!(h.gateway.calls(), 0);
        assert!(h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());
        assert!(h.sink.kinds().contains(&"welcome"));
    }

    #[tokio::test]
    async fn test_paid_plan_charges_first_period() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.end_date, plan.billing_period.advance(h.now()));
        let payments = h
            .payments
            .list_payments(&PaymentFilter {
                subscription_id: Some(sub.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].kind, PaymentKind::Initial);
        assert_eq!(payments[0].status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_declined_initial_charge_goes_past_due() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        h.gateway.push(ChargeResponse::declined("card_declined"));
        let sub = h.subscribe(plan.id).await;

        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert!(sub.grace_period_end.is_some());
    }

    #[tokio::test]
    async fn test_unexpected_charge_error_marks_pending() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        h.gateway
            .push_error(BillingError::Internal("gateway returned garbage".to_string()));
        let sub = h.subscribe(plan.id).await;

        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert!(sub.pending_reason.is_some());
        assert!(h.sink.kinds().contains(&"admin_alert"));

        // A pending subscription blocks a fresh purchase
        let err = h
            .subscriptions
            .create(h.create_request(sub.campus_id, plan.id), Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateSubscription { .. }));

        let resumed = h
            .subscriptions
            .resolve_pending(sub.id, PendingResolution::Resume, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(resumed.status, SubscriptionStatus::Active);
        assert!(resumed.pending_reason.is_none());

        // The stuck first-period charge is voided and charged again
        let payments = h
            .payments
            .list_payments(&PaymentFilter {
                subscription_id: Some(sub.id),
                kind: Some(PaymentKind::Initial),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(payments.len(), 2);
        assert!(payments.iter().any(|p| p.status == PaymentStatus::Failed
            && p.failure_reason.as_deref() == Some(VOIDED_REASON)));
        assert!(payments.iter().any(|p| p.status == PaymentStatus::Completed));
        assert_eq!(h.gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_suspend_pending_revokes_access() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        h.subscriptions.mark_pending(sub.id, "timeout").await.unwrap();

        let suspended = h
            .subscriptions
            .resolve_pending(sub.id, PendingResolution::Suspend, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(suspended.status, SubscriptionStatus::Suspended);
        assert!(!h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());

        let err = h
            .subscriptions
            .resolve_pending(sub.id, PendingResolution::Resume, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_immediate_revokes_access() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;

        let canceled = h
            .subscriptions
            .cancel(
                sub.id,
                CancelRequest {
                    immediate: true,
                    reason: Some("closing campus".to_string()),
                },
                Actor::user(Uuid::new_v4()),
            )
            .await
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert_eq!(canceled.grace_period_end, Some(h.now()));
        assert!(!h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());

        let again = h
            .subscriptions
            .cancel(sub.id, CancelRequest::default(), Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(again, BillingError::AlreadyCanceled(id) if id == sub.id));
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_keeps_access() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;

        let canceled = h
            .subscriptions
            .cancel(sub.id, CancelRequest::default(), Actor::system())
            .await
            .unwrap();
        assert_eq!(canceled.grace_period_end, Some(sub.end_date));
        assert!(!canceled.auto_renew);
        assert!(h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());
        assert!(h.sink.kinds().contains(&"cancellation"));
    }

    #[tokio::test]
    async fn test_change_plan_rejections() {
        let h = harness();
        let basic = h.plan(10_000, 0).await;
        let plus = h.plan(16_000, 0).await;
        let trial_plan = h.plan(10_000, 14).await;
        let sub = h.subscribe(basic.id).await;

        let same = h
            .subscriptions
            .change_plan(sub.id, basic.id, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(same, BillingError::SamePlan(_)));

        // Trial subscriptions cannot change plan
        let trial_sub = h.subscribe(trial_plan.id).await;
        let err = h
            .subscriptions
            .change_plan(trial_sub.id, plus.id, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InvalidTransition {
                status: SubscriptionStatus::Trial,
                ..
            }
        ));

        // A renewal in flight blocks the change
        h.pending_renewal(&sub).await;
        let err = h
            .subscriptions
            .change_plan(sub.id, plus.id, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_downgrade_banks_credit() {
        let h = harness();
        let premium = h.plan(30_000, 0).await;
        let basic = h.plan(10_000, 0).await;
        let sub = h.subscribe(premium.id).await;
        h.clock.advance(Duration::days(15));

        let result = h
            .subscriptions
            .change_plan(sub.id, basic.id, Actor::system())
            .await
            .unwrap();
        assert!(result.proration.is_downgrade());
        assert!(result.payment.is_none());
        assert_eq!(
            result.subscription.credit_balance_cents,
            -result.proration.amount_cents
        );
        assert_eq!(result.subscription.price_cents, 10_000);
        assert_eq!(result.subscription.current_period_start, h.now());
    }

    #[tokio::test]
    async fn test_update_rejects_auto_renew_on_canceled() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        h.subscriptions
            .cancel(sub.id, CancelRequest::default(), Actor::system())
            .await
            .unwrap();

        let err = h
            .subscriptions
            .update(
                sub.id,
                UpdateSubscriptionRequest {
                    auto_renew: Some(true),
                    ..Default::default()
                },
                Actor::system(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));

        let updated = h
            .subscriptions
            .update(
                sub.id,
                UpdateSubscriptionRequest {
                    billing_contact: Some(BillingContact {
                        email: Some("finance@example.edu".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Actor::system(),
            )
            .await
            .unwrap();
        assert_eq!(
            updated.billing_contact.email.as_deref(),
            Some("finance@example.edu")
        );
    }

    #[tokio::test]
    async fn test_get_for_campus_falls_back_to_latest() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        h.subscriptions
            .cancel(
                sub.id,
                CancelRequest {
                    immediate: true,
                    reason: None,
                },
                Actor::system(),
            )
            .await
            .unwrap();

        let found = h.subscriptions.get_for_campus(sub.campus_id).await.unwrap();
        assert_eq!(found.id, sub.id);
        assert_eq!(found.status, SubscriptionStatus::Canceled);
        assert!(matches!(
            h.subscriptions.get_for_campus(Uuid::new_v4()).await,
            Err(BillingError::NotFound(_))
        ));
    }
}
