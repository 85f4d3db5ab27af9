//! Payments and charge settlement
//!
//! A payment row is committed as PENDING before the gateway is called, so a crash
//! mid-call leaves a record the webhook reconciler can settle later. Settlement is
//! shared by the charge workflow and the reconciler: both reload the payment and
//! its subscription, re-check state and commit one changeset, retrying a bounded
//! number of times when another writer got there first.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventType};
use crate::gateway::ChargeRequest;
use crate::notifications::Notification;
use crate::scheduler::RetryPolicy;
use crate::state_machine::validate_transition;
use crate::store::{Changeset, PaymentFilter};
use crate::subscriptions::{load_subscription, Subscription, SubscriptionStatus};
use crate::tax::ChargeAmount;

/// Attempts for a settlement that loses an optimistic-lock race
pub(crate) const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Failure reason on an in-flight payment closed out by an administrator
pub const VOIDED_REASON: &str = "voided_on_pending_resolution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    /// First period of a non-trial paid subscription
    Initial,
    /// Renewal for the next period (the only kind that advances the period)
    Recurring,
    /// Upgrade charge after a mid-period plan change
    Proration,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Initial => "initial",
            PaymentKind::Recurring => "recurring",
            PaymentKind::Proration => "proration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(PaymentKind::Initial),
            "recurring" => Some(PaymentKind::Recurring),
            "proration" => Some(PaymentKind::Proration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Charged through the payment gateway
    Card,
    /// Fully covered by account credit; never sent to the gateway
    AccountCredit,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::AccountCredit => "account_credit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "card" => Some(PaymentMethod::Card),
            "account_credit" => Some(PaymentMethod::AccountCredit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub campus_id: Uuid,
    pub kind: PaymentKind,
    /// Total charged, tax included
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub credit_applied_cents: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub failure_reason: Option<String>,
    /// Cumulative refunded amount
    pub refund_amount_cents: Option<i64>,
    pub refunded_at: Option<OffsetDateTime>,
    pub refund_reason: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub raw_response: Option<String>,
    pub alerted_at: Option<OffsetDateTime>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl Payment {
    /// A new PENDING payment for `subscription` covering `[period_start, period_end)`
    pub fn new_pending(
        subscription: &Subscription,
        kind: PaymentKind,
        charge: &ChargeAmount,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Self {
        let method = if charge.total_cents() == 0 {
            PaymentMethod::AccountCredit
        } else {
            PaymentMethod::Card
        };

        Self {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            campus_id: subscription.campus_id,
            kind,
            amount_cents: charge.total_cents(),
            tax_cents: charge.tax.tax_cents,
            credit_applied_cents: charge.credit_applied_cents,
            currency: subscription.currency.clone(),
            method,
            status: PaymentStatus::Pending,
            transaction_id: None,
            period_start,
            period_end,
            failure_reason: None,
            refund_amount_cents: None,
            refunded_at: None,
            refund_reason: None,
            invoice_id: None,
            raw_response: None,
            alerted_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// A fresh PENDING attempt for the same kind, period and amount
    pub fn reattempt(&self, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: PaymentStatus::Pending,
            transaction_id: None,
            failure_reason: None,
            refund_amount_cents: None,
            refunded_at: None,
            refund_reason: None,
            invoice_id: None,
            raw_response: None,
            alerted_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            ..self.clone()
        }
    }

    pub fn subtotal_cents(&self) -> i64 {
        self.amount_cents - self.tax_cents
    }

    pub fn refundable_cents(&self) -> i64 {
        match self.status {
            PaymentStatus::Completed | PaymentStatus::Refunded => {
                self.amount_cents - self.refund_amount_cents.unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// What a settlement call did
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// The payment changed state and side effects were committed
    Applied(Payment),
    /// The payment was already in the requested state
    AlreadyApplied(Payment),
    /// The request conflicts with a later state (e.g. failure after completion)
    Ignored(Payment),
}

impl SettleOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            SettleOutcome::Applied(p) | SettleOutcome::AlreadyApplied(p) | SettleOutcome::Ignored(p) => p,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, SettleOutcome::Applied(_))
    }
}

/// Result of sending one pending payment to the gateway
#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Succeeded(Payment),
    Failed(Payment),
    /// Accepted by the gateway without a verdict; still PENDING
    Processing(Payment),
}

impl ChargeOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            ChargeOutcome::Succeeded(p)
            | ChargeOutcome::Failed(p)
            | ChargeOutcome::Processing(p) => p,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ChargeOutcome::Succeeded(_))
    }
}

/// Gateway execution and settlement of payments
#[derive(Clone)]
pub struct PaymentProcessor {
    ctx: BillingContext,
}

impl PaymentProcessor {
    pub fn new(ctx: BillingContext) -> Self {
        Self { ctx }
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Payment> {
        load_payment(&self.ctx, payment_id).await
    }

    pub async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>> {
        self.ctx.store.list_payments(filter).await
    }

    /// Send a committed PENDING payment to the gateway and settle the verdict.
    ///
    /// Declines and transient gateway failures settle as failed. A charge still
    /// processing at the gateway stays PENDING for the webhook to settle. Any
    /// other error leaves the payment PENDING and is returned to the caller.
    pub async fn execute(&self, payment: &Payment) -> BillingResult<ChargeOutcome> {
        if payment.amount_cents == 0 {
            let outcome = self
                .settle_success(
                    payment.id,
                    &format!("credit-{}", payment.id),
                    None,
                    ActorType::System,
                )
                .await?;
            return Ok(ChargeOutcome::Succeeded(outcome.payment().clone()));
        }

        let subscription = load_subscription(&self.ctx, payment.subscription_id).await?;
        let request = ChargeRequest::for_payment(payment, &subscription);

        tracing::info!(
            payment_id = %payment.id,
            subscription_id = %payment.subscription_id,
            amount_cents = payment.amount_cents,
            kind = payment.kind.as_str(),
            gateway = self.ctx.gateway.name(),
            "Charging payment"
        );

        match self.ctx.gateway.charge(&request).await {
            Ok(response) if response.successful => {
                let transaction_id = response
                    .transaction_id
                    .unwrap_or_else(|| format!("gw-{}", payment.id));
                let outcome = self
                    .settle_success(
                        payment.id,
                        &transaction_id,
                        response.raw_response,
                        ActorType::System,
                    )
                    .await?;
                Ok(ChargeOutcome::Succeeded(outcome.payment().clone()))
            }
            Ok(response) if response.processing => {
                let payment = self
                    .record_processing(payment.id, response.transaction_id, response.raw_response)
                    .await?;
                Ok(ChargeOutcome::Processing(payment))
            }
            Ok(response) => {
                let reason = response
                    .error_message
                    .unwrap_or_else(|| "Payment declined".to_string());
                let outcome = self
                    .settle_failure(
                        payment.id,
                        &reason,
                        response.transaction_id,
                        response.raw_response,
                        ActorType::System,
                    )
                    .await?;
                Ok(ChargeOutcome::Failed(outcome.payment().clone()))
            }
            Err(BillingError::Gateway(message)) => {
                tracing::warn!(
                    payment_id = %payment.id,
                    error = %message,
                    "Gateway unavailable, treating charge as failed"
                );
                let outcome = self
                    .settle_failure(payment.id, &message, None, None, ActorType::System)
                    .await?;
                Ok(ChargeOutcome::Failed(outcome.payment().clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Keep a payment PENDING while the gateway decides, remembering its
    /// transaction id so the webhook can find it
    async fn record_processing(
        &self,
        payment_id: Uuid,
        transaction_id: Option<String>,
        raw_response: Option<String>,
    ) -> BillingResult<Payment> {
        let mut payment = load_payment(&self.ctx, payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            // The webhook won the race
            return Ok(payment);
        }

        payment.transaction_id = transaction_id.or(payment.transaction_id);
        if raw_response.is_some() {
            payment.raw_response = raw_response;
        }
        payment.updated_at = self.ctx.now();

        let mut changes = Changeset::new();
        changes.update_payment(&mut payment);
        match self.ctx.commit(changes).await {
            Ok(()) => {
                tracing::info!(
                    payment_id = %payment_id,
                    transaction_id = ?payment.transaction_id,
                    "Payment processing at gateway, awaiting webhook"
                );
                Ok(payment)
            }
            Err(BillingError::ConcurrentModification(_)) => load_payment(&self.ctx, payment_id).await,
            Err(e) => Err(e),
        }
    }

    /// A later attempt for the same period that is in flight or already paid
    async fn superseding_attempt(&self, payment: &Payment) -> BillingResult<Option<Payment>> {
        let later = self
            .ctx
            .store
            .list_payments(&PaymentFilter {
                subscription_id: Some(payment.subscription_id),
                statuses: vec![PaymentStatus::Pending, PaymentStatus::Completed],
                kind: Some(payment.kind),
                created_at_or_after: Some(payment.created_at),
                ..Default::default()
            })
            .await?;
        Ok(later
            .into_iter()
            .find(|p| p.id != payment.id && p.period_start == payment.period_start))
    }

    /// Mark a payment COMPLETED and run the post-success transition.
    ///
    /// Idempotent: a payment already COMPLETED (or REFUNDED) is left untouched.
    /// Only a recurring payment whose period extends past the subscription's
    /// current end advances the period, so replays never double-advance. A late
    /// success for a FAILED payment whose period was already re-attempted is not
    /// applied; administrators are alerted to refund it.
    pub async fn settle_success(
        &self,
        payment_id: Uuid,
        transaction_id: &str,
        raw_response: Option<String>,
        actor: ActorType,
    ) -> BillingResult<SettleOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.ctx.now();
            let mut payment = load_payment(&self.ctx, payment_id).await?;

            if matches!(
                payment.status,
                PaymentStatus::Completed | PaymentStatus::Refunded
            ) {
                tracing::info!(
                    payment_id = %payment_id,
                    status = %payment.status,
                    "Payment already settled, skipping success"
                );
                return Ok(SettleOutcome::AlreadyApplied(payment));
            }

            if payment.status == PaymentStatus::Failed {
                if let Some(newer) = self.superseding_attempt(&payment).await? {
                    tracing::error!(
                        payment_id = %payment_id,
                        superseded_by = %newer.id,
                        transaction_id = %transaction_id,
                        "Gateway reported success for a superseded payment"
                    );
                    self.ctx
                        .notifier
                        .alert_admins(
                            "Superseded payment captured",
                            format!(
                                "Transaction {} succeeded for payment {} after attempt {} ({}) replaced it; refund one of them",
                                transaction_id, payment_id, newer.id, newer.status
                            ),
                            Some(payment.subscription_id),
                            Some(payment_id),
                        )
                        .await;
                    return Ok(SettleOutcome::Ignored(payment));
                }
            }

            let mut subscription = load_subscription(&self.ctx, payment.subscription_id).await?;
            let previous_status = subscription.status;

            let existing_invoice = self.ctx.store.find_invoice_for_payment(payment.id).await?;

            payment.status = PaymentStatus::Completed;
            payment.transaction_id = Some(transaction_id.to_string());
            payment.failure_reason = None;
            payment.completed_at = Some(now);
            payment.updated_at = now;
            if raw_response.is_some() {
                payment.raw_response = raw_response.clone();
            }

            let mut changes = Changeset::new();

            let new_invoice = match existing_invoice {
                Some(invoice) => {
                    payment.invoice_id = Some(invoice.id);
                    None
                }
                None => {
                    let invoice = self
                        .ctx
                        .invoices
                        .create_invoice_for_payment(&payment, &subscription, now)
                        .await?;
                    payment.invoice_id = Some(invoice.id);
                    Some(invoice)
                }
            };

            let renewed = apply_success_transition(&mut subscription, &payment, now)?;
            if renewed.is_some() {
                changes.update_subscription(&mut subscription);
                changes.campus_flag(subscription.campus_id, true);
            } else {
                tracing::info!(
                    payment_id = %payment_id,
                    subscription_id = %subscription.id,
                    status = %subscription.status,
                    "Subscription not live, recording payment without lifecycle change"
                );
            }

            changes.update_payment(&mut payment);
            changes.event(
                BillingEventBuilder::new(payment.campus_id, BillingEventType::PaymentSucceeded)
                    .subscription(payment.subscription_id)
                    .actor_type(actor)
                    .data(serde_json::json!({
                        "payment_id": payment.id,
                        "kind": payment.kind.as_str(),
                        "amount_cents": payment.amount_cents,
                        "transaction_id": transaction_id,
                    }))
                    .build(now),
            );
            if renewed == Some(true) {
                changes.event(
                    BillingEventBuilder::new(
                        subscription.campus_id,
                        BillingEventType::SubscriptionRenewed,
                    )
                    .subscription(subscription.id)
                    .actor_type(actor)
                    .data(serde_json::json!({
                        "previous_status": previous_status.as_str(),
                        "period_start": subscription.current_period_start.to_string(),
                        "period_end": subscription.end_date.to_string(),
                    }))
                    .build(now),
                );
            }
            if let Some(invoice) = &new_invoice {
                changes.event(
                    BillingEventBuilder::new(payment.campus_id, BillingEventType::InvoiceIssued)
                        .subscription(payment.subscription_id)
                        .actor_type(actor)
                        .data(serde_json::json!({
                            "invoice_id": invoice.id,
                            "invoice_number": invoice.invoice_number,
                            "total_cents": invoice.total_cents,
                        }))
                        .build(now),
                );
            }
            let invoice_number = new_invoice.as_ref().map(|i| i.invoice_number.clone());
            if let Some(invoice) = new_invoice {
                changes.invoice(invoice);
            }

            match self.ctx.commit(changes).await {
                Ok(()) => {
                    tracing::info!(
                        payment_id = %payment_id,
                        subscription_id = %subscription.id,
                        transaction_id = %transaction_id,
                        status = %subscription.status,
                        "Payment completed"
                    );
                    self.ctx
                        .notifier
                        .notify(Notification::PaymentSucceeded {
                            campus_id: payment.campus_id,
                            email: subscription.billing_contact.email.clone(),
                            amount_cents: payment.amount_cents,
                            currency: payment.currency.clone(),
                            invoice_number,
                        })
                        .await;
                    return Ok(SettleOutcome::Applied(payment));
                }
                Err(BillingError::ConcurrentModification(reason))
                    if attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    tracing::warn!(
                        payment_id = %payment_id,
                        attempt = attempt,
                        reason = %reason,
                        "Settlement lost a concurrent update, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark a payment FAILED and run the past-due transition.
    ///
    /// A payment that already completed is never downgraded to failed.
    pub async fn settle_failure(
        &self,
        payment_id: Uuid,
        reason: &str,
        transaction_id: Option<String>,
        raw_response: Option<String>,
        actor: ActorType,
    ) -> BillingResult<SettleOutcome> {
        let policy = RetryPolicy::from_config(&self.ctx.config);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.ctx.now();
            let mut payment = load_payment(&self.ctx, payment_id).await?;

            match payment.status {
                PaymentStatus::Completed | PaymentStatus::Refunded => {
                    tracing::warn!(
                        payment_id = %payment_id,
                        status = %payment.status,
                        "Ignoring failure for a settled payment"
                    );
                    return Ok(SettleOutcome::Ignored(payment));
                }
                PaymentStatus::Failed => return Ok(SettleOutcome::AlreadyApplied(payment)),
                PaymentStatus::Pending => {}
            }

            let mut subscription = load_subscription(&self.ctx, payment.subscription_id).await?;

            payment.status = PaymentStatus::Failed;
            payment.failure_reason = Some(reason.to_string());
            payment.updated_at = now;
            if payment.transaction_id.is_none() {
                payment.transaction_id = transaction_id.clone();
            }
            if raw_response.is_some() {
                payment.raw_response = raw_response.clone();
            }

            let mut changes = Changeset::new();
            let went_past_due =
                apply_failure_transition(&mut subscription, &policy, &self.ctx.config, now)?;
            if went_past_due.is_some() {
                changes.update_subscription(&mut subscription);
            }
            changes.update_payment(&mut payment);
            changes.event(
                BillingEventBuilder::new(payment.campus_id, BillingEventType::PaymentFailed)
                    .subscription(payment.subscription_id)
                    .actor_type(actor)
                    .data(serde_json::json!({
                        "payment_id": payment.id,
                        "kind": payment.kind.as_str(),
                        "amount_cents": payment.amount_cents,
                        "reason": reason,
                        "retry_count": subscription.retry_count,
                        "next_retry_at": subscription.next_retry_at.map(|t| t.to_string()),
                    }))
                    .build(now),
            );
            if went_past_due == Some(true) {
                changes.event(
                    BillingEventBuilder::new(
                        subscription.campus_id,
                        BillingEventType::SubscriptionPastDue,
                    )
                    .subscription(subscription.id)
                    .actor_type(actor)
                    .data(serde_json::json!({
                        "grace_period_end": subscription.grace_period_end.map(|t| t.to_string()),
                    }))
                    .build(now),
                );
            }

            match self.ctx.commit(changes).await {
                Ok(()) => {
                    tracing::warn!(
                        payment_id = %payment_id,
                        subscription_id = %subscription.id,
                        reason = %reason,
                        status = %subscription.status,
                        retry_count = subscription.retry_count,
                        "Payment failed"
                    );
                    self.ctx
                        .notifier
                        .notify(Notification::PaymentFailed {
                            campus_id: payment.campus_id,
                            email: subscription.billing_contact.email.clone(),
                            amount_cents: payment.amount_cents,
                            currency: payment.currency.clone(),
                            reason: reason.to_string(),
                            grace_period_end: subscription.grace_period_end,
                        })
                        .await;
                    return Ok(SettleOutcome::Applied(payment));
                }
                Err(BillingError::ConcurrentModification(conflict))
                    if attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    tracing::warn!(
                        payment_id = %payment_id,
                        attempt = attempt,
                        reason = %conflict,
                        "Settlement lost a concurrent update, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record a refund reported by the gateway.
    ///
    /// `cumulative_refund_cents` is the total refunded so far on the payment. The
    /// subscription status is not changed.
    pub async fn record_refund(
        &self,
        payment_id: Uuid,
        cumulative_refund_cents: i64,
        reason: Option<String>,
        actor: ActorType,
    ) -> BillingResult<SettleOutcome> {
        if cumulative_refund_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "Refund amount must be positive".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.ctx.now();
            let mut payment = load_payment(&self.ctx, payment_id).await?;

            match payment.status {
                PaymentStatus::Completed | PaymentStatus::Refunded => {}
                PaymentStatus::Pending | PaymentStatus::Failed => {
                    return Err(BillingError::InvalidInput(format!(
                        "Payment {} is {} and cannot be refunded",
                        payment_id, payment.status
                    )));
                }
            }

            if payment.refund_amount_cents == Some(cumulative_refund_cents) {
                return Ok(SettleOutcome::AlreadyApplied(payment));
            }

            let amount = if cumulative_refund_cents > payment.amount_cents {
                tracing::warn!(
                    payment_id = %payment_id,
                    refund_cents = cumulative_refund_cents,
                    amount_cents = payment.amount_cents,
                    "Refund exceeds payment amount, capping"
                );
                payment.amount_cents
            } else {
                cumulative_refund_cents
            };
            let newly_refunded = amount - payment.refund_amount_cents.unwrap_or(0);

            payment.status = PaymentStatus::Refunded;
            payment.refund_amount_cents = Some(amount);
            payment.refunded_at = Some(now);
            if reason.is_some() {
                payment.refund_reason = reason.clone();
            }
            payment.updated_at = now;

            let mut changes = Changeset::new();
            changes.update_payment(&mut payment);
            changes.event(
                BillingEventBuilder::new(payment.campus_id, BillingEventType::RefundRecorded)
                    .subscription(payment.subscription_id)
                    .actor_type(actor)
                    .data(serde_json::json!({
                        "payment_id": payment.id,
                        "refund_amount_cents": amount,
                        "reason": reason,
                    }))
                    .build(now),
            );

            match self.ctx.commit(changes).await {
                Ok(()) => {
                    tracing::info!(
                        payment_id = %payment_id,
                        refund_amount_cents = amount,
                        "Refund recorded"
                    );
                    let email = self
                        .ctx
                        .store
                        .get_subscription(payment.subscription_id)
                        .await?
                        .and_then(|s| s.billing_contact.email);
                    self.ctx
                        .notifier
                        .notify(Notification::Refunded {
                            campus_id: payment.campus_id,
                            email,
                            amount_cents: newly_refunded.max(0),
                            currency: payment.currency.clone(),
                            reason: payment.refund_reason.clone(),
                        })
                        .await;
                    return Ok(SettleOutcome::Applied(payment));
                }
                Err(BillingError::ConcurrentModification(conflict))
                    if attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    tracing::warn!(
                        payment_id = %payment_id,
                        attempt = attempt,
                        reason = %conflict,
                        "Refund lost a concurrent update, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) async fn load_payment(ctx: &BillingContext, payment_id: Uuid) -> BillingResult<Payment> {
    ctx.store
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))
}

/// Post-success transition. Returns `None` when the subscription is not in a
/// state a payment can revive, otherwise whether the period advanced.
fn apply_success_transition(
    subscription: &mut Subscription,
    payment: &Payment,
    now: OffsetDateTime,
) -> BillingResult<Option<bool>> {
    if !matches!(
        subscription.status,
        SubscriptionStatus::Trial
            | SubscriptionStatus::Active
            | SubscriptionStatus::PastDue
            | SubscriptionStatus::Pending
    ) {
        return Ok(None);
    }

    validate_transition(subscription.status, SubscriptionStatus::Active, "settle payment")?;

    let advances =
        payment.kind == PaymentKind::Recurring && payment.period_end > subscription.end_date;
    if advances {
        subscription.current_period_start = payment.period_start;
        subscription.end_date = payment.period_end;
        subscription.next_billing_date = payment.period_end;
        subscription.usage.appointments = 0;
    }

    subscription.status = SubscriptionStatus::Active;
    subscription.grace_period_end = None;
    subscription.retry_count = 0;
    subscription.next_retry_at = None;
    subscription.pending_reason = None;
    subscription.credit_balance_cents =
        (subscription.credit_balance_cents - payment.credit_applied_cents).max(0);
    subscription.updated_at = now;

    Ok(Some(advances))
}

/// Past-due transition. Returns `None` when the subscription is left unchanged,
/// otherwise whether it newly entered PAST_DUE.
fn apply_failure_transition(
    subscription: &mut Subscription,
    policy: &RetryPolicy,
    config: &crate::config::BillingConfig,
    now: OffsetDateTime,
) -> BillingResult<Option<bool>> {
    match subscription.status {
        SubscriptionStatus::Trial | SubscriptionStatus::Active => {
            validate_transition(subscription.status, SubscriptionStatus::PastDue, "record failure")?;
            let grace_end = now + config.grace_period();
            subscription.status = SubscriptionStatus::PastDue;
            subscription.grace_period_end = Some(grace_end);
            subscription.retry_count = 0;
            subscription.next_retry_at = policy.next_retry_at(0, now, grace_end);
            subscription.updated_at = now;
            Ok(Some(true))
        }
        SubscriptionStatus::PastDue => {
            let grace_end = subscription
                .grace_period_end
                .unwrap_or_else(|| now + config.grace_period());
            subscription.grace_period_end = Some(grace_end);
            subscription.retry_count += 1;
            subscription.next_retry_at =
                policy.next_retry_at(subscription.retry_count, now, grace_end);
            subscription.updated_at = now;
            Ok(Some(false))
        }
        SubscriptionStatus::Pending
        | SubscriptionStatus::Canceled
        | SubscriptionStatus::Suspended
        | SubscriptionStatus::Expired => Ok(None),
    }
}
