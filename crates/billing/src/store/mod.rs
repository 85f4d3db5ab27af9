//! Persistence seam for the billing engine
//!
//! Reads are plain lookups. Every state change goes through [`BillingStore::commit`],
//! which applies a [`Changeset`] atomically: subscription and payment updates carry
//! the version they were read at, and a stale version fails the whole changeset with
//! [`BillingError::ConcurrentModification`](crate::error::BillingError).

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::cache::BillingCache;
use crate::error::BillingResult;
use crate::events::BillingEvent;
use crate::invoices::Invoice;
use crate::payments::{Payment, PaymentKind, PaymentStatus};
use crate::plans::Plan;
use crate::subscriptions::{Subscription, SubscriptionStatus};

/// Selection criteria for subscription scans; unset fields do not filter
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub campus_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub statuses: Vec<SubscriptionStatus>,
    pub next_billing_at_or_before: Option<OffsetDateTime>,
    pub next_retry_at_or_before: Option<OffsetDateTime>,
    pub grace_ended_at_or_before: Option<OffsetDateTime>,
    pub limit: Option<i64>,
}

impl SubscriptionFilter {
    pub fn with_statuses(statuses: &[SubscriptionStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn matches(&self, sub: &Subscription) -> bool {
        self.campus_id.is_none_or(|id| sub.campus_id == id)
            && self.plan_id.is_none_or(|id| sub.plan_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&sub.status))
            && self
                .next_billing_at_or_before
                .is_none_or(|t| sub.next_billing_date <= t)
            && self
                .next_retry_at_or_before
                .is_none_or(|t| sub.next_retry_at.is_some_and(|r| r <= t))
            && self
                .grace_ended_at_or_before
                .is_none_or(|t| sub.grace_period_end.is_some_and(|g| g <= t))
    }
}

/// Selection criteria for payment scans; unset fields do not filter
#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub subscription_id: Option<Uuid>,
    pub campus_id: Option<Uuid>,
    pub statuses: Vec<PaymentStatus>,
    pub kind: Option<PaymentKind>,
    pub created_before: Option<OffsetDateTime>,
    pub created_at_or_after: Option<OffsetDateTime>,
    pub unalerted_only: bool,
    pub limit: Option<i64>,
}

impl PaymentFilter {
    pub fn matches(&self, payment: &Payment) -> bool {
        self.subscription_id
            .is_none_or(|id| payment.subscription_id == id)
            && self.campus_id.is_none_or(|id| payment.campus_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&payment.status))
            && self.kind.is_none_or(|k| payment.kind == k)
            && self.created_before.is_none_or(|t| payment.created_at < t)
            && self.created_at_or_after.is_none_or(|t| payment.created_at >= t)
            && (!self.unalerted_only || payment.alerted_at.is_none())
    }
}

#[derive(Debug, Clone)]
pub enum SubscriptionWrite {
    Insert(Subscription),
    Update {
        subscription: Subscription,
        expected_version: i64,
    },
}

impl SubscriptionWrite {
    pub fn subscription(&self) -> &Subscription {
        match self {
            SubscriptionWrite::Insert(s) => s,
            SubscriptionWrite::Update { subscription, .. } => subscription,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PaymentWrite {
    Insert(Payment),
    Update {
        payment: Payment,
        expected_version: i64,
    },
}

impl PaymentWrite {
    pub fn payment(&self) -> &Payment {
        match self {
            PaymentWrite::Insert(p) => p,
            PaymentWrite::Update { payment, .. } => payment,
        }
    }
}

/// Campus access flag owned by billing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampusFlag {
    pub campus_id: Uuid,
    pub is_subscribed: bool,
}

/// One atomic read-modify-write
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub subscription: Option<SubscriptionWrite>,
    pub payments: Vec<PaymentWrite>,
    pub invoice: Option<Invoice>,
    pub campus_flag: Option<CampusFlag>,
    pub events: Vec<BillingEvent>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&mut self, subscription: &Subscription) -> &mut Self {
        self.subscription = Some(SubscriptionWrite::Insert(subscription.clone()));
        self
    }

    /// Record an update and advance `subscription.version` to its post-commit value
    pub fn update_subscription(&mut self, subscription: &mut Subscription) -> &mut Self {
        let expected_version = subscription.version;
        subscription.version += 1;
        self.subscription = Some(SubscriptionWrite::Update {
            subscription: subscription.clone(),
            expected_version,
        });
        self
    }

    pub fn insert_payment(&mut self, payment: &Payment) -> &mut Self {
        self.payments.push(PaymentWrite::Insert(payment.clone()));
        self
    }

    /// Record an update and advance `payment.version` to its post-commit value
    pub fn update_payment(&mut self, payment: &mut Payment) -> &mut Self {
        let expected_version = payment.version;
        payment.version += 1;
        self.payments.push(PaymentWrite::Update {
            payment: payment.clone(),
            expected_version,
        });
        self
    }

    pub fn invoice(&mut self, invoice: Invoice) -> &mut Self {
        self.invoice = Some(invoice);
        self
    }

    pub fn campus_flag(&mut self, campus_id: Uuid, is_subscribed: bool) -> &mut Self {
        self.campus_flag = Some(CampusFlag {
            campus_id,
            is_subscribed,
        });
        self
    }

    pub fn event(&mut self, event: BillingEvent) -> &mut Self {
        self.events.push(event);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.subscription.is_none()
            && self.payments.is_empty()
            && self.invoice.is_none()
            && self.campus_flag.is_none()
            && self.events.is_empty()
    }

    /// Cache keys made stale by this changeset
    pub fn cache_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(write) = &self.subscription {
            keys.push(BillingCache::campus_subscription_key(
                write.subscription().campus_id,
            ));
        }
        if let Some(flag) = &self.campus_flag {
            let key = BillingCache::campus_subscription_key(flag.campus_id);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// Processing state of an inbound gateway webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookProcessingResult {
    Processing,
    Success,
    Error,
    NotFound,
}

impl WebhookProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookProcessingResult::Processing => "processing",
            WebhookProcessingResult::Success => "success",
            WebhookProcessingResult::Error => "error",
            WebhookProcessingResult::NotFound => "not_found",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(WebhookProcessingResult::Processing),
            "success" => Some(WebhookProcessingResult::Success),
            "error" => Some(WebhookProcessingResult::Error),
            "not_found" => Some(WebhookProcessingResult::NotFound),
            _ => None,
        }
    }
}

impl std::fmt::Display for WebhookProcessingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub event_key: String,
    pub event_type: String,
    pub transaction_id: Option<String>,
    pub payload: serde_json::Value,
    pub processing_result: WebhookProcessingResult,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub received_at: OffsetDateTime,
    pub processing_started_at: Option<OffsetDateTime>,
    pub processed_at: Option<OffsetDateTime>,
}

/// Request to take exclusive processing rights for a webhook event
///
/// The claim succeeds for an unseen key, for an `error` record below
/// `max_attempts`, and for a `processing` record older than `stale_after`.
#[derive(Debug, Clone)]
pub struct WebhookClaim {
    pub event_key: String,
    pub event_type: String,
    pub transaction_id: Option<String>,
    pub payload: serde_json::Value,
    pub now: OffsetDateTime,
    pub max_attempts: i32,
    pub stale_after: Duration,
}

impl WebhookClaim {
    pub fn may_reclaim(&self, existing: &WebhookEventRecord) -> bool {
        match existing.processing_result {
            WebhookProcessingResult::Error => existing.attempts < self.max_attempts,
            WebhookProcessingResult::Processing => existing
                .processing_started_at
                .is_none_or(|started| started <= self.now - self.stale_after),
            WebhookProcessingResult::Success | WebhookProcessingResult::NotFound => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WebhookClaimOutcome {
    Claimed(WebhookEventRecord),
    Duplicate(WebhookEventRecord),
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Plans
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;
    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;
    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()>;
    async fn update_plan(&self, plan: &Plan) -> BillingResult<()>;
    async fn count_live_subscriptions_for_plan(&self, plan_id: Uuid) -> BillingResult<i64>;

    // Subscriptions
    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>>;
    /// The campus's TRIAL, ACTIVE or PAST_DUE subscription, if any
    async fn find_live_subscription(&self, campus_id: Uuid) -> BillingResult<Option<Subscription>>;
    /// Most recently created subscription for the campus in any status
    async fn latest_subscription(&self, campus_id: Uuid) -> BillingResult<Option<Subscription>>;
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> BillingResult<Vec<Subscription>>;
    async fn subscription_status_counts(&self) -> BillingResult<Vec<(SubscriptionStatus, i64)>>;

    // Payments
    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>>;
    async fn find_payment_by_transaction(&self, transaction_id: &str)
        -> BillingResult<Option<Payment>>;
    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>>;
    /// Stamp `alerted_at` on a pending payment; false if it was already alerted
    async fn mark_payment_alerted(&self, payment_id: Uuid, at: OffsetDateTime)
        -> BillingResult<bool>;

    // Invoices
    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;
    async fn find_invoice_for_payment(&self, payment_id: Uuid) -> BillingResult<Option<Invoice>>;
    async fn list_invoices(&self, campus_id: Uuid) -> BillingResult<Vec<Invoice>>;

    // Campus access
    async fn is_campus_subscribed(&self, campus_id: Uuid) -> BillingResult<bool>;

    // Audit trail
    async fn list_events(&self, subscription_id: Uuid, limit: i64)
        -> BillingResult<Vec<BillingEvent>>;

    /// Apply a changeset atomically
    async fn commit(&self, changes: Changeset) -> BillingResult<()>;

    // Webhook log
    async fn claim_webhook(&self, claim: WebhookClaim) -> BillingResult<WebhookClaimOutcome>;
    async fn finish_webhook(
        &self,
        event_key: &str,
        result: WebhookProcessingResult,
        error_message: Option<String>,
        at: OffsetDateTime,
    ) -> BillingResult<()>;
    async fn get_webhook(&self, event_key: &str) -> BillingResult<Option<WebhookEventRecord>>;
    async fn list_webhooks(
        &self,
        result: Option<WebhookProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;
    /// Delete finished webhook records received before `before`
    async fn cleanup_webhooks(&self, before: OffsetDateTime) -> BillingResult<u64>;
}
