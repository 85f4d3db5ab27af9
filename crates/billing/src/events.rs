//! Billing event audit trail
//!
//! Every lifecycle transition appends a [`BillingEvent`] to the changeset that
//! performs it, so the audit row commits or rolls back with the state change.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Who caused a billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Admin,
    System,
    Gateway,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Admin => "admin",
            ActorType::System => "system",
            ActorType::Gateway => "gateway",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ActorType::User),
            "admin" => Some(ActorType::Admin),
            "system" => Some(ActorType::System),
            "gateway" => Some(ActorType::Gateway),
            _ => None,
        }
    }
}

/// Actor attached to an operation's audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<Uuid>,
    pub actor_type: ActorType,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn gateway() -> Self {
        Self {
            id: None,
            actor_type: ActorType::Gateway,
        }
    }

    pub fn user(id: Uuid) -> Self {
        Self {
            id: Some(id),
            actor_type: ActorType::User,
        }
    }

    pub fn admin(id: Uuid) -> Self {
        Self {
            id: Some(id),
            actor_type: ActorType::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    SubscriptionRenewed,
    SubscriptionPastDue,
    SubscriptionSuspended,
    SubscriptionExpired,
    SubscriptionPending,
    SubscriptionResumed,
    PlanChanged,
    PaymentCreated,
    PaymentSucceeded,
    PaymentFailed,
    RefundRecorded,
    InvoiceIssued,
    CreditApplied,
    UsageAdjusted,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::SubscriptionUpdated => "subscription_updated",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::SubscriptionRenewed => "subscription_renewed",
            BillingEventType::SubscriptionPastDue => "subscription_past_due",
            BillingEventType::SubscriptionSuspended => "subscription_suspended",
            BillingEventType::SubscriptionExpired => "subscription_expired",
            BillingEventType::SubscriptionPending => "subscription_pending",
            BillingEventType::SubscriptionResumed => "subscription_resumed",
            BillingEventType::PlanChanged => "plan_changed",
            BillingEventType::PaymentCreated => "payment_created",
            BillingEventType::PaymentSucceeded => "payment_succeeded",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::RefundRecorded => "refund_recorded",
            BillingEventType::InvoiceIssued => "invoice_issued",
            BillingEventType::CreditApplied => "credit_applied",
            BillingEventType::UsageAdjusted => "usage_adjusted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [BillingEventType; 17] = [
            BillingEventType::SubscriptionCreated,
            BillingEventType::SubscriptionUpdated,
            BillingEventType::SubscriptionCanceled,
            BillingEventType::SubscriptionRenewed,
            BillingEventType::SubscriptionPastDue,
            BillingEventType::SubscriptionSuspended,
            BillingEventType::SubscriptionExpired,
            BillingEventType::SubscriptionPending,
            BillingEventType::SubscriptionResumed,
            BillingEventType::PlanChanged,
            BillingEventType::PaymentCreated,
            BillingEventType::PaymentSucceeded,
            BillingEventType::PaymentFailed,
            BillingEventType::RefundRecorded,
            BillingEventType::InvoiceIssued,
            BillingEventType::CreditApplied,
            BillingEventType::UsageAdjusted,
        ];
        ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub campus_id: Uuid,
    pub event_type: BillingEventType,
    pub actor_type: ActorType,
    pub actor_id: Option<Uuid>,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Builder for billing events
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    campus_id: Uuid,
    event_type: BillingEventType,
    subscription_id: Option<Uuid>,
    actor_type: ActorType,
    actor_id: Option<Uuid>,
    data: serde_json::Value,
}

impl BillingEventBuilder {
    pub fn new(campus_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            campus_id,
            event_type,
            subscription_id: None,
            actor_type: ActorType::System,
            actor_id: None,
            data: serde_json::json!({}),
        }
    }

    pub fn subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    pub fn actor_opt(mut self, actor_id: Option<Uuid>, actor_type: ActorType) -> Self {
        self.actor_id = actor_id;
        self.actor_type = actor_type;
        self
    }

    pub fn by(self, actor: Actor) -> Self {
        self.actor_opt(actor.id, actor.actor_type)
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self, at: OffsetDateTime) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            subscription_id: self.subscription_id,
            campus_id: self.campus_id,
            event_type: self.event_type,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            data: self.data,
            created_at: at,
        }
    }
}
