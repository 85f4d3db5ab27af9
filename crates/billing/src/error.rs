//! Billing error types

use uuid::Uuid;

use crate::subscriptions::SubscriptionStatus;

/// Coarse classification used by callers to decide how to surface an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Entity lookup miss (404-equivalent)
    NotFound,
    /// Conflict or business-rule violation (4xx-equivalent)
    BusinessRule,
    /// The gateway could not process the request; retried by policy
    TransientGateway,
    /// Anything else
    Unexpected,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Campus {campus_id} already has a live subscription ({existing_id})")]
    DuplicateSubscription { campus_id: Uuid, existing_id: Uuid },

    #[error("Subscription {0} is already canceled")]
    AlreadyCanceled(Uuid),

    #[error("Cannot {action}: subscription is {status}")]
    InvalidTransition {
        action: &'static str,
        status: SubscriptionStatus,
    },

    #[error("Subscription is already on plan {0}")]
    SamePlan(Uuid),

    #[error("Plan {0} is not available for purchase")]
    PlanUnavailable(Uuid),

    #[error("Plan {0} is referenced by live subscriptions and cannot change commercial terms")]
    PlanInUse(Uuid),

    #[error("Quota exceeded for {resource}: limit {limit}, requested {requested}")]
    QuotaExceeded {
        resource: &'static str,
        limit: i64,
        requested: i64,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::DuplicateSubscription { .. }
            | BillingError::AlreadyCanceled(_)
            | BillingError::InvalidTransition { .. }
            | BillingError::SamePlan(_)
            | BillingError::PlanUnavailable(_)
            | BillingError::PlanInUse(_)
            | BillingError::QuotaExceeded { .. }
            | BillingError::Forbidden(_)
            | BillingError::InvalidInput(_)
            | BillingError::ConcurrentModification(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::WebhookEventNotSupported(_) => ErrorKind::BusinessRule,
            BillingError::Gateway(_) => ErrorKind::TransientGateway,
            BillingError::Configuration(_)
            | BillingError::Database(_)
            | BillingError::Cache(_)
            | BillingError::Serialization(_)
            | BillingError::Internal(_) => ErrorKind::Unexpected,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::DuplicateSubscription { .. } => "SUBSCRIPTION_ALREADY_EXISTS",
            BillingError::AlreadyCanceled(_) => "SUBSCRIPTION_ALREADY_CANCELED",
            BillingError::InvalidTransition { .. } => "INVALID_SUBSCRIPTION_STATE",
            BillingError::SamePlan(_) => "PLAN_UNCHANGED",
            BillingError::PlanUnavailable(_) => "PLAN_UNAVAILABLE",
            BillingError::PlanInUse(_) => "PLAN_IN_USE",
            BillingError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            BillingError::Forbidden(_) => "FORBIDDEN",
            BillingError::InvalidInput(_) => "INVALID_INPUT",
            BillingError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            BillingError::Gateway(_) => "GATEWAY_UNAVAILABLE",
            BillingError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            BillingError::WebhookEventNotSupported(_) => "WEBHOOK_EVENT_NOT_SUPPORTED",
            BillingError::Configuration(_)
            | BillingError::Database(_)
            | BillingError::Cache(_)
            | BillingError::Serialization(_)
            | BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Human-readable detail lines for API responses
    pub fn details(&self) -> Vec<String> {
        match self {
            BillingError::DuplicateSubscription {
                campus_id,
                existing_id,
            } => vec![
                format!("campus_id: {}", campus_id),
                format!("existing_subscription_id: {}", existing_id),
            ],
            BillingError::InvalidTransition { action, status } => vec![
                format!("action: {}", action),
                format!("current_status: {}", status),
            ],
            BillingError::QuotaExceeded {
                resource,
                limit,
                requested,
            } => vec![
                format!("resource: {}", resource),
                format!("limit: {}", limit),
                format!("requested: {}", requested),
            ],
            // Internal errors never leak their message
            e if e.kind() == ErrorKind::Unexpected => vec![],
            e => vec![e.to_string()],
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            BillingError::NotFound(_) => 404,
            BillingError::Forbidden(_) => 403,
            BillingError::WebhookSignatureInvalid
            | BillingError::WebhookEventNotSupported(_)
            | BillingError::InvalidInput(_) => 400,
            BillingError::QuotaExceeded { .. } => 422,
            BillingError::Gateway(_) => 502,
            e if e.kind() == ErrorKind::BusinessRule => 409,
            _ => 500,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("Row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(e: redis::RedisError) -> Self {
        BillingError::Cache(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Serialization(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Gateway(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_subscription_is_business_rule() {
        let err = BillingError::DuplicateSubscription {
            campus_id: Uuid::nil(),
            existing_id: Uuid::nil(),
        };
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
        assert_eq!(err.code(), "SUBSCRIPTION_ALREADY_EXISTS");
        assert_eq!(err.http_status(), 409);
        assert_eq!(err.details().len(), 2);
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = BillingError::Database("connection reset by peer".to_string());
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(err.details().is_empty());
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn test_gateway_error_is_transient() {
        let err = BillingError::Gateway("timeout".to_string());
        assert_eq!(err.kind(), ErrorKind::TransientGateway);
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn test_invalid_transition_details() {
        let err = BillingError::InvalidTransition {
            action: "change plan",
            status: SubscriptionStatus::PastDue,
        };
        assert_eq!(
            err.details(),
            vec![
                "action: change plan".to_string(),
                "current_status: past_due".to_string()
            ]
        );
        assert_eq!(err.to_string(), "Cannot change plan: subscription is past_due");
    }
}
