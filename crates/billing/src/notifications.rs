//! User-facing and operational notifications
//!
//! Notifications are fire-and-forget. [`Notifier`] logs a failing sink and
//! carries on, so a lost email never rolls back a committed billing change.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Welcome {
        campus_id: Uuid,
        email: Option<String>,
        plan_name: String,
        trial_end: Option<OffsetDateTime>,
    },
    Cancellation {
        campus_id: Uuid,
        email: Option<String>,
        access_until: OffsetDateTime,
        immediate: bool,
    },
    PlanChanged {
        campus_id: Uuid,
        email: Option<String>,
        from_plan: String,
        to_plan: String,
        proration_cents: i64,
        currency: String,
    },
    PaymentSucceeded {
        campus_id: Uuid,
        email: Option<String>,
        amount_cents: i64,
        currency: String,
        invoice_number: Option<String>,
    },
    PaymentFailed {
        campus_id: Uuid,
        email: Option<String>,
        amount_cents: i64,
        currency: String,
        reason: String,
        grace_period_end: Option<OffsetDateTime>,
    },
    Suspended {
        campus_id: Uuid,
        email: Option<String>,
    },
    Expired {
        campus_id: Uuid,
        email: Option<String>,
    },
    Refunded {
        campus_id: Uuid,
        email: Option<String>,
        amount_cents: i64,
        currency: String,
        reason: Option<String>,
    },
    /// Operational alert for administrators
    AdminAlert {
        subject: String,
        detail: String,
        subscription_id: Option<Uuid>,
        payment_id: Option<Uuid>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Welcome { .. } => "welcome",
            Notification::Cancellation { .. } => "cancellation",
            Notification::PlanChanged { .. } => "plan_changed",
            Notification::PaymentSucceeded { .. } => "payment_succeeded",
            Notification::PaymentFailed { .. } => "payment_failed",
            Notification::Suspended { .. } => "suspended",
            Notification::Expired { .. } => "expired",
            Notification::Refunded { .. } => "refunded",
            Notification::AdminAlert { .. } => "admin_alert",
        }
    }

    pub fn campus_id(&self) -> Option<Uuid> {
        match self {
            Notification::Welcome { campus_id, .. }
            | Notification::Cancellation { campus_id, .. }
            | Notification::PlanChanged { campus_id, .. }
            | Notification::PaymentSucceeded { campus_id, .. }
            | Notification::PaymentFailed { campus_id, .. }
            | Notification::Suspended { campus_id, .. }
            | Notification::Expired { campus_id, .. }
            | Notification::Refunded { campus_id, .. } => Some(*campus_id),
            Notification::AdminAlert { .. } => None,
        }
    }

    /// Customer recipient; admin alerts are routed by the sink
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Notification::Welcome { email, .. }
            | Notification::Cancellation { email, .. }
            | Notification::PlanChanged { email, .. }
            | Notification::PaymentSucceeded { email, .. }
            | Notification::PaymentFailed { email, .. }
            | Notification::Suspended { email, .. }
            | Notification::Expired { email, .. }
            | Notification::Refunded { email, .. } => email.as_deref(),
            Notification::AdminAlert { .. } => None,
        }
    }

    pub fn is_admin_alert(&self) -> bool {
        matches!(self, Notification::AdminAlert { .. })
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> BillingResult<()>;
}

/// Sink that only logs; used when no email provider is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notification: &Notification) -> BillingResult<()> {
        if notification.is_admin_alert() {
            tracing::error!(notification = ?notification, "Billing admin alert");
        } else {
            tracing::info!(
                kind = notification.kind(),
                campus_id = ?notification.campus_id(),
                "Billing notification (no email provider configured)"
            );
        }
        Ok(())
    }
}

/// Non-failing front for a [`NotificationSink`]
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn logging() -> Self {
        Self::new(Arc::new(LogSink))
    }

    pub async fn notify(&self, notification: Notification) {
        if let Err(e) = self.sink.send(&notification).await {
            tracing::warn!(
                kind = notification.kind(),
                campus_id = ?notification.campus_id(),
                error = %e,
                "Failed to send billing notification"
            );
        }
    }

    pub async fn alert_admins(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        subscription_id: Option<Uuid>,
        payment_id: Option<Uuid>,
    ) {
        let subject = subject.into();
        let detail = detail.into();
        tracing::error!(
            subject = %subject,
            detail = %detail,
            subscription_id = ?subscription_id,
            payment_id = ?payment_id,
            "Raising billing admin alert"
        );
        self.notify(Notification::AdminAlert {
            subject,
            detail,
            subscription_id,
            payment_id,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn send(&self, _notification: &Notification) -> BillingResult<()> {
            Err(BillingError::Internal("smtp down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let notifier = Notifier::new(Arc::new(FailingSink));
        notifier
            .notify(Notification::Suspended {
                campus_id: Uuid::nil(),
                email: Some("bursar@example.edu".to_string()),
            })
            .await;
    }

    #[test]
    fn test_recipient_and_kind() {
        let n = Notification::Expired {
            campus_id: Uuid::nil(),
            email: Some("bursar@example.edu".to_string()),
        };
        assert_eq!(n.kind(), "expired");
        assert_eq!(n.recipient(), Some("bursar@example.edu"));

        let alert = Notification::AdminAlert {
            subject: "stale".to_string(),
            detail: String::new(),
            subscription_id: None,
            payment_id: None,
        };
        assert!(alert.is_admin_alert());
        assert_eq!(alert.recipient(), None);
    }
}
