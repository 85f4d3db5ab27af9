//! Billing email delivery via the Resend HTTP API
//!
//! Sends are spawned onto the runtime and retried with exponential backoff, so
//! billing operations never wait on the email provider.

use async_trait::async_trait;
use edubill_shared::format_cents;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};
use crate::notifications::{Notification, NotificationSink};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key; sending is disabled when unset
    pub api_key: Option<String>,
    pub from_address: String,
    pub admin_address: Option<String>,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            from_address: std::env::var("BILLING_EMAIL_FROM")
                .unwrap_or_else(|_| "EduBill Billing <billing@edubill.app>".to_string()),
            admin_address: std::env::var("BILLING_ADMIN_EMAIL")
                .ok()
                .filter(|a| !a.trim().is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Clone)]
struct RenderedEmail {
    to: String,
    subject: String,
    html: String,
}

#[derive(Clone)]
pub struct BillingEmailService {
    client: reqwest::Client,
    config: EmailConfig,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        let config = EmailConfig::from_env();
        if !config.is_enabled() {
            tracing::warn!("RESEND_API_KEY not set, billing emails will only be logged");
        }
        Self::new(config)
    }

    fn render(&self, notification: &Notification) -> Option<RenderedEmail> {
        let to = if notification.is_admin_alert() {
            self.config.admin_address.clone()?
        } else {
            notification.recipient()?.to_string()
        };

        let (subject, body) = match notification {
            Notification::Welcome {
                plan_name,
                trial_end,
                ..
            } => (
                format!("Welcome to {}", plan_name),
                match trial_end {
                    Some(end) => format!(
                        "<p>Your campus subscription to <b>{}</b> is active. Your free trial runs until {}.</p>",
                        plan_name,
                        end.date()
                    ),
                    None => format!(
                        "<p>Your campus subscription to <b>{}</b> is active.</p>",
                        plan_name
                    ),
                },
            ),
            Notification::Cancellation {
                access_until,
                immediate,
                ..
            } => (
                "Your subscription has been canceled".to_string(),
                if *immediate {
                    "<p>Your subscription was canceled and access has ended.</p>".to_string()
                } else {
                    format!(
                        "<p>Your subscription was canceled. Access continues until {}.</p>",
                        access_until.date()
                    )
                },
            ),
            Notification::PlanChanged {
                from_plan,
                to_plan,
                proration_cents,
                currency,
                ..
            } => {
                let adjustment = if *proration_cents > 0 {
                    format!(
                        "A prorated charge of {} applies.",
                        format_cents(*proration_cents, currency)
                    )
                } else if *proration_cents < 0 {
                    format!(
                        "A credit of {} was added to your account.",
                        format_cents(-*proration_cents, currency)
                    )
                } else {
                    String::new()
                };
                (
                    format!("Plan changed to {}", to_plan),
                    format!(
                        "<p>Your plan changed from <b>{}</b> to <b>{}</b>. {}</p>",
                        from_plan, to_plan, adjustment
                    ),
                )
            }
            Notification::PaymentSucceeded {
                amount_cents,
                currency,
                invoice_number,
                ..
            } => (
                "Payment received".to_string(),
                format!(
                    "<p>We received your payment of {}.{}</p>",
                    format_cents(*amount_cents, currency),
                    invoice_number
                        .as_ref()
                        .map(|n| format!(" Invoice {} is available in your billing history.", n))
                        .unwrap_or_default()
                ),
            ),
            Notification::PaymentFailed {
                amount_cents,
                currency,
                reason,
                grace_period_end,
                ..
            } => (
                "Payment failed".to_string(),
                format!(
                    "<p>Your payment of {} failed: {}.</p>{}",
                    format_cents(*amount_cents, currency),
                    reason,
                    grace_period_end
                        .map(|g| format!(
                            "<p>Please update your payment method before {} to keep access.</p>",
                            g.date()
                        ))
                        .unwrap_or_default()
                ),
            ),
            Notification::Suspended { .. } => (
                "Subscription suspended".to_string(),
                "<p>Your subscription was suspended after the grace period ended without payment.</p>"
                    .to_string(),
            ),
            Notification::Expired { .. } => (
                "Subscription expired".to_string(),
                "<p>Your subscription has expired.</p>".to_string(),
            ),
            Notification::Refunded {
                amount_cents,
                currency,
                reason,
                ..
            } => (
                "Refund issued".to_string(),
                format!(
                    "<p>A refund of {} was issued{}.</p>",
                    format_cents(*amount_cents, currency),
                    reason
                        .as_ref()
                        .map(|r| format!(" ({})", r))
                        .unwrap_or_default()
                ),
            ),
            Notification::AdminAlert {
                subject,
                detail,
                subscription_id,
                payment_id,
            } => (
                format!("[Billing alert] {}", subject),
                format!(
                    "<p>{}</p><p>subscription: {}<br/>payment: {}</p>",
                    detail,
                    subscription_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    payment_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string())
                ),
            ),
        };

        Some(RenderedEmail {
            to,
            subject,
            html: body,
        })
    }
}

async fn deliver(
    client: reqwest::Client,
    api_key: String,
    from: String,
    email: RenderedEmail,
) -> Result<(), reqwest::Error> {
    client
        .post(RESEND_API_URL)
        .bearer_auth(api_key)
        .json(&serde_json::json!({
            "from": from,
            "to": [email.to],
            "subject": email.subject,
            "html": email.html,
        }))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[async_trait]
impl NotificationSink for BillingEmailService {
    async fn send(&self, notification: &Notification) -> BillingResult<()> {
        let Some(email) = self.render(notification) else {
            tracing::debug!(
                kind = notification.kind(),
                "No recipient for billing notification, skipping"
            );
            return Ok(());
        };

        let Some(api_key) = self.config.api_key.clone() else {
            tracing::info!(
                kind = notification.kind(),
                to = %email.to,
                subject = %email.subject,
                "Email disabled, notification logged only"
            );
            return Ok(());
        };

        let client = self.client.clone();
        let from = self.config.from_address.clone();
        let kind = notification.kind();

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| BillingError::Internal(format!("No async runtime for email: {}", e)))?;
        handle.spawn(async move {
            let strategy = ExponentialBackoff::from_millis(250).map(jitter).take(3);
            let result = Retry::spawn(strategy, || {
                deliver(client.clone(), api_key.clone(), from.clone(), email.clone())
            })
            .await;

            match result {
                Ok(()) => tracing::info!(kind = kind, to = %email.to, "Billing email sent"),
                Err(e) => tracing::error!(
                    kind = kind,
                    to = %email.to,
                    error = %e,
                    "Failed to send billing email after retries"
                ),
            }
        });

        Ok(())
    }
}
