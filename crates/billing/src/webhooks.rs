//! Gateway webhook reconciliation
//!
//! Inbound notifications are verified, recorded in the webhook log under an
//! idempotency key, and applied to the matching payment through the same
//! settlement paths the scheduler uses. Exclusive processing rights come from
//! [`BillingStore::claim_webhook`](crate::store::BillingStore::claim_webhook);
//! settlement itself is idempotent, so a replayed event never double-applies.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stripe::{Event, EventObject, EventType};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::events::ActorType;
use crate::payments::{Payment, PaymentProcessor, SettleOutcome};
use crate::store::{WebhookClaim, WebhookClaimOutcome, WebhookProcessingResult};

type HmacSha256 = Hmac<Sha256>;

/// A `processing` claim older than this is assumed to belong to a dead worker
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

const REPLAY_BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayEventType {
    PaymentSuccess,
    PaymentFailed,
    PaymentRefunded,
}

impl GatewayEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayEventType::PaymentSuccess => "PAYMENT_SUCCESS",
            GatewayEventType::PaymentFailed => "PAYMENT_FAILED",
            GatewayEventType::PaymentRefunded => "PAYMENT_REFUNDED",
        }
    }
}

/// Gateway-neutral notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    /// Gateway-assigned event id, when the gateway provides one
    #[serde(default)]
    pub event_id: Option<String>,
    pub event_type: GatewayEventType,
    pub transaction_id: String,
    /// Local payment id echoed back from charge metadata
    #[serde(default)]
    pub payment_reference: Option<Uuid>,
    #[serde(default)]
    pub raw_data: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Cumulative refunded amount in cents
    #[serde(default)]
    pub refund_amount: Option<i64>,
    #[serde(default)]
    pub refund_reason: Option<String>,
}

impl GatewayEvent {
    /// Idempotency key: the gateway event id, else a digest of the event content
    pub fn event_key(&self) -> String {
        if let Some(id) = self.event_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.event_type.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.transaction_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.raw_data.as_deref().unwrap_or_default().as_bytes());
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    /// Translate a Stripe event into the gateway-neutral shape
    pub fn from_stripe_event(event: &Event) -> BillingResult<Self> {
        let raw_data = serde_json::to_string(&event.data.object).ok();
        let event_id = Some(event.id.to_string());

        let intent_event_type = match event.type_ {
            EventType::PaymentIntentSucceeded => Some(GatewayEventType::PaymentSuccess),
            EventType::PaymentIntentPaymentFailed => Some(GatewayEventType::PaymentFailed),
            _ => None,
        };

        match (intent_event_type, &event.data.object) {
            (Some(event_type), EventObject::PaymentIntent(intent)) => Ok(Self {
                event_id,
                event_type,
                transaction_id: intent.id.to_string(),
                payment_reference: payment_reference(intent.metadata.get("payment_id")),
                raw_data,
                error_message: intent
                    .last_payment_error
                    .as_ref()
                    .and_then(|e| e.message.clone()),
                refund_amount: None,
                refund_reason: None,
            }),
            (None, EventObject::Charge(charge))
                if matches!(event.type_, EventType::ChargeRefunded) =>
            {
                let transaction_id = charge
                    .payment_intent
                    .as_ref()
                    .map(|intent| intent.id().to_string())
                    .unwrap_or_else(|| charge.id.to_string());
                Ok(Self {
                    event_id,
                    event_type: GatewayEventType::PaymentRefunded,
                    transaction_id,
                    payment_reference: payment_reference(charge.metadata.get("payment_id")),
                    raw_data,
                    error_message: None,
                    refund_amount: Some(charge.amount_refunded),
                    refund_reason: None,
                })
            }
            _ => Err(BillingError::WebhookEventNotSupported(
                event.type_.to_string(),
            )),
        }
    }
}

fn payment_reference(value: Option<&String>) -> Option<Uuid> {
    value.and_then(|v| Uuid::parse_str(v).ok())
}

/// Check a `t=<unix>,v1=<hex>` signature header against `payload`.
///
/// The MAC is HMAC-SHA256 over `"{t}.{payload}"`. A `whsec_` prefix on the
/// secret is stripped before use.
pub fn verify_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now: OffsetDateTime,
    tolerance: Duration,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Webhook signature header has no timestamp");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Webhook signature header has no v1 signature");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let skew = (now.unix_timestamp() - timestamp).abs();
    if skew > tolerance.whole_seconds() {
        tracing::warn!(
            timestamp = timestamp,
            skew_secs = skew,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let verified = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&expected).is_ok()
    });

    if !verified {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// What handling one event did
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    /// Applied (or confirmed already applied) to the payment
    Processed(SettleOutcome),
    /// Already handled or being handled elsewhere
    Duplicate(WebhookProcessingResult),
    /// No local payment matches; recorded and never retried
    NotFound,
}

/// Summary of a replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub examined: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Applies gateway notifications to payments
#[derive(Clone)]
pub struct WebhookReconciler {
    ctx: BillingContext,
    payments: PaymentProcessor,
    signing_secret: Option<String>,
}

impl WebhookReconciler {
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            payments: PaymentProcessor::new(ctx.clone()),
            ctx,
            signing_secret: None,
        }
    }

    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    /// Verify a signed request body and turn it into a [`GatewayEvent`].
    ///
    /// Accepts both the gateway-neutral JSON shape and raw Stripe events.
    pub fn verify_event(&self, payload: &str, signature_header: &str) -> BillingResult<GatewayEvent> {
        let secret = self.signing_secret.as_deref().ok_or_else(|| {
            BillingError::Configuration("Webhook signing secret not configured".to_string())
        })?;
        verify_signature(
            secret,
            payload,
            signature_header,
            self.ctx.now(),
            Duration::seconds(self.ctx.config.webhook_tolerance_secs),
        )?;

        let value: serde_json::Value = serde_json::from_str(payload)?;
        if value.get("object").and_then(|o| o.as_str()) == Some("event") {
            let event: Event = serde_json::from_value(value)?;
            GatewayEvent::from_stripe_event(&event)
        } else {
            Ok(serde_json::from_value(value)?)
        }
    }

    /// Claim, apply and record one event
    pub async fn handle(&self, event: GatewayEvent) -> BillingResult<WebhookOutcome> {
        let event_key = event.event_key();
        let claim = WebhookClaim {
            event_key: event_key.clone(),
            event_type: event.event_type.as_str().to_string(),
            transaction_id: Some(event.transaction_id.clone()),
            payload: serde_json::to_value(&event)?,
            now: self.ctx.now(),
            max_attempts: self.ctx.config.webhook_max_attempts,
            stale_after: Duration::minutes(PROCESSING_TIMEOUT_MINUTES),
        };

        let record = match self.ctx.store.claim_webhook(claim).await? {
            WebhookClaimOutcome::Claimed(record) => record,
            WebhookClaimOutcome::Duplicate(existing) => {
                tracing::warn!(
                    event_key = %event_key,
                    event_type = event.event_type.as_str(),
                    processing_result = %existing.processing_result,
                    "Duplicate webhook event"
                );
                return Ok(WebhookOutcome::Duplicate(existing.processing_result));
            }
        };

        tracing::info!(
            event_key = %event_key,
            event_type = event.event_type.as_str(),
            transaction_id = %event.transaction_id,
            attempt = record.attempts,
            "Processing gateway webhook"
        );

        let result = self.apply(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(WebhookOutcome::NotFound) => (WebhookProcessingResult::NotFound, None),
            Ok(_) => (WebhookProcessingResult::Success, None),
            Err(e) => (WebhookProcessingResult::Error, Some(e.to_string())),
        };

        if let Err(e) = self
            .ctx
            .store
            .finish_webhook(&event_key, processing_result, error_message, self.ctx.now())
            .await
        {
            tracing::error!(
                event_key = %event_key,
                processing_result = %processing_result,
                error = %e,
                "Failed to record webhook result; event stays claimed until the processing timeout"
            );
        }

        result
    }

    async fn apply(&self, event: &GatewayEvent) -> BillingResult<WebhookOutcome> {
        let Some(payment) = self.find_payment(event).await? else {
            tracing::error!(
                transaction_id = %event.transaction_id,
                payment_reference = ?event.payment_reference,
                event_type = event.event_type.as_str(),
                "No payment matches webhook"
            );
            return Ok(WebhookOutcome::NotFound);
        };

        let outcome = match event.event_type {
            GatewayEventType::PaymentSuccess => {
                self.payments
                    .settle_success(
                        payment.id,
                        &event.transaction_id,
                        event.raw_data.clone(),
                        ActorType::Gateway,
                    )
                    .await?
            }
            GatewayEventType::PaymentFailed => {
                let reason = event
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Payment failed".to_string());
                self.payments
                    .settle_failure(
                        payment.id,
                        &reason,
                        Some(event.transaction_id.clone()),
                        event.raw_data.clone(),
                        ActorType::Gateway,
                    )
                    .await?
            }
            GatewayEventType::PaymentRefunded => {
                let amount = event.refund_amount.ok_or_else(|| {
                    BillingError::InvalidInput("Refund event without refundAmount".to_string())
                })?;
                self.payments
                    .record_refund(payment.id, amount, event.refund_reason.clone(), ActorType::Gateway)
                    .await?
            }
        };

        Ok(WebhookOutcome::Processed(outcome))
    }

    async fn find_payment(&self, event: &GatewayEvent) -> BillingResult<Option<Payment>> {
        if let Some(payment) = self
            .ctx
            .store
            .find_payment_by_transaction(&event.transaction_id)
            .await?
        {
            return Ok(Some(payment));
        }
        match event.payment_reference {
            Some(payment_id) => self.ctx.store.get_payment(payment_id).await,
            None => Ok(None),
        }
    }

    /// Re-run events that failed or whose worker died mid-processing.
    ///
    /// `not_found` events are never replayed.
    pub async fn replay_failed(&self) -> BillingResult<ReplayReport> {
        let now = self.ctx.now();
        let stale_before = now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES);
        let max_attempts = self.ctx.config.webhook_max_attempts;

        let mut candidates = self
            .ctx
            .store
            .list_webhooks(Some(WebhookProcessingResult::Error), REPLAY_BATCH_SIZE)
            .await?;
        candidates.extend(
            self.ctx
                .store
                .list_webhooks(Some(WebhookProcessingResult::Processing), REPLAY_BATCH_SIZE)
                .await?
                .into_iter()
                .filter(|r| r.processing_started_at.is_none_or(|s| s <= stale_before)),
        );

        let mut report = ReplayReport::default();
        for record in candidates {
            report.examined += 1;

            if record.processing_result == WebhookProcessingResult::Error
                && record.attempts >= max_attempts
            {
                report.skipped += 1;
                continue;
            }

            let event: GatewayEvent = match serde_json::from_value(record.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        event_key = %record.event_key,
                        error = %e,
                        "Stored webhook payload is unreadable, skipping replay"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            match self.handle(event).await {
                Ok(WebhookOutcome::Duplicate(_)) => report.skipped += 1,
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    tracing::warn!(
                        event_key = %record.event_key,
                        attempts = record.attempts + 1,
                        error = %e,
                        "Webhook replay failed"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "Webhook replay pass complete"
            );
        }
        Ok(report)
    }

    /// Delete finished webhook records older than `retention`
    pub async fn cleanup(&self, retention: Duration) -> BillingResult<u64> {
        let deleted = self
            .ctx
            .store
            .cleanup_webhooks(self.ctx.now() - retention)
            .await?;
        tracing::info!(deleted = deleted, "Cleaned up old webhook events");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::PaymentStatus;
    use crate::store::PaymentFilter;
    use crate::subscriptions::SubscriptionStatus;
    use crate::test_support::harness;

    fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn stripe_intent(id: &str, status: &str, payment_id: Option<Uuid>) -> serde_json::Value {
        let mut metadata = serde_json::Map::new();
        if let Some(payment_id) = payment_id {
            metadata.insert("payment_id".to_string(), payment_id.to_string().into());
        }
        let received = if status == "succeeded" { 10_000 } else { 0 };
        serde_json::json!({
            "id": id,
            "object": "payment_intent",
            "amount": 10_000,
            "amount_capturable": 0,
            "amount_received": received,
            "capture_method": "automatic",
            "confirmation_method": "automatic",
            "created": 1_767_225_600,
            "currency": "usd",
            "livemode": false,
            "metadata": metadata,
            "payment_method_types": ["card"],
            "status": status,
        })
    }

    fn stripe_charge(amount_refunded: i64, intent: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": "ch_1",
            "object": "charge",
            "amount": 10_000,
            "amount_captured": 10_000,
            "amount_refunded": amount_refunded,
            "billing_details": {},
            "captured": true,
            "created": 1_767_225_600,
            "currency": "usd",
            "disputed": false,
            "livemode": false,
            "metadata": {},
            "paid": true,
            "payment_intent": intent,
            "refunded": amount_refunded >= 10_000,
            "refunds": {
                "object": "list",
                "data": [],
                "has_more": false,
                "url": "/v1/charges/ch_1/refunds"
            },
            "status": "succeeded",
        })
    }

    fn stripe_event(id: &str, event_type: &str, object: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "object": "event",
            "type": event_type,
            "api_version": "2023-10-16",
            "created": 1_767_225_600,
            "livemode": false,
            "pending_webhooks": 1,
            "request": null,
            "data": { "object": object },
        })
    }

    fn parse_stripe(value: serde_json::Value) -> BillingResult<GatewayEvent> {
        let event: Event = serde_json::from_value(value).unwrap();
        GatewayEvent::from_stripe_event(&event)
    }

    fn success_event(event_id: &str, payment: &Payment, tx: &str) -> GatewayEvent {
        GatewayEvent {
            event_id: Some(event_id.to_string()),
            event_type: GatewayEventType::PaymentSuccess,
            transaction_id: tx.to_string(),
            payment_reference: Some(payment.id),
            raw_data: None,
            error_message: None,
            refund_amount: None,
            refund_reason: None,
        }
    }

    #[test]
    fn test_signature_roundtrip_and_tolerance() {
        let now = OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap();
        let payload = r#"{"eventType":"PAYMENT_SUCCESS","transactionId":"tx-1"}"#;
        let header = sign("secret", now.unix_timestamp(), payload);

        assert!(verify_signature("whsec_secret", payload, &header, now, Duration::minutes(5)).is_ok());
        assert!(matches!(
            verify_signature("other", payload, &header, now, Duration::minutes(5)),
            Err(BillingError::WebhookSignatureInvalid)
        ));
        assert!(matches!(
            verify_signature("secret", payload, &header, now + Duration::minutes(6), Duration::minutes(5)),
            Err(BillingError::WebhookSignatureInvalid)
        ));
        assert!(verify_signature("secret", payload, "v1=abcd", now, Duration::minutes(5)).is_err());
    }

    #[test]
    fn test_event_key_prefers_gateway_id() {
        let mut event = GatewayEvent {
            event_id: Some("evt_1".to_string()),
            event_type: GatewayEventType::PaymentFailed,
            transaction_id: "tx-9".to_string(),
            payment_reference: None,
            raw_data: Some("{}".to_string()),
            error_message: None,
            refund_amount: None,
            refund_reason: None,
        };
        assert_eq!(event.event_key(), "evt_1");

        event.event_id = None;
        let digest = event.event_key();
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest, event.clone().event_key());

        event.raw_data = Some(r#"{"retry":1}"#.to_string());
        assert_ne!(event.event_key(), digest);
    }

    #[test]
    fn test_generic_event_json_shape() {
        let event: GatewayEvent = serde_json::from_str(
            r#"{"eventType":"PAYMENT_REFUNDED","transactionId":"tx-7","refundAmount":1500,"refundReason":"duplicate"}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, GatewayEventType::PaymentRefunded);
        assert_eq!(event.refund_amount, Some(1500));
        assert_eq!(event.payment_reference, None);
    }

    #[tokio::test]
    async fn test_duplicate_success_yields_one_invoice() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        let payment = h.pending_renewal(&sub).await;
        let reconciler = WebhookReconciler::new(h.ctx.clone());

        let first = reconciler
            .handle(success_event("evt_a", &payment, "pi_renewal"))
            .await
            .unwrap();
        assert!(matches!(first, WebhookOutcome::Processed(SettleOutcome::Applied(_))));

        // Same event delivered twice
        let replay = reconciler
            .handle(success_event("evt_a", &payment, "pi_renewal"))
            .await
            .unwrap();
        assert!(matches!(
            replay,
            WebhookOutcome::Duplicate(WebhookProcessingResult::Success)
        ));

        // A distinct event for the same charge
        let second = reconciler
            .handle(success_event("evt_b", &payment, "pi_renewal"))
            .await
            .unwrap();
        assert!(matches!(
            second,
            WebhookOutcome::Processed(SettleOutcome::AlreadyApplied(_))
        ));

        let completed = h
            .ctx
            .store
            .list_payments(&PaymentFilter {
                subscription_id: Some(sub.id),
                statuses: vec![PaymentStatus::Completed],
                ..Default::default()
            })
            .await
            .unwrap();
        // initial charge + renewal
        assert_eq!(completed.len(), 2);
        assert_eq!(h.ctx.store.list_invoices(sub.campus_id).await.unwrap().len(), 2);
        assert_eq!(
            h.reload(sub.id).await.end_date,
            plan.billing_period.advance(sub.end_date)
        );
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_recorded_not_found() {
        let h = harness();
        let reconciler = WebhookReconciler::new(h.ctx.clone());
        let event = GatewayEvent {
            event_id: Some("evt_unknown".to_string()),
            event_type: GatewayEventType::PaymentSuccess,
            transaction_id: "pi_nobody".to_string(),
            payment_reference: None,
            raw_data: None,
            error_message: None,
            refund_amount: None,
            refund_reason: None,
        };

        let outcome = reconciler.handle(event).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::NotFound));

        let record = h.ctx.store.get_webhook("evt_unknown").await.unwrap().unwrap();
        assert_eq!(record.processing_result, WebhookProcessingResult::NotFound);

        let report = reconciler.replay_failed().await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_failed_webhook_moves_subscription_past_due() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        let payment = h.pending_renewal(&sub).await;
        let reconciler = WebhookReconciler::new(h.ctx.clone());

        let event = GatewayEvent {
            event_type: GatewayEventType::PaymentFailed,
            error_message: Some("card_declined".to_string()),
            ..success_event("evt_fail", &payment, "pi_declined")
        };
        reconciler.handle(event).await.unwrap();

        let failed = h.payments.get_payment(payment.id).await.unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("card_declined"));
        assert_eq!(h.reload(sub.id).await.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_early_refund_is_replayed_after_success() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        let payment = h.pending_renewal(&sub).await;
        let reconciler = WebhookReconciler::new(h.ctx.clone());

        // Refund arrives while the payment is still pending
        let refund = GatewayEvent {
            event_type: GatewayEventType::PaymentRefunded,
            refund_amount: Some(4_000),
            refund_reason: Some("requested_by_customer".to_string()),
            ..success_event("evt_refund", &payment, "pi_out_of_order")
        };
        assert!(reconciler.handle(refund).await.is_err());
        let record = h.ctx.store.get_webhook("evt_refund").await.unwrap().unwrap();
        assert_eq!(record.processing_result, WebhookProcessingResult::Error);
        assert_eq!(record.attempts, 1);

        reconciler
            .handle(success_event("evt_paid", &payment, "pi_out_of_order"))
            .await
            .unwrap();

        let report = reconciler.replay_failed().await.unwrap();
        assert_eq!(report.succeeded, 1);

        let refunded = h.payments.get_payment(payment.id).await.unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(refunded.refund_amount_cents, Some(4_000));
        assert_eq!(h.reload(sub.id).await.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_replay_stops_at_max_attempts() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        let payment = h.pending_renewal(&sub).await;
        let reconciler = WebhookReconciler::new(h.ctx.clone());

        let refund = GatewayEvent {
            event_type: GatewayEventType::PaymentRefunded,
            refund_amount: Some(1_000),
            ..success_event("evt_stuck", &payment, "pi_stuck")
        };
        let _ = reconciler.handle(refund).await;

        let max = h.ctx.config.webhook_max_attempts;
        for _ in 1..max {
            let report = reconciler.replay_failed().await.unwrap();
            assert_eq!(report.failed, 1);
        }
        let record = h.ctx.store.get_webhook("evt_stuck").await.unwrap().unwrap();
        assert_eq!(record.attempts, max);

        let report = reconciler.replay_failed().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_stripe_intent_succeeded_translation() {
        let payment_id = Uuid::new_v4();
        let event = parse_stripe(stripe_event(
            "evt_ok",
            "payment_intent.succeeded",
            stripe_intent("pi_ok", "succeeded", Some(payment_id)),
        ))
        .unwrap();

        assert_eq!(event.event_type, GatewayEventType::PaymentSuccess);
        assert_eq!(event.event_id.as_deref(), Some("evt_ok"));
        assert_eq!(event.transaction_id, "pi_ok");
        assert_eq!(event.payment_reference, Some(payment_id));
        assert_eq!(event.event_key(), "evt_ok");
        assert!(event.raw_data.is_some());
        assert_eq!(event.refund_amount, None);
    }

    #[test]
    fn test_stripe_intent_failed_carries_decline_message() {
        let mut intent = stripe_intent("pi_bad", "requires_payment_method", None);
        intent["last_payment_error"] = serde_json::json!({
            "type": "card_error",
            "message": "Your card was declined.",
        });
        let event = parse_stripe(stripe_event("evt_bad", "payment_intent.payment_failed", intent))
            .unwrap();

        assert_eq!(event.event_type, GatewayEventType::PaymentFailed);
        assert_eq!(event.transaction_id, "pi_bad");
        assert_eq!(event.payment_reference, None);
        assert_eq!(event.error_message.as_deref(), Some("Your card was declined."));
    }

    #[test]
    fn test_stripe_charge_refunded_translation() {
        let event = parse_stripe(stripe_event(
            "evt_refund",
            "charge.refunded",
            stripe_charge(2_500, Some("pi_paid")),
        ))
        .unwrap();
        assert_eq!(event.event_type, GatewayEventType::PaymentRefunded);
        assert_eq!(event.transaction_id, "pi_paid");
        assert_eq!(event.refund_amount, Some(2_500));

        // Without an intent the charge id is the transaction
        let event = parse_stripe(stripe_event(
            "evt_refund_2",
            "charge.refunded",
            stripe_charge(10_000, None),
        ))
        .unwrap();
        assert_eq!(event.transaction_id, "ch_1");
        assert_eq!(event.refund_amount, Some(10_000));
    }

    #[test]
    fn test_unhandled_stripe_event_is_rejected() {
        let err = parse_stripe(stripe_event(
            "evt_created",
            "payment_intent.created",
            stripe_intent("pi_new", "requires_confirmation", None),
        ))
        .unwrap_err();
        assert!(matches!(err, BillingError::WebhookEventNotSupported(_)));
        assert_eq!(err.code(), "WEBHOOK_EVENT_NOT_SUPPORTED");
    }

    #[tokio::test]
    async fn test_signed_stripe_event_settles_by_metadata_reference() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        let payment = h.pending_renewal(&sub).await;

        let reconciler = WebhookReconciler::new(h.ctx.clone()).with_signing_secret("whsec_stripe");
        let payload = stripe_event(
            "evt_meta",
            "payment_intent.succeeded",
            stripe_intent("pi_unknown_locally", "succeeded", Some(payment.id)),
        )
        .to_string();
        let header = sign("stripe", h.now().unix_timestamp(), &payload);

        let event = reconciler.verify_event(&payload, &header).unwrap();
        assert_eq!(event.payment_reference, Some(payment.id));
        let outcome = reconciler.handle(event).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed(SettleOutcome::Applied(_))));

        let settled = h.payments.get_payment(payment.id).await.unwrap();
        assert_eq!(settled.status, PaymentStatus::Completed);
        assert_eq!(settled.transaction_id.as_deref(), Some("pi_unknown_locally"));
    }

    #[tokio::test]
    async fn test_verify_event_requires_secret() {
        let h = harness();
        let reconciler = WebhookReconciler::new(h.ctx.clone());
        assert!(matches!(
            reconciler.verify_event("{}", "t=1,v1=00"),
            Err(BillingError::Configuration(_))
        ));

        let reconciler = reconciler.with_signing_secret("whsec_topsecret");
        let payload = r#"{"eventType":"PAYMENT_FAILED","transactionId":"pi_1","errorMessage":"expired_card"}"#;
        let header = sign("topsecret", h.now().unix_timestamp(), payload);
        let event = reconciler.verify_event(payload, &header).unwrap();
        assert_eq!(event.event_type, GatewayEventType::PaymentFailed);
        assert_eq!(event.error_message.as_deref(), Some("expired_card"));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_and_in_flight() {
        let h = harness();
        let reconciler = WebhookReconciler::new(h.ctx.clone());
        let event = GatewayEvent {
            event_id: Some("evt_old".to_string()),
            event_type: GatewayEventType::PaymentSuccess,
            transaction_id: "pi_gone".to_string(),
            payment_reference: None,
            raw_data: None,
            error_message: None,
            refund_amount: None,
            refund_reason: None,
        };
        reconciler.handle(event).await.unwrap();

        assert_eq!(reconciler.cleanup(Duration::days(30)).await.unwrap(), 0);
        h.clock.advance(Duration::days(31));
        assert_eq!(reconciler.cleanup(Duration::days(30)).await.unwrap(), 1);
        assert!(h.ctx.store.get_webhook("evt_old").await.unwrap().is_none());
    }
}
