//! Payment gateway adapter
//!
//! `charge` is called at most once per logical charge attempt, always for a
//! payment that is already committed as PENDING. A decline is a normal response
//! (`successful == false`); a charge the gateway accepted but has not decided yet
//! comes back with `processing` set and is settled later by webhook. Transport and
//! API failures are [`BillingError::Gateway`] and are treated as a failed attempt
//! by the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stripe::{
    CreatePaymentIntent, Currency, CustomerId, PaymentIntent, PaymentIntentStatus,
    PaymentMethodId, StripeError,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::payments::Payment;
use crate::subscriptions::Subscription;

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub payment_id: Uuid,
    pub subscription_id: Uuid,
    pub campus_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub description: String,
}

impl ChargeRequest {
    pub fn for_payment(payment: &Payment, subscription: &Subscription) -> Self {
        Self {
            payment_id: payment.id,
            subscription_id: subscription.id,
            campus_id: subscription.campus_id,
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            customer_id: subscription.gateway_customer_id.clone(),
            payment_method_id: subscription.gateway_payment_method_id.clone(),
            description: format!(
                "{} charge for subscription {} ({} to {})",
                payment.kind.as_str(),
                subscription.id,
                payment.period_start.date(),
                payment.period_end.date()
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub successful: bool,
    /// Accepted without a verdict yet
    pub processing: bool,
    pub transaction_id: Option<String>,
    pub raw_response: Option<String>,
    pub error_message: Option<String>,
}

impl ChargeResponse {
    pub fn success(transaction_id: impl Into<String>) -> Self {
        Self {
            successful: true,
            transaction_id: Some(transaction_id.into()),
            ..Default::default()
        }
    }

    pub fn processing(transaction_id: impl Into<String>) -> Self {
        Self {
            processing: true,
            transaction_id: Some(transaction_id.into()),
            ..Default::default()
        }
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            successful: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeResponse>;

    fn name(&self) -> &'static str;
}

/// Stripe PaymentIntent gateway
///
/// The payment id is the idempotency key and is echoed in metadata, so a retried
/// request never double-charges and webhooks can be matched back to the payment.
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn currency(code: &str) -> BillingResult<Currency> {
        serde_json::from_value(serde_json::json!(code.to_lowercase())).map_err(|_| {
            BillingError::InvalidInput(format!("Unsupported currency: {}", code))
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeResponse> {
        let customer_id = match &request.customer_id {
            Some(id) => id.parse::<CustomerId>().map_err(|e| {
                BillingError::InvalidInput(format!("Invalid customer id: {}", e))
            })?,
            None => {
                return Ok(ChargeResponse::declined(
                    "No payment customer on file for this subscription",
                ))
            }
        };
        let payment_method = request
            .payment_method_id
            .as_deref()
            .map(|id| id.parse::<PaymentMethodId>())
            .transpose()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method: {}", e)))?;

        let mut metadata = HashMap::new();
        metadata.insert("payment_id".to_string(), request.payment_id.to_string());
        metadata.insert(
            "subscription_id".to_string(),
            request.subscription_id.to_string(),
        );
        metadata.insert("campus_id".to_string(), request.campus_id.to_string());

        let mut params = CreatePaymentIntent::new(
            request.amount_cents,
            Self::currency(&request.currency)?,
        );
        params.customer = Some(customer_id);
        params.payment_method = payment_method;
        params.confirm = Some(true);
        params.description = Some(request.description.as_str());
        params.metadata = Some(metadata);

        let client = self.stripe.idempotent(request.payment_id.to_string());

        match PaymentIntent::create(&client, params).await {
            Ok(intent) => {
                let raw_response = serde_json::to_string(&intent).ok();
                let transaction_id = Some(intent.id.to_string());
                match intent.status {
                    PaymentIntentStatus::Succeeded => Ok(ChargeResponse {
                        successful: true,
                        transaction_id,
                        raw_response,
                        ..Default::default()
                    }),
                    PaymentIntentStatus::Processing => {
                        tracing::info!(
                            payment_id = %request.payment_id,
                            intent_id = %intent.id,
                            "Stripe payment still processing, awaiting webhook"
                        );
                        Ok(ChargeResponse {
                            processing: true,
                            transaction_id,
                            raw_response,
                            ..Default::default()
                        })
                    }
                    status => {
                        let message = intent
                            .last_payment_error
                            .as_ref()
                            .and_then(|e| e.message.clone())
                            .unwrap_or_else(|| format!("Payment not completed ({:?})", status));
                        Ok(ChargeResponse {
                            transaction_id,
                            raw_response,
                            error_message: Some(message),
                            ..Default::default()
                        })
                    }
                }
            }
            // Card errors come back as API errors with a decline message
            Err(StripeError::Stripe(request_error)) if request_error.http_status == 402 => {
                Ok(ChargeResponse::declined(
                    request_error
                        .message
                        .unwrap_or_else(|| "Card declined".to_string()),
                ))
            }
            Err(e) => {
                tracing::error!(
                    payment_id = %request.payment_id,
                    error = %e,
                    "Stripe charge failed"
                );
                Err(BillingError::Gateway(e.to_string()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "stripe"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_mapping() {
        assert_eq!(StripeGateway::currency("USD").unwrap(), Currency::USD);
        assert_eq!(StripeGateway::currency("eur").unwrap(), Currency::EUR);
    }

    #[test]
    fn test_response_constructors() {
        let ok = ChargeResponse::success("pi_123");
        assert!(ok.successful);
        assert_eq!(ok.transaction_id.as_deref(), Some("pi_123"));

        let processing = ChargeResponse::processing("pi_456");
        assert!(processing.processing);
        assert!(!processing.successful);

        let declined = ChargeResponse::declined("insufficient_funds");
        assert!(!declined.successful);
        assert!(!declined.processing);
        assert_eq!(declined.error_message.as_deref(), Some("insufficient_funds"));
    }
}
