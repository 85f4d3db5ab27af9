//! Stripe client configuration

use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Configuration("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| {
            BillingError::Configuration("STRIPE_WEBHOOK_SECRET not set".to_string())
        })?;

        if secret_key.trim().is_empty() {
            return Err(BillingError::Configuration(
                "STRIPE_SECRET_KEY is empty".to_string(),
            ));
        }

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"***")
            .field("webhook_secret", &"***")
            .finish()
    }
}

/// Shared Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    /// Client whose requests carry `key` as the Stripe idempotency key
    pub fn idempotent(&self, key: impl Into<String>) -> stripe::Client {
        self.inner
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key.into()))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let config = StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_abc".to_string(),
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk_test_123"));
        assert!(!rendered.contains("whsec_abc"));
    }
}
