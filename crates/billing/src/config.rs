//! Billing engine configuration

use time::Duration;

use crate::error::{BillingError, BillingResult};

/// Tunables for the subscription lifecycle and the sweeps that drive it
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Days a PAST_DUE subscription keeps access before suspension
    pub grace_period_days: i64,
    /// Maximum number of scheduled charge retries inside the grace window
    pub max_payment_retries: u32,
    /// First retry delay; each later retry doubles it
    pub retry_base_delay_hours: i64,
    /// Age after which a PENDING payment raises an admin alert
    pub stale_pending_minutes: i64,
    /// Days a SUSPENDED subscription is kept before it expires
    pub suspended_retention_days: i64,
    /// Tax rate applied to every charge, in basis points
    pub tax_rate_bps: u32,
    /// TTL for cached catalog and subscription-by-campus lookups
    pub cache_ttl_secs: u64,
    /// Redis URL for the shared cache (in-memory cache when unset)
    pub redis_url: Option<String>,
    /// Recipient for operational alerts
    pub admin_alert_email: Option<String>,
    /// Allowed clock skew for signed webhooks
    pub webhook_tolerance_secs: i64,
    /// Replays attempted for a failed webhook before it is left for manual review
    pub webhook_max_attempts: i32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 7,
            max_payment_retries: 3,
            retry_base_delay_hours: 24,
            stale_pending_minutes: 60,
            suspended_retention_days: 30,
            tax_rate_bps: 0,
            cache_ttl_secs: 300,
            redis_url: None,
            admin_alert_email: None,
            webhook_tolerance_secs: 300,
            webhook_max_attempts: 5,
        }
    }
}

impl BillingConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        Ok(Self {
            grace_period_days: env_parse("BILLING_GRACE_PERIOD_DAYS", defaults.grace_period_days)?,
            max_payment_retries: env_parse(
                "BILLING_MAX_PAYMENT_RETRIES",
                defaults.max_payment_retries,
            )?,
            retry_base_delay_hours: env_parse(
                "BILLING_RETRY_BASE_DELAY_HOURS",
                defaults.retry_base_delay_hours,
            )?,
            stale_pending_minutes: env_parse(
                "BILLING_STALE_PENDING_MINUTES",
                defaults.stale_pending_minutes,
            )?,
            suspended_retention_days: env_parse(
                "BILLING_SUSPENDED_RETENTION_DAYS",
                defaults.suspended_retention_days,
            )?,
            tax_rate_bps: env_parse("BILLING_TAX_RATE_BPS", defaults.tax_rate_bps)?,
            cache_ttl_secs: env_parse("BILLING_CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            admin_alert_email: std::env::var("BILLING_ADMIN_EMAIL")
                .ok()
                .filter(|v| !v.is_empty()),
            webhook_tolerance_secs: env_parse(
                "BILLING_WEBHOOK_TOLERANCE_SECS",
                defaults.webhook_tolerance_secs,
            )?,
            webhook_max_attempts: env_parse(
                "BILLING_WEBHOOK_MAX_ATTEMPTS",
                defaults.webhook_max_attempts,
            )?,
        }
        .validated()?)
    }

    fn validated(self) -> BillingResult<Self> {
        if self.grace_period_days <= 0 {
            return Err(BillingError::Configuration(
                "BILLING_GRACE_PERIOD_DAYS must be positive".to_string(),
            ));
        }
        if self.retry_base_delay_hours <= 0 {
            return Err(BillingError::Configuration(
                "BILLING_RETRY_BASE_DELAY_HOURS must be positive".to_string(),
            ));
        }
        if self.tax_rate_bps > 10_000 {
            return Err(BillingError::Configuration(
                "BILLING_TAX_RATE_BPS must not exceed 10000".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::days(self.grace_period_days)
    }

    pub fn stale_pending_after(&self) -> Duration {
        Duration::minutes(self.stale_pending_minutes)
    }

    pub fn suspended_retention(&self) -> Duration {
        Duration::days(self.suspended_retention_days)
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            BillingError::Configuration(format!("Invalid value for environment variable {}", name))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.grace_period(), Duration::days(7));
        assert_eq!(config.max_payment_retries, 3);
        assert_eq!(config.stale_pending_after(), Duration::minutes(60));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_validation_rejects_excessive_tax() {
        let config = BillingConfig {
            tax_rate_bps: 20_000,
            ..Default::default()
        };
        assert!(matches!(
            config.validated(),
            Err(BillingError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_grace() {
        let config = BillingConfig {
            grace_period_days: 0,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }
}
