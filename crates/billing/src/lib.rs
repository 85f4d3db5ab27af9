// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries detail strings and ids
#![allow(clippy::too_many_arguments)] // Settlement calls pass gateway payload pieces
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! EduBill Billing Engine
//!
//! Subscription lifecycle and recurring billing for campuses.
//!
//! ## Features
//!
//! - **Subscriptions**: Create, update, cancel, change plan with proration
//! - **Scheduler**: Renewals, retries inside the grace window, suspension and expiry
//! - **Payments**: Gateway charges with idempotent settlement and refunds
//! - **Webhooks**: Signed gateway callbacks with an audit log and replay
//! - **Invoices**: One invoice per completed payment, rendered on demand
//! - **Usage**: Per-plan quotas on schools, users, appointments and storage
//! - **Analytics**: Campus totals and platform statistics
//! - **Email Notifications**: Welcome, payment failed, suspension, refund, alerts

pub mod access;
pub mod analytics;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod email;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod invoices;
pub mod notifications;
pub mod payments;
pub mod plans;
pub mod proration;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod subscriptions;
pub mod tax;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod test_support;

// Access
pub use access::{
    authorize, AccessValidator, Capability, MembershipAccessValidator, Principal, Role,
};

// Analytics
pub use analytics::{AnalyticsService, CampusAnalytics, PaymentCounts, PlatformStats};

// Cache
pub use cache::{BillingCache, FillToken};

// Client
pub use client::{StripeClient, StripeConfig};

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::BillingConfig;

// Context
pub use context::BillingContext;

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use events::{Actor, ActorType, BillingEvent, BillingEventBuilder, BillingEventType};

// Gateway
pub use gateway::{ChargeRequest, ChargeResponse, PaymentGateway, StripeGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{
    Invoice, InvoiceDocument, InvoiceGenerator, InvoiceService, TextInvoiceGenerator,
};

// Notifications
pub use notifications::{LogSink, Notification, NotificationSink, Notifier};

// Payments
pub use payments::{
    ChargeOutcome, Payment, PaymentKind, PaymentMethod, PaymentProcessor, PaymentStatus,
    SettleOutcome,
};

// Plans
pub use plans::{BillingPeriod, NewPlan, Plan, PlanCatalog, PlanQuotas, PlanUpdate};

// Proration
pub use proration::{calculate_proration, ProratedAmount};

// Scheduler
pub use scheduler::{BillingOutcome, BillingScheduler, RetryPolicy, SweepReport};

// Store
pub use store::{
    BillingStore, Changeset, InMemoryBillingStore, PaymentFilter, PgBillingStore,
    SubscriptionFilter, WebhookEventRecord, WebhookProcessingResult,
};

// Subscriptions
pub use subscriptions::{
    BillingContact, CancelRequest, CreateSubscriptionRequest, PendingResolution,
    PlanChangeResult, Subscription, SubscriptionService, SubscriptionStatus,
    UpdateSubscriptionRequest, UsageCounters,
};

// Tax
pub use tax::{ChargeAmount, TaxBreakdown};

// Usage
pub use usage::{QuotaUsage, UsageResource, UsageService};

// Webhooks
pub use webhooks::{GatewayEvent, GatewayEventType, ReplayReport, WebhookOutcome, WebhookReconciler};

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

const DEFAULT_INVOICE_ISSUER: &str = "EduBill";
const MAX_PAYMENT_PAGE: i64 = 200;

/// Main billing service: the authorised entry point for inbound calls.
///
/// Every campus-scoped call checks the principal's capability and campus access
/// before touching the engine. The scheduler and webhook reconciler are exposed
/// for the worker and the HTTP layer; they act as the system, not a principal.
pub struct BillingService {
    pub ctx: BillingContext,
    pub subscriptions: SubscriptionService,
    pub payments: PaymentProcessor,
    pub plans: PlanCatalog,
    pub invoices: InvoiceService,
    pub usage: UsageService,
    pub analytics: AnalyticsService,
    pub scheduler: BillingScheduler,
    pub webhooks: WebhookReconciler,
    access: Arc<dyn AccessValidator>,
}

impl BillingService {
    /// Create a billing service over explicit dependencies
    pub fn new(ctx: BillingContext, access: Arc<dyn AccessValidator>) -> Self {
        Self {
            subscriptions: SubscriptionService::new(ctx.clone()),
            payments: PaymentProcessor::new(ctx.clone()),
            plans: PlanCatalog::new(ctx.clone()),
            invoices: InvoiceService::new(ctx.clone()),
            usage: UsageService::new(ctx.clone()),
            analytics: AnalyticsService::new(ctx.clone()),
            scheduler: BillingScheduler::new(ctx.clone()),
            webhooks: WebhookReconciler::new(ctx.clone()),
            access,
            ctx,
        }
    }

    /// Create a billing service from environment variables
    pub async fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();

        let cache = match &config.redis_url {
            Some(url) => match BillingCache::redis(url, config.cache_ttl_secs).await {
                Ok(cache) => cache,
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable, using in-memory billing cache");
                    BillingCache::in_memory(config.cache_ttl_secs)
                }
            },
            None => BillingCache::in_memory(config.cache_ttl_secs),
        };

        let email = EmailConfig::from_env();
        let notifier = if email.is_enabled() {
            Notifier::new(Arc::new(BillingEmailService::new(email)))
        } else {
            tracing::warn!("RESEND_API_KEY not set, billing notifications will only be logged");
            Notifier::logging()
        };

        let ctx = BillingContext {
            store: Arc::new(PgBillingStore::new(pool)),
            gateway: Arc::new(StripeGateway::new(stripe)),
            invoices: Arc::new(TextInvoiceGenerator::new(
                std::env::var("BILLING_INVOICE_ISSUER")
                    .unwrap_or_else(|_| DEFAULT_INVOICE_ISSUER.to_string()),
            )),
            notifier,
            cache,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
        };

        let mut service = Self::new(ctx, Arc::new(MembershipAccessValidator));
        service.webhooks = service.webhooks.with_signing_secret(webhook_secret);
        Ok(service)
    }

    async fn authorize(
        &self,
        principal: &Principal,
        campus_id: Uuid,
        capability: Capability,
    ) -> BillingResult<()> {
        authorize(self.access.as_ref(), principal, campus_id, capability).await
    }

    async fn authorized_subscription(
        &self,
        principal: &Principal,
        subscription_id: Uuid,
        capability: Capability,
    ) -> BillingResult<Subscription> {
        principal.require(capability)?;
        let subscription = self.subscriptions.get_subscription(subscription_id).await?;
        self.authorize(principal, subscription.campus_id, capability)
            .await?;
        Ok(subscription)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub async fn create_subscription(
        &self,
        principal: &Principal,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        self.authorize(principal, request.campus_id, Capability::ManageSubscription)
            .await?;
        self.subscriptions.create(request, principal.actor()).await
    }

    pub async fn get_campus_subscription(
        &self,
        principal: &Principal,
        campus_id: Uuid,
    ) -> BillingResult<Subscription> {
        self.authorize(principal, campus_id, Capability::ViewBilling)
            .await?;
        self.subscriptions.get_for_campus(campus_id).await
    }

    pub async fn update_subscription(
        &self,
        principal: &Principal,
        subscription_id: Uuid,
        request: UpdateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        self.authorized_subscription(principal, subscription_id, Capability::ManageSubscription)
            .await?;
        self.subscriptions
            .update(subscription_id, request, principal.actor())
            .await
    }

    pub async fn cancel_subscription(
        &self,
        principal: &Principal,
        subscription_id: Uuid,
        request: CancelRequest,
    ) -> BillingResult<Subscription> {
        self.authorized_subscription(principal, subscription_id, Capability::ManageSubscription)
            .await?;
        self.subscriptions
            .cancel(subscription_id, request, principal.actor())
            .await
    }

    pub async fn change_plan(
        &self,
        principal: &Principal,
        subscription_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<PlanChangeResult> {
        self.authorized_subscription(principal, subscription_id, Capability::ManageSubscription)
            .await?;
        self.subscriptions
            .change_plan(subscription_id, new_plan_id, principal.actor())
            .await
    }

    pub async fn resolve_pending(
        &self,
        principal: &Principal,
        subscription_id: Uuid,
        resolution: PendingResolution,
    ) -> BillingResult<Subscription> {
        self.authorized_subscription(principal, subscription_id, Capability::ResolvePending)
            .await?;
        self.subscriptions
            .resolve_pending(subscription_id, resolution, principal.actor())
            .await
    }

    pub async fn subscription_history(
        &self,
        principal: &Principal,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        self.authorized_subscription(principal, subscription_id, Capability::ViewBilling)
            .await?;
        self.subscriptions.history(subscription_id, limit).await
    }

    /// Access gate for other services; no principal needed
    pub async fn is_campus_subscribed(&self, campus_id: Uuid) -> BillingResult<bool> {
        self.ctx.store.is_campus_subscribed(campus_id).await
    }

    // =========================================================================
    // Invoices and payments
    // =========================================================================

    pub async fn list_invoices(
        &self,
        principal: &Principal,
        campus_id: Uuid,
    ) -> BillingResult<Vec<Invoice>> {
        self.authorize(principal, campus_id, Capability::ViewInvoices)
            .await?;
        self.invoices.list_invoices(campus_id).await
    }

    pub async fn download_invoice(
        &self,
        principal: &Principal,
        invoice_id: Uuid,
    ) -> BillingResult<InvoiceDocument> {
        principal.require(Capability::ViewInvoices)?;
        let invoice = self.invoices.get_invoice(invoice_id).await?;
        self.authorize(principal, invoice.campus_id, Capability::ViewInvoices)
            .await?;
        self.invoices.download_invoice(invoice_id).await
    }

    pub async fn list_payments(
        &self,
        principal: &Principal,
        campus_id: Uuid,
        statuses: Vec<PaymentStatus>,
        limit: i64,
    ) -> BillingResult<Vec<Payment>> {
        self.authorize(principal, campus_id, Capability::ViewPayments)
            .await?;
        self.payments
            .list_payments(&PaymentFilter {
                campus_id: Some(campus_id),
                statuses,
                limit: Some(limit.clamp(1, MAX_PAYMENT_PAGE)),
                ..Default::default()
            })
            .await
    }

    // =========================================================================
    // Usage and analytics
    // =========================================================================

    pub async fn report_usage(
        &self,
        principal: &Principal,
        campus_id: Uuid,
        resource: UsageResource,
        delta: i64,
    ) -> BillingResult<UsageCounters> {
        self.authorize(principal, campus_id, Capability::ReportUsage)
            .await?;
        self.usage
            .adjust_usage(campus_id, resource, delta, principal.actor())
            .await
    }

    pub async fn campus_analytics(
        &self,
        principal: &Principal,
        campus_id: Uuid,
    ) -> BillingResult<CampusAnalytics> {
        self.authorize(principal, campus_id, Capability::ViewAnalytics)
            .await?;
        self.analytics.campus_analytics(campus_id).await
    }

    pub async fn platform_stats(&self, principal: &Principal) -> BillingResult<PlatformStats> {
        principal.require(Capability::ViewPlatformStats)?;
        self.analytics.platform_stats().await
    }

    // =========================================================================
    // Plans
    // =========================================================================

    /// Visible plans for everyone; hidden and retired plans need `ManagePlans`
    pub async fn list_plans(
        &self,
        principal: &Principal,
        include_hidden: bool,
    ) -> BillingResult<Vec<Plan>> {
        if include_hidden {
            principal.require(Capability::ManagePlans)?;
        }
        self.plans.list_plans(include_hidden).await
    }

    pub async fn create_plan(&self, principal: &Principal, request: NewPlan) -> BillingResult<Plan> {
        principal.require(Capability::ManagePlans)?;
        let plan = self.plans.create_plan(request).await?;
        tracing::info!(
            plan_id = %plan.id,
            user_id = %principal.user_id,
            "Plan created"
        );
        Ok(plan)
    }

    pub async fn update_plan(
        &self,
        principal: &Principal,
        plan_id: Uuid,
        update: PlanUpdate,
    ) -> BillingResult<Plan> {
        principal.require(Capability::ManagePlans)?;
        self.plans.update_plan(plan_id, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, monthly_plan};

    fn service(h: &crate::test_support::Harness) -> BillingService {
        BillingService::new(h.ctx.clone(), Arc::new(MembershipAccessValidator))
    }

    fn campus_admin(campus_id: Uuid) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            role: Role::CampusAdmin,
            campus_ids: vec![campus_id],
        }
    }

    #[tokio::test]
    async fn test_campus_admin_manages_own_campus_only() {
        let h = harness();
        let billing = service(&h);
        let plan = h.plan(10_000, 0).await;
        let campus = Uuid::new_v4();
        let admin = campus_admin(campus);

        let sub = billing
            .create_subscription(&admin, h.create_request(campus, plan.id))
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);

        let other = campus_admin(Uuid::new_v4());
        let denied = billing
            .cancel_subscription(&other, sub.id, CancelRequest::default())
            .await;
        assert!(matches!(denied, Err(BillingError::Forbidden(_))));
        assert_eq!(h.reload(sub.id).await.status, SubscriptionStatus::Active);

        let invoices = billing.list_invoices(&admin, campus).await.unwrap();
        assert_eq!(invoices.len(), 1);
        assert!(billing.download_invoice(&other, invoices[0].id).await.is_err());
        assert!(billing.download_invoice(&admin, invoices[0].id).await.is_ok());
    }

    #[tokio::test]
    async fn test_plan_management_requires_platform_admin() {
        let h = harness();
        let billing = service(&h);
        let admin = campus_admin(Uuid::new_v4());
        assert!(matches!(
            billing.create_plan(&admin, monthly_plan("Nope", 1_000)).await,
            Err(BillingError::Forbidden(_))
        ));
        assert!(billing.list_plans(&admin, true).await.is_err());
        assert!(billing.list_plans(&admin, false).await.is_ok());

        let operator = Principal {
            user_id: Uuid::new_v4(),
            role: Role::PlatformAdmin,
            campus_ids: vec![],
        };
        let plan = billing
            .create_plan(&operator, monthly_plan("Campus Pro", 25_000))
            .await
            .unwrap();
        assert!(billing.platform_stats(&operator).await.is_ok());
        assert!(billing.platform_stats(&admin).await.is_err());
        assert_eq!(plan.price_cents, 25_000);
    }

    #[tokio::test]
    async fn test_staff_can_report_usage_but_not_see_payments() {
        let h = harness();
        let billing = service(&h);
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        let staff = Principal {
            user_id: Uuid::new_v4(),
            role: Role::CampusStaff,
            campus_ids: vec![sub.campus_id],
        };

        let usage = billing
            .report_usage(&staff, sub.campus_id, UsageResource::Users, 3)
            .await
            .unwrap();
        assert_eq!(usage.users, 3);
        assert!(billing
            .list_payments(&staff, sub.campus_id, vec![], 10)
            .await
            .is_err());
    }
}
