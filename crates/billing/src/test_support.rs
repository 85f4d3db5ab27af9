// Test-only module
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Test doubles and fixtures shared by the unit and scenario tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::BillingCache;
use crate::clock::ManualClock;
use crate::config::BillingConfig;
use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::events::Actor;
use crate::gateway::{ChargeRequest, ChargeResponse, PaymentGateway};
use crate::invoices::TextInvoiceGenerator;
use crate::notifications::{Notification, NotificationSink, Notifier};
use crate::payments::{Payment, PaymentKind, PaymentProcessor};
use crate::plans::{BillingPeriod, NewPlan, Plan, PlanCatalog};
use crate::scheduler::BillingScheduler;
use crate::store::{Changeset, InMemoryBillingStore};
use crate::subscriptions::{
    BillingContact, CreateSubscriptionRequest, Subscription, SubscriptionService,
};
use crate::tax::ChargeAmount;

pub const TEST_START: OffsetDateTime = datetime!(2026-01-01 00:00 UTC);

/// Gateway that replays queued responses, then succeeds
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<BillingResult<ChargeResponse>>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn push(&self, response: ChargeResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_error(&self, error: BillingError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, _request: &ChargeRequest) -> BillingResult<ChargeResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(ChargeResponse::success(format!("tx-{}", n))),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|n| n.kind()).collect()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: &Notification) -> BillingResult<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub fn monthly_plan(name: &str, price_cents: i64) -> NewPlan {
    NewPlan {
        name: name.to_string(),
        description: None,
        price_cents,
        currency: "USD".to_string(),
        billing_period: BillingPeriod::Monthly,
        trial_days: 0,
        quotas: Default::default(),
        features: Vec::new(),
        is_visible: true,
        sort_order: 0,
    }
}

pub struct Harness {
    pub ctx: BillingContext,
    pub clock: ManualClock,
    pub gateway: Arc<ScriptedGateway>,
    pub sink: Arc<RecordingSink>,
    pub catalog: PlanCatalog,
    pub payments: PaymentProcessor,
    pub subscriptions: SubscriptionService,
    pub scheduler: BillingScheduler,
}

pub fn harness() -> Harness {
    harness_with(BillingConfig::default())
}

pub fn harness_with(config: BillingConfig) -> Harness {
    let clock = ManualClock::new(TEST_START);
    let gateway = Arc::new(ScriptedGateway::default());
    let sink = Arc::new(RecordingSink::default());

    let ctx = BillingContext {
        store: Arc::new(InMemoryBillingStore::new()),
        gateway: gateway.clone(),
        invoices: Arc::new(TextInvoiceGenerator::new("EduBill Test Issuer")),
        notifier: Notifier::new(sink.clone()),
        cache: BillingCache::in_memory(config.cache_ttl_secs),
        clock: Arc::new(clock.clone()),
        config: Arc::new(config),
    };

    Harness {
        catalog: PlanCatalog::new(ctx.clone()),
        payments: PaymentProcessor::new(ctx.clone()),
        subscriptions: SubscriptionService::new(ctx.clone()),
        scheduler: BillingScheduler::new(ctx.clone()),
        ctx,
        clock,
        gateway,
        sink,
    }
}

impl Harness {
    pub fn now(&self) -> OffsetDateTime {
        self.ctx.now()
    }

    pub async fn plan(&self, price_cents: i64, trial_days: i32) -> Plan {
        self.catalog
            .create_plan(NewPlan {
                trial_days,
                ..monthly_plan(&format!("Plan {}", price_cents), price_cents)
            })
            .await
            .unwrap()
    }

    pub fn create_request(&self, campus_id: Uuid, plan_id: Uuid) -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            campus_id,
            plan_id,
            billing_contact: BillingContact {
                name: Some("Bursar".to_string()),
                email: Some("bursar@example.edu".to_string()),
                phone: None,
                address: None,
            },
            auto_renew: true,
            gateway_customer_id: Some("cus_test".to_string()),
            gateway_payment_method_id: None,
        }
    }

    /// Subscribe a fresh campus to `plan_id`
    pub async fn subscribe(&self, plan_id: Uuid) -> Subscription {
        self.subscriptions
            .create(self.create_request(Uuid::new_v4(), plan_id), Actor::system())
            .await
            .unwrap()
    }

    pub async fn reload(&self, subscription_id: Uuid) -> Subscription {
        self.ctx
            .store
            .get_subscription(subscription_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Commit a PENDING recurring payment for the period after `subscription`'s
    /// current one, the way the scheduler claims a renewal
    pub async fn pending_renewal(&self, subscription: &Subscription) -> Payment {
        let mut sub = self.reload(subscription.id).await;
        let now = self.now();
        let charge = ChargeAmount::with_credit(
            sub.price_cents,
            sub.credit_balance_cents,
            self.ctx.config.tax_rate_bps,
        );
        let payment = Payment::new_pending(
            &sub,
            PaymentKind::Recurring,
            &charge,
            sub.end_date,
            sub.period_end_after(sub.end_date),
            now,
        );

        let mut changes = Changeset::new();
        changes.update_subscription(&mut sub);
        changes.insert_payment(&payment);
        self.ctx.commit(changes).await.unwrap();
        payment
    }
}
