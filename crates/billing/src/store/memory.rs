//! In-process [`BillingStore`] used by tests and local runs
//!
//! One mutex guards all state, so a changeset is validated and applied as a unit
//! with the same uniqueness and version rules as the Postgres schema.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BillingStore, Changeset, PaymentFilter, PaymentWrite, SubscriptionFilter, SubscriptionWrite,
    WebhookClaim, WebhookClaimOutcome, WebhookEventRecord, WebhookProcessingResult,
};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::invoices::Invoice;
use crate::payments::{Payment, PaymentStatus};
use crate::plans::Plan;
use crate::subscriptions::{Subscription, SubscriptionStatus};

#[derive(Default)]
struct State {
    plans: Vec<Plan>,
    // Insertion order breaks ties between equal timestamps
    subscriptions: Vec<Subscription>,
    payments: Vec<Payment>,
    invoices: Vec<Invoice>,
    campus_flags: HashMap<Uuid, bool>,
    events: Vec<BillingEvent>,
    webhooks: Vec<WebhookEventRecord>,
}

impl State {
    fn live_subscription_for(&self, campus_id: Uuid, except: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| s.campus_id == campus_id && s.id != except && s.status.is_live())
    }

    fn validate(&self, changes: &Changeset) -> BillingResult<()> {
        if let Some(write) = &changes.subscription {
            let sub = write.subscription();
            match write {
                SubscriptionWrite::Insert(_) => {
                    if self.subscriptions.iter().any(|s| s.id == sub.id) {
                        return Err(BillingError::ConcurrentModification(format!(
                            "Subscription {} already exists",
                            sub.id
                        )));
                    }
                }
                SubscriptionWrite::Update {
                    expected_version, ..
                } => {
                    let stored = self
                        .subscriptions
                        .iter()
                        .find(|s| s.id == sub.id)
                        .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", sub.id)))?;
                    if stored.version != *expected_version {
                        return Err(BillingError::ConcurrentModification(format!(
                            "Subscription {} changed (version {} != {})",
                            sub.id, stored.version, expected_version
                        )));
                    }
                }
            }
            if sub.status.is_live() {
                if let Some(existing) = self.live_subscription_for(sub.campus_id, sub.id) {
                    return Err(BillingError::DuplicateSubscription {
                        campus_id: sub.campus_id,
                        existing_id: existing.id,
                    });
                }
            }
        }

        for write in &changes.payments {
            let payment = write.payment();
            match write {
                PaymentWrite::Insert(_) => {
                    if self.payments.iter().any(|p| p.id == payment.id) {
                        return Err(BillingError::ConcurrentModification(format!(
                            "Payment {} already exists",
                            payment.id
                        )));
                    }
                }
                PaymentWrite::Update {
                    expected_version, ..
                } => {
                    let stored = self
                        .payments
                        .iter()
                        .find(|p| p.id == payment.id)
                        .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment.id)))?;
                    if stored.version != *expected_version {
                        return Err(BillingError::ConcurrentModification(format!(
                            "Payment {} changed (version {} != {})",
                            payment.id, stored.version, expected_version
                        )));
                    }
                }
            }
            if let Some(tx) = &payment.transaction_id {
                if self
                    .payments
                    .iter()
                    .any(|p| p.id != payment.id && p.transaction_id.as_ref() == Some(tx))
                {
                    return Err(BillingError::ConcurrentModification(format!(
                        "Transaction {} is already recorded on another payment",
                        tx
                    )));
                }
            }
        }

        if let Some(invoice) = &changes.invoice {
            if self
                .invoices
                .iter()
                .any(|i| i.payment_id == invoice.payment_id)
            {
                return Err(BillingError::ConcurrentModification(format!(
                    "Invoice already issued for payment {}",
                    invoice.payment_id
                )));
            }
        }

        Ok(())
    }

    fn apply(&mut self, changes: Changeset) {
        if let Some(write) = changes.subscription {
            match write {
                SubscriptionWrite::Insert(sub) => self.subscriptions.push(sub),
                SubscriptionWrite::Update { subscription, .. } => {
                    if let Some(stored) = self
                        .subscriptions
                        .iter_mut()
                        .find(|s| s.id == subscription.id)
                    {
                        *stored = subscription;
                    }
                }
            }
        }
        for write in changes.payments {
            match write {
                PaymentWrite::Insert(payment) => self.payments.push(payment),
                PaymentWrite::Update { payment, .. } => {
                    if let Some(stored) = self.payments.iter_mut().find(|p| p.id == payment.id) {
                        *stored = payment;
                    }
                }
            }
        }
        if let Some(invoice) = changes.invoice {
            self.invoices.push(invoice);
        }
        if let Some(flag) = changes.campus_flag {
            self.campus_flags.insert(flag.campus_id, flag.is_subscribed);
        }
        self.events.extend(changes.events);
    }
}

/// Newest first; ties resolve to the most recently inserted
fn newest_first<T: Clone>(items: &[T], key: impl Fn(&T) -> OffsetDateTime) -> Vec<T> {
    let mut out: Vec<T> = items.iter().rev().cloned().collect();
    out.sort_by_key(|item| std::cmp::Reverse(key(item)));
    out
}

fn take_limit<T>(mut items: Vec<T>, limit: Option<i64>) -> Vec<T> {
    if let Some(limit) = limit {
        items.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
    }
    items
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let state = self.state.lock().await;
        Ok(state.plans.iter().find(|p| p.id == plan_id).cloned())
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        Ok(self.state.lock().await.plans.clone())
    }

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state.plans.iter().any(|p| p.id == plan.id) {
            return Err(BillingError::InvalidInput(format!(
                "Plan {} already exists",
                plan.id
            )));
        }
        state.plans.push(plan.clone());
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .plans
            .iter_mut()
            .find(|p| p.id == plan.id)
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan.id)))?;
        *stored = plan.clone();
        Ok(())
    }

    async fn count_live_subscriptions_for_plan(&self, plan_id: Uuid) -> BillingResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.plan_id == plan_id && s.status.is_live())
            .count() as i64)
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .find(|s| s.id == subscription_id)
            .cloned())
    }

    async fn find_live_subscription(&self, campus_id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state.live_subscription_for(campus_id, Uuid::nil()).cloned())
    }

    async fn latest_subscription(&self, campus_id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        let campus: Vec<Subscription> = state
            .subscriptions
            .iter()
            .filter(|s| s.campus_id == campus_id)
            .cloned()
            .collect();
        Ok(newest_first(&campus, |s| s.created_at).into_iter().next())
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let matching = state
            .subscriptions
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        Ok(take_limit(matching, filter.limit))
    }

    async fn subscription_status_counts(&self) -> BillingResult<Vec<(SubscriptionStatus, i64)>> {
        let state = self.state.lock().await;
        let mut counts: HashMap<SubscriptionStatus, i64> = HashMap::new();
        for sub in &state.subscriptions {
            *counts.entry(sub.status).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        Ok(counts)
    }

    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.iter().find(|p| p.id == payment_id).cloned())
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>> {
        let state = self.state.lock().await;
        let matching: Vec<Payment> = state
            .payments
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        Ok(take_limit(
            newest_first(&matching, |p| p.created_at),
            filter.limit,
        ))
    }

    async fn mark_payment_alerted(
        &self,
        payment_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.payments.iter_mut().find(|p| p.id == payment_id) {
            Some(p) if p.status == PaymentStatus::Pending && p.alerted_at.is_none() => {
                p.alerted_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::NotFound(format!("Payment {}", payment_id))),
        }
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let state = self.state.lock().await;
        Ok(state.invoices.iter().find(|i| i.id == invoice_id).cloned())
    }

    async fn find_invoice_for_payment(&self, payment_id: Uuid) -> BillingResult<Option<Invoice>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .iter()
            .find(|i| i.payment_id == payment_id)
            .cloned())
    }

    async fn list_invoices(&self, campus_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        let campus: Vec<Invoice> = state
            .invoices
            .iter()
            .filter(|i| i.campus_id == campus_id)
            .cloned()
            .collect();
        Ok(newest_first(&campus, |i| i.issued_at))
    }

    async fn is_campus_subscribed(&self, campus_id: Uuid) -> BillingResult<bool> {
        let state = self.state.lock().await;
        Ok(state.campus_flags.get(&campus_id).copied().unwrap_or(false))
    }

    async fn list_events(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let state = self.state.lock().await;
        let events: Vec<BillingEvent> = state
            .events
            .iter()
            .filter(|e| e.subscription_id == Some(subscription_id))
            .cloned()
            .collect();
        Ok(take_limit(
            newest_first(&events, |e| e.created_at),
            Some(limit),
        ))
    }

    async fn commit(&self, changes: Changeset) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.validate(&changes)?;
        state.apply(changes);
        Ok(())
    }

    async fn claim_webhook(&self, claim: WebhookClaim) -> BillingResult<WebhookClaimOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .webhooks
            .iter_mut()
            .find(|w| w.event_key == claim.event_key)
        {
            if !claim.may_reclaim(existing) {
                return Ok(WebhookClaimOutcome::Duplicate(existing.clone()));
            }
            existing.processing_result = WebhookProcessingResult::Processing;
            existing.attempts += 1;
            existing.error_message = None;
            existing.processing_started_at = Some(claim.now);
            existing.processed_at = None;
            return Ok(WebhookClaimOutcome::Claimed(existing.clone()));
        }

        let record = WebhookEventRecord {
            id: Uuid::new_v4(),
            event_key: claim.event_key,
            event_type: claim.event_type,
            transaction_id: claim.transaction_id,
            payload: claim.payload,
            processing_result: WebhookProcessingResult::Processing,
            attempts: 1,
            error_message: None,
            received_at: claim.now,
            processing_started_at: Some(claim.now),
            processed_at: None,
        };
        state.webhooks.push(record.clone());
        Ok(WebhookClaimOutcome::Claimed(record))
    }

    async fn finish_webhook(
        &self,
        event_key: &str,
        result: WebhookProcessingResult,
        error_message: Option<String>,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .webhooks
            .iter_mut()
            .find(|w| w.event_key == event_key)
            .ok_or_else(|| BillingError::NotFound(format!("Webhook event {}", event_key)))?;
        record.processing_result = result;
        record.error_message = error_message;
        record.processed_at = Some(at);
        Ok(())
    }

    async fn get_webhook(&self, event_key: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .webhooks
            .iter()
            .find(|w| w.event_key == event_key)
            .cloned())
    }

    async fn list_webhooks(
        &self,
        result: Option<WebhookProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<WebhookEventRecord> = state
            .webhooks
            .iter()
            .filter(|w| result.is_none_or(|r| w.processing_result == r))
            .cloned()
            .collect();
        records.sort_by_key(|w| w.received_at);
        Ok(take_limit(records, Some(limit)))
    }

    async fn cleanup_webhooks(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before_len = state.webhooks.len();
        state.webhooks.retain(|w| {
            w.received_at >= before || w.processing_result == WebhookProcessingResult::Processing
        });
        Ok((before_len - state.webhooks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;

    #[tokio::test]
    async fn test_stale_version_rejects_whole_changeset() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;

        let mut first = h.reload(sub.id).await;
        let mut second = first.clone();

        let mut changes = Changeset::new();
        first.auto_renew = false;
        changes.update_subscription(&mut first);
        h.ctx.store.commit(changes).await.unwrap();

        let mut stale = Changeset::new();
        second.credit_balance_cents = 500;
        stale.update_subscription(&mut second);
        stale.campus_flag(sub.campus_id, false);
        let err = h.ctx.store.commit(stale).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));

        // Nothing from the rejected changeset was applied
        let stored = h.reload(sub.id).await;
        assert_eq!(stored.credit_balance_cents, 0);
        assert!(!stored.auto_renew);
        assert!(h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_live_subscription_rejected() {
        let h = harness();
        let plan = h.plan(10_000, 14).await;
        let sub = h.subscribe(plan.id).await;

        let mut twin = h.reload(sub.id).await;
        twin.id = Uuid::new_v4();
        twin.version = 0;
        let mut changes = Changeset::new();
        changes.insert_subscription(&twin);
        let err = h.ctx.store.commit(changes).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::DuplicateSubscription { existing_id, .. } if existing_id == sub.id
        ));
    }
}
