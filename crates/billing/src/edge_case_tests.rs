// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Scenario tests that cross module boundaries:
//! - Subscription uniqueness (BILL-S01 to BILL-S03)
//! - Proration (BILL-P01 to BILL-P02)
//! - Settlement idempotence (BILL-W01 to BILL-W02)
//! - Sweeps (BILL-G01 to BILL-G04)

#[cfg(test)]
mod subscription_uniqueness_tests {
    use crate::error::BillingError;
    use crate::events::Actor;
    use crate::gateway::ChargeResponse;
    use crate::store::SubscriptionFilter;
    use crate::subscriptions::{CancelRequest, SubscriptionStatus, LIVE_STATUSES};
    use crate::test_support::{harness, Harness};
    use proptest::prelude::*;
    use time::Duration;
    use uuid::Uuid;

    async fn live_count(h: &Harness, campus_id: Uuid) -> usize {
        h.ctx
            .store
            .list_subscriptions(&SubscriptionFilter {
                campus_id: Some(campus_id),
                statuses: LIVE_STATUSES.to_vec(),
                ..Default::default()
            })
            .await
            .unwrap()
            .len()
    }

    // =========================================================================
    // BILL-S01: Create for a campus with an ACTIVE subscription - conflict,
    // nothing persisted
    // =========================================================================
    #[tokio::test]
    async fn test_second_subscription_for_campus_rejected() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let other = h.plan(20_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        assert_eq!(sub.status, SubscriptionStatus::Active);

        let err = h
            .subscriptions
            .create(h.create_request(sub.campus_id, other.id), Actor::system())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SUBSCRIPTION_ALREADY_EXISTS");
        match err {
            BillingError::DuplicateSubscription { campus_id, existing_id } => {
                assert_eq!(campus_id, sub.campus_id);
                assert_eq!(existing_id, sub.id);
            }
            other => panic!("expected DuplicateSubscription, got {:?}", other),
        }

        let all = h
            .ctx
            .store
            .list_subscriptions(&SubscriptionFilter {
                campus_id: Some(sub.campus_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1, "no new row may be persisted");
        // No charge attempted for the rejected purchase
        assert_eq!(h.gateway.calls(), 1);
    }

    // =========================================================================
    // BILL-S02: A campus can subscribe again once the old subscription is gone
    // =========================================================================
    #[tokio::test]
    async fn test_resubscribe_after_immediate_cancel() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        h.subscriptions
            .cancel(
                sub.id,
                CancelRequest {
                    immediate: true,
                    reason: Some("closing campus".into()),
                },
                Actor::system(),
            )
            .await
            .unwrap();

        // Grace ends now, so the sweep expires it
        h.scheduler.run_grace_sweep().await.unwrap();
        assert_eq!(h.reload(sub.id).await.status, SubscriptionStatus::Expired);

        let again = h
            .subscriptions
            .create(h.create_request(sub.campus_id, plan.id), Actor::system())
            .await
            .unwrap();
        assert_ne!(again.id, sub.id);
        assert_eq!(live_count(&h, sub.campus_id).await, 1);
        assert!(h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create { campus: usize, paid: bool },
        Cancel { campus: usize, immediate: bool },
        Decline,
        Advance { days: i64 },
        Sweep,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..3usize, any::<bool>()).prop_map(|(campus, paid)| Op::Create { campus, paid }),
            2 => (0..3usize, any::<bool>())
                .prop_map(|(campus, immediate)| Op::Cancel { campus, immediate }),
            1 => Just(Op::Decline),
            2 => (1..40i64).prop_map(|days| Op::Advance { days }),
            2 => Just(Op::Sweep),
        ]
    }

    async fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
        let h = harness();
        let paid = h.plan(10_000, 0).await;
        let trial = h.plan(5_000, 14).await;
        let campuses = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

        for op in ops {
            match op {
                Op::Create { campus, paid: is_paid } => {
                    let plan_id = if is_paid { paid.id } else { trial.id };
                    // Rejections are expected; only the invariant matters
                    let _ = h
                        .subscriptions
                        .create(h.create_request(campuses[campus], plan_id), Actor::system())
                        .await;
                }
                Op::Cancel { campus, immediate } => {
                    if let Some(live) = h
                        .ctx
                        .store
                        .find_live_subscription(campuses[campus])
                        .await
                        .unwrap()
                    {
                        let _ = h
                            .subscriptions
                            .cancel(
                                live.id,
                                CancelRequest {
                                    immediate,
                                    reason: None,
                                },
                                Actor::system(),
                            )
                            .await;
                    }
                }
                Op::Decline => h.gateway.push(ChargeResponse::declined("card_declined")),
                Op::Advance { days } => h.clock.advance(Duration::days(days)),
                Op::Sweep => {
                    h.scheduler.run_all().await.unwrap();
                }
            }

            for campus in campuses {
                prop_assert!(live_count(&h, campus).await <= 1);
            }
        }
        Ok(())
    }

    // =========================================================================
    // BILL-S03: At most one live subscription per campus under any sequence
    // =========================================================================
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_at_most_one_live_subscription(ops in prop::collection::vec(op(), 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(run_ops(ops))?;
        }
    }
}

#[cfg(test)]
mod proration_tests {
    use crate::events::Actor;
    use crate::payments::{PaymentKind, PaymentStatus};
    use crate::test_support::harness;
    use time::macros::datetime;
    use time::Duration;

    // =========================================================================
    // BILL-P01: 100/month on day 15 of 30, change to 160/month - 110.00 now
    // =========================================================================
    #[tokio::test]
    async fn test_mid_period_upgrade_charges_difference() {
        let h = harness();
        // April has 30 days
        h.clock.set(datetime!(2026-04-01 00:00 UTC));
        let basic = h.plan(10_000, 0).await;
        let plus = h.plan(16_000, 0).await;
        let sub = h.subscribe(basic.id).await;
        assert_eq!(sub.end_date, datetime!(2026-05-01 00:00 UTC));

        h.clock.advance(Duration::days(15));
        let result = h
            .subscriptions
            .change_plan(sub.id, plus.id, Actor::system())
            .await
            .unwrap();

        assert_eq!(result.proration.unused_credit_cents, 5_000);
        assert_eq!(result.proration.amount_cents, 11_000);
        let payment = result.payment.unwrap();
        assert_eq!(payment.kind, PaymentKind::Proration);
        assert_eq!(payment.amount_cents, 11_000);
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(result.subscription.price_cents, 16_000);
        assert_eq!(result.subscription.current_period_start, h.now());
    }

    // =========================================================================
    // BILL-P02: A -> B -> A at the same instant nets zero
    // =========================================================================
    #[tokio::test]
    async fn test_round_trip_plan_change_nets_zero() {
        let h = harness();
        let basic = h.plan(10_000, 0).await;
        let plus = h.plan(16_000, 0).await;
        let sub = h.subscribe(basic.id).await;

        let up = h
            .subscriptions
            .change_plan(sub.id, plus.id, Actor::system())
            .await
            .unwrap();
        let down = h
            .subscriptions
            .change_plan(sub.id, basic.id, Actor::system())
            .await
            .unwrap();

        assert_eq!(up.proration.amount_cents, 6_000);
        assert_eq!(up.proration.amount_cents + down.proration.amount_cents, 0);
        // The downgrade leg is banked, not refunded
        assert_eq!(down.subscription.credit_balance_cents, 6_000);
    }

    // =========================================================================
    // BILL-P03: A -> B -> A mid-period pays for the half period already used
    // =========================================================================
    #[tokio::test]
    async fn test_mid_period_round_trip_restarts_period() {
        let h = harness();
        h.clock.set(datetime!(2026-04-01 00:00 UTC));
        let basic = h.plan(10_000, 0).await;
        let plus = h.plan(16_000, 0).await;
        let sub = h.subscribe(basic.id).await;

        h.clock.advance(Duration::days(15));
        let up = h
            .subscriptions
            .change_plan(sub.id, plus.id, Actor::system())
            .await
            .unwrap();
        let down = h
            .subscriptions
            .change_plan(sub.id, basic.id, Actor::system())
            .await
            .unwrap();

        // The upgrade restarted the period, so the way back credits the full new price
        assert_eq!(up.proration.amount_cents, 11_000);
        assert_eq!(down.proration.amount_cents, -16_000 + 10_000);
        // Net equals the unused half of the original period: 10_000 x (1 - 0.5)
        assert_eq!(up.proration.amount_cents + down.proration.amount_cents, 5_000);
        assert_eq!(down.subscription.credit_balance_cents, 6_000);
        assert_eq!(down.subscription.current_period_start, h.now());
        assert_eq!(down.subscription.end_date, datetime!(2026-05-16 00:00 UTC));
    }
}

#[cfg(test)]
mod settlement_tests {
    use crate::payments::{PaymentStatus, SettleOutcome};
    use crate::store::PaymentFilter;
    use crate::test_support::harness;
    use crate::webhooks::{GatewayEvent, GatewayEventType, WebhookOutcome, WebhookReconciler};

    fn success(transaction_id: &str) -> GatewayEvent {
        GatewayEvent {
            event_id: None,
            event_type: GatewayEventType::PaymentSuccess,
            transaction_id: transaction_id.to_string(),
            payment_reference: None,
            raw_data: Some(format!("{{\"id\":\"{}\"}}", transaction_id)),
            error_message: None,
            refund_amount: None,
            refund_reason: None,
        }
    }

    // =========================================================================
    // BILL-W01: Webhook confirming a synchronously settled charge is a no-op
    // =========================================================================
    #[tokio::test]
    async fn test_webhook_after_synchronous_success() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        let reconciler = WebhookReconciler::new(h.ctx.clone());

        // ScriptedGateway names the first charge tx-1
        let outcome = reconciler.handle(success("tx-1")).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Processed(SettleOutcome::AlreadyApplied(_))
        ));

        let before = h.reload(sub.id).await;
        assert_eq!(before.end_date, sub.end_date);
        assert_eq!(h.ctx.store.list_invoices(sub.campus_id).await.unwrap().len(), 1);
    }

    // =========================================================================
    // BILL-W02: Same success delivered twice without an event id
    // =========================================================================
    #[tokio::test]
    async fn test_content_keyed_duplicate_success() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        let mut payment = h.pending_renewal(&sub).await;
        let reconciler = WebhookReconciler::new(h.ctx.clone());

        let mut event = success("pi_renewal");
        event.payment_reference = Some(payment.id);
        reconciler.handle(event.clone()).await.unwrap();
        let replay = reconciler.handle(event).await.unwrap();
        assert!(matches!(replay, WebhookOutcome::Duplicate(_)));

        payment = h.payments.get_payment(payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.invoice_id.is_some());

        let completed = h
            .payments
            .list_payments(&PaymentFilter {
                campus_id: Some(sub.campus_id),
                statuses: vec![PaymentStatus::Completed],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(h.ctx.store.list_invoices(sub.campus_id).await.unwrap().len(), 2);
    }
}

#[cfg(test)]
mod sweep_tests {
    use crate::events::Actor;
    use crate::gateway::ChargeResponse;
    use crate::subscriptions::{CancelRequest, SubscriptionStatus};
    use crate::test_support::harness;
    use time::Duration;

    // =========================================================================
    // BILL-G01: Due ACTIVE subscription either renews or goes PAST_DUE
    // =========================================================================
    #[tokio::test]
    async fn test_due_subscription_never_left_unchanged() {
        for declined in [false, true] {
            let h = harness();
            let plan = h.plan(10_000, 0).await;
            let sub = h.subscribe(plan.id).await;
            h.clock.set(sub.next_billing_date + Duration::hours(2));
            if declined {
                h.gateway.push(ChargeResponse::declined("insufficient_funds"));
            }

            h.scheduler.run_billing_sweep().await.unwrap();
            let after = h.reload(sub.id).await;
            if declined {
                assert_eq!(after.status, SubscriptionStatus::PastDue);
                assert_eq!(after.grace_period_end, Some(h.now() + Duration::days(7)));
                assert_eq!(after.end_date, sub.end_date);
                assert_eq!(after.retry_count, 0);
                assert!(after.next_retry_at.is_some());
            } else {
                assert_eq!(after.status, SubscriptionStatus::Active);
                assert_eq!(after.end_date, plan.billing_period.advance(sub.end_date));
                assert_eq!(after.next_billing_date, after.end_date);
            }
        }
    }

    // =========================================================================
    // BILL-G02: PAST_DUE with grace ended yesterday - SUSPENDED, flag cleared
    // =========================================================================
    #[tokio::test]
    async fn test_expired_grace_suspends() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        h.gateway.push(ChargeResponse::declined("card_declined"));
        let sub = h.subscribe(plan.id).await;
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert!(h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());

        let grace_end = sub.grace_period_end.unwrap();
        h.clock.set(grace_end + Duration::days(1));
        let report = h.scheduler.run_grace_sweep().await.unwrap();
        assert_eq!(report.suspended, 1);

        assert_eq!(h.reload(sub.id).await.status, SubscriptionStatus::Suspended);
        assert!(!h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());
        assert!(h.sink.kinds().contains(&"suspended"));
    }

    // =========================================================================
    // BILL-G03: Deferred cancel keeps access until the period ends
    // =========================================================================
    #[tokio::test]
    async fn test_deferred_cancel_expires_at_period_end() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;

        let canceled = h
            .subscriptions
            .cancel(sub.id, CancelRequest::default(), Actor::system())
            .await
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert_eq!(canceled.grace_period_end, Some(sub.end_date));

        h.clock.set(sub.end_date - Duration::hours(1));
        h.scheduler.run_grace_sweep().await.unwrap();
        assert_eq!(h.reload(sub.id).await.status, SubscriptionStatus::Canceled);
        assert!(h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());

        h.clock.set(sub.end_date + Duration::minutes(1));
        h.scheduler.run_grace_sweep().await.unwrap();
        assert_eq!(h.reload(sub.id).await.status, SubscriptionStatus::Expired);
        assert!(!h.ctx.store.is_campus_subscribed(sub.campus_id).await.unwrap());
    }

    // =========================================================================
    // BILL-G04: Full sweep is safe to run repeatedly at the same instant
    // =========================================================================
    #[tokio::test]
    async fn test_run_all_is_idempotent_per_instant() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;
        h.clock.set(sub.next_billing_date);

        h.scheduler.run_all().await.unwrap();
        let first = h.reload(sub.id).await;
        h.scheduler.run_all().await.unwrap();
        let second = h.reload(sub.id).await;

        assert_eq!(first.end_date, second.end_date);
        assert_eq!(first.version, second.version);
        assert_eq!(h.gateway.calls(), 2);
    }
}
