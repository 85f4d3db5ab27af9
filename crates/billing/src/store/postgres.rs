//! Postgres-backed [`BillingStore`]
//!
//! Each changeset runs in one transaction. Versioned updates use
//! `WHERE id = $1 AND version = $2`; zero affected rows means another writer
//! committed first. The partial unique index `subscriptions_one_live_per_campus`
//! is the final guard for the one-live-subscription rule.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, Changeset, PaymentFilter, PaymentWrite, SubscriptionFilter, SubscriptionWrite,
    WebhookClaim, WebhookClaimOutcome, WebhookEventRecord, WebhookProcessingResult,
};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEvent, BillingEventType};
use crate::invoices::Invoice;
use crate::payments::{Payment, PaymentKind, PaymentMethod, PaymentStatus};
use crate::plans::{BillingPeriod, Plan, PlanQuotas};
use crate::subscriptions::{
    BillingContact, Subscription, SubscriptionStatus, UsageCounters, LIVE_STATUSES,
};

const LIVE_SUBSCRIPTION_INDEX: &str = "subscriptions_one_live_per_campus";

const PLAN_COLUMNS: &str = "id, name, description, price_cents, currency, billing_period, \
    trial_days, max_schools, max_users, max_appointments, max_storage_mb, features, \
    is_visible, sort_order, is_active, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, campus_id, plan_id, status, start_date, \
    current_period_start, end_date, trial_end_date, next_billing_date, grace_period_end, \
    price_cents, currency, billing_period, auto_renew, billing_name, billing_email, \
    billing_phone, billing_address, gateway_customer_id, gateway_payment_method_id, \
    cancellation_reason, canceled_at, credit_balance_cents, retry_count, next_retry_at, \
    pending_reason, usage_schools, usage_users, usage_appointments, usage_storage_mb, \
    version, created_at, updated_at, billing_anchor_day";

const PAYMENT_COLUMNS: &str = "id, subscription_id, campus_id, kind, amount_cents, tax_cents, \
    credit_applied_cents, currency, method, status, transaction_id, period_start, period_end, \
    failure_reason, refund_amount_cents, refunded_at, refund_reason, invoice_id, raw_response, \
    alerted_at, version, created_at, updated_at, completed_at";

const INVOICE_COLUMNS: &str = "id, payment_id, subscription_id, campus_id, invoice_number, \
    subtotal_cents, tax_cents, total_cents, currency, document_ref, issued_at";

const WEBHOOK_COLUMNS: &str = "id, event_key, event_type, transaction_id, payload, \
    processing_result, attempts, error_message, received_at, processing_started_at, processed_at";

fn corrupt(column: &str, value: &str) -> BillingError {
    BillingError::Database(format!("Unexpected {} value in database: {}", column, value))
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    price_cents: i64,
    currency: String,
    billing_period: String,
    trial_days: i32,
    max_schools: Option<i64>,
    max_users: Option<i64>,
    max_appointments: Option<i64>,
    max_storage_mb: Option<i64>,
    features: Vec<String>,
    is_visible: bool,
    sort_order: i32,
    is_active: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> BillingResult<Self> {
        Ok(Plan {
            billing_period: BillingPeriod::parse(&row.billing_period)
                .ok_or_else(|| corrupt("billing_period", &row.billing_period))?,
            id: row.id,
            name: row.name,
            description: row.description,
            price_cents: row.price_cents,
            currency: row.currency,
            trial_days: row.trial_days,
            quotas: PlanQuotas {
                max_schools: row.max_schools,
                max_users: row.max_users,
                max_appointments: row.max_appointments,
                max_storage_mb: row.max_storage_mb,
            },
            features: row.features,
            is_visible: row.is_visible,
            sort_order: row.sort_order,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    campus_id: Uuid,
    plan_id: Uuid,
    status: String,
    start_date: OffsetDateTime,
    current_period_start: OffsetDateTime,
    end_date: OffsetDateTime,
    trial_end_date: Option<OffsetDateTime>,
    next_billing_date: OffsetDateTime,
    grace_period_end: Option<OffsetDateTime>,
    price_cents: i64,
    currency: String,
    billing_period: String,
    auto_renew: bool,
    billing_name: Option<String>,
    billing_email: Option<String>,
    billing_phone: Option<String>,
    billing_address: Option<String>,
    gateway_customer_id: Option<String>,
    gateway_payment_method_id: Option<String>,
    cancellation_reason: Option<String>,
    canceled_at: Option<OffsetDateTime>,
    credit_balance_cents: i64,
    retry_count: i32,
    next_retry_at: Option<OffsetDateTime>,
    pending_reason: Option<String>,
    usage_schools: i64,
    usage_users: i64,
    usage_appointments: i64,
    usage_storage_mb: i64,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    billing_anchor_day: i16,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            status: SubscriptionStatus::parse(&row.status)
                .ok_or_else(|| corrupt("subscription status", &row.status))?,
            billing_period: BillingPeriod::parse(&row.billing_period)
                .ok_or_else(|| corrupt("billing_period", &row.billing_period))?,
            billing_anchor_day: u8::try_from(row.billing_anchor_day)
                .map_err(|_| corrupt("billing_anchor_day", &row.billing_anchor_day.to_string()))?,
            id: row.id,
            campus_id: row.campus_id,
            plan_id: row.plan_id,
            start_date: row.start_date,
            current_period_start: row.current_period_start,
            end_date: row.end_date,
            trial_end_date: row.trial_end_date,
            next_billing_date: row.next_billing_date,
            grace_period_end: row.grace_period_end,
            price_cents: row.price_cents,
            currency: row.currency,
            auto_renew: row.auto_renew,
            billing_contact: BillingContact {
                name: row.billing_name,
                email: row.billing_email,
                phone: row.billing_phone,
                address: row.billing_address,
            },
            gateway_customer_id: row.gateway_customer_id,
            gateway_payment_method_id: row.gateway_payment_method_id,
            cancellation_reason: row.cancellation_reason,
            canceled_at: row.canceled_at,
            credit_balance_cents: row.credit_balance_cents,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            pending_reason: row.pending_reason,
            usage: UsageCounters {
                schools: row.usage_schools,
                users: row.usage_users,
                appointments: row.usage_appointments,
                storage_mb: row.usage_storage_mb,
            },
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    subscription_id: Uuid,
    campus_id: Uuid,
    kind: String,
    amount_cents: i64,
    tax_cents: i64,
    credit_applied_cents: i64,
    currency: String,
    method: String,
    status: String,
    transaction_id: Option<String>,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    failure_reason: Option<String>,
    refund_amount_cents: Option<i64>,
    refunded_at: Option<OffsetDateTime>,
    refund_reason: Option<String>,
    invoice_id: Option<Uuid>,
    raw_response: Option<String>,
    alerted_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> BillingResult<Self> {
        Ok(Payment {
            kind: PaymentKind::parse(&row.kind).ok_or_else(|| corrupt("payment kind", &row.kind))?,
            method: PaymentMethod::parse(&row.method)
                .ok_or_else(|| corrupt("payment method", &row.method))?,
            status: PaymentStatus::parse(&row.status)
                .ok_or_else(|| corrupt("payment status", &row.status))?,
            id: row.id,
            subscription_id: row.subscription_id,
            campus_id: row.campus_id,
            amount_cents: row.amount_cents,
            tax_cents: row.tax_cents,
            credit_applied_cents: row.credit_applied_cents,
            currency: row.currency,
            transaction_id: row.transaction_id,
            period_start: row.period_start,
            period_end: row.period_end,
            failure_reason: row.failure_reason,
            refund_amount_cents: row.refund_amount_cents,
            refunded_at: row.refunded_at,
            refund_reason: row.refund_reason,
            invoice_id: row.invoice_id,
            raw_response: row.raw_response,
            alerted_at: row.alerted_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    payment_id: Uuid,
    subscription_id: Uuid,
    campus_id: Uuid,
    invoice_number: String,
    subtotal_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    currency: String,
    document_ref: String,
    issued_at: OffsetDateTime,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            id: row.id,
            payment_id: row.payment_id,
            subscription_id: row.subscription_id,
            campus_id: row.campus_id,
            invoice_number: row.invoice_number,
            subtotal_cents: row.subtotal_cents,
            tax_cents: row.tax_cents,
            total_cents: row.total_cents,
            currency: row.currency,
            document_ref: row.document_ref,
            issued_at: row.issued_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    subscription_id: Option<Uuid>,
    campus_id: Uuid,
    event_type: String,
    actor_type: String,
    actor_id: Option<Uuid>,
    data: serde_json::Value,
    created_at: OffsetDateTime,
}

impl TryFrom<EventRow> for BillingEvent {
    type Error = BillingError;

    fn try_from(row: EventRow) -> BillingResult<Self> {
        Ok(BillingEvent {
            event_type: BillingEventType::parse(&row.event_type)
                .ok_or_else(|| corrupt("event_type", &row.event_type))?,
            actor_type: ActorType::parse(&row.actor_type)
                .ok_or_else(|| corrupt("actor_type", &row.actor_type))?,
            id: row.id,
            subscription_id: row.subscription_id,
            campus_id: row.campus_id,
            actor_id: row.actor_id,
            data: row.data,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    event_key: String,
    event_type: String,
    transaction_id: Option<String>,
    payload: serde_json::Value,
    processing_result: String,
    attempts: i32,
    error_message: Option<String>,
    received_at: OffsetDateTime,
    processing_started_at: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<WebhookRow> for WebhookEventRecord {
    type Error = BillingError;

    fn try_from(row: WebhookRow) -> BillingResult<Self> {
        Ok(WebhookEventRecord {
            processing_result: WebhookProcessingResult::parse(&row.processing_result)
                .ok_or_else(|| corrupt("processing_result", &row.processing_result))?,
            id: row.id,
            event_key: row.event_key,
            event_type: row.event_type,
            transaction_id: row.transaction_id,
            payload: row.payload,
            attempts: row.attempts,
            error_message: row.error_message,
            received_at: row.received_at,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn violated_constraint(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            db.constraint().map(str::to_string)
        }
        _ => None,
    }
}

fn live_status_strings() -> Vec<String> {
    LIVE_STATUSES.iter().map(|s| s.as_str().to_string()).collect()
}

pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_subscription(
        tx: &mut Transaction<'_, Postgres>,
        write: &SubscriptionWrite,
    ) -> Result<(), sqlx::Error> {
        let sub = write.subscription();
        let affected = match write {
            SubscriptionWrite::Insert(_) => sqlx::query(&format!(
                "INSERT INTO subscriptions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                 $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, \
                 $26, $27, $28, $29, $30, $31, $32, $33, $34)",
                SUBSCRIPTION_COLUMNS
            ))
            .bind(sub.id)
            .bind(sub.campus_id)
            .bind(sub.plan_id)
            .bind(sub.status.as_str())
            .bind(sub.start_date)
            .bind(sub.current_period_start)
            .bind(sub.end_date)
            .bind(sub.trial_end_date)
            .bind(sub.next_billing_date)
            .bind(sub.grace_period_end)
            .bind(sub.price_cents)
            .bind(&sub.currency)
            .bind(sub.billing_period.as_str())
            .bind(sub.auto_renew)
            .bind(&sub.billing_contact.name)
            .bind(&sub.billing_contact.email)
            .bind(&sub.billing_contact.phone)
            .bind(&sub.billing_contact.address)
            .bind(&sub.gateway_customer_id)
            .bind(&sub.gateway_payment_method_id)
            .bind(&sub.cancellation_reason)
            .bind(sub.canceled_at)
            .bind(sub.credit_balance_cents)
            .bind(sub.retry_count)
            .bind(sub.next_retry_at)
            .bind(&sub.pending_reason)
            .bind(sub.usage.schools)
            .bind(sub.usage.users)
            .bind(sub.usage.appointments)
            .bind(sub.usage.storage_mb)
            .bind(sub.version)
            .bind(sub.created_at)
            .bind(sub.updated_at)
            .bind(i16::from(sub.billing_anchor_day))
            .execute(&mut **tx)
            .await?
            .rows_affected(),
            SubscriptionWrite::Update {
                expected_version, ..
            } => sqlx::query(
                r#"
                UPDATE subscriptions SET
                    plan_id = $3, status = $4, current_period_start = $5, end_date = $6,
                    trial_end_date = $7, next_billing_date = $8, grace_period_end = $9,
                    price_cents = $10, currency = $11, billing_period = $12, auto_renew = $13,
                    billing_name = $14, billing_email = $15, billing_phone = $16,
                    billing_address = $17, gateway_customer_id = $18,
                    gateway_payment_method_id = $19, cancellation_reason = $20,
                    canceled_at = $21, credit_balance_cents = $22, retry_count = $23,
                    next_retry_at = $24, pending_reason = $25, usage_schools = $26,
                    usage_users = $27, usage_appointments = $28, usage_storage_mb = $29,
                    version = $30, updated_at = $31, billing_anchor_day = $32
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(sub.id)
            .bind(*expected_version)
            .bind(sub.plan_id)
            .bind(sub.status.as_str())
            .bind(sub.current_period_start)
            .bind(sub.end_date)
            .bind(sub.trial_end_date)
            .bind(sub.next_billing_date)
            .bind(sub.grace_period_end)
            .bind(sub.price_cents)
            .bind(&sub.currency)
            .bind(sub.billing_period.as_str())
            .bind(sub.auto_renew)
            .bind(&sub.billing_contact.name)
            .bind(&sub.billing_contact.email)
            .bind(&sub.billing_contact.phone)
            .bind(&sub.billing_contact.address)
            .bind(&sub.gateway_customer_id)
            .bind(&sub.gateway_payment_method_id)
            .bind(&sub.cancellation_reason)
            .bind(sub.canceled_at)
            .bind(sub.credit_balance_cents)
            .bind(sub.retry_count)
            .bind(sub.next_retry_at)
            .bind(&sub.pending_reason)
            .bind(sub.usage.schools)
            .bind(sub.usage.users)
            .bind(sub.usage.appointments)
            .bind(sub.usage.storage_mb)
            .bind(sub.version)
            .bind(sub.updated_at)
            .bind(i16::from(sub.billing_anchor_day))
            .execute(&mut **tx)
            .await?
            .rows_affected(),
        };

        if affected == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn write_payment(
        tx: &mut Transaction<'_, Postgres>,
        write: &PaymentWrite,
    ) -> Result<(), sqlx::Error> {
        let p = write.payment();
        let affected = match write {
            PaymentWrite::Insert(_) => sqlx::query(&format!(
                "INSERT INTO payments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                 $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
                PAYMENT_COLUMNS
            ))
            .bind(p.id)
            .bind(p.subscription_id)
            .bind(p.campus_id)
            .bind(p.kind.as_str())
            .bind(p.amount_cents)
            .bind(p.tax_cents)
            .bind(p.credit_applied_cents)
            .bind(&p.currency)
            .bind(p.method.as_str())
            .bind(p.status.as_str())
            .bind(&p.transaction_id)
            .bind(p.period_start)
            .bind(p.period_end)
            .bind(&p.failure_reason)
            .bind(p.refund_amount_cents)
            .bind(p.refunded_at)
            .bind(&p.refund_reason)
            .bind(p.invoice_id)
            .bind(&p.raw_response)
            .bind(p.alerted_at)
            .bind(p.version)
            .bind(p.created_at)
            .bind(p.updated_at)
            .bind(p.completed_at)
            .execute(&mut **tx)
            .await?
            .rows_affected(),
            PaymentWrite::Update {
                expected_version, ..
            } => sqlx::query(
                r#"
                UPDATE payments SET
                    status = $3, transaction_id = $4, failure_reason = $5,
                    refund_amount_cents = $6, refunded_at = $7, refund_reason = $8,
                    invoice_id = $9, raw_response = $10, alerted_at = $11, version = $12,
                    updated_at = $13, completed_at = $14
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(p.id)
            .bind(*expected_version)
            .bind(p.status.as_str())
            .bind(&p.transaction_id)
            .bind(&p.failure_reason)
            .bind(p.refund_amount_cents)
            .bind(p.refunded_at)
            .bind(&p.refund_reason)
            .bind(p.invoice_id)
            .bind(&p.raw_response)
            .bind(p.alerted_at)
            .bind(p.version)
            .bind(p.updated_at)
            .bind(p.completed_at)
            .execute(&mut **tx)
            .await?
            .rows_affected(),
        };

        if affected == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn apply(&self, changes: &Changeset) -> Result<(), (sqlx::Error, &'static str)> {
        let mut tx = self.pool.begin().await.map_err(|e| (e, "begin"))?;

        if let Some(write) = &changes.subscription {
            Self::write_subscription(&mut tx, write)
                .await
                .map_err(|e| (e, "subscription"))?;
        }
        for write in &changes.payments {
            Self::write_payment(&mut tx, write)
                .await
                .map_err(|e| (e, "payment"))?;
        }
        if let Some(invoice) = &changes.invoice {
            sqlx::query(&format!(
                "INSERT INTO invoices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                INVOICE_COLUMNS
            ))
            .bind(invoice.id)
            .bind(invoice.payment_id)
            .bind(invoice.subscription_id)
            .bind(invoice.campus_id)
            .bind(&invoice.invoice_number)
            .bind(invoice.subtotal_cents)
            .bind(invoice.tax_cents)
            .bind(invoice.total_cents)
            .bind(&invoice.currency)
            .bind(&invoice.document_ref)
            .bind(invoice.issued_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| (e, "invoice"))?;
        }
        if let Some(flag) = &changes.campus_flag {
            sqlx::query(
                r#"
                INSERT INTO campus_billing_status (campus_id, is_subscribed, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (campus_id) DO UPDATE SET
                    is_subscribed = EXCLUDED.is_subscribed,
                    updated_at = NOW()
                "#,
            )
            .bind(flag.campus_id)
            .bind(flag.is_subscribed)
            .execute(&mut *tx)
            .await
            .map_err(|e| (e, "campus flag"))?;
        }
        for event in &changes.events {
            sqlx::query(
                r#"
                INSERT INTO billing_events
                    (id, subscription_id, campus_id, event_type, actor_type, actor_id, data, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.id)
            .bind(event.subscription_id)
            .bind(event.campus_id)
            .bind(event.event_type.as_str())
            .bind(event.actor_type.as_str())
            .bind(event.actor_id)
            .bind(&event.data)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| (e, "billing event"))?;
        }

        tx.commit().await.map_err(|e| (e, "commit"))
    }

    fn push_subscription_filter(
        query: &mut QueryBuilder<'_, Postgres>,
        filter: &SubscriptionFilter,
    ) {
        query.push(" WHERE TRUE");
        if let Some(campus_id) = filter.campus_id {
            query.push(" AND campus_id = ").push_bind(campus_id);
        }
        if let Some(plan_id) = filter.plan_id {
            query.push(" AND plan_id = ").push_bind(plan_id);
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            query.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(at) = filter.next_billing_at_or_before {
            query.push(" AND next_billing_date <= ").push_bind(at);
        }
        if let Some(at) = filter.next_retry_at_or_before {
            query.push(" AND next_retry_at <= ").push_bind(at);
        }
        if let Some(at) = filter.grace_ended_at_or_before {
            query.push(" AND grace_period_end <= ").push_bind(at);
        }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Plan::try_from).transpose()
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans ORDER BY sort_order, name",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO plans ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, \
             $12, $13, $14, $15, $16, $17)",
            PLAN_COLUMNS
        ))
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.billing_period.as_str())
        .bind(plan.trial_days)
        .bind(plan.quotas.max_schools)
        .bind(plan.quotas.max_users)
        .bind(plan.quotas.max_appointments)
        .bind(plan.quotas.max_storage_mb)
        .bind(&plan.features)
        .bind(plan.is_visible)
        .bind(plan.sort_order)
        .bind(plan.is_active)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE plans SET
                name = $2, description = $3, price_cents = $4, currency = $5,
                billing_period = $6, trial_days = $7, max_schools = $8, max_users = $9,
                max_appointments = $10, max_storage_mb = $11, features = $12,
                is_visible = $13, sort_order = $14, is_active = $15, updated_at = $16
            WHERE id = $1
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.billing_period.as_str())
        .bind(plan.trial_days)
        .bind(plan.quotas.max_schools)
        .bind(plan.quotas.max_users)
        .bind(plan.quotas.max_appointments)
        .bind(plan.quotas.max_storage_mb)
        .bind(&plan.features)
        .bind(plan.is_visible)
        .bind(plan.sort_order)
        .bind(plan.is_active)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Plan {}", plan.id)));
        }
        Ok(())
    }

    async fn count_live_subscriptions_for_plan(&self, plan_id: Uuid) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM subscriptions WHERE plan_id = $1 AND status = ANY($2)",
        )
        .bind(plan_id)
        .bind(live_status_strings())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_live_subscription(&self, campus_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE campus_id = $1 AND status = ANY($2)",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(campus_id)
        .bind(live_status_strings())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn latest_subscription(&self, campus_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE campus_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(campus_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> BillingResult<Vec<Subscription>> {
        let mut query = QueryBuilder::new(format!(
            "SELECT {} FROM subscriptions",
            SUBSCRIPTION_COLUMNS
        ));
        Self::push_subscription_filter(&mut query, filter);
        query.push(" ORDER BY next_billing_date, id");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit);
        }

        let rows: Vec<SubscriptionRow> = query.build_query_as().fetch_all(&self.pool).await?;
        collect(rows)
    }

    async fn subscription_status_counts(&self) -> BillingResult<Vec<(SubscriptionStatus, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM subscriptions GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(status, count)| {
                SubscriptionStatus::parse(&status)
                    .map(|s| (s, count))
                    .ok_or_else(|| corrupt("subscription status", &status))
            })
            .collect()
    }

    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE transaction_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>> {
        let mut query = QueryBuilder::new(format!(
            "SELECT {} FROM payments WHERE TRUE",
            PAYMENT_COLUMNS
        ));
        if let Some(subscription_id) = filter.subscription_id {
            query
                .push(" AND subscription_id = ")
                .push_bind(subscription_id);
        }
        if let Some(campus_id) = filter.campus_id {
            query.push(" AND campus_id = ").push_bind(campus_id);
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            query.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(kind) = filter.kind {
            query.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(before) = filter.created_before {
            query.push(" AND created_at < ").push_bind(before);
        }
        if let Some(after) = filter.created_at_or_after {
            query.push(" AND created_at >= ").push_bind(after);
        }
        if filter.unalerted_only {
            query.push(" AND alerted_at IS NULL");
        }
        query.push(" ORDER BY created_at DESC, id");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit);
        }

        let rows: Vec<PaymentRow> = query.build_query_as().fetch_all(&self.pool).await?;
        collect(rows)
    }

    async fn mark_payment_alerted(
        &self,
        payment_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET alerted_at = $2
            WHERE id = $1 AND status = 'pending' AND alerted_at IS NULL
            "#,
        )
        .bind(payment_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Invoice::from))
    }

    async fn find_invoice_for_payment(&self, payment_id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE payment_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Invoice::from))
    }

    async fn list_invoices(&self, campus_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE campus_id = $1 ORDER BY issued_at DESC",
            INVOICE_COLUMNS
        ))
        .bind(campus_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Invoice::from).collect())
    }

    async fn is_campus_subscribed(&self, campus_id: Uuid) -> BillingResult<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT is_subscribed FROM campus_billing_status WHERE campus_id = $1")
                .bind(campus_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(subscribed,)| subscribed).unwrap_or(false))
    }

    async fn list_events(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, campus_id, event_type, actor_type, actor_id, data, created_at
            FROM billing_events
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn commit(&self, changes: Changeset) -> BillingResult<()> {
        let (error, stage) = match self.apply(&changes).await {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };

        match (error, changes.subscription.as_ref()) {
            (sqlx::Error::RowNotFound, _) => Err(BillingError::ConcurrentModification(format!(
                "{} was modified concurrently",
                stage
            ))),
            (e, Some(write))
                if violated_constraint(&e).as_deref() == Some(LIVE_SUBSCRIPTION_INDEX) =>
            {
                let campus_id = write.subscription().campus_id;
                let existing_id = self
                    .find_live_subscription(campus_id)
                    .await?
                    .map(|s| s.id)
                    .unwrap_or_else(Uuid::nil);
                Err(BillingError::DuplicateSubscription {
                    campus_id,
                    existing_id,
                })
            }
            (e, _) => match violated_constraint(&e) {
                Some(constraint) => {
                    tracing::warn!(
                        stage = stage,
                        constraint = %constraint,
                        "Changeset hit a unique constraint"
                    );
                    Err(BillingError::ConcurrentModification(format!(
                        "{} conflicts with an existing row ({})",
                        stage, constraint
                    )))
                }
                None => {
                    tracing::error!(stage = stage, error = %e, "Changeset commit failed");
                    Err(BillingError::Database(e.to_string()))
                }
            },
        }
    }

    async fn claim_webhook(&self, claim: WebhookClaim) -> BillingResult<WebhookClaimOutcome> {
        let stale_before = claim.now - claim.stale_after;
        let claimed: Option<WebhookRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO gateway_webhook_events
                (id, event_key, event_type, transaction_id, payload, processing_result,
                 attempts, received_at, processing_started_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', 1, $6, $6)
            ON CONFLICT (event_key) DO UPDATE SET
                processing_result = 'processing',
                attempts = gateway_webhook_events.attempts + 1,
                error_message = NULL,
                processing_started_at = $6,
                processed_at = NULL
            WHERE (gateway_webhook_events.processing_result = 'error'
                   AND gateway_webhook_events.attempts < $7)
               OR (gateway_webhook_events.processing_result = 'processing'
                   AND gateway_webhook_events.processing_started_at <= $8)
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&claim.event_key)
        .bind(&claim.event_type)
        .bind(&claim.transaction_id)
        .bind(&claim.payload)
        .bind(claim.now)
        .bind(claim.max_attempts)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(WebhookClaimOutcome::Claimed(row.try_into()?));
        }

        match self.get_webhook(&claim.event_key).await? {
            Some(existing) => Ok(WebhookClaimOutcome::Duplicate(existing)),
            None => Err(BillingError::ConcurrentModification(format!(
                "Webhook event {} vanished during claim",
                claim.event_key
            ))),
        }
    }

    async fn finish_webhook(
        &self,
        event_key: &str,
        result: WebhookProcessingResult,
        error_message: Option<String>,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = $2, error_message = $3, processed_at = $4
            WHERE event_key = $1
            "#,
        )
        .bind(event_key)
        .bind(result.as_str())
        .bind(&error_message)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Webhook event {}", event_key)));
        }
        Ok(())
    }

    async fn get_webhook(&self, event_key: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let row: Option<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {} FROM gateway_webhook_events WHERE event_key = $1",
            WEBHOOK_COLUMNS
        ))
        .bind(event_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WebhookEventRecord::try_from).transpose()
    }

    async fn list_webhooks(
        &self,
        result: Option<WebhookProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let mut query = QueryBuilder::new(format!(
            "SELECT {} FROM gateway_webhook_events",
            WEBHOOK_COLUMNS
        ));
        if let Some(result) = result {
            query
                .push(" WHERE processing_result = ")
                .push_bind(result.as_str());
        }
        query.push(" ORDER BY received_at LIMIT ").push_bind(limit);

        let rows: Vec<WebhookRow> = query.build_query_as().fetch_all(&self.pool).await?;
        collect(rows)
    }

    async fn cleanup_webhooks(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM gateway_webhook_events
            WHERE received_at < $1 AND processing_result <> 'processing'
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
