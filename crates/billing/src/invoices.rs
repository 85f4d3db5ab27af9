//! Invoices for completed payments
//!
//! One invoice per COMPLETED payment, enforced by a unique index on `payment_id`.
//! The [`InvoiceGenerator`] seam turns a payment into an invoice record with a
//! durable document reference and renders the document on demand.

use async_trait::async_trait;
use edubill_shared::format_cents;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::payments::{load_payment, Payment};
use crate::subscriptions::Subscription;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub subscription_id: Uuid,
    pub campus_id: Uuid,
    pub invoice_number: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub document_ref: String,
    pub issued_at: OffsetDateTime,
}

/// A rendered invoice document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceDocument {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait InvoiceGenerator: Send + Sync {
    /// Build the invoice record for a payment that is being completed
    async fn create_invoice_for_payment(
        &self,
        payment: &Payment,
        subscription: &Subscription,
        issued_at: OffsetDateTime,
    ) -> BillingResult<Invoice>;

    /// Render the invoice document
    async fn generate_document(
        &self,
        invoice: &Invoice,
        payment: &Payment,
    ) -> BillingResult<InvoiceDocument>;

    /// Fetch the document behind `invoice.document_ref`
    async fn download_document(
        &self,
        invoice: &Invoice,
        payment: &Payment,
    ) -> BillingResult<InvoiceDocument> {
        self.generate_document(invoice, payment).await
    }
}

/// Plain-text invoices rendered deterministically from stored records
#[derive(Debug, Clone, Default)]
pub struct TextInvoiceGenerator {
    issuer: String,
}

impl TextInvoiceGenerator {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
        }
    }

    /// `INV-YYYYMM-XXXXXXXX`
    pub fn invoice_number(issued_at: OffsetDateTime, id: Uuid) -> String {
        let simple = id.simple().to_string().to_uppercase();
        format!(
            "INV-{:04}{:02}-{}",
            issued_at.year(),
            issued_at.month() as u8,
            &simple[..8]
        )
    }
}

#[async_trait]
impl InvoiceGenerator for TextInvoiceGenerator {
    async fn create_invoice_for_payment(
        &self,
        payment: &Payment,
        subscription: &Subscription,
        issued_at: OffsetDateTime,
    ) -> BillingResult<Invoice> {
        let id = Uuid::new_v4();
        let invoice_number = Self::invoice_number(issued_at, id);

        Ok(Invoice {
            id,
            payment_id: payment.id,
            subscription_id: subscription.id,
            campus_id: subscription.campus_id,
            document_ref: format!("invoices/{}.txt", invoice_number),
            invoice_number,
            subtotal_cents: payment.subtotal_cents(),
            tax_cents: payment.tax_cents,
            total_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            issued_at,
        })
    }

    async fn generate_document(
        &self,
        invoice: &Invoice,
        payment: &Payment,
    ) -> BillingResult<InvoiceDocument> {
        let issuer = if self.issuer.is_empty() {
            "EduBill"
        } else {
            self.issuer.as_str()
        };

        let mut body = String::new();
        body.push_str(&format!("{}\nINVOICE {}\n\n", issuer, invoice.invoice_number));
        body.push_str(&format!("Issued:        {}\n", invoice.issued_at.date()));
        body.push_str(&format!("Campus:        {}\n", invoice.campus_id));
        body.push_str(&format!("Subscription:  {}\n", invoice.subscription_id));
        body.push_str(&format!(
            "Period:        {} to {}\n",
            payment.period_start.date(),
            payment.period_end.date()
        ));
        body.push_str(&format!("Charge type:   {}\n\n", payment.kind.as_str()));
        if payment.credit_applied_cents > 0 {
            body.push_str(&format!(
                "Credit:        {}\n",
                format_cents(payment.credit_applied_cents, &invoice.currency)
            ));
        }
        body.push_str(&format!(
            "Subtotal:      {}\n",
            format_cents(invoice.subtotal_cents, &invoice.currency)
        ));
        body.push_str(&format!(
            "Tax:           {}\n",
            format_cents(invoice.tax_cents, &invoice.currency)
        ));
        body.push_str(&format!(
            "Total:         {}\n",
            format_cents(invoice.total_cents, &invoice.currency)
        ));
        if let Some(tx) = &payment.transaction_id {
            body.push_str(&format!("\nReference:     {}\n", tx));
        }

        Ok(InvoiceDocument {
            file_name: format!("{}.txt", invoice.invoice_number),
            content_type: "text/plain; charset=utf-8",
            bytes: body.into_bytes(),
        })
    }
}

/// Read side for invoices
#[derive(Clone)]
pub struct InvoiceService {
    ctx: BillingContext,
}

impl InvoiceService {
    pub fn new(ctx: BillingContext) -> Self {
        Self { ctx }
    }

    /// Invoices for a campus, newest first
    pub async fn list_invoices(&self, campus_id: Uuid) -> BillingResult<Vec<Invoice>> {
        self.ctx.store.list_invoices(campus_id).await
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.ctx
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {}", invoice_id)))
    }

    pub async fn download_invoice(&self, invoice_id: Uuid) -> BillingResult<InvoiceDocument> {
        let invoice = self.get_invoice(invoice_id).await?;
        let payment = load_payment(&self.ctx, invoice.payment_id).await?;
        self.ctx.invoices.download_document(&invoice, &payment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;
    use time::macros::datetime;

    #[test]
    fn test_invoice_number_format() {
        let id = Uuid::parse_str("0a1b2c3d-0000-4000-8000-000000000000").unwrap();
        assert_eq!(
            TextInvoiceGenerator::invoice_number(datetime!(2026-03-09 12:00 UTC), id),
            "INV-202603-0A1B2C3D"
        );
    }

    #[tokio::test]
    async fn test_initial_charge_issues_downloadable_invoice() {
        let h = harness();
        let plan = h.plan(10_000, 0).await;
        let sub = h.subscribe(plan.id).await;

        let service = InvoiceService::new(h.ctx.clone());
        let invoices = service.list_invoices(sub.campus_id).await.unwrap();
        assert_eq!(invoices.len(), 1);
        let invoice = &invoices[0];
        assert_eq!(invoice.total_cents, 10_000);
        assert!(invoice.document_ref.starts_with("invoices/INV-"));

        let doc = service.download_invoice(invoice.id).await.unwrap();
        let text = String::from_utf8(doc.bytes).unwrap();
        assert!(text.contains(&invoice.invoice_number));
        assert!(text.contains("Total:         100.00 USD"));
    }

    #[tokio::test]
    async fn test_download_unknown_invoice() {
        let h = harness();
        let service = InvoiceService::new(h.ctx.clone());
        assert!(matches!(
            service.download_invoice(Uuid::new_v4()).await,
            Err(BillingError::NotFound(_))
        ));
    }
}
