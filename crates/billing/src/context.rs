//! Collaborators shared by every billing service

use std::sync::Arc;

use time::OffsetDateTime;

use crate::cache::BillingCache;
use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::gateway::PaymentGateway;
use crate::invoices::InvoiceGenerator;
use crate::notifications::Notifier;
use crate::store::{BillingStore, Changeset};

/// Cheap-to-clone handle on the engine's dependencies
#[derive(Clone)]
pub struct BillingContext {
    pub store: Arc<dyn BillingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub invoices: Arc<dyn InvoiceGenerator>,
    pub notifier: Notifier,
    pub cache: BillingCache,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<BillingConfig>,
}

impl BillingContext {
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Commit a changeset, then drop the cache entries it made stale
    pub async fn commit(&self, changes: Changeset) -> BillingResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let keys = changes.cache_keys();
        self.store.commit(changes).await?;
        if !keys.is_empty() {
            self.cache.invalidate(&keys).await;
        }
        Ok(())
    }
}
