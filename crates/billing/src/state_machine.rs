//! Subscription status transition rules
//!
//! Every lifecycle operation validates its target status here before building a
//! changeset, so an illegal move fails with a domain error instead of being
//! persisted.

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionStatus;

/// Validates a status transition.
///
/// | From      | To                                          |
/// |-----------|---------------------------------------------|
/// | Trial     | Active, PastDue, Canceled, Pending          |
/// | Active    | PastDue, Canceled, Pending                  |
/// | PastDue   | Active, Suspended, Canceled, Expired, Pending |
/// | Pending   | Active, Suspended                           |
/// | Canceled  | Expired                                     |
/// | Suspended | Expired                                     |
/// | Expired   | (terminal)                                  |
///
/// Staying in the same status is always allowed (renewals keep ACTIVE).
pub fn validate_transition(
    from: SubscriptionStatus,
    to: SubscriptionStatus,
    action: &'static str,
) -> BillingResult<()> {
    if from == to || allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            action,
            status: from,
        })
    }
}

pub fn allowed_transitions(status: SubscriptionStatus) -> &'static [SubscriptionStatus] {
    use SubscriptionStatus::*;

    match status {
        Trial => &[Active, PastDue, Canceled, Pending],
        Active => &[PastDue, Canceled, Pending],
        PastDue => &[Active, Suspended, Canceled, Expired, Pending],
        Pending => &[Active, Suspended],
        Canceled => &[Expired],
        Suspended => &[Expired],
        Expired => &[],
    }
}
