//! Authorisation for inbound billing calls
//!
//! Each role resolves to a fixed capability set. Campus-scoped calls also ask an
//! [`AccessValidator`] whether the principal may act for that campus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::Actor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Platform operator with every capability
    PlatformAdmin,
    /// Platform finance staff
    BillingAdmin,
    /// Owner or administrator of one or more campuses
    CampusAdmin,
    /// Campus staff with read access
    CampusStaff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ViewBilling,
    ManageSubscription,
    ViewInvoices,
    ViewPayments,
    ViewAnalytics,
    ReportUsage,
    ManagePlans,
    ViewPlatformStats,
    ResolvePending,
}

const PLATFORM_ADMIN: &[Capability] = &[
    Capability::ViewBilling,
    Capability::ManageSubscription,
    Capability::ViewInvoices,
    Capability::ViewPayments,
    Capability::ViewAnalytics,
    Capability::ReportUsage,
    Capability::ManagePlans,
    Capability::ViewPlatformStats,
    Capability::ResolvePending,
];

const BILLING_ADMIN: &[Capability] = &[
    Capability::ViewBilling,
    Capability::ViewInvoices,
    Capability::ViewPayments,
    Capability::ViewAnalytics,
    Capability::ViewPlatformStats,
    Capability::ResolvePending,
];

const CAMPUS_ADMIN: &[Capability] = &[
    Capability::ViewBilling,
    Capability::ManageSubscription,
    Capability::ViewInvoices,
    Capability::ViewPayments,
    Capability::ViewAnalytics,
    Capability::ReportUsage,
];

const CAMPUS_STAFF: &[Capability] = &[
    Capability::ViewBilling,
    Capability::ViewInvoices,
    Capability::ReportUsage,
];

impl Role {
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Role::PlatformAdmin => PLATFORM_ADMIN,
            Role::BillingAdmin => BILLING_ADMIN,
            Role::CampusAdmin => CAMPUS_ADMIN,
            Role::CampusStaff => CAMPUS_STAFF,
        }
    }

    /// Platform roles are not tied to campus membership
    pub fn is_platform(&self) -> bool {
        matches!(self, Role::PlatformAdmin | Role::BillingAdmin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::PlatformAdmin => "platform_admin",
            Role::BillingAdmin => "billing_admin",
            Role::CampusAdmin => "campus_admin",
            Role::CampusStaff => "campus_staff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "platform_admin" => Some(Role::PlatformAdmin),
            "billing_admin" => Some(Role::BillingAdmin),
            "campus_admin" => Some(Role::CampusAdmin),
            "campus_staff" => Some(Role::CampusStaff),
            _ => None,
        }
    }
}

/// Authenticated caller, resolved by the auth layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Role,
    /// Campuses the caller belongs to
    #[serde(default)]
    pub campus_ids: Vec<Uuid>,
}

impl Principal {
    pub fn can(&self, capability: Capability) -> bool {
        self.role.capabilities().contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> BillingResult<()> {
        if self.can(capability) {
            Ok(())
        } else {
            tracing::warn!(
                user_id = %self.user_id,
                role = self.role.as_str(),
                capability = ?capability,
                "Billing capability denied"
            );
            Err(BillingError::Forbidden(format!(
                "Role {} lacks {:?}",
                self.role.as_str(),
                capability
            )))
        }
    }

    /// Audit actor for changes made by this principal
    pub fn actor(&self) -> Actor {
        if self.role.is_platform() {
            Actor::admin(self.user_id)
        } else {
            Actor::user(self.user_id)
        }
    }
}

#[async_trait]
pub trait AccessValidator: Send + Sync {
    /// Whether `principal` may access billing for `campus_id`
    async fn can_access_campus(&self, principal: &Principal, campus_id: Uuid) -> BillingResult<bool>;
}

/// Grants platform roles every campus and everyone else their own campuses
#[derive(Debug, Clone, Copy, Default)]
pub struct MembershipAccessValidator;

#[async_trait]
impl AccessValidator for MembershipAccessValidator {
    async fn can_access_campus(&self, principal: &Principal, campus_id: Uuid) -> BillingResult<bool> {
        Ok(principal.role.is_platform() || principal.campus_ids.contains(&campus_id))
    }
}

/// Check a capability and campus access together
pub async fn authorize(
    validator: &dyn AccessValidator,
    principal: &Principal,
    campus_id: Uuid,
    capability: Capability,
) -> BillingResult<()> {
    principal.require(capability)?;
    if validator.can_access_campus(principal, campus_id).await? {
        Ok(())
    } else {
        tracing::warn!(
            user_id = %principal.user_id,
            campus_id = %campus_id,
            "Campus access denied"
        );
        Err(BillingError::Forbidden(format!(
            "No billing access to campus {}",
            campus_id
        )))
    }
}
