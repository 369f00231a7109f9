//! Plan tiers, limits and the entitlement policy.
//!
//! The policy is a pure function of `(tier, action, usage)`. Usage counts are
//! read by the caller from existing read models just before the check, so two
//! concurrent requests can both pass a check at `limit - 1`. Plan limits are soft
//! limits; that over-count is accepted.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use tally_core::{DomainError, DomainResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Business,
}

impl PlanTier {
    /// Suggested upgrade when a limit of this tier is hit.
    pub fn upgrade_target(self) -> Option<PlanTier> {
        match self {
            PlanTier::Free => Some(PlanTier::Pro),
            PlanTier::Pro => Some(PlanTier::Business),
            PlanTier::Business => None,
        }
    }

    pub fn is_paid(self) -> bool {
        self != PlanTier::Free
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Business => "business",
        })
    }
}

impl FromStr for PlanTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "pro" => Ok(PlanTier::Pro),
            "business" => Ok(PlanTier::Business),
            other => Err(DomainError::validation(format!("unknown plan tier '{other}'"))),
        }
    }
}

/// Limits of one tier. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub monthly_invoices: Option<u32>,
    pub active_clients: Option<u32>,
    pub email_delivery: bool,
}

impl PlanLimits {
    pub fn unlimited() -> Self {
        Self {
            monthly_invoices: None,
            active_clients: None,
            email_delivery: true,
        }
    }
}

/// Result of checking a counted resource against its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitCheck {
    Unlimited,
    WithinLimit { current: u32, max: u32 },
    AtLimit { current: u32, max: u32 },
}

impl LimitCheck {
    fn evaluate(limit: Option<u32>, current: u32) -> Self {
        match limit {
            None => LimitCheck::Unlimited,
            Some(max) if current < max => LimitCheck::WithinLimit { current, max },
            Some(max) => LimitCheck::AtLimit { current, max },
        }
    }

    pub fn is_allowed(self) -> bool {
        !matches!(self, LimitCheck::AtLimit { .. })
    }
}

/// Actions gated by the tenant's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanAction {
    CreateInvoice,
    /// Registering or reactivating a client (both add an active client).
    ActivateClient,
    SendInvoice,
    RemindInvoice,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanAction::CreateInvoice => "create invoice",
            PlanAction::ActivateClient => "add active client",
            PlanAction::SendInvoice => "send invoice",
            PlanAction::RemindInvoice => "send reminder",
        })
    }
}

/// Current usage counts for a tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Invoices created since the first day of the current calendar month.
    pub invoices_this_month: u32,
    pub active_clients: u32,
}

/// Limits per tier. Free-tier numbers are configurable; paid tiers are unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanCatalog {
    pub free_monthly_invoices: u32,
    pub free_active_clients: u32,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self {
            free_monthly_invoices: 5,
            free_active_clients: 2,
        }
    }
}

impl PlanCatalog {
    pub fn limits(&self, tier: PlanTier) -> PlanLimits {
        match tier {
            PlanTier::Free => PlanLimits {
                monthly_invoices: Some(self.free_monthly_invoices),
                active_clients: Some(self.free_active_clients),
                email_delivery: false,
            },
            PlanTier::Pro | PlanTier::Business => PlanLimits::unlimited(),
        }
    }

    /// Allow or deny `action` for a tenant on `tier` with the given usage.
    pub fn check(&self, tier: PlanTier, action: PlanAction, usage: Usage) -> DomainResult<()> {
        let limits = self.limits(tier);

        let denied = |limit: String| DomainError::EntitlementExceeded {
            plan: tier.to_string(),
            limit,
            upgrade_to: tier.upgrade_target().map(|t| t.to_string()),
        };

        match action {
            PlanAction::CreateInvoice => {
                match LimitCheck::evaluate(limits.monthly_invoices, usage.invoices_this_month) {
                    LimitCheck::AtLimit { max, .. } => {
                        Err(denied(format!("{max} invoices per calendar month")))
                    }
                    _ => Ok(()),
                }
            }
            PlanAction::ActivateClient => {
                match LimitCheck::evaluate(limits.active_clients, usage.active_clients) {
                    LimitCheck::AtLimit { max, .. } => Err(denied(format!("{max} active clients"))),
                    _ => Ok(()),
                }
            }
            PlanAction::SendInvoice | PlanAction::RemindInvoice => {
                if limits.email_delivery {
                    Ok(())
                } else {
                    Err(denied(format!("{action} is not included")))
                }
            }
        }
    }
}

/// Processor price id → tier mapping, used when an event carries no plan metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceBook {
    pub pro_price_id: Option<String>,
    pub business_price_id: Option<String>,
}

impl PriceBook {
    pub fn tier_for_price(&self, price_id: &str) -> Option<PlanTier> {
        if self.pro_price_id.as_deref() == Some(price_id) {
            Some(PlanTier::Pro)
        } else if self.business_price_id.as_deref() == Some(price_id) {
            Some(PlanTier::Business)
        } else {
            None
        }
    }

    pub fn price_for_tier(&self, tier: PlanTier) -> Option<&str> {
        match tier {
            PlanTier::Free => None,
            PlanTier::Pro => self.pro_price_id.as_deref(),
            PlanTier::Business => self.business_price_id.as_deref(),
        }
    }
}
