//! Plan tiers and the "does this user currently hold a paid entitlement"
//! question, answered against the user store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::store::{UserRecord, UserStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    PremiumMonthly,
    PremiumYearly,
}

impl PlanTier {
    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }

    /// Label written to the `user_plan` cookie. Deliberately lossy: the
    /// cookie only distinguishes free from premium.
    pub fn cookie_label(&self) -> &'static str {
        if self.is_paid() {
            "premium"
        } else {
            "free"
        }
    }
}

/// Outcome of an entitlement check.
///
/// `Unknown` means the store could not be consulted. It is a distinct state
/// so callers can render "could not verify" instead of conflating a lookup
/// failure with "not entitled".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementStatus {
    Active,
    Inactive,
    Unknown,
}

fn status_of(user: Option<UserRecord>, now: DateTime<Utc>) -> EntitlementStatus {
    let Some(user) = user else {
        return EntitlementStatus::Inactive;
    };
    let active = user.plan.is_paid()
        && user
            .subscription_end
            .map(|end| end > now)
            .unwrap_or(false);
    if active {
        EntitlementStatus::Active
    } else {
        EntitlementStatus::Inactive
    }
}

pub async fn resolve(store: &dyn UserStore, email: &str, now: DateTime<Utc>) -> EntitlementStatus {
    match store.find_user_by_email(email).await {
        Ok(user) => status_of(user, now),
        Err(e) => {
            error!("Entitlement lookup failed for {}: {:#}", email, e);
            EntitlementStatus::Unknown
        }
    }
}

pub async fn resolve_by_id(
    store: &dyn UserStore,
    user_id: &str,
    now: DateTime<Utc>,
) -> EntitlementStatus {
    match store.find_user_by_id(user_id).await {
        Ok(user) => status_of(user, now),
        Err(e) => {
            error!("Entitlement lookup failed for user {}: {:#}", user_id, e);
            EntitlementStatus::Unknown
        }
    }
}
