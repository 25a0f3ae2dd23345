//! Per-plan usage ceilings for countable resources.
//!
//! Counting and the subsequent write are not transactionally coupled, so two
//! simultaneous writes from the same user can overshoot a ceiling by one.
//! That race is accepted; nothing here claims exact enforcement.

use anyhow::Result;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;

use crate::entitlement::PlanTier;
use crate::store::UserStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Favorites,
    Reviews,
    DateCourses,
}

/// Ceilings for one plan. `None` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct PlanCeilings {
    pub favorites: Option<u64>,
    pub reviews_per_month: Option<u64>,
    pub date_courses: Option<u64>,
}

impl PlanCeilings {
    fn get(&self, resource: Resource) -> Option<u64> {
        match resource {
            Resource::Favorites => self.favorites,
            Resource::Reviews => self.reviews_per_month,
            Resource::DateCourses => self.date_courses,
        }
    }
}

static PLAN_CEILINGS: Lazy<HashMap<PlanTier, PlanCeilings>> = Lazy::new(|| {
    let unlimited = PlanCeilings {
        favorites: None,
        reviews_per_month: None,
        date_courses: None,
    };
    HashMap::from([
        (
            PlanTier::Free,
            PlanCeilings {
                favorites: Some(10),
                reviews_per_month: Some(3),
                date_courses: Some(1),
            },
        ),
        (PlanTier::PremiumMonthly, unlimited),
        (PlanTier::PremiumYearly, unlimited),
    ])
});

pub fn ceilings_for(tier: PlanTier) -> PlanCeilings {
    PLAN_CEILINGS[&tier]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    LimitReached {
        resource: Resource,
        limit: u64,
        used: u64,
    },
}

/// UTC calendar month containing `now`, as a half-open interval.
pub fn month_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .unwrap();
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let end = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).unwrap();
    (start, end)
}

/// Counts the user's existing rows for `resource` and compares against the
/// plan ceiling. Review counts are scoped to the current calendar month.
pub async fn enforce(
    store: &dyn UserStore,
    tier: PlanTier,
    resource: Resource,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<LimitDecision> {
    let Some(limit) = ceilings_for(tier).get(resource) else {
        return Ok(LimitDecision::Allowed);
    };
    let used = match resource {
        Resource::Favorites => store.count_favorites(user_id).await?,
        Resource::Reviews => {
            let (from, to) = month_window(now);
            store.count_reviews_between(user_id, from, to).await?
        }
        Resource::DateCourses => store.count_date_courses(user_id).await?,
    };
    if used >= limit {
        Ok(LimitDecision::LimitReached {
            resource,
            limit,
            used,
        })
    } else {
        Ok(LimitDecision::Allowed)
    }
}
