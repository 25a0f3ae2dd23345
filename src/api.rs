//! Gated write endpoints: favorites, reviews, date-course proposals.
//!
//! Each handler resolves the caller, runs the usage-limit check for its
//! resource and then performs the write. Responses are a discriminated
//! union: `created` or `limit_reached` with the upgrade prompt.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::TypedHeader;
use chrono::Utc;
use headers::Cookie;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::app::AppState;
use crate::entitlement::PlanTier;
use crate::limits::{self, LimitDecision, Resource};
use crate::session;
use crate::store::{NewDateCourse, NewReview};

const UPGRADE_MESSAGE: &str =
    "無料プランの上限に達しました。プレミアムプランへのアップグレードをご検討ください。";

#[derive(Debug, Deserialize)]
pub struct AddFavoriteRequest {
    pub spot_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PostReviewRequest {
    pub spot_id: String,
    pub rating: u8,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct ProposeDateCourseRequest {
    pub title: String,
    pub spot_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteResponse {
    Created,
    LimitReached {
        resource: Resource,
        limit: u64,
        used: u64,
        message: &'static str,
    },
}

struct Caller {
    user_id: String,
    tier: PlanTier,
}

fn resolve_caller(cookie: Option<&Cookie>, state: &AppState) -> Option<Caller> {
    let bundle = cookie
        .map(session::bundle_from_cookie)
        .unwrap_or_default();
    let now = Utc::now();
    if let Some(claims) = bundle
        .token
        .as_deref()
        .and_then(|t| session::verify_token(t, &state.signing_secret, now))
    {
        return Some(Caller {
            user_id: claims.user_id,
            tier: claims.plan,
        });
    }
    // Cookie fallback. The label is lossy but both premium tiers share the
    // same (unlimited) ceilings, so mapping "premium" to monthly is exact
    // for limit purposes.
    let user_id = bundle.user_id?;
    let tier = match bundle.plan.as_deref() {
        Some("premium") => PlanTier::PremiumMonthly,
        _ => PlanTier::Free,
    };
    Some(Caller { user_id, tier })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"status": "error", "message": "Login required"})),
    )
        .into_response()
}

fn store_error() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({"status": "error", "message": "Store unavailable"})),
    )
        .into_response()
}

fn limit_reached(resource: Resource, limit: u64, used: u64) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(WriteResponse::LimitReached {
            resource,
            limit,
            used,
            message: UPGRADE_MESSAGE,
        }),
    )
        .into_response()
}

async fn check_limit(state: &AppState, caller: &Caller, resource: Resource) -> Result<(), Response> {
    match limits::enforce(
        state.store.as_ref(),
        caller.tier,
        resource,
        &caller.user_id,
        Utc::now(),
    )
    .await
    {
        Ok(LimitDecision::Allowed) => Ok(()),
        Ok(LimitDecision::LimitReached {
            resource,
            limit,
            used,
        }) => {
            info!(
                "Limit reached for user {} on {:?} ({}/{})",
                caller.user_id, resource, used, limit
            );
            Err(limit_reached(resource, limit, used))
        }
        Err(e) => {
            error!("Usage count failed for user {}: {:#}", caller.user_id, e);
            Err(store_error())
        }
    }
}

pub async fn add_favorite(
    State(state): State<AppState>,
    cookie: Option<TypedHeader<Cookie>>,
    Json(request): Json<AddFavoriteRequest>,
) -> Response {
    let Some(caller) = resolve_caller(cookie.as_deref(), &state) else {
        return unauthorized();
    };
    if let Err(response) = check_limit(&state, &caller, Resource::Favorites).await {
        return response;
    }
    if let Err(e) = state
        .store
        .create_favorite(&caller.user_id, &request.spot_id)
        .await
    {
        error!("Failed to create favorite: {:#}", e);
        return store_error();
    }
    (StatusCode::CREATED, Json(WriteResponse::Created)).into_response()
}

pub async fn post_review(
    State(state): State<AppState>,
    cookie: Option<TypedHeader<Cookie>>,
    Json(request): Json<PostReviewRequest>,
) -> Response {
    let Some(caller) = resolve_caller(cookie.as_deref(), &state) else {
        return unauthorized();
    };
    if !(1..=5).contains(&request.rating) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"status": "error", "message": "Rating must be between 1 and 5"})),
        )
            .into_response();
    }
    if let Err(response) = check_limit(&state, &caller, Resource::Reviews).await {
        return response;
    }
    let review = NewReview {
        spot_id: request.spot_id,
        rating: request.rating,
        body: request.body,
    };
    if let Err(e) = state.store.create_review(&caller.user_id, &review).await {
        error!("Failed to create review: {:#}", e);
        return store_error();
    }
    (StatusCode::CREATED, Json(WriteResponse::Created)).into_response()
}

pub async fn propose_date_course(
    State(state): State<AppState>,
    cookie: Option<TypedHeader<Cookie>>,
    Json(request): Json<ProposeDateCourseRequest>,
) -> Response {
    let Some(caller) = resolve_caller(cookie.as_deref(), &state) else {
        return unauthorized();
    };
    if request.spot_ids.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"status": "error", "message": "A date course needs at least one spot"})),
        )
            .into_response();
    }
    if let Err(response) = check_limit(&state, &caller, Resource::DateCourses).await {
        return response;
    }
    let course = NewDateCourse {
        title: request.title,
        spot_ids: request.spot_ids,
    };
    if let Err(e) = state
        .store
        .create_date_course(&caller.user_id, &course)
        .await
    {
        error!("Failed to create date course: {:#}", e);
        return store_error();
    }
    (StatusCode::CREATED, Json(WriteResponse::Created)).into_response()
}
