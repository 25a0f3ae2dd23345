//! Service wiring: state, router, the partner login exchange and the billing
//! webhook that keeps user plans in sync.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::{env, net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

use crate::anomaly::AnomalyTracker;
use crate::api;
use crate::entitlement::PlanTier;
use crate::gate::{self, DenyReason};
use crate::session;
use crate::store::{HttpStore, UserStore};

const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB safety cap
const DEFAULT_BIND: ([u8; 4], u16) = ([0, 0, 0, 0], 4117);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Production,
    Development,
}

impl AppEnv {
    /// Reads `APP_ENV`. Only the two known values are accepted: a typo like
    /// `prod` must fail startup rather than silently enable the development
    /// origin bypass. Unset means development.
    pub fn from_env() -> Result<Self> {
        match env::var("APP_ENV") {
            Ok(value) if value == "production" => Ok(AppEnv::Production),
            Ok(value) if value == "development" => Ok(AppEnv::Development),
            Ok(value) => Err(anyhow::anyhow!(
                "unrecognized APP_ENV value {:?} (expected \"production\" or \"development\")",
                value
            )),
            Err(_) => Ok(AppEnv::Development),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, AppEnv::Production)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn UserStore>,
    pub signing_secret: String,
    pub webhook_secret: String,
    pub env: AppEnv,
    pub anomaly: AnomalyTracker,
}

pub async fn run_server() -> Result<()> {
    let store: Arc<dyn UserStore> = Arc::new(HttpStore::from_env()?);

    let signing_secret = env::var("SESSION_SIGNING_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("SESSION_SIGNING_SECRET must be set"))?;
    let webhook_secret = env::var("UTAGE_WEBHOOK_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("UTAGE_WEBHOOK_SECRET must be set"))?;

    let app_env = AppEnv::from_env()?;
    if !app_env.is_production() {
        warn!("Running in development mode: dev-tunnel hosts bypass the origin check");
    }

    let state = AppState {
        store,
        signing_secret,
        webhook_secret,
        env: app_env,
        anomaly: AnomalyTracker::new(),
    };

    let app = build_router(state);

    let addr = match env::var("BIND_ADDR") {
        Ok(raw) => raw.parse::<SocketAddr>()?,
        Err(_) => SocketAddr::from(DEFAULT_BIND),
    };
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/spots/:spot_id", get(spot_page))
        .route("/health", get(health))
        .route(gate::LOGIN_PATH, get(login_exchange))
        .route("/webhook/utage", post(handle_webhook))
        .route("/api/favorites", post(api::add_favorite))
        .route("/api/reviews", post(api::post_review))
        .route("/api/date-courses", post(api::propose_date_course))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gate::gate_middleware,
        ))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn home() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html><html lang=\"ja\"><head><meta charset=\"utf-8\">\
         <title>デートスポットを探す</title></head>\
         <body><h1>デートスポットを探す</h1>\
         <p>エリアやシーンからデートスポットを検索できます。</p></body></html>",
    )
}

async fn spot_page(Path(spot_id): Path<String>) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html><html lang=\"ja\"><head><meta charset=\"utf-8\">\
         <title>スポット詳細</title></head>\
         <body><h1>スポット {}</h1></body></html>",
        spot_id
    ))
}

#[derive(Deserialize)]
struct LoginQuery {
    token: String,
    #[serde(default)]
    next: Option<String>,
}

/// Partner login exchange: Utage redirects members back here with a signed
/// token in the query string. A valid token stamps the cookie bundle and
/// forwards to the requested page.
async fn login_exchange(State(state): State<AppState>, Query(query): Query<LoginQuery>) -> Response {
    let now = Utc::now();
    let Some(claims) = session::verify_token(&query.token, &state.signing_secret, now) else {
        warn!("Login exchange with invalid or expired token");
        return gate::deny_page(DenyReason::Generic, "/");
    };

    info!("Login exchange succeeded for user {}", claims.user_id);
    let secure = state.env.is_production();
    let mut cookies = session::bundle_cookies(
        &claims.user_id,
        claims.plan.cookie_label(),
        now,
        secure,
    );
    cookies.push(session::build_cookie(
        session::COOKIE_TOKEN,
        &query.token,
        session::SESSION_TTL_SECS,
        secure,
    ));

    // Only local absolute paths are honored; anything else goes home.
    let destination = query
        .next
        .as_deref()
        .filter(|n| n.starts_with('/') && !n.starts_with("//"))
        .unwrap_or("/");
    let mut response = Redirect::to(destination).into_response();
    gate::append_cookies(&mut response, cookies);
    response
}

/// Billing events from Utage. Plans are created on first successful payment
/// and reset to free on cancellation or refund.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
enum UtageEvent {
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded {
        email: String,
        plan: PlanTier,
        period_start: String,
        period_end: String,
    },
    #[serde(rename = "subscription.canceled")]
    SubscriptionCanceled { email: String },
    #[serde(rename = "payment.refunded")]
    PaymentRefunded { email: String },
    #[serde(other)]
    Unknown,
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    // Enforce content type
    let content_type_ok = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        == Some(true);
    if !content_type_ok {
        warn!(
            "Rejecting webhook: unsupported content-type {:?}",
            headers.get(header::CONTENT_TYPE)
        );
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(json!({"status": "error", "message": "Unsupported content type"})),
        );
    }

    if !verify_utage_signature(&headers, &body, &state.webhook_secret) {
        warn!("Webhook signature verification failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "error", "message": "Invalid signature"})),
        );
    }

    let event: UtageEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejecting webhook: invalid JSON body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": "Invalid payload format"})),
            );
        }
    };

    let outcome = match event {
        UtageEvent::PaymentSucceeded {
            email,
            plan,
            period_start,
            period_end,
        } => {
            let parsed = period_start
                .parse::<DateTime<Utc>>()
                .and_then(|start| period_end.parse::<DateTime<Utc>>().map(|end| (start, end)));
            match parsed {
                Ok((start, end)) => {
                    info!("Payment succeeded for {}, plan {:?} until {}", email, plan, end);
                    state.store.upsert_subscription(&email, plan, start, end).await
                }
                Err(e) => {
                    warn!("Rejecting webhook: invalid period timestamps: {}", e);
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"status": "error", "message": "Invalid period timestamps"})),
                    );
                }
            }
        }
        UtageEvent::SubscriptionCanceled { email } | UtageEvent::PaymentRefunded { email } => {
            info!("Subscription ended for {}, resetting to free", email);
            state.store.clear_subscription(&email).await
        }
        UtageEvent::Unknown => {
            info!("Ignoring webhook with unsupported event type");
            return (
                StatusCode::OK,
                Json(json!({"status": "success", "message": "Event received but not processed"})),
            );
        }
    };

    match outcome {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "success", "message": "Event processed"})),
        ),
        Err(e) => {
            error!("Failed to apply billing event: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": "Failed to apply event"})),
            )
        }
    }
}

fn verify_utage_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
    let Some(sig_header) = headers
        .get("x-utage-signature")
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let sig_hex = sig_header.strip_prefix("sha256=").unwrap_or(sig_header);
    let Ok(expected) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    expected.len() == computed.len() && constant_time_eq(&computed, &expected)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
