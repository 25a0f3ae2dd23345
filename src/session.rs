//! Session token verification and the Utage cookie bundle.
//!
//! Two independent notions of "session" coexist here: a signed session token
//! (HMAC-SHA256 over a JSON payload, carried in the `session_token` cookie)
//! and the plaintext companion bundle the partner login flow stamps
//! (`utage_access`, `utage_access_timestamp`, `userId`, `user_plan`). The
//! bundle rolls on a fixed 24h TTL; the token carries verified claims.

use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::entitlement::PlanTier;

pub const COOKIE_ACCESS: &str = "utage_access";
pub const COOKIE_TIMESTAMP: &str = "utage_access_timestamp";
pub const COOKIE_USER_ID: &str = "userId";
pub const COOKIE_PLAN: &str = "user_plan";
pub const COOKIE_TOKEN: &str = "session_token";

pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;
pub const SESSION_TTL_MS: i64 = SESSION_TTL_SECS * 1000;

/// Claims carried by the signed session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub email: String,
    pub plan: PlanTier,
    /// Expiry, epoch seconds.
    pub exp: i64,
}

/// Signs claims into the compact `hex(payload).hex(sig)` token format.
pub fn sign_token(claims: &SessionClaims, secret: &str) -> anyhow::Result<String> {
    let payload = serde_json::to_vec(claims)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow::anyhow!("invalid signing key"))?;
    mac.update(&payload);
    let sig = mac.finalize().into_bytes();
    Ok(format!("{}.{}", hex::encode(&payload), hex::encode(sig)))
}

/// Verifies a session token and returns its claims.
///
/// Any defect - missing parts, bad hex, signature mismatch, expired `exp`,
/// unparsable payload - yields `None`. Callers treat `None` as anonymous;
/// verification never errors.
pub fn verify_token(token: &str, secret: &str, now: DateTime<Utc>) -> Option<SessionClaims> {
    let (payload_hex, sig_hex) = token.split_once('.')?;
    let payload = hex::decode(payload_hex).ok()?;
    let expected = hex::decode(sig_hex).ok()?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(&payload);
    let computed = mac.finalize().into_bytes();
    if expected.len() != computed.len() || !constant_time_eq(&computed, &expected) {
        return None;
    }

    let claims: SessionClaims = serde_json::from_slice(&payload).ok()?;
    if claims.exp <= now.timestamp() {
        return None;
    }
    Some(claims)
}

/// The raw cookie bundle as read off a request. Fields are `None` when the
/// cookie is absent; internal consistency is judged by [`evaluate_freshness`].
#[derive(Debug, Clone, Default)]
pub struct CookieBundle {
    pub access: Option<String>,
    pub timestamp: Option<String>,
    pub user_id: Option<String>,
    pub plan: Option<String>,
    pub token: Option<String>,
}

pub fn read_bundle(headers: &HeaderMap) -> CookieBundle {
    use headers::HeaderMapExt;
    match headers.typed_get::<headers::Cookie>() {
        Some(cookie) => bundle_from_cookie(&cookie),
        None => CookieBundle::default(),
    }
}

pub fn bundle_from_cookie(cookie: &headers::Cookie) -> CookieBundle {
    let get = |name: &str| cookie.get(name).map(|v| v.to_string());
    CookieBundle {
        access: get(COOKIE_ACCESS),
        timestamp: get(COOKIE_TIMESTAMP),
        user_id: get(COOKIE_USER_ID),
        plan: get(COOKIE_PLAN),
        token: get(COOKIE_TOKEN),
    }
}

/// Rolling-window state of the cookie bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    NoSession,
    Valid,
    Expired,
}

/// Classifies the bundle against the 24h TTL.
///
/// A flag without a parsable timestamp is a broken bundle and classifies as
/// `Expired` so the caller purges it rather than trusting half a grant.
pub fn evaluate_freshness(bundle: &CookieBundle, now: DateTime<Utc>) -> Freshness {
    match bundle.access.as_deref() {
        Some("true") => {}
        _ => return Freshness::NoSession,
    }
    let Some(ts) = bundle.timestamp.as_deref().and_then(|t| t.parse::<i64>().ok()) else {
        return Freshness::Expired;
    };
    let age_ms = now.timestamp_millis() - ts;
    if age_ms >= SESSION_TTL_MS {
        Freshness::Expired
    } else {
        Freshness::Valid
    }
}

/// Serializes one cookie with the attributes every bundle cookie shares:
/// httpOnly, SameSite=Lax, Path=/ and Secure in production.
pub fn build_cookie(name: &str, value: &str, max_age_secs: i64, secure: bool) -> String {
    format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax{}",
        name,
        value,
        max_age_secs,
        if secure { "; Secure" } else { "" }
    )
}

fn expire_cookie(name: &str, secure: bool) -> String {
    build_cookie(name, "", 0, secure)
}

/// Full bundle stamped after a confirmed partner login or a trusted-origin hit.
pub fn bundle_cookies(
    user_id: &str,
    plan_label: &str,
    now: DateTime<Utc>,
    secure: bool,
) -> Vec<String> {
    vec![
        build_cookie(COOKIE_ACCESS, "true", SESSION_TTL_SECS, secure),
        build_cookie(
            COOKIE_TIMESTAMP,
            &now.timestamp_millis().to_string(),
            SESSION_TTL_SECS,
            secure,
        ),
        build_cookie(COOKIE_USER_ID, user_id, SESSION_TTL_SECS, secure),
        build_cookie(COOKIE_PLAN, plan_label, SESSION_TTL_SECS, secure),
    ]
}

/// Grant window without a known identity: only the flag and timestamp.
pub fn anonymous_grant_cookies(now: DateTime<Utc>, secure: bool) -> Vec<String> {
    vec![
        build_cookie(COOKIE_ACCESS, "true", SESSION_TTL_SECS, secure),
        build_cookie(
            COOKIE_TIMESTAMP,
            &now.timestamp_millis().to_string(),
            SESSION_TTL_SECS,
            secure,
        ),
    ]
}

/// Resets the rolling window on a request where validity holds.
pub fn refresh_timestamp_cookie(now: DateTime<Utc>, secure: bool) -> String {
    build_cookie(
        COOKIE_TIMESTAMP,
        &now.timestamp_millis().to_string(),
        SESSION_TTL_SECS,
        secure,
    )
}

/// Deletes the grant cookies. `user_plan` survives a purge: it is a plan
/// label, not part of the rolling grant.
pub fn purge_cookies(secure: bool) -> Vec<String> {
    vec![
        expire_cookie(COOKIE_ACCESS, secure),
        expire_cookie(COOKIE_TIMESTAMP, secure),
        expire_cookie(COOKIE_USER_ID, secure),
    ]
}
