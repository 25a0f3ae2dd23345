//! Edge gate: every request passes through [`gate_middleware`] before any
//! handler runs. Combines origin classification, session freshness, the
//! anomaly heuristic and the entitlement check into an allow/deny decision;
//! denials render a self-contained HTML page, never a bare status code,
//! because end users hit these paths in a browser.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
use chrono::Utc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::entitlement::{self, EntitlementStatus};
use crate::origin;
use crate::session::{self, Freshness};

pub const LOGIN_PATH: &str = "/utage-login";
/// A misspelled login URL circulated in partner mails for a while; requests
/// to it are redirected rather than broken.
pub const LOGIN_PATH_MISSPELLED: &str = "/utage-loign";

pub const MEMBER_PORTAL_URL: &str = "https://online.utage-system.com/member/login";

/// Paths exempt from the origin and entitlement checks: the login entry point
/// itself, health, and the partner webhook (authenticated by signature, not
/// session). Anomaly bookkeeping still sees them.
const UNGATED_PATHS: [&str; 3] = [LOGIN_PATH, "/health", "/webhook/utage"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    SessionExpired,
    SubscriptionInactive,
    VerificationFailed,
    Anomalous,
    Generic,
}

impl DenyReason {
    fn title(&self) -> &'static str {
        match self {
            DenyReason::SessionExpired => "セッションの有効期限が切れました",
            DenyReason::SubscriptionInactive => "有効なプランが確認できません",
            DenyReason::VerificationFailed => "プランを確認できませんでした",
            DenyReason::Anomalous => "アクセスを一時的に制限しています",
            DenyReason::Generic => "アクセスが確認できません",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            DenyReason::SessionExpired => {
                "ログインから24時間が経過しました。お手数ですが、会員サイトから再度ログインしてください。"
            }
            DenyReason::SubscriptionInactive => {
                "ログインは確認できましたが、現在有効なプレミアムプランが見つかりません。会員サイトでご契約状況をご確認ください。"
            }
            DenyReason::VerificationFailed => {
                "ご契約状況の確認中にエラーが発生しました。時間をおいて再度お試しください。解決しない場合は会員サイトからログインし直してください。"
            }
            DenyReason::Anomalous => {
                "通常と異なるアクセスパターンを検出したため、安全のためセッションを無効化しました。会員サイトから再度ログインしてください。"
            }
            DenyReason::Generic => {
                "会員サイトを経由したアクセスが確認できませんでした。会員サイトからログインしてご利用ください。"
            }
        }
    }
}

/// Renders the 403 deny page. Self-contained HTML: no external assets.
pub fn deny_page(reason: DenyReason, attempted_path: &str) -> Response {
    let login_link = format!(
        "{}?next={}",
        LOGIN_PATH,
        urlencoding::encode(attempted_path)
    );
    let html = format!(
        r#"<!DOCTYPE html>
<html lang="ja">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
  body {{ font-family: sans-serif; background: #faf7f5; color: #333; margin: 0; }}
  main {{ max-width: 480px; margin: 10vh auto; padding: 2rem; background: #fff;
         border-radius: 8px; box-shadow: 0 2px 8px rgba(0,0,0,0.08); }}
  h1 {{ font-size: 1.2rem; }}
  p {{ line-height: 1.7; }}
  a.button {{ display: block; text-align: center; margin-top: 1rem; padding: 0.8rem;
             background: #e0526e; color: #fff; border-radius: 6px; text-decoration: none; }}
  a.plain {{ display: block; text-align: center; margin-top: 0.8rem; color: #888; }}
</style>
</head>
<body>
<main>
  <h1>{title}</h1>
  <p>{message}</p>
  <a class="button" href="{portal}">会員サイトへ</a>
  <a class="plain" href="{login_link}">再ログインする</a>
  <a class="plain" href="javascript:history.back()">前のページに戻る</a>
  <a class="plain" href="/">ホームへ戻る</a>
</main>
</body>
</html>
"#,
        title = reason.title(),
        message = reason.message(),
        portal = MEMBER_PORTAL_URL,
        login_link = login_link,
    );
    (StatusCode::FORBIDDEN, Html(html)).into_response()
}

/// Appends Set-Cookie headers to a response.
pub fn append_cookies(response: &mut Response, cookies: Vec<String>) {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-real-ip"))
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
}

pub async fn gate_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if path == LOGIN_PATH_MISSPELLED {
        let target = match request.uri().query() {
            Some(query) => format!("{}?{}", LOGIN_PATH, query),
            None => LOGIN_PATH.to_string(),
        };
        return Redirect::permanent(&target).into_response();
    }

    let headers = request.headers().clone();
    let now = Utc::now();
    let secure = state.env.is_production();

    let bundle = session::read_bundle(&headers);
    let claims = bundle
        .token
        .as_deref()
        .and_then(|t| session::verify_token(t, &state.signing_secret, now));

    // Anomaly bookkeeping happens before any allow branch, the exempt paths
    // included: the login and webhook endpoints are exactly the ones the
    // sensitive-path rule watches, so they must land in the window.
    let known_user = claims
        .as_ref()
        .map(|c| c.user_id.clone())
        .or_else(|| bundle.user_id.clone());
    if let Some(user_id) = known_user.as_deref() {
        let ip = client_ip(&headers);
        if let Some(reason) = state.anomaly.record(user_id, &path, now, ip.as_deref()).await {
            if state.env.is_production() {
                warn!(
                    "Anomalous pattern ({}) for user {}, invalidating session",
                    reason.as_str(),
                    user_id
                );
                let mut response = deny_page(DenyReason::Anomalous, &path);
                append_cookies(&mut response, session::purge_cookies(secure));
                return response;
            }
            warn!(
                "Anomalous pattern ({}) for user {} ignored outside production",
                reason.as_str(),
                user_id
            );
        }
    }

    if UNGATED_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let trusted = origin::is_trusted_origin(&headers)
        || (!state.env.is_production() && origin::is_dev_tunnel_host(&headers));
    let freshness = session::evaluate_freshness(&bundle, now);

    // Plan tier: verified claim first, plaintext cookie as the documented
    // fallback when no verified session exists.
    let paid = claims
        .as_ref()
        .map(|c| c.plan.is_paid())
        .or_else(|| bundle.plan.as_deref().map(|p| p == "premium"))
        .unwrap_or(false);

    let mut set_cookies: Vec<String> = Vec::new();
    match freshness {
        // Rolling TTL: every valid hit resets the window.
        Freshness::Valid => set_cookies.push(session::refresh_timestamp_cookie(now, secure)),
        Freshness::Expired => set_cookies.extend(session::purge_cookies(secure)),
        Freshness::NoSession => {
            if trusted {
                match known_user.as_deref() {
                    Some(user_id) => {
                        let label = if paid { "premium" } else { "free" };
                        set_cookies.extend(session::bundle_cookies(user_id, label, now, secure));
                    }
                    None => set_cookies.extend(session::anonymous_grant_cookies(now, secure)),
                }
            }
        }
    }

    if paid && !trusted && freshness != Freshness::Valid {
        // Direct access without a live grant: the store has the last word.
        let status = match claims.as_ref() {
            Some(c) => entitlement::resolve(state.store.as_ref(), &c.email, now).await,
            None => match bundle.user_id.as_deref() {
                Some(user_id) => {
                    entitlement::resolve_by_id(state.store.as_ref(), user_id, now).await
                }
                None => EntitlementStatus::Inactive,
            },
        };
        match status {
            EntitlementStatus::Active => {
                info!("Direct access allowed for active subscriber on {}", path);
            }
            EntitlementStatus::Inactive => {
                let reason = if freshness == Freshness::Expired {
                    DenyReason::SessionExpired
                } else if claims.is_some() {
                    DenyReason::SubscriptionInactive
                } else {
                    DenyReason::Generic
                };
                let mut response = deny_page(reason, &path);
                append_cookies(&mut response, set_cookies);
                return response;
            }
            EntitlementStatus::Unknown => {
                let mut response = deny_page(DenyReason::VerificationFailed, &path);
                append_cookies(&mut response, set_cookies);
                return response;
            }
        }
    }

    let mut response = next.run(request).await;
    append_cookies(&mut response, set_cookies);
    response
}
