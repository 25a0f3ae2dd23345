use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use spotgate::anomaly::AnomalyTracker;
use spotgate::app::{build_router, AppEnv, AppState};
use spotgate::entitlement::PlanTier;
use spotgate::session::{self, SessionClaims};
use spotgate::store::{NewDateCourse, NewReview, UserRecord, UserStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt;

const SIGNING_SECRET: &str = "test-signing-secret";
const WEBHOOK_SECRET: &str = "test-webhook-secret";

#[derive(Default)]
struct FakeStore {
    users: Mutex<HashMap<String, UserRecord>>,
    favorites: Mutex<Vec<(String, String)>>,
    reviews: Mutex<Vec<(String, DateTime<Utc>)>>,
    date_courses: Mutex<Vec<(String, String)>>,
    fail_lookups: bool,
}

#[async_trait::async_trait]
impl UserStore for FakeStore {
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<UserRecord>> {
        if self.fail_lookups {
            anyhow::bail!("store unavailable");
        }
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_user_by_id(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>> {
        if self.fail_lookups {
            anyhow::bail!("store unavailable");
        }
        Ok(self.users.lock().unwrap().get(user_id).cloned())
    }

    async fn count_favorites(&self, user_id: &str) -> anyhow::Result<u64> {
        Ok(self
            .favorites
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == user_id)
            .count() as u64)
    }

    async fn count_reviews_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        Ok(self
            .reviews
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, at)| u == user_id && *at >= from && *at < to)
            .count() as u64)
    }

    async fn count_date_courses(&self, user_id: &str) -> anyhow::Result<u64> {
        Ok(self
            .date_courses
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == user_id)
            .count() as u64)
    }

    async fn create_favorite(&self, user_id: &str, spot_id: &str) -> anyhow::Result<()> {
        self.favorites
            .lock()
            .unwrap()
            .push((user_id.to_string(), spot_id.to_string()));
        Ok(())
    }

    async fn create_review(&self, user_id: &str, _review: &NewReview) -> anyhow::Result<()> {
        self.reviews
            .lock()
            .unwrap()
            .push((user_id.to_string(), Utc::now()));
        Ok(())
    }

    async fn create_date_course(
        &self,
        user_id: &str,
        course: &NewDateCourse,
    ) -> anyhow::Result<()> {
        self.date_courses
            .lock()
            .unwrap()
            .push((user_id.to_string(), course.title.clone()));
        Ok(())
    }

    async fn upsert_subscription(
        &self,
        email: &str,
        plan: PlanTier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.values_mut().find(|u| u.email == email) {
            user.plan = plan;
            user.subscription_start = Some(start);
            user.subscription_end = Some(end);
        } else {
            let id = format!("id-{}", email);
            users.insert(
                id.clone(),
                UserRecord {
                    id,
                    email: email.to_string(),
                    plan,
                    subscription_start: Some(start),
                    subscription_end: Some(end),
                },
            );
        }
        Ok(())
    }

    async fn clear_subscription(&self, email: &str) -> anyhow::Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.values_mut().find(|u| u.email == email) {
            user.plan = PlanTier::Free;
            user.subscription_end = None;
        }
        Ok(())
    }
}

fn premium_user(end: Option<DateTime<Utc>>) -> UserRecord {
    UserRecord {
        id: "u-1".to_string(),
        email: "u1@example.com".to_string(),
        plan: PlanTier::PremiumMonthly,
        subscription_start: Some(Utc::now() - Duration::days(20)),
        subscription_end: end,
    }
}

fn store_with(users: Vec<UserRecord>) -> FakeStore {
    let store = FakeStore::default();
    {
        let mut map = store.users.lock().unwrap();
        for user in users {
            map.insert(user.id.clone(), user);
        }
    }
    store
}

fn app_with(store: Arc<FakeStore>, env: AppEnv) -> Router {
    build_router(AppState {
        store,
        signing_secret: SIGNING_SECRET.to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        env,
        anomaly: AnomalyTracker::new(),
    })
}

fn fresh_bundle(user_id: &str, plan: &str) -> String {
    format!(
        "utage_access=true; utage_access_timestamp={}; userId={}; user_plan={}",
        Utc::now().timestamp_millis(),
        user_id,
        plan
    )
}

fn stale_bundle(user_id: &str, plan: &str) -> String {
    format!(
        "utage_access=true; utage_access_timestamp={}; userId={}; user_plan={}",
        (Utc::now() - Duration::hours(25)).timestamp_millis(),
        user_id,
        plan
    )
}

fn signed_session_token(user_id: &str, email: &str, plan: PlanTier) -> String {
    let claims = SessionClaims {
        user_id: user_id.to_string(),
        email: email.to_string(),
        plan,
        exp: (Utc::now() + Duration::hours(12)).timestamp(),
    };
    session::sign_token(&claims, SIGNING_SECRET).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn set_cookies(response: &axum::response::Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn free_plan_is_always_allowed() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let request = Request::get("/")
        .header("cookie", "user_plan=free; userId=u-9")
        .header("referer", "https://random-site.example/")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn anonymous_request_is_allowed() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let response = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn stale_bundle_is_purged_and_denied_for_lapsed_subscriber() {
    let lapsed = premium_user(Some(Utc::now() - Duration::days(2)));
    let store = Arc::new(store_with(vec![lapsed]));
    let app = app_with(store, AppEnv::Production);

    let request = Request::get("/spots/1")
        .header("cookie", stale_bundle("u-1", "premium"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let cookies = set_cookies(&response);
    assert!(cookies
        .iter()
        .any(|c| c.starts_with("utage_access=;") && c.contains("Max-Age=0")));
    assert!(cookies
        .iter()
        .any(|c| c.starts_with("utage_access_timestamp=;") && c.contains("Max-Age=0")));
    assert!(cookies
        .iter()
        .any(|c| c.starts_with("userId=;") && c.contains("Max-Age=0")));

    let body = body_text(response).await;
    assert!(body.contains("24時間"), "expected the expired-session page");
}

#[tokio::test]
async fn valid_bundle_from_untrusted_origin_is_still_a_session() {
    // The store is down on purpose: a live bundle must not need a lookup.
    let store = Arc::new(FakeStore {
        fail_lookups: true,
        ..FakeStore::default()
    });
    let app = app_with(store, AppEnv::Production);

    let request = Request::get("/spots/1")
        .header("cookie", fresh_bundle("u-1", "premium"))
        .header("referer", "https://random-site.example/")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Rolling TTL: the timestamp is refreshed on every valid hit.
    assert!(set_cookies(&response)
        .iter()
        .any(|c| c.starts_with("utage_access_timestamp=") && !c.contains("Max-Age=0")));
}

#[tokio::test]
async fn trusted_origin_stamps_the_bundle() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let request = Request::get("/spots/1")
        .header("cookie", "userId=u-1; user_plan=premium")
        .header("referer", "https://online.utage-system.com/member/top")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cookies = set_cookies(&response);
    assert!(cookies.iter().any(|c| c.starts_with("utage_access=true")));
    assert!(cookies
        .iter()
        .any(|c| c.starts_with("utage_access_timestamp=")));
    assert!(cookies.iter().any(|c| c.starts_with("userId=u-1")));
    assert!(cookies.iter().all(|c| c.contains("HttpOnly")
        && c.contains("SameSite=Lax")
        && c.contains("Secure")));
}

#[tokio::test]
async fn direct_access_is_allowed_for_confirmed_active_subscriber() {
    let active = premium_user(Some(Utc::now() + Duration::days(10)));
    let store = Arc::new(store_with(vec![active]));
    let app = app_with(store, AppEnv::Production);

    // No bundle, no trusted origin: only the store can vouch for the user.
    let request = Request::get("/spots/1")
        .header("cookie", "userId=u-1; user_plan=premium")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn lapsed_subscriber_without_session_is_denied() {
    let lapsed = premium_user(Some(Utc::now() - Duration::days(1)));
    let store = Arc::new(store_with(vec![lapsed]));
    let app = app_with(store, AppEnv::Production);

    let token = signed_session_token("u-1", "u1@example.com", PlanTier::PremiumMonthly);
    let request = Request::get("/spots/1")
        .header("cookie", format!("session_token={}; user_plan=premium", token))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = body_text(response).await;
    assert!(
        body.contains("有効なプレミアムプランが見つかりません"),
        "expected the inactive-subscription page"
    );
}

#[tokio::test]
async fn store_failure_denies_with_the_verification_message() {
    let store = Arc::new(FakeStore {
        fail_lookups: true,
        ..FakeStore::default()
    });
    let app = app_with(store, AppEnv::Production);

    let request = Request::get("/spots/1")
        .header("cookie", "userId=u-1; user_plan=premium")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = body_text(response).await;
    assert!(
        body.contains("エラーが発生しました"),
        "lookup failure must render the could-not-verify page"
    );
    assert!(
        !body.contains("経由したアクセスが確認できませんでした"),
        "must be distinguishable from the generic deny page"
    );
}

#[tokio::test]
async fn misspelled_login_path_redirects_preserving_query() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let response = app
        .oneshot(
            Request::get("/utage-loign?token=abc&next=%2Fspots%2F1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok()),
        Some("/utage-login?token=abc&next=%2Fspots%2F1")
    );
}

#[tokio::test]
async fn login_exchange_sets_the_bundle_and_redirects() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let token = signed_session_token("u-1", "u1@example.com", PlanTier::PremiumMonthly);
    let request = Request::get(format!("/utage-login?token={}&next=/spots/1", token))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok()),
        Some("/spots/1")
    );

    let cookies = set_cookies(&response);
    assert!(cookies.iter().any(|c| c.starts_with("utage_access=true")));
    assert!(cookies.iter().any(|c| c.starts_with("userId=u-1")));
    assert!(cookies.iter().any(|c| c.starts_with("user_plan=premium")));
    assert!(cookies.iter().any(|c| c.starts_with("session_token=")));
}

#[tokio::test]
async fn login_exchange_rejects_a_bad_token() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let response = app
        .oneshot(
            Request::get("/utage-login?token=garbage")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn anomaly_burst_denies_and_invalidates_in_production() {
    let store = Arc::new(FakeStore {
        fail_lookups: true,
        ..FakeStore::default()
    });
    let app = app_with(store, AppEnv::Production);

    let mut last = None;
    for i in 0..40 {
        let request = Request::get(format!("/spots/{}", i))
            .header("cookie", fresh_bundle("u-1", "premium"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        last = Some(response);
    }
    let last = last.unwrap();
    assert_eq!(last.status(), StatusCode::FORBIDDEN);
    assert!(set_cookies(&last)
        .iter()
        .any(|c| c.starts_with("utage_access=;") && c.contains("Max-Age=0")));
    let body = body_text(last).await;
    assert!(body.contains("アクセスパターン"));
}

#[tokio::test]
async fn hammering_the_login_path_counts_toward_the_window() {
    // The login and webhook endpoints skip the origin/entitlement checks but
    // must still feed the anomaly window, or sensitive-path abuse would be
    // invisible to the gate.
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    for _ in 0..25 {
        let request = Request::get("/utage-login")
            .header("cookie", "userId=u-4; user_plan=free")
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(request).await.unwrap();
    }

    let request = Request::get("/")
        .header("cookie", "userId=u-4; user_plan=free")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(set_cookies(&response)
        .iter()
        .any(|c| c.starts_with("utage_access=;") && c.contains("Max-Age=0")));
    let body = body_text(response).await;
    assert!(body.contains("アクセスパターン"));
}

#[tokio::test]
async fn anomaly_burst_fails_open_outside_production() {
    let store = Arc::new(FakeStore {
        fail_lookups: true,
        ..FakeStore::default()
    });
    let app = app_with(store, AppEnv::Development);

    for i in 0..40 {
        let request = Request::get(format!("/spots/{}", i))
            .header("cookie", fresh_bundle("u-1", "premium"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {} was blocked", i);
    }
}

#[tokio::test]
async fn free_user_at_favorites_ceiling_is_rejected_with_upgrade_prompt() {
    let store = Arc::new(store_with(vec![]));
    {
        let mut favorites = store.favorites.lock().unwrap();
        for i in 0..10 {
            favorites.push(("u-2".to_string(), format!("spot-{}", i)));
        }
    }
    let app = app_with(store.clone(), AppEnv::Production);

    let request = Request::post("/api/favorites")
        .header("content-type", "application/json")
        .header("cookie", "userId=u-2; user_plan=free")
        .body(Body::from(json!({"spot_id": "spot-new"}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["status"], "limit_reached");
    assert_eq!(body["resource"], "favorites");
    assert_eq!(body["limit"], 10);
    assert_eq!(body["used"], 10);
    assert_eq!(store.favorites.lock().unwrap().len(), 10, "no row was written");
}

#[tokio::test]
async fn premium_user_is_not_limited_on_favorites() {
    let store = Arc::new(store_with(vec![]));
    {
        let mut favorites = store.favorites.lock().unwrap();
        for i in 0..10 {
            favorites.push(("u-1".to_string(), format!("spot-{}", i)));
        }
    }
    let app = app_with(store.clone(), AppEnv::Production);

    let request = Request::post("/api/favorites")
        .header("content-type", "application/json")
        .header("cookie", fresh_bundle("u-1", "premium"))
        .body(Body::from(json!({"spot_id": "spot-new"}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(store.favorites.lock().unwrap().len(), 11);
}

#[tokio::test]
async fn free_user_review_limit_is_scoped_to_the_month() {
    let store = Arc::new(store_with(vec![]));
    {
        let mut reviews = store.reviews.lock().unwrap();
        // three this month hits the ceiling; old ones do not count
        for _ in 0..3 {
            reviews.push(("u-2".to_string(), Utc::now()));
        }
        reviews.push(("u-2".to_string(), Utc::now() - Duration::days(60)));
    }
    let app = app_with(store.clone(), AppEnv::Production);

    let request = Request::post("/api/reviews")
        .header("content-type", "application/json")
        .header("cookie", "userId=u-2; user_plan=free")
        .body(Body::from(
            json!({"spot_id": "spot-1", "rating": 4, "body": "よかったです"}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["status"], "limit_reached");
    assert_eq!(body["resource"], "reviews");
}

#[tokio::test]
async fn write_endpoints_require_identity() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let request = Request::post("/api/favorites")
        .header("content-type", "application/json")
        .body(Body::from(json!({"spot_id": "spot-1"}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

fn sign_webhook(body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).expect("static key is valid");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn webhook_request(body: String, signature: &str) -> Request<Body> {
    Request::post("/webhook/utage")
        .header("content-type", "application/json")
        .header("x-utage-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn webhook_rejects_a_bad_signature() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let body = json!({"event": "payment.succeeded"}).to_string();
    let response = app
        .oneshot(webhook_request(body, "sha256=deadbeef"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_payment_succeeded_upserts_the_subscription() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store.clone(), AppEnv::Production);

    let end = Utc::now() + Duration::days(30);
    let body = json!({
        "event": "payment.succeeded",
        "email": "new@example.com",
        "plan": "premium_monthly",
        "period_start": Utc::now().to_rfc3339(),
        "period_end": end.to_rfc3339(),
    })
    .to_string();
    let signature = sign_webhook(&body);
    let response = app.oneshot(webhook_request(body, &signature)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let users = store.users.lock().unwrap();
    let user = users
        .values()
        .find(|u| u.email == "new@example.com")
        .expect("user should exist after payment");
    assert_eq!(user.plan, PlanTier::PremiumMonthly);
    assert!(user.subscription_end.is_some());
}

#[tokio::test]
async fn webhook_cancel_resets_the_plan() {
    let active = premium_user(Some(Utc::now() + Duration::days(10)));
    let store = Arc::new(store_with(vec![active]));
    let app = app_with(store.clone(), AppEnv::Production);

    let body = json!({
        "event": "subscription.canceled",
        "email": "u1@example.com",
    })
    .to_string();
    let signature = sign_webhook(&body);
    let response = app.oneshot(webhook_request(body, &signature)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let users = store.users.lock().unwrap();
    let user = users.get("u-1").unwrap();
    assert_eq!(user.plan, PlanTier::Free);
    assert!(user.subscription_end.is_none());
}

#[tokio::test]
async fn webhook_ignores_unknown_events() {
    let store = Arc::new(store_with(vec![]));
    let app = app_with(store, AppEnv::Production);

    let body = json!({"event": "member.updated", "email": "x@example.com"}).to_string();
    let signature = sign_webhook(&body);
    let response = app.oneshot(webhook_request(body, &signature)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
