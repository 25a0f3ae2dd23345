//! Access to the user store. The real store sits behind an internal REST
//! service; tests substitute an in-memory fake through [`UserStore`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::env;

use crate::entitlement::PlanTier;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub plan: PlanTier,
    pub subscription_start: Option<DateTime<Utc>>,
    pub subscription_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewReview {
    pub spot_id: String,
    pub rating: u8,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct NewDateCourse {
    pub title: String,
    pub spot_ids: Vec<String>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>>;

    async fn count_favorites(&self, user_id: &str) -> Result<u64>;
    async fn count_reviews_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64>;
    async fn count_date_courses(&self, user_id: &str) -> Result<u64>;

    async fn create_favorite(&self, user_id: &str, spot_id: &str) -> Result<()>;
    async fn create_review(&self, user_id: &str, review: &NewReview) -> Result<()>;
    async fn create_date_course(&self, user_id: &str, course: &NewDateCourse) -> Result<()>;

    async fn upsert_subscription(
        &self,
        email: &str,
        plan: PlanTier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()>;
    async fn clear_subscription(&self, email: &str) -> Result<()>;
}

/// User row as the store API serializes it. Timestamps travel as RFC 3339
/// strings and are parsed here.
#[derive(Debug, Deserialize)]
struct UserWire {
    id: String,
    email: String,
    plan: PlanTier,
    #[serde(default)]
    subscription_start: Option<String>,
    #[serde(default)]
    subscription_end: Option<String>,
}

impl UserWire {
    fn into_record(self) -> Result<UserRecord> {
        let parse = |field: &str, value: Option<String>| -> Result<Option<DateTime<Utc>>> {
            value
                .map(|v| {
                    v.parse::<DateTime<Utc>>()
                        .with_context(|| format!("invalid {} timestamp: {}", field, v))
                })
                .transpose()
        };
        Ok(UserRecord {
            subscription_start: parse("subscription_start", self.subscription_start)?,
            subscription_end: parse("subscription_end", self.subscription_end)?,
            id: self.id,
            email: self.email,
            plan: self.plan,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CountWire {
    count: u64,
}

pub struct HttpStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpStore {
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("STORE_API_URL").context("STORE_API_URL must be set")?;
        let api_key = env::var("STORE_API_KEY").context("STORE_API_KEY must be set")?;
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn find_user(&self, url: String) -> Result<Option<UserRecord>> {
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("user lookup failed with status {}", response.status()));
        }
        let wire: UserWire = response.json().await?;
        Ok(Some(wire.into_record()?))
    }

    async fn count(&self, url: String) -> Result<u64> {
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("count failed with status {}", response.status()));
        }
        let wire: CountWire = response.json().await?;
        Ok(wire.count)
    }

    async fn post_json(&self, url: String, body: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("write failed with status {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for HttpStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        self.find_user(self.url(&format!("/users?email={}", urlencoding::encode(email))))
            .await
    }

    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>> {
        self.find_user(self.url(&format!("/users/{}", urlencoding::encode(user_id))))
            .await
    }

    async fn count_favorites(&self, user_id: &str) -> Result<u64> {
        self.count(self.url(&format!(
            "/favorites/count?userId={}",
            urlencoding::encode(user_id)
        )))
        .await
    }

    async fn count_reviews_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        self.count(self.url(&format!(
            "/reviews/count?userId={}&from={}&to={}",
            urlencoding::encode(user_id),
            urlencoding::encode(&from.to_rfc3339()),
            urlencoding::encode(&to.to_rfc3339())
        )))
        .await
    }

    async fn count_date_courses(&self, user_id: &str) -> Result<u64> {
        self.count(self.url(&format!(
            "/date-courses/count?userId={}",
            urlencoding::encode(user_id)
        )))
        .await
    }

    async fn create_favorite(&self, user_id: &str, spot_id: &str) -> Result<()> {
        self.post_json(
            self.url("/favorites"),
            json!({ "userId": user_id, "spotId": spot_id }),
        )
        .await
    }

    async fn create_review(&self, user_id: &str, review: &NewReview) -> Result<()> {
        self.post_json(
            self.url("/reviews"),
            json!({
                "userId": user_id,
                "spotId": review.spot_id,
                "rating": review.rating,
                "body": review.body,
            }),
        )
        .await
    }

    async fn create_date_course(&self, user_id: &str, course: &NewDateCourse) -> Result<()> {
        self.post_json(
            self.url("/date-courses"),
            json!({
                "userId": user_id,
                "title": course.title,
                "spotIds": course.spot_ids,
            }),
        )
        .await
    }

    async fn upsert_subscription(
        &self,
        email: &str,
        plan: PlanTier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        self.post_json(
            self.url("/users/subscription"),
            json!({
                "email": email,
                "plan": plan,
                "subscriptionStart": start.to_rfc3339(),
                "subscriptionEnd": end.to_rfc3339(),
            }),
        )
        .await
    }

    async fn clear_subscription(&self, email: &str) -> Result<()> {
        self.post_json(
            self.url("/users/subscription/clear"),
            json!({ "email": email }),
        )
        .await
    }
}
