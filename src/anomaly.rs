//! Per-user sliding-window heuristic for abusive request patterns.
//!
//! Strictly a per-process, best-effort signal: the window lives in memory,
//! resets on restart and is not shared across instances, so it must never be
//! treated as a security boundary. The thresholds are tunable constants, not
//! invariants.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Trailing horizon kept per user.
const WINDOW_MS: i64 = 5 * 60 * 1000;
/// Hard cap on entries per user.
const MAX_ENTRIES: usize = 100;

const BURST_LIMIT: usize = 30;
const BURST_WINDOW_MS: i64 = 60 * 1000;
const SAME_PATH_LIMIT: usize = 5;
const SAME_PATH_WINDOW_MS: i64 = 1000;
const DISTINCT_IP_LIMIT: usize = 3;
const SENSITIVE_LIMIT: usize = 20;
const SENSITIVE_WINDOW_MS: i64 = 10 * 60 * 1000;

/// Endpoints worth watching more closely than regular pages.
pub const SENSITIVE_PATHS: [&str; 2] = ["/utage-login", "/webhook/utage"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyReason {
    TooManyRequests,
    RapidSamePathAccess,
    MultipleIps,
    SuspiciousApiAccess,
}

impl AnomalyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyReason::TooManyRequests => "too_many_requests",
            AnomalyReason::RapidSamePathAccess => "rapid_same_path_access",
            AnomalyReason::MultipleIps => "multiple_ips",
            AnomalyReason::SuspiciousApiAccess => "suspicious_api_access",
        }
    }
}

#[derive(Debug, Clone)]
struct Hit {
    path: String,
    at: i64,
    ip: Option<String>,
}

#[derive(Clone, Default)]
pub struct AnomalyTracker {
    windows: Arc<Mutex<HashMap<String, VecDeque<Hit>>>>,
}

impl AnomalyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hit to the user's window, prunes it, and evaluates the
    /// rules in order, short-circuiting on the first match. The window is
    /// mutated whether or not a rule fires.
    pub async fn record(
        &self,
        user_id: &str,
        path: &str,
        now: DateTime<Utc>,
        ip: Option<&str>,
    ) -> Option<AnomalyReason> {
        let at = now.timestamp_millis();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(user_id.to_string()).or_default();

        window.push_back(Hit {
            path: path.to_string(),
            at,
            ip: ip.map(str::to_string),
        });
        while let Some(front) = window.front() {
            if at - front.at > WINDOW_MS {
                window.pop_front();
            } else {
                break;
            }
        }
        while window.len() > MAX_ENTRIES {
            window.pop_front();
        }

        evaluate(window, path, at)
    }
}

fn evaluate(window: &VecDeque<Hit>, path: &str, at: i64) -> Option<AnomalyReason> {
    let burst = window
        .iter()
        .filter(|h| at - h.at <= BURST_WINDOW_MS)
        .count();
    if burst > BURST_LIMIT {
        return Some(AnomalyReason::TooManyRequests);
    }

    let same_path = window
        .iter()
        .filter(|h| h.path == path && at - h.at <= SAME_PATH_WINDOW_MS)
        .count();
    if same_path > SAME_PATH_LIMIT {
        return Some(AnomalyReason::RapidSamePathAccess);
    }

    let distinct_ips: HashSet<&str> = window.iter().filter_map(|h| h.ip.as_deref()).collect();
    if distinct_ips.len() > DISTINCT_IP_LIMIT {
        return Some(AnomalyReason::MultipleIps);
    }

    let sensitive = window
        .iter()
        .filter(|h| {
            at - h.at <= SENSITIVE_WINDOW_MS && SENSITIVE_PATHS.contains(&h.path.as_str())
        })
        .count();
    if sensitive > SENSITIVE_LIMIT {
        return Some(AnomalyReason::SuspiciousApiAccess);
    }

    None
}
