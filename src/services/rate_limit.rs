//! Sliding-window rate limiting for location submissions
//!
//! Two limiters run per submission: one keyed by vehicle, one keyed by the
//! submitting driver. Each keeps a window of recent submission timestamps in
//! the ephemeral cache; the window is pruned before every check and the key
//! expires on its own shortly after the window closes.
//!
//! If the cache is unavailable the limiter admits unconditionally:
//! availability of location ingestion outranks strict rate enforcement.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

use crate::config::RateLimitRule;
use crate::store::TtlCache;

/// What kind of actor a window is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectType {
    Vehicle,
    Driver,
}

impl SubjectType {
    fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Vehicle => "vehicle",
            SubjectType::Driver => "driver",
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Submissions left in the current window
    pub remaining: usize,
    /// When the window frees up again
    pub reset_at: DateTime<Utc>,
}

/// Stored window: epoch-millisecond timestamps of recent submissions
#[derive(Debug, Default, Serialize, Deserialize)]
struct Window {
    timestamps: Vec<i64>,
}

#[derive(Clone)]
pub struct RateLimiter {
    cache: TtlCache,
}

impl RateLimiter {
    pub fn new(cache: TtlCache) -> Self {
        Self { cache }
    }

    /// Check and record one submission for a subject.
    pub fn admit(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
        rule: RateLimitRule,
    ) -> RateLimitDecision {
        self.admit_at(subject_type, subject_id, rule, Utc::now())
    }

    /// `admit` with an explicit clock, used by tests to walk the window.
    pub fn admit_at(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let key = format!("ratelimit:{}:{}", subject_type.as_str(), subject_id);
        let window_ms = rule.window_secs as i64 * 1000;
        let now_ms = now.timestamp_millis();
        // Key outlives the window by a second so an idle subject's counter
        // disappears on its own.
        let key_ttl = Duration::from_secs(rule.window_secs + 1);

        let result = self.cache.update::<Window, RateLimitDecision, _>(
            &key,
            key_ttl,
            |current| {
                let mut window = current.unwrap_or_default();
                window.timestamps.retain(|&ts| ts > now_ms - window_ms);

                if window.timestamps.len() >= rule.max_updates {
                    let oldest = window.timestamps.iter().min().copied().unwrap_or(now_ms);
                    let reset_at = Utc
                        .timestamp_millis_opt(oldest + window_ms)
                        .single()
                        .unwrap_or(now);
                    let decision = RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_at,
                    };
                    (window, decision)
                } else {
                    window.timestamps.push(now_ms);
                    let remaining = rule.max_updates - window.timestamps.len();
                    let decision = RateLimitDecision {
                        allowed: true,
                        remaining,
                        reset_at: Utc
                            .timestamp_millis_opt(now_ms + window_ms)
                            .single()
                            .unwrap_or(now),
                    };
                    (window, decision)
                }
            },
        );

        match result {
            Ok(decision) => decision,
            Err(e) => {
                // Fail open: a broken cache must not block ingestion.
                tracing::warn!(
                    subject = %subject_id,
                    error = %e,
                    "Rate limiter cache unavailable, admitting"
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: rule.max_updates,
                    reset_at: now,
                }
            }
        }
    }
}
