//! Shared-store rate limiting.
//!
//! Provides per-scope sliding-window and fixed-window limits. Every check is
//! one atomic store operation, so limits hold across server processes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tidings_common::{AppResult, IdGenerator, SharedClock};
use tracing::warn;

use crate::store::{SharedStoreRef, keys};

/// Independent rate-limit budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    Api,
    Auth,
    Write,
    Comment,
    Upload,
    Reaction,
}

impl RateLimitScope {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Auth => "auth",
            Self::Write => "write",
            Self::Comment => "comment",
            Self::Upload => "upload",
            Self::Reaction => "reaction",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAlgorithm {
    /// Timestamp log; smooth, exact.
    SlidingWindow,
    /// One counter per `window_secs` bucket.
    FixedWindow,
}

/// Rate limit configuration for one scope.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Time window duration in seconds.
    pub window_secs: u64,
    pub scope: RateLimitScope,
    pub algorithm: RateLimitAlgorithm,
}

impl RateLimitConfig {
    /// Create a new rate limit config.
    #[must_use]
    pub const fn new(
        scope: RateLimitScope,
        max_requests: u32,
        window_secs: u64,
        algorithm: RateLimitAlgorithm,
    ) -> Self {
        Self {
            max_requests,
            window_secs,
            scope,
            algorithm,
        }
    }
}

/// Default limits per scope.
pub mod limits {
    use super::{RateLimitAlgorithm::*, RateLimitConfig, RateLimitScope};

    /// General API traffic.
    pub const API: RateLimitConfig =
        RateLimitConfig::new(RateLimitScope::Api, 100, 60, SlidingWindow);

    /// Login and token endpoints.
    pub const AUTH: RateLimitConfig =
        RateLimitConfig::new(RateLimitScope::Auth, 5, 900, SlidingWindow);

    pub const WRITE: RateLimitConfig =
        RateLimitConfig::new(RateLimitScope::Write, 30, 60, SlidingWindow);

    pub const COMMENT: RateLimitConfig =
        RateLimitConfig::new(RateLimitScope::Comment, 10, 60, SlidingWindow);

    pub const UPLOAD: RateLimitConfig =
        RateLimitConfig::new(RateLimitScope::Upload, 10, 3600, FixedWindow);

    pub const REACTION: RateLimitConfig =
        RateLimitConfig::new(RateLimitScope::Reaction, 60, 60, FixedWindow);
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Total limit.
    pub limit: u32,
    /// When the window next frees capacity.
    pub reset_at: DateTime<Utc>,
    /// Seconds to wait before retrying, set only on rejection.
    pub retry_after_secs: Option<u64>,
}

/// Rate limiter over the shared store.
#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStoreRef,
    clock: SharedClock,
    timeout: Duration,
    id_gen: IdGenerator,
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl RateLimiter {
    /// Create a limiter that gives up on the store after `timeout`.
    #[must_use]
    pub const fn new(store: SharedStoreRef, clock: SharedClock, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
            id_gen: IdGenerator::new(),
        }
    }

    /// Check a request against `config` and record it when admitted.
    ///
    /// Never fails: when the store errors or does not answer within the
    /// timeout the request is allowed.
    pub async fn check_limit(&self, config: &RateLimitConfig, identifier: &str) -> RateLimitDecision {
        let now_ms = self.clock.now_millis();
        let check = async {
            match config.algorithm {
                RateLimitAlgorithm::SlidingWindow => {
                    self.sliding_window(config, identifier, now_ms).await
                }
                RateLimitAlgorithm::FixedWindow => {
                    self.fixed_window(config, identifier, now_ms).await
                }
            }
        };

        match tokio::time::timeout(self.timeout, check).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(scope = %config.scope, error = %e, "Rate limit store failed, allowing request");
                self.fail_open(config, now_ms)
            }
            Err(_) => {
                warn!(
                    scope = %config.scope,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Rate limit store timed out, allowing request"
                );
                self.fail_open(config, now_ms)
            }
        }
    }

    fn fail_open(&self, config: &RateLimitConfig, now_ms: i64) -> RateLimitDecision {
        let window_ms = i64::try_from(config.window_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        RateLimitDecision {
            allowed: true,
            remaining: config.max_requests,
            limit: config.max_requests,
            reset_at: millis_to_utc(now_ms.saturating_add(window_ms)),
            retry_after_secs: None,
        }
    }

    async fn sliding_window(
        &self,
        config: &RateLimitConfig,
        identifier: &str,
        now_ms: i64,
    ) -> AppResult<RateLimitDecision> {
        let window_ms = i64::try_from(config.window_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let key = keys::sliding_window(config.scope.as_str(), identifier);
        // Unique member so two requests in the same millisecond both count.
        let member = format!("{now_ms}-{}", self.id_gen.generate_connection_id());

        let outcome = self
            .store
            .sliding_window(&key, &member, now_ms, window_ms, u64::from(config.max_requests))
            .await?;

        let oldest = outcome.oldest_ms.unwrap_or(now_ms);
        let reset_ms = oldest.saturating_add(window_ms);
        let used = u32::try_from(outcome.count).unwrap_or(u32::MAX);

        let retry_after_secs = (!outcome.allowed).then(|| {
            let wait_ms = u64::try_from(reset_ms - now_ms).unwrap_or(0);
            wait_ms.div_ceil(1000).max(1)
        });

        Ok(RateLimitDecision {
            allowed: outcome.allowed,
            remaining: config.max_requests.saturating_sub(used),
            limit: config.max_requests,
            reset_at: millis_to_utc(reset_ms),
            retry_after_secs,
        })
    }

    async fn fixed_window(
        &self,
        config: &RateLimitConfig,
        identifier: &str,
        now_ms: i64,
    ) -> AppResult<RateLimitDecision> {
        let window_secs = i64::try_from(config.window_secs.max(1)).unwrap_or(i64::MAX);
        let now_secs = now_ms.div_euclid(1000);
        let bucket = now_secs.div_euclid(window_secs);
        let key = keys::fixed_window(config.scope.as_str(), identifier, bucket);

        let count = self
            .store
            .incr_with_expiry(&key, config.window_secs.max(1))
            .await?;

        let used = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        let allowed = used <= config.max_requests;
        let reset_secs = bucket.saturating_add(1).saturating_mul(window_secs);
        let retry_after_secs = (!allowed)
            .then(|| u64::try_from(reset_secs - now_secs).unwrap_or(0).max(1));

        Ok(RateLimitDecision {
            allowed,
            remaining: config.max_requests.saturating_sub(used),
            limit: config.max_requests,
            reset_at: millis_to_utc(reset_secs.saturating_mul(1000)),
            retry_after_secs,
        })
    }
}
