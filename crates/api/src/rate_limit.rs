//! API rate limiting middleware.
//!
//! Provides per-user and per-IP rate limiting on top of the shared-store
//! [`RateLimiter`].

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tidings_common::AppError;
use tidings_core::{RateLimitConfig, RateLimitDecision, RateLimiter, UserSummary, limits};

const LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Rate limiter state for middleware.
#[derive(Clone)]
pub struct RateLimiterState {
    pub limiter: RateLimiter,
    /// Checks are skipped entirely when false.
    pub enabled: bool,
    /// Budget applied by [`rate_limit_middleware`].
    pub config: RateLimitConfig,
}

impl RateLimiterState {
    /// Create a new rate limiter state with the general API budget.
    #[must_use]
    pub const fn new(limiter: RateLimiter, enabled: bool) -> Self {
        Self {
            limiter,
            enabled,
            config: limits::API,
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }
}

/// Extract client IP from request.
fn extract_client_ip(req: &Request<Body>) -> Option<IpAddr> {
    let headers = req.headers();

    // Try X-Forwarded-For header first
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());
    if forwarded.is_some() {
        return forwarded;
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|ip| ip.trim().parse().ok());
    if real_ip.is_some() {
        return real_ip;
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Identifier the budget is charged to.
fn rate_limit_key(req: &Request<Body>) -> String {
    if let Some(user) = req.extensions().get::<UserSummary>() {
        format!("user:{}", user.id)
    } else if let Some(ip) = extract_client_ip(req) {
        format!("ip:{ip}")
    } else {
        "unknown".to_string()
    }
}

fn set_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(LIMIT, HeaderValue::from(decision.limit));
    headers.insert(REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RESET, HeaderValue::from(decision.reset_at.timestamp()));
}

/// Rate limiting middleware.
pub async fn rate_limit_middleware(
    State(state): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !state.enabled {
        return next.run(req).await;
    }
    rate_limit_with_config(&state.limiter, &state.config, req, next).await
}

/// Charge `config` for this request, answering 429 when it is exhausted.
pub async fn rate_limit_with_config(
    limiter: &RateLimiter,
    config: &RateLimitConfig,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = rate_limit_key(&req);
    let decision = limiter.check_limit(config, &key).await;

    let mut response = match decision.retry_after_secs {
        Some(retry_after) if !decision.allowed => {
            tracing::debug!(key = %key, scope = %config.scope, retry_after, "Rate limited");
            AppError::RateLimited { retry_after }.into_response()
        }
        _ => next.run(req).await,
    };

    set_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{
        Extension, Router,
        http::StatusCode,
        middleware::from_fn_with_state,
        routing::get,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tidings_common::ManualClock;
    use tidings_core::{MemoryStore, RateLimitAlgorithm, RateLimitScope};
    use tidings_db::entities::user::UserRole;
    use tower::ServiceExt;

    fn user_summary(id: &str) -> UserSummary {
        UserSummary {
            id: id.to_string(),
            username: id.to_string(),
            name: None,
            avatar_url: None,
            role: UserRole::User,
        }
    }

    fn app(enabled: bool, max: u32) -> Router {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = RateLimiter::new(store, clock, Duration::from_millis(250));
        let state = RateLimiterState::new(limiter, enabled).with_config(RateLimitConfig::new(
            RateLimitScope::Api,
            max,
            60,
            RateLimitAlgorithm::SlidingWindow,
        ));

        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(state, rate_limit_middleware))
    }

    fn request_from(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_sets_headers_and_rejects_over_budget() {
        let app = app(true, 2);

        let first = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-limit"], "2");
        assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

        app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        let third = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(third.headers()["retry-after"], "60");
        assert_eq!(third.headers()["x-ratelimit-remaining"], "0");

        let other = app.oneshot(request_from("10.0.0.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_authenticated_users_have_their_own_budget() {
        let app = app(true, 1);
        let request = |user: &str| {
            let mut req = request_from("10.0.0.1");
            req.extensions_mut().insert(user_summary(user));
            req
        };

        assert_eq!(
            app.clone().oneshot(request("alice")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            app.clone().oneshot(request("alice")).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            app.clone().oneshot(request("bob")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            app.oneshot(request_from("10.0.0.1")).await.unwrap().status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let app = app(false, 1);
        for _ in 0..3 {
            let response = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
    }

    #[tokio::test]
    async fn test_user_extension_reaches_handler() {
        let app = Router::new().route(
            "/",
            get(|Extension(user): Extension<UserSummary>| async move { user.id }),
        );
        let mut req = request_from("10.0.0.1");
        req.extensions_mut().insert(user_summary("carol"));

        let response = app.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"carol");
    }
}
