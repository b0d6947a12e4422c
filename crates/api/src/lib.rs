//! HTTP and WebSocket surface of tidings.
//!
//! - **Middleware**: bearer-token authentication, rate limiting
//! - **Streaming**: the `/streaming` WebSocket that drives presence
//!
//! Built on Axum 0.8 with Tower middleware stack.

pub mod middleware;
pub mod rate_limit;
pub mod streaming;

use axum::{Router, middleware::from_fn_with_state, routing::get};

pub use middleware::AppState;
pub use rate_limit::RateLimiterState;
pub use streaming::streaming_handler;

/// Create the application router.
///
/// Authentication runs before rate limiting so limits can be keyed per
/// user.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/streaming", get(streaming_handler))
        .layer(from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .with_state(state)
}
