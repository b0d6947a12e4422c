//! API middleware.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use tidings_core::{NotificationService, PresenceTracker, UserDirectory};
use tracing::debug;

use crate::rate_limit::RateLimiterState;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub notification_service: NotificationService,
    pub presence: Arc<PresenceTracker>,
    pub directory: Arc<dyn UserDirectory>,
    pub rate_limiter: RateLimiterState,
}

/// Bearer token from the `Authorization` header or the `i` query parameter.
fn request_token(req: &Request<Body>) -> Option<String> {
    if let Some(token) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }

    req.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "i")
            .map(|(_, value)| value.to_string())
    })
}

/// Authentication middleware.
///
/// Resolves the token and stores the [`tidings_core::UserSummary`] in the
/// request extensions. Unauthenticated requests pass through untouched.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(token) = request_token(&req) {
        match state.directory.authenticate(&token).await {
            Ok(Some(user)) => {
                req.extensions_mut().insert(user);
            }
            Ok(None) => debug!("Unknown bearer token"),
            Err(e) => debug!(error = %e, "Token lookup failed"),
        }
    }

    next.run(req).await
}
