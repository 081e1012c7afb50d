//! Per-route guards: rate limiting first, then the auth gate.

use super::{error::ApiError, ApiState};
use crate::auth::RateLimitTier;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, warn};

pub const UNKNOWN_CLIENT: &str = "unknown";

/// Extract a client IP from common proxy headers.
pub(crate) fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Client address used as the rate limit key.
///
/// The TCP peer by default. Proxy headers only override it when
/// `trust_proxy_headers` is set.
pub(crate) fn client_address(request: &Request, trust_proxy_headers: bool) -> String {
    let forwarded = if trust_proxy_headers {
        forwarded_client(request.headers())
    } else {
        None
    };
    forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

pub async fn rate_limit(
    State((state, tier)): State<(Arc<ApiState>, RateLimitTier)>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_address(&request, state.trust_proxy_headers);
    let decision = state.limiter.check(tier, &client).await;

    if !decision.allowed {
        warn!(
            client = %client,
            tier = tier.as_str(),
            route = request.uri().path(),
            count = decision.count,
            limit = decision.limit,
            "Rate limit exceeded"
        );
        return ApiError::RateLimited {
            tier,
            retry_after_secs: decision.retry_after_secs(),
        }
        .into_response();
    }

    next.run(request).await
}

/// Authenticate the bearer token and publish the identity for handlers.
pub async fn require_auth(
    State(state): State<Arc<ApiState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.gate.authenticate(request.headers()).await {
        Ok(user) => {
            debug!(user_id = %user.user_id, source = ?user.source, "Authenticated");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => {
            warn!(
                reason = %err,
                route = request.uri().path(),
                "Rejected request"
            );
            err.into_response()
        }
    }
}
