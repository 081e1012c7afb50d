use crate::{
    api::{
        handlers::{auth, health, me},
        middleware::{rate_limit, require_auth},
        users::UserStore,
    },
    auth::{AuthGate, PasswordError, PasswordHasher, RateLimitTier, RateLimiter},
    store::KvStore,
};
use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header, HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Router,
};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer,
    set_header::{SetRequestHeaderLayer, SetResponseHeaderLayer},
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;

pub mod error;
pub(crate) mod handlers;
pub mod middleware;
mod openapi;
pub mod users;

pub use handlers::auth::{AuthResponse, LoginRequest, LogoutResponse, RegisterRequest};
pub use openapi::openapi;

/// Everything a request handler needs, shared behind one `Arc`.
pub struct ApiState {
    pub(crate) gate: AuthGate,
    pub(crate) hasher: PasswordHasher,
    pub(crate) users: Arc<dyn UserStore>,
    pub(crate) limiter: RateLimiter,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) trust_proxy_headers: bool,
    dummy_digest: String,
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("hasher", &self.hasher)
            .field("limiter", &self.limiter)
            .field("store", &self.store.backend())
            .field("users", &self.users.backend())
            .field("trust_proxy_headers", &self.trust_proxy_headers)
            .finish_non_exhaustive()
    }
}

impl ApiState {
    /// # Errors
    /// Fails if the hasher cannot produce the digest used for unknown-user logins.
    pub fn new(
        gate: AuthGate,
        hasher: PasswordHasher,
        users: Arc<dyn UserStore>,
        limiter: RateLimiter,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, PasswordError> {
        let dummy_digest = hasher.hash_blocking(&Ulid::new().to_string())?;
        Ok(Self {
            gate,
            hasher,
            users,
            limiter,
            store,
            trust_proxy_headers: false,
            dummy_digest,
        })
    }

    /// Key rate limits on `X-Forwarded-For`/`X-Real-IP` when present. Off by
    /// default, since any client can set those headers.
    #[must_use]
    pub fn with_trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    pub(crate) fn dummy_digest(&self) -> &str {
        &self.dummy_digest
    }
}

fn security_headers() -> [(HeaderName, &'static str); 8] {
    [
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (header::X_FRAME_OPTIONS, "DENY"),
        (header::X_XSS_PROTECTION, "1; mode=block"),
        (
            header::STRICT_TRANSPORT_SECURITY,
            "max-age=31536000; includeSubDomains",
        ),
        (
            header::CONTENT_SECURITY_POLICY,
            "default-src 'none'; frame-ancestors 'none'",
        ),
        (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
        (
            HeaderName::from_static("permissions-policy"),
            "geolocation=(), microphone=(), camera=()",
        ),
        (
            HeaderName::from_static("x-permitted-cross-domain-policies"),
            "none",
        ),
    ]
}

/// Add the security headers to every response, replacing any a handler set.
fn with_security_headers(router: Router) -> Router {
    security_headers()
        .into_iter()
        .fold(router, |router, (name, value)| {
            router.layer(SetResponseHeaderLayer::overriding(
                name,
                HeaderValue::from_static(value),
            ))
        })
}

/// Build the application router.
///
/// Auth endpoints sit behind the strict tier, everything under `/v1` else
/// behind the general tier. `/health` and `/openapi.json` are never limited.
/// The rate limit runs before the auth gate so rejected floods never reach
/// token validation.
pub fn router(state: Arc<ApiState>) -> Router {
    let gate = from_fn_with_state(state.clone(), require_auth);

    let auth_routes = Router::new()
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/refresh", post(auth::refresh))
        .merge(
            Router::new()
                .route("/v1/auth/logout", post(auth::logout))
                .route_layer(gate.clone()),
        )
        .route_layer(from_fn_with_state(
            (state.clone(), RateLimitTier::Auth),
            rate_limit,
        ));

    let user_routes = Router::new()
        .route("/v1/me", get(me::me))
        .route("/v1/auth/cache/stats", get(me::cache_stats))
        .route_layer(gate)
        .route_layer(from_fn_with_state(
            (state.clone(), RateLimitTier::General),
            rate_limit,
        ));

    let router = Router::new()
        .route("/health", get(health::health).head(health::health))
        .route("/openapi.json", get(openapi::openapi_json))
        .merge(auth_routes)
        .merge(user_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state)),
        );

    with_security_headers(router)
}

/// Start the server
/// # Errors
/// Return error if failed to bind or serve
pub async fn serve(port: u16, state: Arc<ApiState>) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Gracefully shutdown"),
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
    })
    .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::test_state;
    use super::*;
    use axum::{body::to_bytes, http::StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn request_id_is_generated_and_propagated() -> Result<()> {
        let response = router(test_state()?)
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert_eq!(request_id.len(), 26);
        Ok(())
    }

    #[tokio::test]
    async fn request_id_from_client_is_kept() -> Result<()> {
        let response = router(test_state()?)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(
            response
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok()),
            Some("abc-123")
        );
        Ok(())
    }

    #[tokio::test]
    async fn me_requires_token() -> Result<()> {
        let response = router(test_state()?)
            .oneshot(
                Request::builder()
                    .uri("/v1/me")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let body: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(body["error"], "missing_token");
        Ok(())
    }

    #[tokio::test]
    async fn security_headers_on_every_response() -> Result<()> {
        let app = router(test_state()?);
        for uri in ["/health", "/v1/me", "/v1/nope"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty())?)
                .await?;
            let headers = response.headers();
            assert_eq!(
                headers.get(header::X_CONTENT_TYPE_OPTIONS),
                Some(&HeaderValue::from_static("nosniff")),
                "{uri}"
            );
            assert_eq!(
                headers.get(header::X_FRAME_OPTIONS),
                Some(&HeaderValue::from_static("DENY")),
                "{uri}"
            );
            for (name, value) in security_headers() {
                assert_eq!(
                    headers.get(&name).and_then(|v| v.to_str().ok()),
                    Some(value),
                    "{uri}"
                );
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() -> Result<()> {
        let response = router(test_state()?)
            .oneshot(Request::builder().uri("/v1/nope").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }
}
