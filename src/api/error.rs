use crate::auth::{AuthError, PasswordError, RateLimitTier};
use crate::api::users::UserStoreError;
use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use utoipa::ToSchema;

pub const INVALID_CREDENTIALS: &str = "invalid credentials";

/// Error payload returned by every endpoint.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: code.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

impl AuthError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::MalformedToken => StatusCode::BAD_REQUEST,
            Self::TokenExpired
            | Self::InvalidSignature
            | Self::WrongTokenKind
            | Self::TokenRevoked => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(reason) => error!(reason = %reason, "Authentication failed unexpectedly"),
            other => debug!(reason = %other, "Authentication rejected"),
        }
        error_response(self.status(), self.code(), self.public_message())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("weak password: {0}")]
    WeakPassword(String),
    #[error("username or email already registered")]
    Conflict,
    #[error("not found")]
    NotFound,
    #[error("rate limit exceeded")]
    RateLimited {
        tier: RateLimitTier,
        retry_after_secs: u64,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<UserStoreError> for ApiError {
    fn from(err: UserStoreError) -> Self {
        match err {
            UserStoreError::Conflict => Self::Conflict,
            UserStoreError::Unavailable(reason) => Self::Internal(reason),
        }
    }
}

impl From<PasswordError> for ApiError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::EmptyPassword => {
                Self::WeakPassword("password must not be empty".to_string())
            }
            PasswordError::MalformedDigest => {
                // The stored digest is ours; this is an integrity problem, not a bad login.
                error!("Stored password digest failed to parse");
                Self::InvalidCredentials
            }
            PasswordError::InvalidParams(reason) | PasswordError::Hashing(reason) => {
                Self::Internal(reason)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidCredentials => error_response(
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                INVALID_CREDENTIALS,
            ),
            Self::Validation(message) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_request", &message)
            }
            Self::WeakPassword(message) => {
                error_response(StatusCode::BAD_REQUEST, "weak_password", &message)
            }
            Self::Conflict => error_response(
                StatusCode::CONFLICT,
                "conflict",
                "username or email already registered",
            ),
            Self::NotFound => error_response(StatusCode::NOT_FOUND, "not_found", "not found"),
            Self::RateLimited {
                tier,
                retry_after_secs,
            } => {
                let mut response =
                    error_response(StatusCode::TOO_MANY_REQUESTS, tier.error_code(), tier.message());
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            Self::Auth(err) => err.into_response(),
            Self::Internal(reason) => {
                error!(reason = %reason, "Request failed");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error",
                )
            }
        }
    }
}
