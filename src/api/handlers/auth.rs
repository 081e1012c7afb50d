//! Credential endpoints: register, login, refresh, logout.
//!
//! Login failures never say whether the user exists. An unknown login still
//! runs one password verification against a throwaway digest so both paths
//! cost about the same.

use super::json_body;
use crate::api::{
    error::{ApiError, ErrorBody},
    users::{normalize_email, NewUser},
    ApiState,
};
use crate::auth::{TokenPair, IssuedToken};
use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;
pub const TOKEN_TYPE_BEARER: &str = "Bearer";

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry, unix seconds.
    pub expires_at: i64,
    pub token_type: String,
}

impl AuthResponse {
    fn new(user_id: Uuid, username: String, access: IssuedToken, refresh: IssuedToken) -> Self {
        Self {
            user_id,
            username,
            access_token: access.token,
            refresh_token: refresh.token,
            expires_at: access.expires_at,
            token_type: TOKEN_TYPE_BEARER.to_string(),
        }
    }

    fn from_pair(user_id: Uuid, username: String, pair: TokenPair) -> Self {
        Self::new(user_id, username, pair.access, pair.refresh)
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponse {
    pub message: String,
    /// `false` when the token could not be revoked and stays valid until it expires.
    pub revoked: bool,
}

fn valid_username(username: &str) -> bool {
    Regex::new(r"^[a-zA-Z0-9_.-]{3,32}$").is_ok_and(|regex| regex.is_match(username))
}

/// Basic email format check on already-normalized input.
fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

fn check_password_strength(password: &str) -> Result<(), ApiError> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(ApiError::WeakPassword(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(ApiError::WeakPassword(format!(
            "password must be at most {MAX_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_registration(request: &RegisterRequest) -> Result<(), ApiError> {
    if !valid_username(request.username.trim()) {
        return Err(ApiError::Validation(
            "username must be 3-32 characters of letters, digits, '_', '.' or '-'".to_string(),
        ));
    }
    if !valid_email(&normalize_email(&request.email)) {
        return Err(ApiError::Validation("invalid email address".to_string()));
    }
    check_password_strength(&request.password)
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User created, tokens issued", body = AuthResponse),
        (status = 400, description = "Invalid input or weak password", body = ErrorBody),
        (status = 409, description = "Username or email already registered", body = ErrorBody),
        (status = 429, description = "Too many authentication attempts", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn register(
    state: Extension<Arc<ApiState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(payload)?;
    validate_registration(&request)?;

    let password_hash = state.hasher.hash(&request.password).await?;
    let user = state
        .users
        .create(NewUser {
            username: request.username.trim().to_string(),
            email: request.email,
            password_hash,
        })
        .await
        .inspect_err(|err| warn!(error = %err, "Registration rejected"))?;

    let pair = state
        .gate
        .issuer()
        .issue_pair(user.id, &user.username)
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    info!(user_id = %user.id, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse::from_pair(user.id, user.username, pair)),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Credentials accepted, tokens issued", body = AuthResponse),
        (status = 400, description = "Invalid input", body = ErrorBody),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 429, description = "Too many authentication attempts", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    state: Extension<Arc<ApiState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let request = json_body(payload)?;
    let login = request.username_or_email.trim();
    if login.is_empty() || request.password.is_empty() {
        return Err(ApiError::InvalidCredentials);
    }

    let Some(user) = state.users.find_by_login(login).await? else {
        // Burn one verification so unknown users are not faster to reject.
        let _ = state
            .hasher
            .verify(&request.password, state.dummy_digest())
            .await;
        warn!("Login failed");
        return Err(ApiError::InvalidCredentials);
    };

    if !state
        .hasher
        .verify(&request.password, &user.password_hash)
        .await?
    {
        warn!(user_id = %user.id, "Login failed");
        return Err(ApiError::InvalidCredentials);
    }

    let pair = state
        .gate
        .issuer()
        .issue_pair(user.id, &user.username)
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    info!(user_id = %user.id, "User logged in");

    Ok(Json(AuthResponse::from_pair(user.id, user.username, pair)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    params(
        ("RefreshToken" = String, Header, description = "Bearer <refresh token>")
    ),
    responses(
        (status = 200, description = "New access token, same refresh token", body = AuthResponse),
        (status = 400, description = "Missing or malformed refresh token", body = ErrorBody),
        (status = 401, description = "Invalid or expired token", body = ErrorBody),
        (status = 429, description = "Too many authentication attempts", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn refresh(
    state: Extension<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<AuthResponse>, ApiError> {
    let outcome = state.gate.refresh(&headers).await?;

    info!(user_id = %outcome.claims.user_id, "Access token refreshed");

    Ok(Json(AuthResponse::new(
        outcome.claims.user_id,
        outcome.claims.username,
        outcome.access,
        outcome.refresh,
    )))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = LogoutResponse),
        (status = 400, description = "Missing or malformed token", body = ErrorBody),
        (status = 401, description = "Invalid or expired token", body = ErrorBody),
        (status = 429, description = "Too many authentication attempts", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    state: Extension<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, ApiError> {
    let outcome = state.gate.logout(&headers).await?;

    info!(user_id = %outcome.user_id, revoked = outcome.revoked, "User logged out");

    let message = if outcome.revoked {
        "logged out"
    } else {
        "logged out; token remains valid until it expires"
    };

    Ok(Json(LogoutResponse {
        message: message.to_string(),
        revoked: outcome.revoked,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn valid_username_rules() {
        assert!(valid_username("alice"));
        assert!(valid_username("a.b-c_d"));
        assert!(!valid_username("al"));
        assert!(!valid_username("alice smith"));
        assert!(!valid_username(&"a".repeat(33)));
    }

    #[test]
    fn valid_email_rejects_missing_parts() {
        assert!(valid_email("a@example.com"));
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-domain@"));
    }

    #[test]
    fn registration_validation() {
        assert!(validate_registration(&request("alice", "alice@example.com", "long enough")).is_ok());
        assert!(matches!(
            validate_registration(&request("alice", "alice@example.com", "short")),
            Err(ApiError::WeakPassword(_))
        ));
        assert!(matches!(
            validate_registration(&request("alice", "alice@example.com", "")),
            Err(ApiError::WeakPassword(_))
        ));
        assert!(matches!(
            validate_registration(&request("alice", "nope", "long enough")),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            validate_registration(&request("a", "alice@example.com", "long enough")),
            Err(ApiError::Validation(_))
        ));
    }
}
