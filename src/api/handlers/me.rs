use crate::api::{
    error::{ApiError, ErrorBody},
    ApiState,
};
use crate::auth::AuthenticatedUser;
use axum::{extract::Extension, response::Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MeResponse {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CacheStatsResponse {
    pub enabled: bool,
    pub backend: String,
    pub valid: u64,
    pub revoked: u64,
}

#[utoipa::path(
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "Authenticated user", body = MeResponse),
        (status = 400, description = "Missing or malformed token", body = ErrorBody),
        (status = 401, description = "Invalid or expired token", body = ErrorBody),
        (status = 404, description = "User no longer exists", body = ErrorBody),
        (status = 429, description = "Too many requests", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn me(
    state: Extension<Arc<ApiState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<MeResponse>, ApiError> {
    let record = state
        .users
        .find_by_id(user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(MeResponse {
        user_id: record.id,
        username: record.username,
        email: record.email,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/auth/cache/stats",
    responses(
        (status = 200, description = "Entries in the token cache and revocation list", body = CacheStatsResponse),
        (status = 401, description = "Invalid or expired token", body = ErrorBody),
        (status = 500, description = "Token store unavailable", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn cache_stats(
    state: Extension<Arc<ApiState>>,
) -> Result<Json<CacheStatsResponse>, ApiError> {
    let stats = state
        .gate
        .validity()
        .stats()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    Ok(Json(CacheStatsResponse {
        enabled: stats.enabled,
        backend: stats.backend.to_string(),
        valid: stats.valid,
        revoked: stats.revoked,
    }))
}
