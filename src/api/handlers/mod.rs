pub mod auth;
pub mod health;
pub mod me;

use super::error::ApiError;
use axum::extract::rejection::JsonRejection;
use axum::Json;

/// Turn axum's plain-text JSON rejection into the common error body.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::Validation(rejection.body_text()))
}
