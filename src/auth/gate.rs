//! Request-time token checks.
//!
//! Order matters: the revocation list is consulted before the known-valid
//! cache, so a token revoked on another instance is refused even while its
//! cache entry is still alive. Signature work only happens on a cache miss.

use super::{
    error::AuthError,
    token::{Claims, IssuedToken, TokenIssuer, TokenKind},
    validity::{log_hash, token_fingerprint, TokenValidityStore},
};
use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const REFRESH_TOKEN_HEADER: &str = "refreshtoken";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Cache,
    Validated,
}

/// Identity published into request extensions once a token passes the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    /// Only known when the token was fully validated.
    pub username: Option<String>,
    pub source: IdentitySource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutOutcome {
    pub user_id: Uuid,
    pub revoked: bool,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub claims: Claims,
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

/// Parse `<scheme> <value>` with a case-insensitive `Bearer` scheme.
///
/// # Errors
/// `MissingToken` if there is no usable header value, `MalformedToken` if it
/// is not exactly two space separated parts with a bearer scheme.
pub fn extract_bearer(value: Option<&HeaderValue>) -> Result<&str, AuthError> {
    let value = value.ok_or(AuthError::MissingToken)?;
    let value = value.to_str().map_err(|_| AuthError::MalformedToken)?;
    if value.trim().is_empty() {
        return Err(AuthError::MissingToken);
    }

    let parts: Vec<&str> = value.split(' ').collect();
    let [scheme, token] = parts.as_slice() else {
        return Err(AuthError::MalformedToken);
    };
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::MalformedToken);
    }
    Ok(*token)
}

#[derive(Debug, Clone)]
pub struct AuthGate {
    issuer: Arc<TokenIssuer>,
    validity: TokenValidityStore,
}

impl AuthGate {
    #[must_use]
    pub fn new(issuer: Arc<TokenIssuer>, validity: TokenValidityStore) -> Self {
        Self { issuer, validity }
    }

    #[must_use]
    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    #[must_use]
    pub const fn validity(&self) -> &TokenValidityStore {
        &self.validity
    }

    /// Authenticate the `Authorization` header of a request.
    ///
    /// # Errors
    /// Returns the first failed check, see [`AuthError`].
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AuthError> {
        let token = extract_bearer(headers.get(AUTHORIZATION))?;
        self.authenticate_token(token).await
    }

    /// # Errors
    /// Returns `TokenRevoked` for revoked tokens, otherwise the validation error.
    pub async fn authenticate_token(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if self.validity.is_revoked(token).await {
            warn!(
                token_hash = log_hash(&token_fingerprint(token)),
                "Rejected revoked token"
            );
            return Err(AuthError::TokenRevoked);
        }

        match self.validity.lookup(token).await {
            Ok(Some(user_id)) => {
                return Ok(AuthenticatedUser {
                    user_id,
                    username: None,
                    source: IdentitySource::Cache,
                });
            }
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "Token cache lookup failed, validating signature");
            }
        }

        let claims = self
            .issuer
            .validate(token, TokenKind::Access)
            .map_err(|err| {
                debug!(reason = %err, "Token validation failed");
                AuthError::from(err)
            })?;

        // Best effort.
        if let Err(err) = self
            .validity
            .remember(token, claims.user_id, claims.exp)
            .await
        {
            error!(error = %err, user_id = %claims.user_id, "Failed to cache validated token");
        }

        Ok(AuthenticatedUser {
            user_id: claims.user_id,
            username: Some(claims.username),
            source: IdentitySource::Validated,
        })
    }

    /// Revoke the access token on the request.
    ///
    /// The token must still validate. A store failure does not fail the
    /// logout; it is reported with `revoked: false` and the token lives until
    /// it expires.
    ///
    /// # Errors
    /// Returns an error if the header is missing or the token does not validate.
    pub async fn logout(&self, headers: &HeaderMap) -> Result<LogoutOutcome, AuthError> {
        let token = extract_bearer(headers.get(AUTHORIZATION))?;
        let claims = self.issuer.validate(token, TokenKind::Access)?;
        let fingerprint = token_fingerprint(token);

        if !self.validity.is_enabled() {
            warn!(
                user_id = %claims.user_id,
                "Token cache disabled, token stays valid until it expires"
            );
            return Ok(LogoutOutcome {
                user_id: claims.user_id,
                revoked: false,
            });
        }

        let revoked = match self.validity.revoke(token, claims.exp).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    error = %err,
                    user_id = %claims.user_id,
                    token_hash = log_hash(&fingerprint),
                    "Failed to revoke token"
                );
                false
            }
        };

        if let Err(err) = self.validity.forget(token).await {
            warn!(
                error = %err,
                token_hash = log_hash(&fingerprint),
                "Failed to drop cached token"
            );
        }

        Ok(LogoutOutcome {
            user_id: claims.user_id,
            revoked,
        })
    }

    /// Exchange the refresh token in the `RefreshToken` header for a new access
    /// token. The refresh token itself is handed back unchanged.
    ///
    /// # Errors
    /// Returns an error if the header is missing, the refresh token does not
    /// validate or has been revoked.
    pub async fn refresh(&self, headers: &HeaderMap) -> Result<RefreshOutcome, AuthError> {
        let token = extract_bearer(headers.get(REFRESH_TOKEN_HEADER))?;
        let claims = self
            .issuer
            .validate(token, TokenKind::Refresh)
            .map_err(|err| {
                debug!(reason = %err, "Refresh token validation failed");
                AuthError::from(err)
            })?;

        if self.validity.is_revoked(token).await {
            warn!(
                user_id = %claims.user_id,
                token_hash = log_hash(&token_fingerprint(token)),
                "Rejected revoked refresh token"
            );
            return Err(AuthError::TokenRevoked);
        }

        let access = self
            .issuer
            .issue_access(claims.user_id, &claims.username)
            .map_err(|err| AuthError::Internal(err.to_string()))?;
        let refresh = IssuedToken {
            token: token.to_string(),
            expires_at: claims.exp,
        };

        Ok(RefreshOutcome {
            claims,
            access,
            refresh,
        })
    }
}
