use super::token::TokenError;

/// Reasons a request fails authentication.
///
/// Every 401 variant is reported to clients with the same code and message; the
/// variant itself only shows up in logs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("malformed token")]
    MalformedToken,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("wrong token type")]
    WrongTokenKind,
    #[error("token revoked")]
    TokenRevoked,
    #[error("internal error: {0}")]
    Internal(String),
}

pub const GENERIC_TOKEN_MESSAGE: &str = "invalid or expired token";
pub const INVALID_TOKEN_CODE: &str = "invalid_token";

impl AuthError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedToken => "malformed_token",
            Self::TokenExpired
            | Self::InvalidSignature
            | Self::WrongTokenKind
            | Self::TokenRevoked => INVALID_TOKEN_CODE,
            Self::Internal(_) => "internal_error",
        }
    }

    /// Text safe to show to the client.
    #[must_use]
    pub const fn public_message(&self) -> &'static str {
        match self {
            Self::MissingToken => "authorization token is required",
            Self::MalformedToken => "authorization header must be 'Bearer <token>'",
            Self::TokenExpired
            | Self::InvalidSignature
            | Self::WrongTokenKind
            | Self::TokenRevoked => GENERIC_TOKEN_MESSAGE,
            Self::Internal(_) => "internal server error",
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Malformed | TokenError::NotYetValid => Self::MalformedToken,
            TokenError::UnsupportedAlgorithm(_)
            | TokenError::BadSignature
            | TokenError::InvalidIssuer => Self::InvalidSignature,
            TokenError::Expired => Self::TokenExpired,
            TokenError::WrongKind { .. } => Self::WrongTokenKind,
            TokenError::InvalidKey(reason) => Self::Internal(reason.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::TokenKind;

    #[test]
    fn token_errors_map_to_auth_errors() {
        assert_eq!(AuthError::from(TokenError::Malformed), AuthError::MalformedToken);
        assert_eq!(
            AuthError::from(TokenError::NotYetValid),
            AuthError::MalformedToken
        );
        assert_eq!(
            AuthError::from(TokenError::UnsupportedAlgorithm("none".to_string())),
            AuthError::InvalidSignature
        );
        assert_eq!(
            AuthError::from(TokenError::BadSignature),
            AuthError::InvalidSignature
        );
        assert_eq!(AuthError::from(TokenError::Expired), AuthError::TokenExpired);
        assert_eq!(
            AuthError::from(TokenError::WrongKind {
                expected: TokenKind::Access,
                actual: TokenKind::Refresh,
            }),
            AuthError::WrongTokenKind
        );
    }

    #[test]
    fn unauthorized_variants_share_one_code_and_message() {
        for err in [
            AuthError::TokenExpired,
            AuthError::InvalidSignature,
            AuthError::WrongTokenKind,
            AuthError::TokenRevoked,
        ] {
            assert_eq!(err.code(), INVALID_TOKEN_CODE);
            assert_eq!(err.public_message(), GENERIC_TOKEN_MESSAGE);
        }
        assert_ne!(AuthError::MissingToken.public_message(), GENERIC_TOKEN_MESSAGE);
    }
}
