//! HS256 signed tokens.
//!
//! Tokens are compact JWS strings (`header.claims.signature`, base64url without
//! padding). Access and refresh tokens share one claims shape and are told
//! apart by `token_type` and by the secret they are signed with.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const ALG_HS256: &str = "HS256";
const TYP_JWT: &str = "JWT";

pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub user_id: Uuid,
    pub username: String,
    pub token_type: TokenKind,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Random per token, so two tokens minted in the same second still differ.
    pub jti: Uuid,
}

/// A signed token and its expiry in unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("expected {expected} token, got {actual}")]
    WrongKind {
        expected: TokenKind,
        actual: TokenKind,
    },
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid signing key: {0}")]
    InvalidKey(&'static str),
}

#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|_| TokenError::Malformed)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
}

/// Signs and validates tokens. Holds no mutable state, share it behind `Arc`.
pub struct TokenIssuer {
    issuer: String,
    access_secret: SecretString,
    refresh_secret: SecretString,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// # Errors
    /// Returns `InvalidKey` if a secret is empty or both secrets are the same.
    pub fn new(
        issuer: impl Into<String>,
        access_secret: SecretString,
        refresh_secret: SecretString,
    ) -> Result<Self, TokenError> {
        if access_secret.expose_secret().is_empty() || refresh_secret.expose_secret().is_empty() {
            return Err(TokenError::InvalidKey("secret must not be empty"));
        }
        if access_secret.expose_secret() == refresh_secret.expose_secret() {
            return Err(TokenError::InvalidKey(
                "access and refresh secrets must differ",
            ));
        }

        Ok(Self {
            issuer: issuer.into(),
            access_secret,
            refresh_secret,
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
        })
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub const fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    fn secret(&self, kind: TokenKind) -> &SecretString {
        match kind {
            TokenKind::Access => &self.access_secret,
            TokenKind::Refresh => &self.refresh_secret,
        }
    }

    fn mac(&self, kind: TokenKind) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(self.secret(kind).expose_secret().as_bytes())
            .map_err(|_| TokenError::InvalidKey("hmac rejected the secret"))
    }

    /// # Errors
    /// Returns an error if the token cannot be encoded or signed.
    pub fn sign(
        &self,
        user_id: Uuid,
        username: &str,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        self.sign_at(user_id, username, kind, ttl, unix_now())
    }

    /// Sign with an explicit issue time.
    ///
    /// # Errors
    /// Returns an error if the token cannot be encoded or signed.
    pub fn sign_at(
        &self,
        user_id: Uuid,
        username: &str,
        kind: TokenKind,
        ttl: Duration,
        now: i64,
    ) -> Result<IssuedToken, TokenError> {
        let ttl = i64::try_from(ttl.as_secs()).map_err(|_| TokenError::Malformed)?;
        let claims = Claims {
            sub: user_id.to_string(),
            user_id,
            username: username.to_string(),
            token_type: kind,
            iss: self.issuer.clone(),
            iat: now,
            nbf: now,
            exp: now.saturating_add(ttl),
            jti: Uuid::new_v4(),
        };
        let token = self.encode(&claims)?;

        Ok(IssuedToken {
            token,
            expires_at: claims.exp,
        })
    }

    fn encode(&self, claims: &Claims) -> Result<String, TokenError> {
        let header = Header {
            alg: ALG_HS256.to_string(),
            typ: TYP_JWT.to_string(),
        };
        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(claims)?);

        let mut mac = self.mac(claims.token_type)?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{signing_input}.{}",
            Base64UrlUnpadded::encode_string(&signature)
        ))
    }

    /// # Errors
    /// Returns an error if the token cannot be encoded or signed.
    pub fn issue_access(&self, user_id: Uuid, username: &str) -> Result<IssuedToken, TokenError> {
        self.sign(user_id, username, TokenKind::Access, self.access_ttl)
    }

    /// # Errors
    /// Returns an error if either token cannot be encoded or signed.
    pub fn issue_pair(&self, user_id: Uuid, username: &str) -> Result<TokenPair, TokenError> {
        let now = unix_now();
        Ok(TokenPair {
            access: self.sign_at(user_id, username, TokenKind::Access, self.access_ttl, now)?,
            refresh: self.sign_at(user_id, username, TokenKind::Refresh, self.refresh_ttl, now)?,
        })
    }

    /// # Errors
    /// See [`TokenIssuer::validate_at`].
    pub fn validate(&self, token: &str, expected: TokenKind) -> Result<Claims, TokenError> {
        self.validate_at(token, expected, unix_now())
    }

    /// Validate a token against the secret for `expected`.
    ///
    /// The header algorithm is checked before any signature work, so `none` and
    /// every other algorithm are refused outright.
    ///
    /// # Errors
    /// Returns an error if:
    /// - the token is not three base64url segments with JSON header and claims,
    /// - the algorithm is not HS256,
    /// - the signature does not match,
    /// - the claims fail validation (`exp`, `nbf`, `token_type`, `iss`).
    pub fn validate_at(
        &self,
        token: &str,
        expected: TokenKind,
        now: i64,
    ) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(TokenError::Malformed)?;
        let claims_b64 = parts.next().ok_or(TokenError::Malformed)?;
        let sig_b64 = parts.next().ok_or(TokenError::Malformed)?;
        if parts.next().is_some() || header_b64.is_empty() || claims_b64.is_empty() {
            return Err(TokenError::Malformed);
        }

        let header: Header = b64d_json(header_b64)?;
        if header.alg != ALG_HS256 {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let signature =
            Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::BadSignature)?;
        let mut mac = self.mac(expected)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = b64d_json(claims_b64)?;
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        if claims.nbf > now {
            return Err(TokenError::NotYetValid);
        }
        if claims.token_type != expected {
            return Err(TokenError::WrongKind {
                expected,
                actual: claims.token_type,
            });
        }
        if claims.iss != self.issuer {
            return Err(TokenError::InvalidIssuer);
        }

        Ok(claims)
    }
}
