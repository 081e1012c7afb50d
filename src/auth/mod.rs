//! Authentication and session integrity.
//!
//! Leaves first: [`password`] and [`token`] have no dependencies, [`validity`]
//! sits on a [`crate::store::KvStore`], [`gate`] combines the two token pieces
//! per request and [`rate_limit`] runs ahead of everything.

pub mod error;
pub mod gate;
pub mod password;
pub mod rate_limit;
pub mod token;
pub mod validity;

pub use self::error::AuthError;
pub use self::gate::{AuthGate, AuthenticatedUser, IdentitySource};
pub use self::password::{PasswordError, PasswordHasher, PasswordParams};
pub use self::rate_limit::{RateLimitDecision, RateLimitTier, RateLimiter, TierConfig};
pub use self::token::{Claims, IssuedToken, TokenError, TokenIssuer, TokenKind, TokenPair};
pub use self::validity::{RevocationPolicy, TokenValidityStore};
