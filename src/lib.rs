//! # Tessera (token authentication service)
//!
//! `tessera` authenticates users with a password and hands out signed,
//! short-lived access tokens plus longer-lived refresh tokens.
//!
//! ## Credentials
//!
//! Passwords are stored as Argon2id PHC strings. Verification re-derives the key
//! with the parameters recorded in the digest and compares in constant time.
//!
//! ## Tokens
//!
//! Tokens are HS256 JWTs. Access and refresh tokens are signed with different
//! secrets and carry a `token_type` claim that is checked on every validation.
//!
//! ## Revocation and caching
//!
//! A key-value store (Redis, or an in-process map for single instances) keeps two
//! namespaces keyed by the SHA-256 fingerprint of a token:
//!
//! - **known-valid:** skips signature work for tokens that were already checked.
//! - **revoked:** the logout blacklist, always consulted first.
//!
//! Entries never outlive the token they describe.
//!
//! ## Rate limiting
//!
//! Fixed-window counters per `(tier, client address)`. The `auth` tier guards
//! credential endpoints with a much lower budget than the `general` tier.

pub mod api;
pub mod auth;
pub mod cli;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Not built from a git checkout
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }
}
