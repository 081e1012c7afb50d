//! Known-valid cache and revocation list for signed tokens.
//!
//! Both namespaces are keyed by [`token_fingerprint`], never by the raw token,
//! and every entry expires no later than the token it describes.

use crate::store::{KvStore, StoreError};
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Write as _},
    str::FromStr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

const VALID_SEGMENT: &str = "jwt:valid";
const REVOKED_SEGMENT: &str = "jwt:revoked";
const REVOKED_MARKER: &str = "1";

/// What `is_revoked` answers when the store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RevocationPolicy {
    /// Treat the token as not revoked and keep serving.
    #[default]
    FailOpen,
    /// Treat the token as revoked.
    FailClosed,
}

impl FromStr for RevocationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-open" | "open" => Ok(Self::FailOpen),
            "fail-closed" | "closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown revocation policy: {other}")),
        }
    }
}

impl fmt::Display for RevocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailOpen => f.write_str("fail-open"),
            Self::FailClosed => f.write_str("fail-closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub enabled: bool,
    pub backend: &'static str,
    pub valid: u64,
    pub revoked: u64,
}

/// Hex SHA-256 of a token.
#[must_use]
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Short prefix of a fingerprint, enough to correlate log lines.
pub(crate) fn log_hash(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

/// Time left until `expires_at` (unix seconds), `None` once it has passed.
#[must_use]
pub fn remaining_ttl(expires_at: i64, now_millis: i64) -> Option<Duration> {
    let remaining = expires_at.saturating_mul(1000).saturating_sub(now_millis);
    u64::try_from(remaining)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[derive(Clone)]
pub struct TokenValidityStore {
    store: Option<Arc<dyn KvStore>>,
    namespace: String,
    policy: RevocationPolicy,
}

impl fmt::Debug for TokenValidityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidityStore")
            .field("backend", &self.store.as_ref().map(|store| store.backend()))
            .field("namespace", &self.namespace)
            .field("policy", &self.policy)
            .finish()
    }
}

impl TokenValidityStore {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            store: Some(store),
            namespace: namespace.into(),
            policy: RevocationPolicy::default(),
        }
    }

    /// A store where every operation is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            store: None,
            namespace: String::new(),
            policy: RevocationPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RevocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    #[must_use]
    pub const fn policy(&self) -> RevocationPolicy {
        self.policy
    }

    fn valid_key(&self, fingerprint: &str) -> String {
        format!("{}:{VALID_SEGMENT}:{fingerprint}", self.namespace)
    }

    fn revoked_key(&self, fingerprint: &str) -> String {
        format!("{}:{REVOKED_SEGMENT}:{fingerprint}", self.namespace)
    }

    /// Check the revocation list.
    ///
    /// Store failures never surface as errors. They are logged and answered
    /// according to the configured [`RevocationPolicy`].
    pub async fn is_revoked(&self, token: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let fingerprint = token_fingerprint(token);

        match store.exists(&self.revoked_key(&fingerprint)).await {
            Ok(revoked) => revoked,
            Err(err) => match self.policy {
                RevocationPolicy::FailOpen => {
                    error!(
                        security.degraded = true,
                        token_hash = log_hash(&fingerprint),
                        error = %err,
                        "Revocation check failed, allowing token"
                    );
                    false
                }
                RevocationPolicy::FailClosed => {
                    error!(
                        token_hash = log_hash(&fingerprint),
                        error = %err,
                        "Revocation check failed, rejecting token"
                    );
                    true
                }
            },
        }
    }

    /// Add a token to the revocation list until it expires.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn revoke(&self, token: &str, expires_at: i64) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let fingerprint = token_fingerprint(token);
        let Some(ttl) = remaining_ttl(expires_at, unix_millis()) else {
            debug!(
                token_hash = log_hash(&fingerprint),
                "Token already expired, nothing to revoke"
            );
            return Ok(());
        };

        store
            .set_ex(&self.revoked_key(&fingerprint), REVOKED_MARKER, ttl)
            .await?;
        debug!(
            token_hash = log_hash(&fingerprint),
            ttl_seconds = ttl.as_secs(),
            "Token revoked"
        );
        Ok(())
    }

    /// Record a validated token so later requests skip signature work.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn remember(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let fingerprint = token_fingerprint(token);
        let Some(ttl) = remaining_ttl(expires_at, unix_millis()) else {
            return Ok(());
        };

        store
            .set_ex(&self.valid_key(&fingerprint), &user_id.to_string(), ttl)
            .await?;
        debug!(
            token_hash = log_hash(&fingerprint),
            user_id = %user_id,
            ttl_seconds = ttl.as_secs(),
            "Token cached"
        );
        Ok(())
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn lookup(&self, token: &str) -> Result<Option<Uuid>, StoreError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let fingerprint = token_fingerprint(token);

        let Some(value) = store.get(&self.valid_key(&fingerprint)).await? else {
            return Ok(None);
        };
        match Uuid::parse_str(&value) {
            Ok(user_id) => Ok(Some(user_id)),
            Err(_) => {
                warn!(
                    token_hash = log_hash(&fingerprint),
                    "Ignoring unparseable cache entry"
                );
                Ok(None)
            }
        }
    }

    /// # Errors
    /// Returns an error if the store delete fails.
    pub async fn forget(&self, token: &str) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store
            .delete(&self.valid_key(&token_fingerprint(token)))
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the store cannot be scanned.
    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let Some(store) = &self.store else {
            return Ok(CacheStats {
                enabled: false,
                backend: "disabled",
                valid: 0,
                revoked: 0,
            });
        };
        let valid = store
            .count_prefix(&format!("{}:{VALID_SEGMENT}:", self.namespace))
            .await?;
        let revoked = store
            .count_prefix(&format!("{}:{REVOKED_SEGMENT}:", self.namespace))
            .await?;

        Ok(CacheStats {
            enabled: true,
            backend: store.backend(),
            valid,
            revoked,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FailingStore;
    use super::*;
    use crate::{auth::token::unix_now, store::MemoryStore};
    use anyhow::Result;

    fn validity() -> (Arc<MemoryStore>, TokenValidityStore) {
        let store = Arc::new(MemoryStore::new());
        let validity = TokenValidityStore::new(store.clone(), "test");
        (store, validity)
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        assert_eq!(
            token_fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(token_fingerprint("abc"), token_fingerprint("abd"));
    }

    #[test]
    fn remaining_ttl_bounds() {
        assert_eq!(remaining_ttl(100, 100_000), None);
        assert_eq!(remaining_ttl(100, 150_000), None);
        assert_eq!(
            remaining_ttl(100, 99_250),
            Some(Duration::from_millis(750))
        );
    }

    #[test]
    fn policy_from_str() {
        assert_eq!(
            "fail-open".parse::<RevocationPolicy>(),
            Ok(RevocationPolicy::FailOpen)
        );
        assert_eq!(
            "Fail-Closed".parse::<RevocationPolicy>(),
            Ok(RevocationPolicy::FailClosed)
        );
        assert!("sometimes".parse::<RevocationPolicy>().is_err());
        assert_eq!(RevocationPolicy::default(), RevocationPolicy::FailOpen);
    }

    #[tokio::test]
    async fn remember_lookup_forget() -> Result<()> {
        let (_, validity) = validity();
        let user = Uuid::new_v4();
        validity.remember("tok", user, unix_now() + 60).await?;
        assert_eq!(validity.lookup("tok").await?, Some(user));
        assert_eq!(validity.lookup("other").await?, None);
        validity.forget("tok").await?;
        assert_eq!(validity.lookup("tok").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn raw_token_never_stored() -> Result<()> {
        let (store, validity) = validity();
        validity.remember("secret-token", Uuid::new_v4(), unix_now() + 60).await?;
        validity.revoke("secret-token", unix_now() + 60).await?;
        let fingerprint = token_fingerprint("secret-token");
        assert!(store.exists(&format!("test:jwt:valid:{fingerprint}")).await?);
        assert!(store.exists(&format!("test:jwt:revoked:{fingerprint}")).await?);
        assert_eq!(store.count_prefix("test:").await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn remembered_then_revoked_is_revoked() -> Result<()> {
        let (_, validity) = validity();
        let exp = unix_now() + 60;
        validity.remember("tok", Uuid::new_v4(), exp).await?;
        assert!(!validity.is_revoked("tok").await);
        validity.revoke("tok", exp).await?;
        assert!(validity.is_revoked("tok").await);
        Ok(())
    }

    #[tokio::test]
    async fn ttl_bounded_by_token_lifetime() -> Result<()> {
        let (store, validity) = validity();
        let exp = unix_now() + 30;
        validity.remember("tok", Uuid::new_v4(), exp).await?;
        validity.revoke("tok", exp).await?;
        let fingerprint = token_fingerprint("tok");

        for key in [
            format!("test:jwt:valid:{fingerprint}"),
            format!("test:jwt:revoked:{fingerprint}"),
        ] {
            let ttl = store.ttl(&key);
            assert!(ttl.is_some_and(|ttl| ttl <= Duration::from_secs(30)), "{key}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn expired_tokens_are_not_written() -> Result<()> {
        let (store, validity) = validity();
        let exp = unix_now() - 1;
        validity.remember("tok", Uuid::new_v4(), exp).await?;
        validity.revoke("tok", exp).await?;
        assert_eq!(store.count_prefix("test:").await?, 0);
        assert!(!validity.is_revoked("tok").await);
        Ok(())
    }

    #[tokio::test]
    async fn unparseable_entry_is_a_miss() -> Result<()> {
        let (store, validity) = validity();
        let key = format!("test:jwt:valid:{}", token_fingerprint("tok"));
        store.set_ex(&key, "not-a-uuid", Duration::from_secs(60)).await?;
        assert_eq!(validity.lookup("tok").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn stats_count_each_namespace() -> Result<()> {
        let (_, validity) = validity();
        let exp = unix_now() + 60;
        validity.remember("a", Uuid::new_v4(), exp).await?;
        validity.remember("b", Uuid::new_v4(), exp).await?;
        validity.revoke("a", exp).await?;
        let stats = validity.stats().await?;
        assert!(stats.enabled);
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.valid, 2);
        assert_eq!(stats.revoked, 1);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_store_is_a_noop() -> Result<()> {
        let validity = TokenValidityStore::disabled();
        let exp = unix_now() + 60;
        validity.remember("tok", Uuid::new_v4(), exp).await?;
        validity.revoke("tok", exp).await?;
        validity.forget("tok").await?;
        assert!(!validity.is_revoked("tok").await);
        assert_eq!(validity.lookup("tok").await?, None);
        assert!(!validity.stats().await?.enabled);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_store_fails_open_by_default() {
        let validity = TokenValidityStore::new(Arc::new(FailingStore), "test");
        assert!(!validity.is_revoked("tok").await);
        assert!(validity.lookup("tok").await.is_err());
        assert!(validity.revoke("tok", unix_now() + 60).await.is_err());
    }

    #[tokio::test]
    async fn unavailable_store_can_fail_closed() {
        let validity = TokenValidityStore::new(Arc::new(FailingStore), "test")
            .with_policy(RevocationPolicy::FailClosed);
        assert!(validity.is_revoked("tok").await);
    }
}
