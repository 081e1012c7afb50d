//! Fixed-window request limits per tier and client address.
//!
//! Counters live in-process by default. With a shared store every instance
//! increments the same counter, so the budget holds across the fleet. If the
//! shared store fails, the request is counted locally instead.

use crate::store::{Counter, KvStore, MemoryStore};
use std::{fmt, sync::Arc, time::Duration};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    /// Every limited route.
    General,
    /// Credential endpoints.
    Auth,
}

impl RateLimitTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Auth => "auth",
        }
    }

    #[must_use]
    pub const fn error_code(self) -> &'static str {
        match self {
            Self::General => "rate_limit_exceeded",
            Self::Auth => "auth_rate_limit_exceeded",
        }
    }

    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::General => "too many requests, please try again later",
            Self::Auth => "too many authentication attempts, please try again later",
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierConfig {
    pub enabled: bool,
    pub max: u64,
    pub window: Duration,
}

impl TierConfig {
    #[must_use]
    pub const fn default_for(tier: RateLimitTier) -> Self {
        match tier {
            RateLimitTier::General => Self {
                enabled: true,
                max: 100,
                window: Duration::from_secs(60),
            },
            RateLimitTier::Auth => Self {
                enabled: true,
                max: 5,
                window: Duration::from_secs(60),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests seen in the current window, including this one.
    pub count: u64,
    pub limit: u64,
    /// Set when the request was rejected.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    const fn unlimited() -> Self {
        Self {
            allowed: true,
            count: 0,
            limit: 0,
            retry_after: None,
        }
    }

    /// `Retry-After` value in whole seconds, never zero.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.map_or(1, |ttl| {
            let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
            secs.max(1)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBackend {
    Local,
    Shared,
}

pub struct RateLimiter {
    namespace: String,
    general: TierConfig,
    auth: TierConfig,
    local: MemoryStore,
    shared: Option<Arc<dyn KvStore>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("namespace", &self.namespace)
            .field("general", &self.general)
            .field("auth", &self.auth)
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            general: TierConfig::default_for(RateLimitTier::General),
            auth: TierConfig::default_for(RateLimitTier::Auth),
            local: MemoryStore::new(),
            shared: None,
        }
    }

    #[must_use]
    pub fn with_tier(mut self, tier: RateLimitTier, config: TierConfig) -> Self {
        match tier {
            RateLimitTier::General => self.general = config,
            RateLimitTier::Auth => self.auth = config,
        }
        self
    }

    /// Count requests in a store shared by every instance.
    #[must_use]
    pub fn with_shared(mut self, store: Arc<dyn KvStore>) -> Self {
        self.shared = Some(store);
        self
    }

    #[must_use]
    pub const fn config(&self, tier: RateLimitTier) -> TierConfig {
        match tier {
            RateLimitTier::General => self.general,
            RateLimitTier::Auth => self.auth,
        }
    }

    #[must_use]
    pub const fn backend(&self) -> CounterBackend {
        if self.shared.is_some() {
            CounterBackend::Shared
        } else {
            CounterBackend::Local
        }
    }

    fn key(&self, tier: RateLimitTier, client: &str) -> String {
        format!("{}:ratelimit:{tier}:{client}", self.namespace)
    }

    /// Count one request from `client` and decide whether it may proceed.
    ///
    /// The counter is incremented even for rejected requests, so a client that
    /// keeps hammering stays limited until the window closes.
    pub async fn check(&self, tier: RateLimitTier, client: &str) -> RateLimitDecision {
        let config = self.config(tier);
        if !config.enabled {
            return RateLimitDecision::unlimited();
        }
        let key = self.key(tier, client);

        let Some(counter) = self.increment(&key, config.window).await else {
            return RateLimitDecision::unlimited();
        };

        let allowed = counter.count <= config.max;
        RateLimitDecision {
            allowed,
            count: counter.count,
            limit: config.max,
            retry_after: (!allowed).then_some(counter.ttl),
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Option<Counter> {
        if let Some(shared) = &self.shared {
            match shared.incr_with_ttl(key, window).await {
                Ok(counter) => return Some(counter),
                Err(err) => {
                    error!(
                        error = %err,
                        key,
                        "Shared rate limit store failed, counting locally"
                    );
                }
            }
        }

        match self.local.incr_with_ttl(key, window).await {
            Ok(counter) => Some(counter),
            Err(err) => {
                error!(error = %err, key, "Local rate limit counter failed, allowing request");
                None
            }
        }
    }
}
