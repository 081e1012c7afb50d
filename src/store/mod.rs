//! TTL-capable key-value storage.
//!
//! Token fingerprints and rate-limit counters live here. Two backends exist:
//! [`RedisStore`] for deployments with more than one instance and
//! [`MemoryStore`] for single instances and tests. Callers only see the
//! object-safe [`KvStore`] trait.

use std::{future::Future, pin::Pin, time::Duration};

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected value stored under {key}")]
    Corrupt { key: String },
}

impl StoreError {
    pub(crate) fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Result of a fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Value after the increment.
    pub count: u64,
    /// Time until the window closes.
    pub ttl: Duration,
}

pub trait KvStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Writes `value` with a time to live. A zero `ttl` must not be passed.
    fn set_ex<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Returns `true` if a key was removed.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Increments a counter, starting its window on the first increment.
    ///
    /// The expiry is only set when the key has none, so repeated calls inside a
    /// window never extend it.
    fn incr_with_ttl<'a>(&'a self, key: &'a str, window: Duration) -> StoreFuture<'a, Counter>;

    fn count_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, u64>;

    fn ping(&self) -> StoreFuture<'_, ()>;

    fn backend(&self) -> &'static str;
}
