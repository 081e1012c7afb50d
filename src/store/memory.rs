use super::{Counter, KvStore, StoreError, StoreFuture};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug)]
struct Entries {
    map: HashMap<String, Entry>,
    last_sweep: Instant,
}

/// In-process store with lazy expiry.
///
/// Expired entries are dropped when touched. Writes sweep the whole map at
/// most once per sweep interval, so the map stays bounded by the live keys
/// plus whatever expired within the last interval.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    sweep_interval: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            sweep_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.clone()),
            Some(_) => {
                entries.map.remove(key);
                None
            }
            None => None,
        }
    }

    fn maybe_sweep(&self, entries: &mut Entries, now: Instant) {
        if now.saturating_duration_since(entries.last_sweep) < self.sweep_interval {
            return;
        }
        entries.map.retain(|_, entry| entry.is_live(now));
        entries.last_sweep = now;
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.lock().map.len()
    }

    /// Remaining time to live, `None` once the key is gone.
    #[cfg(test)]
    pub(crate) fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

impl KvStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.live(key).map(|entry| entry.value)) })
    }

    fn set_ex<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.lock();
            self.maybe_sweep(&mut entries, now);
            entries.map.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = Instant::now();
            let removed = self.lock().map.remove(key);
            Ok(removed.is_some_and(|entry| entry.is_live(now)))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.live(key).is_some()) })
    }

    fn incr_with_ttl<'a>(&'a self, key: &'a str, window: Duration) -> StoreFuture<'a, Counter> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.lock();
            self.maybe_sweep(&mut entries, now);

            let entry = entries.map.entry(key.to_string()).or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: Some(now + window),
            });
            let count = entry
                .value
                .parse::<u64>()
                .map_err(|_| StoreError::Corrupt {
                    key: key.to_string(),
                })?
                .saturating_add(1);
            entry.value = count.to_string();
            let expires_at = *entry.expires_at.get_or_insert(now + window);

            Ok(Counter {
                count,
                ttl: expires_at.saturating_duration_since(now),
            })
        })
    }

    fn count_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let now = Instant::now();
            let count = self
                .lock()
                .map
                .iter()
                .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
                .count();
            Ok(u64::try_from(count).unwrap_or(u64::MAX))
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn set_get_delete() -> Result<()> {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await?;
        assert_eq!(store.get("k").await?, Some("v".to_string()));
        assert!(store.exists("k").await?);
        assert!(store.delete("k").await?);
        assert!(!store.delete("k").await?);
        assert_eq!(store.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn entries_expire() -> Result<()> {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_millis(20)).await?;
        assert!(store.exists("k").await?);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await?);
        assert_eq!(store.ttl("k"), None);
        Ok(())
    }

    #[tokio::test]
    async fn ttl_never_exceeds_requested() -> Result<()> {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(30)).await?;
        let ttl = store.ttl("k");
        assert!(ttl.is_some_and(|ttl| ttl <= Duration::from_secs(30)));
        Ok(())
    }

    #[tokio::test]
    async fn counter_keeps_first_window() -> Result<()> {
        let store = MemoryStore::new();
        let first = store.incr_with_ttl("c", Duration::from_secs(60)).await?;
        assert_eq!(first.count, 1);
        let second = store.incr_with_ttl("c", Duration::from_secs(600)).await?;
        assert_eq!(second.count, 2);
        // The longer window on the second call must not extend the first one.
        assert!(second.ttl <= Duration::from_secs(60));
        Ok(())
    }

    #[tokio::test]
    async fn counter_restarts_after_window() -> Result<()> {
        let store = MemoryStore::new();
        store.incr_with_ttl("c", Duration::from_millis(20)).await?;
        store.incr_with_ttl("c", Duration::from_millis(20)).await?;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let counter = store.incr_with_ttl("c", Duration::from_millis(20)).await?;
        assert_eq!(counter.count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn counter_on_text_value_is_corrupt() -> Result<()> {
        let store = MemoryStore::new();
        store.set_ex("c", "abc", Duration::from_secs(60)).await?;
        let result = store.incr_with_ttl("c", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn sweep_drops_expired_keys() -> Result<()> {
        let store = MemoryStore::with_sweep_interval(Duration::from_millis(10));
        for i in 0..50 {
            store
                .incr_with_ttl(&format!("c:{i}"), Duration::from_millis(200))
                .await?;
        }
        assert_eq!(store.stored(), 50);
        tokio::time::sleep(Duration::from_millis(300)).await;
        store.set_ex("live", "x", Duration::from_secs(60)).await?;
        assert_eq!(store.stored(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_waits_for_interval() -> Result<()> {
        let store = MemoryStore::with_sweep_interval(Duration::from_secs(3600));
        store.set_ex("old", "x", Duration::from_millis(10)).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set_ex("new", "x", Duration::from_secs(60)).await?;
        // Not swept yet, but never served.
        assert_eq!(store.stored(), 2);
        assert!(!store.exists("old").await?);
        assert_eq!(store.count_prefix("old").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn count_prefix_ignores_other_namespaces() -> Result<()> {
        let store = MemoryStore::new();
        store.set_ex("a:1", "x", Duration::from_secs(60)).await?;
        store.set_ex("a:2", "x", Duration::from_secs(60)).await?;
        store.set_ex("b:1", "x", Duration::from_secs(60)).await?;
        assert_eq!(store.count_prefix("a:").await?, 2);
        assert_eq!(store.count_prefix("b:").await?, 1);
        assert_eq!(store.count_prefix("c:").await?, 0);
        Ok(())
    }
}
