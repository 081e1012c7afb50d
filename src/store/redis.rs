use super::{Counter, KvStore, StoreError, StoreFuture, StoreResult};
use ::redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::time::Duration;
use tracing::debug;

const SCAN_BATCH: usize = 500;

/// Shared store backed by Redis.
///
/// Every operation is a single round trip on a cloned [`ConnectionManager`],
/// which reconnects on its own after a dropped connection.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(StoreError::unavailable)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(StoreError::unavailable)?;
        Ok(Self { manager })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// PTTL answers -2 for a missing key and -1 for a key without expiry.
fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

/// Escape glob metacharacters so a namespace can be used in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

impl KvStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = conn.get(key).await.map_err(StoreError::unavailable)?;
            Ok(value)
        })
    }

    fn set_ex<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: () = ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(StoreError::unavailable)?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: i64 = conn.del(key).await.map_err(StoreError::unavailable)?;
            Ok(removed > 0)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let found: i64 = conn.exists(key).await.map_err(StoreError::unavailable)?;
            Ok(found > 0)
        })
    }

    fn incr_with_ttl<'a>(&'a self, key: &'a str, window: Duration) -> StoreFuture<'a, Counter> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            // MULTI/EXEC keeps INCR and the first-window expiry together; NX makes
            // later increments leave the running window alone.
            let (count, pttl): (u64, i64) = ::redis::pipe()
                .atomic()
                .cmd("INCR")
                .arg(key)
                .cmd("PEXPIRE")
                .arg(key)
                .arg(millis(window))
                .arg("NX")
                .ignore()
                .cmd("PTTL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(StoreError::unavailable)?;

            Ok(Counter {
                count,
                ttl: pttl_to_duration(pttl).unwrap_or(window),
            })
        })
    }

    fn count_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let pattern = glob_escape(prefix);
            let mut cursor: u64 = 0;
            let mut total: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(StoreError::unavailable)?;
                total += u64::try_from(keys.len()).unwrap_or(u64::MAX);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            debug!(prefix, total, "Counted keys");
            Ok(total)
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: String = ::redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(StoreError::unavailable)?;
            Ok(())
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pttl_sentinels_are_none() {
        assert_eq!(pttl_to_duration(-2), None);
        assert_eq!(pttl_to_duration(-1), None);
        assert_eq!(pttl_to_duration(1500), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn glob_escape_metacharacters() {
        assert_eq!(glob_escape("tessera:jwt:valid:"), "tessera:jwt:valid:*");
        assert_eq!(glob_escape("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }
}
