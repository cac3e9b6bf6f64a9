//! In-memory TTL cache
//!
//! ⏳ Used for staged ACME challenges and for parsed handshake certificates.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Key/value map whose entries expire after a per-entry TTL.
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
}

/// Staged challenge values: `domain` (TLS-ALPN-01) or `domain/token` (HTTP-01)
pub type ChallengeCache = TtlCache<String>;

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace `key`
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key.into(), entry);
    }

    /// Fetch `key` unless it has expired
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // expired: drop it lazily
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        None
    }

    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// 🧹 Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = TtlCache::new();
        cache.set("example.com", "auth".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("example.com").as_deref(), Some("auth"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("example.com"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = TtlCache::new();
        cache.set("short", 1u8, Duration::from_secs(1));
        cache.set("long", 2u8, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get("long"), Some(2));

        cache.remove("long");
        assert!(cache.is_empty());
    }
}
