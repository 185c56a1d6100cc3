//! Client-side channel content cache.

use replicant_protocol::ChannelAddress;
use std::collections::HashMap;
use tracing::debug;

/// One cached channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Cache key (the channel descriptor).
    pub key: String,
    /// Validation tag supplied by the server.
    pub etag: String,
    /// Raw change-set payload.
    pub content: String,
}

/// Persists channel payloads keyed by channel descriptor and eTag.
///
/// Storage failures (quota) are recovered locally: `store` rolls back the
/// attempted write and returns `false`; they never propagate to the
/// subscribe flow.
pub trait CacheService {
    /// Looks up a cached payload.
    fn lookup(&self, key: &str) -> Option<CacheEntry>;

    /// Stores a payload, returning false if the write could not be kept.
    fn store(&mut self, key: &str, etag: &str, content: &str) -> bool;

    /// Removes a cached payload, returning true if one existed.
    fn invalidate(&mut self, key: &str) -> bool;

    /// Returns the addresses of cached channels belonging to a system.
    fn key_set(&self, system_id: u32) -> Vec<ChannelAddress>;
}

/// An in-memory cache service.
pub struct MemoryCacheService {
    entries: HashMap<String, CacheEntry>,
    /// Total content bytes allowed; writes beyond it fail and roll back.
    quota_bytes: Option<usize>,
}

impl MemoryCacheService {
    /// Creates an unbounded in-memory cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            quota_bytes: None,
        }
    }

    /// Creates a cache with a content-byte quota.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn used_bytes(&self) -> usize {
        self.entries.values().map(|e| e.content.len()).sum()
    }
}

impl Default for MemoryCacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheService for MemoryCacheService {
    fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).cloned()
    }

    fn store(&mut self, key: &str, etag: &str, content: &str) -> bool {
        let previous = self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                etag: etag.to_string(),
                content: content.to_string(),
            },
        );

        if let Some(quota) = self.quota_bytes {
            if self.used_bytes() > quota {
                // Roll back the write rather than keep a partially full cache.
                self.invalidate(key);
                debug!(key, "cache store exceeded quota, rolled back");
                return false;
            }
        }
        let _ = previous;
        true
    }

    fn invalidate(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn key_set(&self, system_id: u32) -> Vec<ChannelAddress> {
        let mut addresses: Vec<ChannelAddress> = self
            .entries
            .keys()
            .filter_map(|k| k.parse::<ChannelAddress>().ok())
            .filter(|a| a.system_id == system_id)
            .collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_lookup_roundtrip() {
        let mut cache = MemoryCacheService::new();
        assert!(cache.store("1.0", "abc", r#"{"last_id":1}"#));

        let entry = cache.lookup("1.0").unwrap();
        assert_eq!(entry.etag, "abc");
        assert_eq!(entry.content, r#"{"last_id":1}"#);
    }

    #[test]
    fn invalidate_removes() {
        let mut cache = MemoryCacheService::new();
        cache.store("1.0", "abc", "x");

        assert!(cache.invalidate("1.0"));
        assert!(cache.lookup("1.0").is_none());
        assert!(!cache.invalidate("1.0"));
    }

    #[test]
    fn quota_exceeded_rolls_back() {
        let mut cache = MemoryCacheService::with_quota(8);
        assert!(cache.store("1.0", "a", "12345678"));

        // Second write pushes total past the quota and must roll back.
        assert!(!cache.store("1.1", "b", "12345678"));
        assert!(cache.lookup("1.1").is_none());
        // The earlier entry survives.
        assert!(cache.lookup("1.0").is_some());
    }

    #[test]
    fn key_set_filters_by_system() {
        let mut cache = MemoryCacheService::new();
        cache.store("1.0", "a", "x");
        cache.store("1.2.5", "b", "y");
        cache.store("2.0", "c", "z");

        let keys = cache.key_set(1);
        assert_eq!(
            keys,
            vec![ChannelAddress::new(1, 0), ChannelAddress::instance(1, 2, 5)]
        );
    }
}
