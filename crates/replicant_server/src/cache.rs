//! Server-side channel content cache.
//!
//! Cacheable channels keep their initial-subscribe change-set in memory so
//! repeated subscribes across sessions skip the loader. The global map lock
//! is held only to find or create a channel's slot; population runs under
//! the slot's own lock, so filling one channel's cache never blocks
//! unrelated channels.

use crate::error::ServerResult;
use parking_lot::RwLock;
use replicant_protocol::{ChangeSet, ChannelAddress};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Cached content for one channel.
#[derive(Debug, Clone)]
pub struct ChannelCacheEntry {
    /// Validation tag identifying this version of the content.
    pub etag: String,
    /// The channel's initial-subscribe change-set body.
    pub change_set: ChangeSet,
    /// Set when the channel's root entity was deleted.
    pub root_deleted: bool,
}

impl ChannelCacheEntry {
    /// Creates an entry with a fresh eTag.
    pub fn new(change_set: ChangeSet) -> Self {
        Self {
            etag: new_etag(),
            change_set,
            root_deleted: false,
        }
    }

    /// Creates an entry recording a deleted root.
    pub fn deleted() -> Self {
        Self {
            etag: new_etag(),
            change_set: ChangeSet::default(),
            root_deleted: true,
        }
    }
}

/// Generates a cache validation tag.
pub fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Default)]
struct CacheSlot {
    entry: RwLock<Option<ChannelCacheEntry>>,
}

/// Cache of initial-subscribe content for cacheable channels.
#[derive(Debug, Default)]
pub struct ChannelCache {
    slots: RwLock<HashMap<ChannelAddress, Arc<CacheSlot>>>,
}

impl ChannelCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached entry for `address`, populating it with
    /// `populate` on first use. Double-checked: a concurrent populator
    /// wins and its entry is returned.
    pub fn get_or_populate(
        &self,
        address: ChannelAddress,
        populate: impl FnOnce() -> ServerResult<ChannelCacheEntry>,
    ) -> ServerResult<ChannelCacheEntry> {
        let slot = {
            let existing = self.slots.read().get(&address).map(Arc::clone);
            if let Some(slot) = existing {
                slot
            } else {
                let mut slots = self.slots.write();
                Arc::clone(slots.entry(address).or_default())
            }
        };

        if let Some(entry) = slot.entry.read().as_ref() {
            return Ok(entry.clone());
        }
        let mut guard = slot.entry.write();
        if let Some(entry) = guard.as_ref() {
            return Ok(entry.clone());
        }
        let entry = populate()?;
        debug!(%address, etag = entry.etag, "populated channel cache");
        *guard = Some(entry.clone());
        Ok(entry)
    }

    /// Peeks at the cached entry without populating.
    pub fn get(&self, address: &ChannelAddress) -> Option<ChannelCacheEntry> {
        let slot = Arc::clone(self.slots.read().get(address)?);
        let entry = slot.entry.read().clone();
        entry
    }

    /// Drops the cached content for a channel. Returns true if content
    /// existed.
    pub fn invalidate(&self, address: &ChannelAddress) -> bool {
        let Some(slot) = self.slots.read().get(address).map(Arc::clone) else {
            return false;
        };
        let existed = slot.entry.write().take().is_some();
        if existed {
            debug!(%address, "invalidated channel cache");
        }
        existed
    }

    /// Drops all cached content.
    pub fn clear(&self) {
        self.slots.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populates_once() {
        let cache = ChannelCache::new();
        let address = ChannelAddress::new(1, 0);

        let first = cache
            .get_or_populate(address, || Ok(ChannelCacheEntry::new(ChangeSet::new(0))))
            .unwrap();
        let second = cache
            .get_or_populate(address, || {
                panic!("must not repopulate a warm cache");
            })
            .unwrap();
        assert_eq!(first.etag, second.etag);
    }

    #[test]
    fn invalidate_forces_repopulation() {
        let cache = ChannelCache::new();
        let address = ChannelAddress::new(1, 0);

        let first = cache
            .get_or_populate(address, || Ok(ChannelCacheEntry::new(ChangeSet::new(0))))
            .unwrap();
        assert!(cache.invalidate(&address));
        assert!(!cache.invalidate(&address));

        let second = cache
            .get_or_populate(address, || Ok(ChannelCacheEntry::new(ChangeSet::new(0))))
            .unwrap();
        assert_ne!(first.etag, second.etag);
    }

    #[test]
    fn etags_are_unique() {
        assert_ne!(new_etag(), new_etag());
    }
}
