//! Data collection boundary toward the persistence layer.
//!
//! The session manager never reads storage itself; it asks a [`DataLoader`]
//! for the current content of a channel when a subscription is established
//! or refiltered. The loader also owns filter evaluation for broadcast
//! routing, since only the persistence layer knows the attribute semantics
//! filters refer to.

use crate::error::{ServerError, ServerResult};
use replicant_protocol::{ChannelAddress, ChannelLink, EntityChange, EntityMessage};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Current content of one channel, as collected for a subscribe or filter
/// update.
#[derive(Debug, Clone, Default)]
pub struct ChannelContent {
    /// Entity changes describing the channel's current state. For filter
    /// updates this includes removes for entities no longer matching.
    pub changes: Vec<EntityChange>,
    /// Links from this channel to channels its content references.
    pub links: Vec<ChannelLink>,
}

/// Outcome of collecting a channel's content.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    /// The channel exists; here is its content.
    Content(ChannelContent),
    /// The channel's root entity has been deleted.
    RootDeleted,
}

/// Collects channel content and evaluates filters on behalf of the session
/// manager.
pub trait DataLoader {
    /// Collects the current content of a channel for a fresh subscription.
    fn collect_for_subscribe(
        &self,
        address: &ChannelAddress,
        filter: Option<&Value>,
    ) -> ServerResult<LoadOutcome>;

    /// Collects the delta for an in-place filter update: adds for newly
    /// matching entities and removes for entities that no longer match.
    fn collect_for_subscription_update(
        &self,
        address: &ChannelAddress,
        old_filter: Option<&Value>,
        new_filter: Option<&Value>,
    ) -> ServerResult<ChannelContent>;

    /// Collects content for several channels in one pass. Returning `None`
    /// refuses the bulk path; the caller falls back to per-channel
    /// collection.
    fn collect_bulk_subscribe(
        &self,
        addresses: &[ChannelAddress],
        filter: Option<&Value>,
    ) -> ServerResult<Option<Vec<(ChannelAddress, LoadOutcome)>>> {
        let _ = (addresses, filter);
        Ok(None)
    }

    /// Collects filter-update deltas for several channels sharing one old
    /// and one new filter. Returning `None` refuses the bulk path.
    fn collect_bulk_subscription_update(
        &self,
        addresses: &[ChannelAddress],
        old_filter: Option<&Value>,
        new_filter: Option<&Value>,
    ) -> ServerResult<Option<Vec<(ChannelAddress, ChannelContent)>>> {
        let _ = (addresses, old_filter, new_filter);
        Ok(None)
    }

    /// Returns true if `message` passes the filter in effect on `address`.
    /// The default accepts everything, matching unfiltered channels.
    fn filter_allows(
        &self,
        address: &ChannelAddress,
        filter: Option<&Value>,
        message: &EntityMessage,
    ) -> bool {
        let _ = (address, filter, message);
        true
    }

    /// Derives the filter for an implicit subscription created through a
    /// channel link to `target`.
    fn derive_link_filter(&self, target: &ChannelAddress) -> Option<Value> {
        let _ = target;
        None
    }
}

/// An in-memory loader for tests: channel content is seeded up front.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    content: HashMap<ChannelAddress, LoadOutcome>,
    failing: HashSet<ChannelAddress>,
    /// When false, bulk collection is refused and callers fall back to
    /// per-channel subscribes.
    pub bulk_supported: bool,
}

impl MemoryLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a channel with content.
    pub fn seed(&mut self, address: ChannelAddress, content: ChannelContent) {
        self.content.insert(address, LoadOutcome::Content(content));
    }

    /// Seeds a channel whose root entity is deleted.
    pub fn seed_deleted(&mut self, address: ChannelAddress) {
        self.content.insert(address, LoadOutcome::RootDeleted);
    }

    /// Seeds a channel whose collection fails.
    pub fn seed_failure(&mut self, address: ChannelAddress) {
        self.failing.insert(address);
    }
}

impl DataLoader for MemoryLoader {
    fn collect_for_subscribe(
        &self,
        address: &ChannelAddress,
        _filter: Option<&Value>,
    ) -> ServerResult<LoadOutcome> {
        if self.failing.contains(address) {
            return Err(ServerError::LoadFailed {
                address: *address,
                reason: "seeded failure".into(),
            });
        }
        Ok(self
            .content
            .get(address)
            .cloned()
            .unwrap_or(LoadOutcome::Content(ChannelContent::default())))
    }

    fn collect_for_subscription_update(
        &self,
        _address: &ChannelAddress,
        _old_filter: Option<&Value>,
        _new_filter: Option<&Value>,
    ) -> ServerResult<ChannelContent> {
        Ok(ChannelContent::default())
    }

    fn collect_bulk_subscribe(
        &self,
        addresses: &[ChannelAddress],
        filter: Option<&Value>,
    ) -> ServerResult<Option<Vec<(ChannelAddress, LoadOutcome)>>> {
        if !self.bulk_supported {
            return Ok(None);
        }
        let mut results = Vec::with_capacity(addresses.len());
        for address in addresses {
            results.push((*address, self.collect_for_subscribe(address, filter)?));
        }
        Ok(Some(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseeded_channel_is_empty_content() {
        let loader = MemoryLoader::new();
        let outcome = loader
            .collect_for_subscribe(&ChannelAddress::new(1, 0), None)
            .unwrap();
        assert!(matches!(outcome, LoadOutcome::Content(c) if c.changes.is_empty()));
    }

    #[test]
    fn bulk_refused_unless_enabled() {
        let mut loader = MemoryLoader::new();
        let addresses = [ChannelAddress::new(1, 0)];
        assert!(loader
            .collect_bulk_subscribe(&addresses, None)
            .unwrap()
            .is_none());

        loader.bulk_supported = true;
        let results = loader
            .collect_bulk_subscribe(&addresses, None)
            .unwrap()
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}
