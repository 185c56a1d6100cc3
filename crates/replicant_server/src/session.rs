//! Per-session subscription state.

use parking_lot::{Mutex, MutexGuard};
use replicant_protocol::{ChangeSet, ChannelAddress};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use uuid::Uuid;

/// One session's record of a channel subscription.
///
/// Entries form a directed link graph: `outward_links` names the channels
/// this channel's content references (implicitly subscribed through links),
/// `inward_links` the channels referencing this one. An implicit entry stays
/// alive as long as any inward link remains.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEntry {
    /// The subscribed channel.
    pub address: ChannelAddress,
    /// The filter in effect.
    pub filter: Option<Value>,
    /// True once the client subscribed directly; sticky across repeated
    /// subscribes.
    pub explicit: bool,
    /// Channels this entry links to.
    pub outward_links: BTreeSet<ChannelAddress>,
    /// Channels linking to this entry.
    pub inward_links: BTreeSet<ChannelAddress>,
}

impl SubscriptionEntry {
    /// Creates an entry.
    pub fn new(address: ChannelAddress, filter: Option<Value>, explicit: bool) -> Self {
        Self {
            address,
            filter,
            explicit,
            outward_links: BTreeSet::new(),
            inward_links: BTreeSet::new(),
        }
    }

    /// Returns true if nothing keeps this entry alive: not explicitly
    /// subscribed and no remaining inward links.
    pub fn can_unsubscribe(&self) -> bool {
        !self.explicit && self.inward_links.is_empty()
    }
}

/// Mutable session state, guarded by the session's lock.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Subscription entries by address.
    pub entries: BTreeMap<ChannelAddress, SubscriptionEntry>,
    /// eTags the client is known to hold, by address.
    pub etags: HashMap<ChannelAddress, String>,
    /// Set once the `auth` command succeeded.
    pub authorized: bool,
    /// Cleared when the session is invalidated.
    pub open: bool,
    /// Broadcast change-sets awaiting transmission.
    pub outbound: VecDeque<ChangeSet>,
    next_sequence: u64,
}

impl SessionState {
    /// Allocates the next outbound change-set sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

/// One client session.
///
/// All mutation happens under the session's exclusive lock; the session
/// manager acquires it per operation.
#[derive(Debug)]
pub struct Session {
    /// Session id.
    pub id: Uuid,
    state: Mutex<SessionState>,
}

impl Session {
    /// Creates an open, unauthorized session with a fresh id.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(SessionState {
                open: true,
                ..SessionState::default()
            }),
        }
    }

    /// Locks the session state.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_lifetimes() {
        let mut entry = SubscriptionEntry::new(ChannelAddress::new(1, 0), None, true);
        assert!(!entry.can_unsubscribe());

        entry.explicit = false;
        assert!(entry.can_unsubscribe());

        entry.inward_links.insert(ChannelAddress::new(1, 1));
        assert!(!entry.can_unsubscribe());
    }

    #[test]
    fn sequences_are_monotonic_per_session() {
        let session = Session::new();
        let mut state = session.lock();
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);
    }

    #[test]
    fn sessions_get_distinct_ids() {
        assert_ne!(Session::new().id, Session::new().id);
    }
}
