//! Session manager: subscription bookkeeping and broadcast assembly.
//!
//! One manager serves one channel system. It owns the session registry, the
//! channel cache and the link-expansion machinery, and assembles the
//! change-sets each operation ships back to its client. Per-session state is
//! mutated under the session's exclusive lock; the session map itself takes
//! its own read/write lock only for lookup and create/invalidate.

use crate::cache::{ChannelCache, ChannelCacheEntry};
use crate::error::{ServerError, ServerResult};
use crate::loader::{DataLoader, LoadOutcome};
use crate::session::{Session, SessionState, SubscriptionEntry};
use parking_lot::RwLock;
use replicant_protocol::{
    ChangeSet, ChannelAction, ChannelActionType, ChannelAddress, ChannelLink, EntityChange,
    EntityMessage, FilterType, SchemaRegistry,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of a subscribe, beyond the change-set it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// A subscription was established and its content shipped.
    Added,
    /// The filter of an existing subscription was updated in place.
    Updated,
    /// The session was already subscribed with this filter.
    NoChange,
    /// The client's cached content is current; no payload shipped.
    UseCache {
        /// The eTag that validated.
        etag: String,
    },
    /// The channel's root entity is deleted; a DELETE action shipped.
    RootDeleted,
}

/// Server-side runtime for one channel system.
pub struct SessionManager<L: DataLoader> {
    registry: Arc<SchemaRegistry>,
    system_id: u32,
    loader: L,
    cache: ChannelCache,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl<L: DataLoader> SessionManager<L> {
    /// Creates a manager for `system_id`, which must be registered.
    pub fn new(registry: Arc<SchemaRegistry>, system_id: u32, loader: L) -> ServerResult<Self> {
        registry.system(system_id)?;
        Ok(Self {
            registry,
            system_id,
            loader,
            cache: ChannelCache::new(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// The system this manager serves.
    pub fn system_id(&self) -> u32 {
        self.system_id
    }

    /// The channel cache.
    pub fn cache(&self) -> &ChannelCache {
        &self.cache
    }

    /// Creates and registers a new session.
    pub fn create_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        self.sessions
            .write()
            .insert(session.id, Arc::clone(&session));
        debug!(session_id = %session.id, "created session");
        session
    }

    /// Looks up a session by id.
    pub fn session(&self, session_id: &Uuid) -> ServerResult<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or(ServerError::SessionNotFound {
                session_id: *session_id,
            })
    }

    /// Closes a session: removes it from the registry and releases its
    /// entries and eTag table.
    pub fn invalidate_session(&self, session_id: &Uuid) {
        if let Some(session) = self.sessions.write().remove(session_id) {
            let mut state = session.lock();
            state.open = false;
            state.entries.clear();
            state.etags.clear();
            state.outbound.clear();
            debug!(%session_id, "invalidated session");
        }
    }

    /// Records eTags the client reports holding.
    pub fn record_etags(&self, session: &Session, etags: HashMap<ChannelAddress, String>) {
        session.lock().etags.extend(etags);
    }

    /// Drains the session's queued broadcast change-sets.
    pub fn take_outbound(&self, session: &Session) -> Vec<ChangeSet> {
        session.lock().outbound.drain(..).collect()
    }

    /// Subscribes the session to a channel explicitly. Returns the outcome
    /// and the change-set to ship, if the operation produced one.
    pub fn subscribe(
        &self,
        session: &Session,
        address: ChannelAddress,
        filter: Option<Value>,
        client_etag: Option<&str>,
    ) -> ServerResult<(SubscribeOutcome, Option<ChangeSet>)> {
        let mut state = session.lock();
        let mut out = ChangeSet::default();
        let outcome =
            self.subscribe_locked(&mut state, address, true, filter, client_etag, &mut out)?;
        Ok((outcome, Self::finish(&mut state, out)))
    }

    /// Unsubscribes the session from an explicitly subscribed channel,
    /// cascading through implicit link targets left unreferenced.
    pub fn unsubscribe(
        &self,
        session: &Session,
        address: &ChannelAddress,
    ) -> ServerResult<Option<ChangeSet>> {
        let mut state = session.lock();
        let mut out = ChangeSet::default();
        self.unsubscribe_locked(&mut state, address, &mut out)?;
        Ok(Self::finish(&mut state, out))
    }

    /// Subscribes several channels in one operation. Best-effort: every
    /// entry is attempted; the last error is returned after the loop.
    pub fn bulk_subscribe(
        &self,
        session: &Session,
        addresses: &[ChannelAddress],
        filter: Option<Value>,
    ) -> ServerResult<Option<ChangeSet>> {
        let mut state = session.lock();
        let mut out = ChangeSet::default();
        let mut last_error = None;

        let new_addresses: Vec<ChannelAddress> = addresses
            .iter()
            .filter(|a| !state.entries.contains_key(a))
            .copied()
            .collect();
        let existing: Vec<ChannelAddress> = addresses
            .iter()
            .filter(|a| state.entries.contains_key(a))
            .copied()
            .collect();

        let mut bulk_loaded = false;
        if !new_addresses.is_empty() {
            match self
                .loader
                .collect_bulk_subscribe(&new_addresses, filter.as_ref())
            {
                Ok(Some(results)) => {
                    bulk_loaded = true;
                    for (address, outcome) in results {
                        if let Err(err) = self.apply_collected(
                            &mut state,
                            address,
                            true,
                            filter.clone(),
                            outcome,
                            &mut out,
                        ) {
                            warn!(%address, error = %err, "bulk subscribe entry failed");
                            last_error = Some(err);
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => last_error = Some(err),
            }
        }
        if !bulk_loaded {
            for address in &new_addresses {
                if let Err(err) = self.subscribe_locked(
                    &mut state,
                    *address,
                    true,
                    filter.clone(),
                    None,
                    &mut out,
                ) {
                    warn!(address = %address, error = %err, "bulk subscribe entry failed");
                    last_error = Some(err);
                }
            }
        }

        if let Err(err) = self.bulk_update_existing(&mut state, &existing, &filter, &mut out) {
            last_error = Some(err);
        }

        match last_error {
            Some(err) => {
                // Entries that succeeded already changed the session; their
                // content still has to reach the client.
                if let Some(partial) = Self::finish(&mut state, out) {
                    state.outbound.push_back(partial);
                }
                Err(err)
            }
            None => Ok(Self::finish(&mut state, out)),
        }
    }

    /// Unsubscribes several channels. Best-effort, last error wins.
    pub fn bulk_unsubscribe(
        &self,
        session: &Session,
        addresses: &[ChannelAddress],
    ) -> ServerResult<Option<ChangeSet>> {
        let mut state = session.lock();
        let mut out = ChangeSet::default();
        let mut last_error = None;
        for address in addresses {
            if let Err(err) = self.unsubscribe_locked(&mut state, address, &mut out) {
                warn!(%address, error = %err, "bulk unsubscribe entry failed");
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => {
                // The removals that went through still ship.
                if let Some(partial) = Self::finish(&mut state, out) {
                    state.outbound.push_back(partial);
                }
                Err(err)
            }
            None => Ok(Self::finish(&mut state, out)),
        }
    }

    /// Broadcasts a committed batch of entity messages to every open
    /// session, deletes first, then updates, routing each message through
    /// the session's subscribed channels and filters. Returns true if the
    /// broadcast produced content for the initiating session.
    pub fn save_entity_messages(
        &self,
        initiator: Option<Uuid>,
        request_id: Option<u64>,
        messages: &[EntityMessage],
        initiator_changes: Option<&ChangeSet>,
    ) -> ServerResult<bool> {
        // Any update touching a channel's data invalidates its cached
        // initial content.
        for message in messages {
            for targets in message.routing_keys.values() {
                for address in targets {
                    self.cache.invalidate(address);
                }
            }
        }

        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut impacts_initiator = false;
        for session in sessions {
            let is_initiator = Some(session.id) == initiator;
            let mut state = session.lock();
            if !state.open {
                continue;
            }
            let mut out = ChangeSet::default();
            if is_initiator {
                if let Some(own) = initiator_changes {
                    Self::merge_into(&mut out, own);
                }
                out.request_id = request_id;
            }

            let mut links: Vec<ChannelLink> = Vec::new();
            for message in messages.iter().filter(|m| !m.is_update()) {
                self.route_message(&state, message, &mut out);
            }
            for message in messages.iter().filter(|m| m.is_update()) {
                if self.route_message(&state, message, &mut out) {
                    links.extend(message.links.iter().copied());
                }
            }

            if !out.is_empty() {
                self.expand_links(&mut state, &links, &mut out)?;
                out.sequence = state.next_sequence();
                state.outbound.push_back(out);
                if is_initiator {
                    impacts_initiator = true;
                }
            }
        }
        Ok(impacts_initiator)
    }

    // --- internals, called with the session lock held ---

    fn subscribe_locked(
        &self,
        state: &mut SessionState,
        address: ChannelAddress,
        explicit: bool,
        filter: Option<Value>,
        client_etag: Option<&str>,
        out: &mut ChangeSet,
    ) -> ServerResult<SubscribeOutcome> {
        let schema = self.registry.channel(self.system_id, address.channel_id)?;
        if filter.is_some() && !schema.filtered() {
            return Err(ServerError::UnexpectedFilter { address });
        }

        if let Some(entry) = state.entries.get_mut(&address) {
            entry.explicit |= explicit;
            if entry.filter == filter {
                return Ok(SubscribeOutcome::NoChange);
            }
            return match schema.filter_type {
                FilterType::Dynamic => {
                    let old = std::mem::replace(&mut entry.filter, filter.clone());
                    let content = self.loader.collect_for_subscription_update(
                        &address,
                        old.as_ref(),
                        filter.as_ref(),
                    )?;
                    out.push_channel_action(ChannelAction {
                        address,
                        action: ChannelActionType::Update,
                        filter,
                    });
                    for change in content.changes {
                        out.push_entity_change(change);
                    }
                    Ok(SubscribeOutcome::Updated)
                }
                FilterType::Static => Err(ServerError::StaticFilterMismatch { address }),
                FilterType::None => Err(ServerError::UnexpectedFilter { address }),
            };
        }

        if schema.cacheable {
            let cached = self.cache.get_or_populate(address, || {
                match self.loader.collect_for_subscribe(&address, filter.as_ref())? {
                    LoadOutcome::Content(content) => {
                        let mut body = ChangeSet::default();
                        for change in content.changes {
                            body.push_entity_change(change);
                        }
                        Ok(ChannelCacheEntry::new(body))
                    }
                    LoadOutcome::RootDeleted => Ok(ChannelCacheEntry::deleted()),
                }
            })?;
            if cached.root_deleted {
                state.etags.remove(&address);
                out.push_channel_action(ChannelAction {
                    address,
                    action: ChannelActionType::Delete,
                    filter: None,
                });
                return Ok(SubscribeOutcome::RootDeleted);
            }
            let known = client_etag
                .map(str::to_owned)
                .or_else(|| state.etags.get(&address).cloned());
            state
                .entries
                .insert(address, SubscriptionEntry::new(address, filter.clone(), explicit));
            if known.as_deref() == Some(cached.etag.as_str()) {
                state.etags.insert(address, cached.etag.clone());
                return Ok(SubscribeOutcome::UseCache { etag: cached.etag });
            }
            // A stale eTag is replaced by the current one alongside the
            // full payload.
            out.etag = Some(cached.etag.clone());
            out.push_channel_action(ChannelAction {
                address,
                action: ChannelActionType::Add,
                filter,
            });
            for change in cached.change_set.changes.iter().cloned() {
                out.push_entity_change(change);
            }
            state.etags.insert(address, cached.etag);
            return Ok(SubscribeOutcome::Added);
        }

        let outcome = self.loader.collect_for_subscribe(&address, filter.as_ref())?;
        self.apply_collected(state, address, explicit, filter, outcome, out)
    }

    /// Installs a freshly collected channel on the session: entry, ADD (or
    /// DELETE) action, content and link expansion.
    fn apply_collected(
        &self,
        state: &mut SessionState,
        address: ChannelAddress,
        explicit: bool,
        filter: Option<Value>,
        outcome: LoadOutcome,
        out: &mut ChangeSet,
    ) -> ServerResult<SubscribeOutcome> {
        match outcome {
            LoadOutcome::RootDeleted => {
                out.push_channel_action(ChannelAction {
                    address,
                    action: ChannelActionType::Delete,
                    filter: None,
                });
                Ok(SubscribeOutcome::RootDeleted)
            }
            LoadOutcome::Content(content) => {
                state
                    .entries
                    .insert(address, SubscriptionEntry::new(address, filter.clone(), explicit));
                out.push_channel_action(ChannelAction {
                    address,
                    action: ChannelActionType::Add,
                    filter,
                });
                for change in content.changes {
                    out.push_entity_change(change);
                }
                self.expand_links(state, &content.links, out)?;
                Ok(SubscribeOutcome::Added)
            }
        }
    }

    fn unsubscribe_locked(
        &self,
        state: &mut SessionState,
        address: &ChannelAddress,
        out: &mut ChangeSet,
    ) -> ServerResult<()> {
        let entry = state
            .entries
            .get_mut(address)
            .ok_or(ServerError::NotSubscribed { address: *address })?;
        if !entry.explicit {
            return Err(ServerError::NotSubscribed { address: *address });
        }
        entry.explicit = false;

        let mut worklist = VecDeque::from([*address]);
        while let Some(current) = worklist.pop_front() {
            let removable = state
                .entries
                .get(&current)
                .map_or(false, SubscriptionEntry::can_unsubscribe);
            if !removable {
                continue;
            }
            let Some(removed) = state.entries.remove(&current) else {
                continue;
            };
            state.etags.remove(&current);
            out.push_channel_action(ChannelAction {
                address: current,
                action: ChannelActionType::Remove,
                filter: None,
            });
            for target in removed.outward_links {
                if let Some(entry) = state.entries.get_mut(&target) {
                    entry.inward_links.remove(&current);
                    worklist.push_back(target);
                }
            }
        }
        Ok(())
    }

    fn bulk_update_existing(
        &self,
        state: &mut SessionState,
        existing: &[ChannelAddress],
        filter: &Option<Value>,
        out: &mut ChangeSet,
    ) -> ServerResult<()> {
        // Group entries needing a filter change by channel id and current
        // filter, so one bulk collection can serve each group. A group never
        // spans channels; its members share one schema.
        let mut groups: Vec<(u32, Option<Value>, Vec<ChannelAddress>)> = Vec::new();
        let mut last_error = None;
        for address in existing {
            let Some(entry) = state.entries.get_mut(address) else {
                continue;
            };
            entry.explicit = true;
            if entry.filter == *filter {
                continue;
            }
            match groups
                .iter_mut()
                .find(|(cid, old, _)| *cid == address.channel_id && *old == entry.filter)
            {
                Some((_, _, members)) => members.push(*address),
                None => groups.push((address.channel_id, entry.filter.clone(), vec![*address])),
            }
        }

        for (channel_id, old_filter, members) in groups {
            let schema = self.registry.channel(self.system_id, channel_id)?;
            let mut bulk_applied = false;
            if schema.filter_type == FilterType::Dynamic
                && schema.bulk_update_supported
                && members.len() > 1
            {
                match self.loader.collect_bulk_subscription_update(
                    &members,
                    old_filter.as_ref(),
                    filter.as_ref(),
                ) {
                    Ok(Some(results)) => {
                        bulk_applied = true;
                        for (address, content) in results {
                            if let Some(entry) = state.entries.get_mut(&address) {
                                entry.filter = filter.clone();
                            }
                            out.push_channel_action(ChannelAction {
                                address,
                                action: ChannelActionType::Update,
                                filter: filter.clone(),
                            });
                            for change in content.changes {
                                out.push_entity_change(change);
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        bulk_applied = true;
                        last_error = Some(err);
                    }
                }
            }
            if !bulk_applied {
                for address in members {
                    if let Err(err) = self.subscribe_locked(
                        state,
                        address,
                        true,
                        filter.clone(),
                        None,
                        out,
                    ) {
                        warn!(%address, error = %err, "bulk filter update failed");
                        last_error = Some(err);
                    }
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Routes one entity message into the session's change-set. Returns
    /// true if any subscribed channel matched.
    fn route_message(
        &self,
        state: &SessionState,
        message: &EntityMessage,
        out: &mut ChangeSet,
    ) -> bool {
        let mut matched: Vec<String> = Vec::new();
        for targets in message.routing_keys.values() {
            for address in targets {
                if let Some(entry) = state.entries.get(address) {
                    if self
                        .loader
                        .filter_allows(address, entry.filter.as_ref(), message)
                    {
                        matched.push(address.local_descriptor());
                    }
                }
            }
        }
        if matched.is_empty() {
            return false;
        }
        matched.sort();
        matched.dedup();
        out.push_entity_change(EntityChange {
            id: message.id,
            type_id: message.type_id,
            channels: matched,
            data: message.attribute_values.clone(),
        });
        true
    }

    /// Auto-subscribes unsubscribed link targets reachable from subscribed
    /// sources and records the adjacency. Restarts the scan after each
    /// expansion, because subscribing can surface further links.
    fn expand_links(
        &self,
        state: &mut SessionState,
        links: &[ChannelLink],
        out: &mut ChangeSet,
    ) -> ServerResult<()> {
        loop {
            let mut expanded = false;
            for link in links {
                if !state.entries.contains_key(&link.source) {
                    continue;
                }
                if state.entries.contains_key(&link.target) {
                    Self::record_link(state, link);
                    continue;
                }
                let filter = self.loader.derive_link_filter(&link.target);
                let outcome =
                    self.subscribe_locked(state, link.target, false, filter, None, out)?;
                if matches!(outcome, SubscribeOutcome::RootDeleted) {
                    continue;
                }
                Self::record_link(state, link);
                expanded = true;
                break;
            }
            if !expanded {
                return Ok(());
            }
        }
    }

    fn record_link(state: &mut SessionState, link: &ChannelLink) {
        if let Some(entry) = state.entries.get_mut(&link.source) {
            entry.outward_links.insert(link.target);
        }
        if let Some(entry) = state.entries.get_mut(&link.target) {
            entry.inward_links.insert(link.source);
        }
    }

    /// Stamps a sequence number onto a non-empty change-set.
    fn finish(state: &mut SessionState, mut out: ChangeSet) -> Option<ChangeSet> {
        if out.is_empty() && out.etag.is_none() {
            return None;
        }
        out.sequence = state.next_sequence();
        Some(out)
    }

    /// Merges the initiator's own pending changes ahead of the broadcast
    /// content.
    fn merge_into(out: &mut ChangeSet, own: &ChangeSet) {
        out.channels.extend(own.channels.iter().cloned());
        out.channel_actions.extend(own.channel_actions.iter().cloned());
        out.filtered_channel_actions
            .extend(own.filtered_channel_actions.iter().cloned());
        out.changes.extend(own.changes.iter().cloned());
    }
}

impl<L: DataLoader> std::fmt::Debug for SessionManager<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("system_id", &self.system_id)
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}
