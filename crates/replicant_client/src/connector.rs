//! The connector: per-system client runtime.
//!
//! A connector owns everything the client knows about one channel system on
//! one connection: the declared areas of interest, the live subscriptions,
//! the replicated entities and the in-flight request bookkeeping. All of it
//! is driven from [`Connector::step`], which performs one bounded slice of
//! work per call and reports whether more remains. The embedding application
//! decides when ticks happen; the connector never spawns threads and never
//! blocks.

use crate::cache::CacheService;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::context::ReplicantContext;
use crate::entity::{Entity, EntityRepository};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventDispatcher};
use crate::interest::{AreaOfInterest, AreaOfInterestService, AreaOfInterestStatus};
use crate::request::AoiAction;
use crate::response::MessageResponse;
use crate::subscription::{Subscription, SubscriptionMap};
use crate::transport::{
    BulkRequest, SubscribeRequest, SubscriptionUpdateRequest, Transport, TransportEvent,
    UnsubscribeRequest,
};
use replicant_protocol::{ChangeSet, ChannelActionType, ChannelAddress, EntityChange, EntityKey};
use serde_json::Value;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Connection lifecycle state of a [`Connector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// No connection exists or is being attempted.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The connection is live.
    Connected,
    /// A disconnect is in flight.
    Disconnecting,
    /// The transport failed; resources have been released.
    Error,
}

impl ConnectorState {
    /// The state's name, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectorState::Disconnected => "Disconnected",
            ConnectorState::Connecting => "Connecting",
            ConnectorState::Connected => "Connected",
            ConnectorState::Disconnecting => "Disconnecting",
            ConnectorState::Error => "Error",
        }
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Evaluates whether an entity still belongs to a filtered channel after a
/// filter update. The first argument is the filter, the second the entity.
pub type FilterMatcher = Box<dyn Fn(&Value, &Entity) -> bool>;

/// Client runtime for one channel system.
pub struct Connector<T: Transport, C: CacheService> {
    pub(crate) context: Rc<ReplicantContext>,
    pub(crate) system_id: u32,
    pub(crate) state: ConnectorState,
    pub(crate) config: ClientConfig,
    pub(crate) transport: T,
    pub(crate) cache: C,
    pub(crate) events: EventDispatcher,
    pub(crate) connection: Option<Connection>,
    pub(crate) interests: AreaOfInterestService,
    pub(crate) subscriptions: SubscriptionMap,
    pub(crate) entities: EntityRepository,
    pub(crate) filter_matchers: HashMap<u32, FilterMatcher>,
    deferred_disconnect: bool,
}

impl<T: Transport, C: CacheService> Connector<T, C> {
    /// Creates a connector for `system_id`, which must be registered in the
    /// context's schema registry. Binds the transport.
    pub fn new(
        context: Rc<ReplicantContext>,
        system_id: u32,
        mut transport: T,
        cache: C,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        context.registry().system(system_id)?;
        transport.bind();
        Ok(Self {
            context,
            system_id,
            state: ConnectorState::Disconnected,
            config,
            transport,
            cache,
            events: EventDispatcher::new(),
            connection: None,
            interests: AreaOfInterestService::new(),
            subscriptions: SubscriptionMap::new(),
            entities: EntityRepository::new(),
            filter_matchers: HashMap::new(),
            deferred_disconnect: false,
        })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// The system this connector replicates.
    pub fn system_id(&self) -> u32 {
        self.system_id
    }

    /// The live subscriptions.
    pub fn subscriptions(&self) -> &SubscriptionMap {
        &self.subscriptions
    }

    /// Looks up a live subscription.
    pub fn subscription(&self, address: &ChannelAddress) -> Option<&Subscription> {
        self.subscriptions.get(address)
    }

    /// The replicated entity world.
    pub fn entities(&self) -> &EntityRepository {
        &self.entities
    }

    /// Looks up a replicated entity.
    pub fn entity(&self, key: &EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    /// The declared areas of interest.
    pub fn interests(&self) -> &AreaOfInterestService {
        &self.interests
    }

    /// Looks up an area of interest.
    pub fn interest(&self, address: &ChannelAddress) -> Option<&AreaOfInterest> {
        self.interests.get(address)
    }

    /// Sequence of the last change-set applied on the live connection.
    pub fn last_applied_sequence(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.last_rx_sequence)
    }

    /// Mutable access to the transport, for test doubles.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Mutable access to the cache service.
    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    /// Registers an event listener.
    pub fn listen(&mut self, listener: impl Fn(&ClientEvent) + 'static) {
        self.events.listen(listener);
    }

    /// Registers the membership matcher for a filtered channel. Without one,
    /// entities stay in the channel across filter updates until the server
    /// removes them.
    pub fn register_filter_matcher(
        &mut self,
        channel_id: u32,
        matcher: impl Fn(&Value, &Entity) -> bool + 'static,
    ) {
        self.filter_matchers.insert(channel_id, Box::new(matcher));
    }

    /// Registers a post-load verification hook for a replicated type.
    pub fn register_verifier(
        &mut self,
        type_id: u32,
        verifier: impl Fn(&Entity) -> Result<(), String> + 'static,
    ) {
        self.entities.register_verifier(type_id, verifier);
    }

    /// Declares interest in a channel. Idempotent per address; each call
    /// takes a reference released by [`Self::release_interest`]. The actual
    /// subscribe happens on a later tick once connected.
    pub fn acquire_interest(
        &mut self,
        address: ChannelAddress,
        filter: Option<Value>,
    ) -> ClientResult<()> {
        let schema = self
            .context
            .registry()
            .channel(self.system_id, address.channel_id)?;
        if filter.is_some() && !schema.filtered() {
            return Err(ClientError::UnexpectedFilter { address });
        }
        self.interests.create_or_update(address, filter);
        Ok(())
    }

    /// Releases one reference on an area of interest. When the last
    /// reference goes the area survives the configured number of grace
    /// passes before it is disposed and its subscription unwound.
    pub fn release_interest(&mut self, address: &ChannelAddress) {
        self.interests
            .release(address, self.config.orphan_grace_passes);
    }

    /// Starts connecting. Valid from `Disconnected` and `Error`.
    pub fn connect(&mut self) -> ClientResult<()> {
        match self.state {
            ConnectorState::Disconnected => {}
            ConnectorState::Error => self.transport.bind(),
            _ => {
                return Err(ClientError::InvalidState {
                    from: self.state.name(),
                    to: ConnectorState::Connecting.name(),
                })
            }
        }
        self.set_state(ConnectorState::Connecting);
        self.transport.connect();
        Ok(())
    }

    /// Starts disconnecting. If a change-set is mid-pipeline the disconnect
    /// is deferred until it finishes, so the world is never left half
    /// applied.
    pub fn disconnect(&mut self) -> ClientResult<()> {
        match self.state {
            ConnectorState::Connected | ConnectorState::Connecting => {
                let mid_message = self
                    .connection
                    .as_ref()
                    .map_or(false, |c| c.current_response.is_some());
                if mid_message {
                    self.deferred_disconnect = true;
                } else {
                    self.begin_disconnect();
                }
                Ok(())
            }
            _ => Err(ClientError::InvalidState {
                from: self.state.name(),
                to: ConnectorState::Disconnecting.name(),
            }),
        }
    }

    /// Performs one bounded slice of work: drains transport completions,
    /// converges areas of interest against subscriptions, dispatches at most
    /// one request group and advances the inbound pipeline by one stage.
    ///
    /// Returns `Ok(true)` when more work remains and the caller should tick
    /// again. A protocol violation tears the connection down and surfaces as
    /// the error.
    pub fn step(&mut self) -> ClientResult<bool> {
        for event in self.transport.poll() {
            self.handle_transport_event(event);
        }
        if self.state != ConnectorState::Connected {
            return Ok(false);
        }
        match self.tick() {
            Ok(more) => Ok(more),
            Err(err) => {
                error!(error = %err, "protocol violation, tearing down connection");
                self.begin_disconnect();
                Err(err)
            }
        }
    }

    /// Ticks until the connector reports no more work. Completions injected
    /// by the transport between ticks are picked up along the way.
    pub fn run_until_idle(&mut self) -> ClientResult<()> {
        while self.step()? {}
        Ok(())
    }

    fn tick(&mut self) -> ClientResult<bool> {
        self.converge()?;
        let dispatched = self.progress_area_of_interest_requests()?;
        let processed = self.progress_messages()?;
        let inbound_waiting = self
            .connection
            .as_ref()
            .map_or(false, Connection::has_inbound_work);
        Ok(dispatched || processed || inbound_waiting)
    }

    fn set_state(&mut self, to: ConnectorState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!(%from, %to, "connector state changed");
        self.events.emit(ClientEvent::ConnectorStateChanged { from, to });
    }

    fn begin_disconnect(&mut self) {
        if matches!(
            self.state,
            ConnectorState::Disconnecting | ConnectorState::Disconnected
        ) {
            return;
        }
        self.set_state(ConnectorState::Disconnecting);
        self.transport.disconnect();
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { connection_id } => {
                debug!(connection_id, "connected");
                self.connection = Some(Connection::new(connection_id));
                self.set_state(ConnectorState::Connected);
            }
            TransportEvent::ConnectFailed { reason } => {
                warn!(reason, "connect failed");
                self.set_state(ConnectorState::Error);
                self.transport.unbind();
            }
            TransportEvent::Disconnected => {
                self.dispose_connection();
                self.set_state(ConnectorState::Disconnected);
            }
            TransportEvent::DisconnectFailed { reason } => {
                warn!(reason, "disconnect failed");
                self.dispose_connection();
                self.set_state(ConnectorState::Error);
                self.transport.unbind();
            }
            TransportEvent::Message { raw } => {
                // Payloads raced against a teardown are dropped.
                if let Some(connection) = self.connection.as_mut() {
                    connection.enqueue_response(raw);
                }
            }
            TransportEvent::RequestCompleted { request_id } => {
                self.handle_request_completed(request_id);
            }
            TransportEvent::RequestFailed { request_id, reason } => {
                self.handle_request_failed(request_id, reason);
            }
            TransportEvent::CacheValid { request_id } => {
                self.handle_cache_valid(request_id);
            }
        }
    }

    fn handle_request_completed(&mut self, request_id: u64) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if connection.current_aoi_request_id != Some(request_id) {
            // Completion from a request of a torn-down connection.
            debug!(request_id, "ignoring stale request completion");
            return;
        }
        if let Some(entry) = connection.requests_by_id.get_mut(&request_id) {
            entry.results_arrived = true;
        }
        let group = std::mem::take(&mut connection.current_aoi_requests);
        connection.current_aoi_request_id = None;
        for request in group {
            let event = match request.action {
                AoiAction::Add => ClientEvent::SubscribeCompleted {
                    address: request.address,
                },
                AoiAction::Remove => ClientEvent::UnsubscribeCompleted {
                    address: request.address,
                },
                AoiAction::Update => ClientEvent::SubscriptionUpdateCompleted {
                    address: request.address,
                },
            };
            self.events.emit(event);
        }
    }

    fn handle_request_failed(&mut self, request_id: u64, reason: String) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if connection.current_aoi_request_id != Some(request_id) {
            debug!(request_id, "ignoring stale request failure");
            return;
        }
        connection.requests_by_id.remove(&request_id);
        let group = std::mem::take(&mut connection.current_aoi_requests);
        connection.current_aoi_request_id = None;
        for request in group {
            warn!(address = %request.address, action = ?request.action, reason, "request failed");
            match request.action {
                AoiAction::Add => {
                    if let Some(area) = self.interests.get_mut(&request.address) {
                        area.fail(AreaOfInterestStatus::LoadFailed, reason.clone());
                    }
                    self.events.emit(ClientEvent::SubscribeFailed {
                        address: request.address,
                        error: reason.clone(),
                    });
                }
                AoiAction::Remove => {
                    // The server still considers the channel subscribed.
                    if let Some(subscription) = self.subscriptions.get_mut(&request.address) {
                        subscription.explicit = true;
                    }
                    if let Some(area) = self.interests.get_mut(&request.address) {
                        area.status = AreaOfInterestStatus::Loaded;
                        area.error = Some(reason.clone());
                    }
                    self.events.emit(ClientEvent::UnsubscribeFailed {
                        address: request.address,
                        error: reason.clone(),
                    });
                }
                AoiAction::Update => {
                    if let Some(area) = self.interests.get_mut(&request.address) {
                        area.fail(AreaOfInterestStatus::UpdateFailed, reason.clone());
                    }
                    self.events.emit(ClientEvent::SubscriptionUpdateFailed {
                        address: request.address,
                        error: reason.clone(),
                    });
                }
            }
        }
    }

    fn handle_cache_valid(&mut self, request_id: u64) {
        let cache_key = match self.connection.as_ref() {
            Some(connection) if connection.current_aoi_request_id == Some(request_id) => connection
                .requests_by_id
                .get(&request_id)
                .and_then(|entry| entry.cache_key.clone()),
            _ => {
                debug!(request_id, "ignoring stale cache validation");
                return;
            }
        };
        let cached = cache_key.as_deref().and_then(|key| self.cache.lookup(key));
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let group = std::mem::take(&mut connection.current_aoi_requests);
        connection.current_aoi_request_id = None;
        match cached {
            Some(entry) => {
                debug!(key = entry.key, etag = entry.etag, "replaying cached channel content");
                connection.enqueue_out_of_band_response(entry.content);
                if let Some(request_entry) = connection.requests_by_id.get_mut(&request_id) {
                    request_entry.normal_completion_expected = false;
                }
                for request in group {
                    self.events.emit(ClientEvent::SubscribeCompleted {
                        address: request.address,
                    });
                }
            }
            None => {
                // The server validated an eTag the cache no longer holds.
                warn!(request_id, "cache validated but content missing");
                connection.requests_by_id.remove(&request_id);
                for request in group {
                    if let Some(area) = self.interests.get_mut(&request.address) {
                        area.fail(
                            AreaOfInterestStatus::LoadFailed,
                            "cached content missing".into(),
                        );
                    }
                    self.events.emit(ClientEvent::SubscribeFailed {
                        address: request.address,
                        error: "cached content missing".into(),
                    });
                }
            }
        }
    }

    fn dispose_connection(&mut self) {
        if self.connection.take().is_some() {
            let dropped = self.subscriptions.clear();
            debug!(subscriptions = dropped.len(), "disposed connection");
            self.entities.clear();
            // Areas of interest survive reconnects; only their progress
            // resets.
            for address in self.interests.addresses() {
                if let Some(area) = self.interests.get_mut(&address) {
                    area.status = AreaOfInterestStatus::NotAsked;
                    area.error = None;
                }
            }
        }
        self.deferred_disconnect = false;
    }

    // --- outbound: dispatching subscription requests ---

    /// Dispatches at most one request group, grouping adjacent pending
    /// requests when the channels support bulk operations. Returns true if
    /// anything was sent or discarded.
    fn progress_area_of_interest_requests(&mut self) -> ClientResult<bool> {
        {
            let Some(connection) = self.connection.as_ref() else {
                return Ok(false);
            };
            if connection.current_aoi_request_id.is_some()
                || connection.pending_aoi_requests.is_empty()
            {
                return Ok(false);
            }
        }
        let discarded = self.discard_redundant_requests();

        let Some(connection) = self.connection.as_mut() else {
            return Ok(false);
        };
        let Some(first) = connection.pending_aoi_requests.pop_front() else {
            return Ok(discarded);
        };
        let registry = self.context.registry();
        let first_schema = registry.channel(self.system_id, first.address.channel_id)?;
        let action = first.action;
        let mut group = vec![first];

        let mut remaining = std::collections::VecDeque::new();
        while let Some(candidate) = connection.pending_aoi_requests.pop_front() {
            if crate::converger::can_group(&group[0], &candidate, first_schema) {
                group.push(candidate);
            } else {
                remaining.push_back(candidate);
            }
        }
        connection.pending_aoi_requests = remaining;

        if group.len() == 1 {
            let single = &group[0];
            match action {
                AoiAction::Add => {
                    let (cache_key, etag) = if first_schema.cacheable {
                        let key = single.address.to_string();
                        let etag = self.cache.lookup(&key).map(|entry| entry.etag);
                        (Some(key), etag)
                    } else {
                        (None, None)
                    };
                    let request_id = connection.register_request(
                        cache_key.clone(),
                        AoiAction::Add,
                        vec![single.address],
                    );
                    connection.current_aoi_request_id = Some(request_id);
                    self.transport.request_subscribe(SubscribeRequest {
                        request_id,
                        address: single.address,
                        filter: single.filter.clone(),
                        cache_key,
                        etag,
                    });
                    self.events.emit(ClientEvent::SubscribeStarted {
                        address: single.address,
                    });
                }
                AoiAction::Remove => {
                    if let Some(subscription) = self.subscriptions.get_mut(&single.address) {
                        subscription.explicit = false;
                    }
                    let request_id = connection.register_request(
                        None,
                        AoiAction::Remove,
                        vec![single.address],
                    );
                    connection.current_aoi_request_id = Some(request_id);
                    self.transport.request_unsubscribe(UnsubscribeRequest {
                        request_id,
                        address: single.address,
                    });
                    self.events.emit(ClientEvent::UnsubscribeStarted {
                        address: single.address,
                    });
                }
                AoiAction::Update => {
                    let request_id = connection.register_request(
                        None,
                        AoiAction::Update,
                        vec![single.address],
                    );
                    connection.current_aoi_request_id = Some(request_id);
                    self.transport
                        .request_subscription_update(SubscriptionUpdateRequest {
                            request_id,
                            address: single.address,
                            filter: single.filter.clone(),
                        });
                    self.events.emit(ClientEvent::SubscriptionUpdateStarted {
                        address: single.address,
                    });
                }
            }
        } else {
            // Bulk requests never use the cache path.
            let addresses: Vec<ChannelAddress> = group.iter().map(|r| r.address).collect();
            let request_id = connection.register_request(None, action, addresses.clone());
            connection.current_aoi_request_id = Some(request_id);
            let bulk = BulkRequest {
                request_id,
                addresses: addresses.clone(),
                filter: group[0].filter.clone(),
            };
            match action {
                AoiAction::Add => {
                    self.transport.request_bulk_subscribe(bulk);
                    for address in &addresses {
                        self.events.emit(ClientEvent::SubscribeStarted { address: *address });
                    }
                }
                AoiAction::Remove => {
                    for address in &addresses {
                        if let Some(subscription) = self.subscriptions.get_mut(address) {
                            subscription.explicit = false;
                        }
                    }
                    self.transport.request_bulk_unsubscribe(bulk);
                    for address in &addresses {
                        self.events
                            .emit(ClientEvent::UnsubscribeStarted { address: *address });
                    }
                }
                AoiAction::Update => {
                    self.transport.request_bulk_subscription_update(bulk);
                    for address in &addresses {
                        self.events
                            .emit(ClientEvent::SubscriptionUpdateStarted { address: *address });
                    }
                }
            }
        }
        connection.current_aoi_requests = group;
        Ok(true)
    }

    /// Drops queued requests the subscription map already satisfies, which
    /// happens when a subscription appears through another path between
    /// enqueue and dispatch. Returns true if anything was dropped.
    fn discard_redundant_requests(&mut self) -> bool {
        let mut discarded = false;
        loop {
            let Some(connection) = self.connection.as_mut() else {
                return discarded;
            };
            let Some(head) = connection.pending_aoi_requests.front() else {
                return discarded;
            };
            let redundant = match head.action {
                AoiAction::Add => self.subscriptions.contains(&head.address),
                AoiAction::Remove | AoiAction::Update => {
                    !self.subscriptions.contains(&head.address)
                }
            };
            if !redundant {
                return discarded;
            }
            let Some(head) = connection.pending_aoi_requests.pop_front() else {
                return discarded;
            };
            warn!(address = %head.address, action = ?head.action, "dropping redundant request");
            if let Some(area) = self.interests.get_mut(&head.address) {
                match head.action {
                    AoiAction::Add => area.status = AreaOfInterestStatus::Loaded,
                    AoiAction::Update => area.status = AreaOfInterestStatus::Updated,
                    AoiAction::Remove => {}
                }
            }
            discarded = true;
        }
    }

    // --- inbound: the message pipeline ---

    /// Advances the inbound pipeline by one stage: parse, channel actions,
    /// one batch of entity changes, one batch of links, validation, or
    /// finalization. Returns true if a stage ran.
    fn progress_messages(&mut self) -> ClientResult<bool> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(false);
        };
        if !connection.select_current_response() {
            return Ok(false);
        }
        let Some(mut response) = connection.current_response.take() else {
            return Ok(false);
        };

        if response.needs_parsing() {
            self.parse_response(response)?;
            return Ok(true);
        }
        if !response.channel_actions_applied {
            self.apply_channel_actions(&mut response)?;
            self.restore_current(response);
            return Ok(true);
        }
        if !response.entity_changes_done() {
            self.apply_entity_changes(&mut response)?;
            self.restore_current(response);
            return Ok(true);
        }
        if !response.links_done() {
            self.link_entities(&mut response);
            self.restore_current(response);
            return Ok(true);
        }
        if self.config.validate_entities && !response.world_validated {
            self.entities.validate_world()?;
            response.world_validated = true;
            self.restore_current(response);
            return Ok(true);
        }
        self.finalize_response(response);
        Ok(true)
    }

    fn restore_current(&mut self, response: MessageResponse) {
        if let Some(connection) = self.connection.as_mut() {
            connection.current_response = Some(response);
        }
    }

    /// Parses a raw payload, correlates its request id, captures cacheable
    /// content and requeues the parsed response for sequenced selection.
    fn parse_response(&mut self, mut response: MessageResponse) -> ClientResult<()> {
        let Some(raw) = response.take_raw() else {
            return Ok(());
        };
        let change_set =
            ChangeSet::parse(&raw).map_err(|err| ClientError::Parse(err.to_string()))?;
        let actions = change_set.resolve_channel_actions(self.system_id)?;

        if !response.oob {
            if let Some(request_id) = change_set.request_id {
                let Some(connection) = self.connection.as_ref() else {
                    return Ok(());
                };
                let cache_key = connection
                    .requests_by_id
                    .get(&request_id)
                    .ok_or(ClientError::UnknownRequest { request_id })?
                    .cache_key
                    .clone();
                if let (Some(key), Some(etag)) = (cache_key, change_set.etag.as_deref()) {
                    self.cache.store(&key, etag, &raw);
                }
            }
        }

        response.set_change_set(change_set, actions);
        if let Some(connection) = self.connection.as_mut() {
            connection.enqueue_parsed_response(response);
        }
        Ok(())
    }

    /// Applies every channel action of the current response. Channel actions
    /// are not batched; a change-set carries few of them.
    fn apply_channel_actions(&mut self, response: &mut MessageResponse) -> ClientResult<()> {
        let actions = response.channel_actions.clone();
        for action in actions {
            match action.action {
                ChannelActionType::Add => {
                    // Explicit only when this client asked for the channel
                    // and that request has not been answered yet; an add the
                    // server initiated stays owned by its link graph.
                    let explicit = self.connection.as_ref().map_or(false, |c| {
                        c.is_aoi_action_in_progress(&action.address, AoiAction::Add)
                    });
                    self.subscriptions
                        .create(action.address, action.filter.clone(), explicit)?;
                    if let Some(area) = self.interests.get_mut(&action.address) {
                        if matches!(
                            area.status,
                            AreaOfInterestStatus::NotAsked | AreaOfInterestStatus::Loading
                        ) {
                            area.status = AreaOfInterestStatus::Loaded;
                        }
                    }
                    response.counts.channel_adds += 1;
                }
                ChannelActionType::Remove | ChannelActionType::Delete => {
                    let subscription = self.subscriptions.remove(&action.address).ok_or(
                        ClientError::SubscriptionNotFound {
                            address: action.address,
                        },
                    )?;
                    for key in &subscription.entities {
                        self.entities.unlink_from_channel(key, &action.address);
                    }
                    self.interests.dispose(&action.address);
                    response.counts.channel_removes += 1;
                }
                ChannelActionType::Update => {
                    let subscription = self.subscriptions.get_mut(&action.address).ok_or(
                        ClientError::SubscriptionNotFound {
                            address: action.address,
                        },
                    )?;
                    subscription.filter = action.filter.clone();
                    if let (Some(matcher), Some(filter)) = (
                        self.filter_matchers.get(&action.address.channel_id),
                        action.filter.as_ref(),
                    ) {
                        let members: Vec<EntityKey> =
                            subscription.entities.iter().copied().collect();
                        for key in members {
                            let keep = self
                                .entities
                                .get(&key)
                                .map_or(false, |entity| matcher(filter, entity));
                            if !keep {
                                subscription.entities.remove(&key);
                                self.entities.unlink_from_channel(&key, &action.address);
                            }
                        }
                    }
                    if let Some(area) = self.interests.get_mut(&action.address) {
                        if area.status == AreaOfInterestStatus::Updating {
                            area.status = AreaOfInterestStatus::Updated;
                        }
                    }
                    response.counts.channel_updates += 1;
                }
            }
        }
        response.channel_actions_applied = true;
        Ok(())
    }

    /// Applies up to `changes_per_tick` entity changes of the current
    /// response.
    fn apply_entity_changes(&mut self, response: &mut MessageResponse) -> ClientResult<()> {
        let batch: Vec<EntityChange> = match response.change_set() {
            Some(change_set) => {
                let start = response.entity_change_index;
                let end = (start + self.config.changes_per_tick.max(1))
                    .min(change_set.changes.len());
                change_set.changes[start..end].to_vec()
            }
            None => return Ok(()),
        };

        for change in &batch {
            let key = change.key();
            let addresses = change.channel_addresses(self.system_id)?;
            if change.is_update() {
                for address in &addresses {
                    if !self.subscriptions.contains(address) {
                        return Err(ClientError::SubscriptionNotFound { address: *address });
                    }
                }
                let empty = serde_json::Map::new();
                let data = change.data.as_ref().unwrap_or(&empty);
                self.entities.create_or_update(key, data);
                for address in addresses {
                    if let Some(subscription) = self.subscriptions.get_mut(&address) {
                        subscription.entities.insert(key);
                    }
                    if let Some(entity) = self.entities.get_mut(&key) {
                        entity.subscriptions.insert(address);
                    }
                }
                response.entities_to_link.push_back(key);
                response.counts.entity_updates += 1;
            } else {
                let channels: Vec<ChannelAddress> = self
                    .entities
                    .get(&key)
                    .map(|entity| entity.subscriptions.iter().copied().collect())
                    .unwrap_or_default();
                if self.entities.dispose(&key) {
                    for address in channels {
                        if let Some(subscription) = self.subscriptions.get_mut(&address) {
                            subscription.entities.remove(&key);
                        }
                    }
                    response.counts.entity_removes += 1;
                }
                // A remove for an entity never seen locally is tolerated,
                // but it still suppresses any pending link.
                response.removed_entities.insert(key);
            }
        }
        response.entity_change_index += batch.len();
        Ok(())
    }

    /// Links up to `links_per_tick` freshly changed entities.
    fn link_entities(&mut self, response: &mut MessageResponse) {
        for _ in 0..self.config.links_per_tick.max(1) {
            let Some(key) = response.entities_to_link.pop_front() else {
                break;
            };
            if response.removed_entities.contains(&key) {
                // Created and removed within the same change-set.
                continue;
            }
            if self.entities.link(&key) {
                response.counts.entity_links += 1;
            }
        }
    }

    /// Records the applied sequence, retires the answered request entry and
    /// reports the processed message.
    fn finalize_response(&mut self, response: MessageResponse) {
        let sequence = if response.oob { None } else { response.sequence() };
        if let Some(connection) = self.connection.as_mut() {
            if let Some(applied) = sequence {
                connection.last_rx_sequence = applied;
            }
            if response.oob {
                connection
                    .requests_by_id
                    .retain(|_, entry| entry.normal_completion_expected);
            } else if let Some(request_id) = response.request_id() {
                connection.requests_by_id.remove(&request_id);
            }
        }
        self.events.emit(ClientEvent::MessageProcessed {
            sequence,
            counts: response.counts,
        });
        self.transport.on_message_processed();
        if self.deferred_disconnect {
            self.deferred_disconnect = false;
            self.begin_disconnect();
        }
    }
}

impl<T: Transport, C: CacheService> std::fmt::Debug for Connector<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("system_id", &self.system_id)
            .field("state", &self.state)
            .field("subscriptions", &self.subscriptions.len())
            .field("entities", &self.entities.len())
            .field("interests", &self.interests.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheService;
    use crate::transport::RecordingTransport;
    use replicant_protocol::{ChannelSchema, SchemaRegistry, SystemSchema};

    fn context() -> Rc<ReplicantContext> {
        let mut registry = SchemaRegistry::new();
        registry.register(SystemSchema::new(
            1,
            "test",
            vec![ChannelSchema::type_channel(0, "Things")],
        ));
        Rc::new(ReplicantContext::new(registry))
    }

    fn connector() -> Connector<RecordingTransport, MemoryCacheService> {
        Connector::new(
            context(),
            1,
            RecordingTransport::new(),
            MemoryCacheService::new(),
            ClientConfig::new(),
        )
        .unwrap()
    }

    #[test]
    fn unknown_system_rejected() {
        let err = Connector::new(
            context(),
            9,
            RecordingTransport::new(),
            MemoryCacheService::new(),
            ClientConfig::new(),
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn connect_lifecycle() {
        let mut connector = connector();
        assert_eq!(connector.state(), ConnectorState::Disconnected);

        connector.connect().unwrap();
        assert_eq!(connector.state(), ConnectorState::Connecting);

        connector.step().unwrap();
        assert_eq!(connector.state(), ConnectorState::Connected);

        connector.disconnect().unwrap();
        assert_eq!(connector.state(), ConnectorState::Disconnecting);
        connector.step().unwrap();
        assert_eq!(connector.state(), ConnectorState::Disconnected);
    }

    #[test]
    fn connect_while_connecting_is_invalid() {
        let mut connector = connector();
        connector.connect().unwrap();

        let err = connector.connect().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
    }

    #[test]
    fn refused_connect_enters_error_state() {
        let mut connector = connector();
        connector.transport_mut().accept_connects = false;
        connector.connect().unwrap();
        connector.step().unwrap();

        assert_eq!(connector.state(), ConnectorState::Error);
        // Error is a valid starting point for a retry.
        connector.transport_mut().accept_connects = true;
        connector.connect().unwrap();
        connector.step().unwrap();
        assert_eq!(connector.state(), ConnectorState::Connected);
    }

    #[test]
    fn disconnect_while_disconnected_is_invalid() {
        let mut connector = connector();
        let err = connector.disconnect().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
    }

    #[test]
    fn server_initiated_add_is_implicit_despite_interest_record() {
        let mut connector = connector();
        connector.connect().unwrap();
        connector.step().unwrap();

        // The interest exists, but no subscribe request is in progress for
        // it when the unsolicited add arrives.
        let address = ChannelAddress::new(1, 0);
        connector.acquire_interest(address, None).unwrap();

        let raw = r#"{"last_id":1,"channel_actions":[{"cid":0,"action":"add"}]}"#.to_string();
        let change_set = replicant_protocol::ChangeSet::parse(&raw).unwrap();
        let actions = change_set.resolve_channel_actions(1).unwrap();
        let mut response = MessageResponse::from_network(raw);
        response.take_raw();
        response.set_change_set(change_set, actions);

        connector.apply_channel_actions(&mut response).unwrap();
        assert!(!connector.subscription(&address).unwrap().explicit);
    }

    #[test]
    fn filter_on_unfiltered_channel_rejected() {
        let mut connector = connector();
        let err = connector
            .acquire_interest(ChannelAddress::new(1, 0), Some(serde_json::json!({"q": 1})))
            .unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedFilter { .. }));
    }
}
