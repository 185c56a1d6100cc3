//! Transport layer abstraction.
//!
//! The transport performs the actual network I/O. Requests are fire-and-
//! forget from the connector's perspective; completions, failures and
//! inbound payloads come back as [`TransportEvent`]s drained by the
//! connector at the start of each scheduler tick. This keeps the client
//! single-threaded: nothing in the core ever blocks on the network.

use replicant_protocol::ChannelAddress;
use serde_json::Value;
use std::collections::VecDeque;

/// A single-channel subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    /// Correlation id.
    pub request_id: u64,
    /// Target channel.
    pub address: ChannelAddress,
    /// Subscription filter.
    pub filter: Option<Value>,
    /// Cache key, present when the channel is cacheable.
    pub cache_key: Option<String>,
    /// Cached eTag to offer the server.
    pub etag: Option<String>,
}

/// A single-channel unsubscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribeRequest {
    /// Correlation id.
    pub request_id: u64,
    /// Target channel.
    pub address: ChannelAddress,
}

/// A single-channel filter update request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdateRequest {
    /// Correlation id.
    pub request_id: u64,
    /// Target channel.
    pub address: ChannelAddress,
    /// New filter.
    pub filter: Option<Value>,
}

/// A bulk request over several channels of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    /// Correlation id.
    pub request_id: u64,
    /// Target channels.
    pub addresses: Vec<ChannelAddress>,
    /// Shared filter (subscribe/update only).
    pub filter: Option<Value>,
}

/// An asynchronous completion or inbound payload from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection was established.
    Connected {
        /// Transport-assigned connection id.
        connection_id: String,
    },
    /// The connect attempt failed.
    ConnectFailed {
        /// Failure description.
        reason: String,
    },
    /// The connection closed.
    Disconnected,
    /// The disconnect attempt failed.
    DisconnectFailed {
        /// Failure description.
        reason: String,
    },
    /// A raw change-set payload arrived.
    Message {
        /// Raw JSON.
        raw: String,
    },
    /// An outbound request was acknowledged.
    RequestCompleted {
        /// Correlated request id.
        request_id: u64,
    },
    /// An outbound request was rejected.
    RequestFailed {
        /// Correlated request id.
        request_id: u64,
        /// Failure description.
        reason: String,
    },
    /// The server validated the offered eTag; the cached payload should be
    /// replayed locally instead of waiting for a network change-set.
    CacheValid {
        /// Correlated request id.
        request_id: u64,
    },
}

/// Performs network I/O on behalf of one connector.
pub trait Transport {
    /// Binds transport resources. Called before the first connect.
    fn bind(&mut self) {}

    /// Releases transport resources. Called when the connector errors out.
    fn unbind(&mut self) {}

    /// Opens the connection. Completion arrives as `Connected` or
    /// `ConnectFailed`.
    fn connect(&mut self);

    /// Closes the connection. Completion arrives as `Disconnected` or
    /// `DisconnectFailed`.
    fn disconnect(&mut self);

    /// Requests a single-channel subscription.
    fn request_subscribe(&mut self, request: SubscribeRequest);

    /// Requests a single-channel unsubscribe.
    fn request_unsubscribe(&mut self, request: UnsubscribeRequest);

    /// Requests a single-channel filter update.
    fn request_subscription_update(&mut self, request: SubscriptionUpdateRequest);

    /// Requests a bulk subscribe. Bulk loads never use the cache path.
    fn request_bulk_subscribe(&mut self, request: BulkRequest);

    /// Requests a bulk unsubscribe.
    fn request_bulk_unsubscribe(&mut self, request: BulkRequest);

    /// Requests a bulk filter update.
    fn request_bulk_subscription_update(&mut self, request: BulkRequest);

    /// Drains pending completion events.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Hook invoked after each fully processed change-set.
    fn on_message_processed(&mut self) {}
}

/// A recorded outbound call, for assertions in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    /// `connect` was invoked.
    Connect,
    /// `disconnect` was invoked.
    Disconnect,
    /// `request_subscribe` was invoked.
    Subscribe(SubscribeRequest),
    /// `request_unsubscribe` was invoked.
    Unsubscribe(UnsubscribeRequest),
    /// `request_subscription_update` was invoked.
    SubscriptionUpdate(SubscriptionUpdateRequest),
    /// `request_bulk_subscribe` was invoked.
    BulkSubscribe(BulkRequest),
    /// `request_bulk_unsubscribe` was invoked.
    BulkUnsubscribe(BulkRequest),
    /// `request_bulk_subscription_update` was invoked.
    BulkSubscriptionUpdate(BulkRequest),
}

/// A transport test double that records calls and replays queued events.
///
/// `connect`/`disconnect` succeed immediately by default; tests inject
/// request completions, failures and inbound payloads explicitly.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    calls: Vec<RecordedCall>,
    events: VecDeque<TransportEvent>,
    /// When false, `connect` queues `ConnectFailed` instead of `Connected`.
    pub accept_connects: bool,
    next_connection: u64,
}

impl RecordingTransport {
    /// Creates a transport that accepts connects.
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            events: VecDeque::new(),
            accept_connects: true,
            next_connection: 0,
        }
    }

    /// Returns the recorded calls.
    pub fn calls(&self) -> &[RecordedCall] {
        &self.calls
    }

    /// Removes and returns the recorded calls.
    pub fn take_calls(&mut self) -> Vec<RecordedCall> {
        std::mem::take(&mut self.calls)
    }

    /// Queues an event for the next poll.
    pub fn push_event(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }

    /// Queues an inbound payload.
    pub fn deliver(&mut self, raw: impl Into<String>) {
        self.push_event(TransportEvent::Message { raw: raw.into() });
    }

    /// Queues a request acknowledgement.
    pub fn complete_request(&mut self, request_id: u64) {
        self.push_event(TransportEvent::RequestCompleted { request_id });
    }

    /// Queues a request failure.
    pub fn fail_request(&mut self, request_id: u64, reason: impl Into<String>) {
        self.push_event(TransportEvent::RequestFailed {
            request_id,
            reason: reason.into(),
        });
    }

    /// Queues a cache-valid completion.
    pub fn cache_valid(&mut self, request_id: u64) {
        self.push_event(TransportEvent::CacheValid { request_id });
    }
}

impl Transport for RecordingTransport {
    fn connect(&mut self) {
        self.calls.push(RecordedCall::Connect);
        if self.accept_connects {
            self.next_connection += 1;
            self.events.push_back(TransportEvent::Connected {
                connection_id: format!("conn-{}", self.next_connection),
            });
        } else {
            self.events.push_back(TransportEvent::ConnectFailed {
                reason: "connect refused".into(),
            });
        }
    }

    fn disconnect(&mut self) {
        self.calls.push(RecordedCall::Disconnect);
        self.events.push_back(TransportEvent::Disconnected);
    }

    fn request_subscribe(&mut self, request: SubscribeRequest) {
        self.calls.push(RecordedCall::Subscribe(request));
    }

    fn request_unsubscribe(&mut self, request: UnsubscribeRequest) {
        self.calls.push(RecordedCall::Unsubscribe(request));
    }

    fn request_subscription_update(&mut self, request: SubscriptionUpdateRequest) {
        self.calls.push(RecordedCall::SubscriptionUpdate(request));
    }

    fn request_bulk_subscribe(&mut self, request: BulkRequest) {
        self.calls.push(RecordedCall::BulkSubscribe(request));
    }

    fn request_bulk_unsubscribe(&mut self, request: BulkRequest) {
        self.calls.push(RecordedCall::BulkUnsubscribe(request));
    }

    fn request_bulk_subscription_update(&mut self, request: BulkRequest) {
        self.calls.push(RecordedCall::BulkSubscriptionUpdate(request));
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }
}
