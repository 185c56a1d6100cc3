//! Per-connector connection state.

use crate::request::{AoiAction, AreaOfInterestRequest, RequestEntry};
use crate::response::MessageResponse;
use replicant_protocol::ChannelAddress;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Live state for one transport connection.
///
/// A connection is created on connect and replaced wholesale on reconnect;
/// disposal cascades to the subscriptions established through it.
#[derive(Debug)]
pub struct Connection {
    /// Transport-assigned id.
    pub connection_id: String,
    /// Sequence of the last change-set applied to the world.
    pub last_rx_sequence: u64,
    /// Queued subscription requests not yet dispatched.
    pub pending_aoi_requests: VecDeque<AreaOfInterestRequest>,
    /// The dispatched request group awaiting acknowledgement.
    pub current_aoi_requests: Vec<AreaOfInterestRequest>,
    /// Request id of the dispatched group.
    pub current_aoi_request_id: Option<u64>,
    /// Inbound payloads not yet parsed.
    pub unparsed_responses: VecDeque<MessageResponse>,
    /// Parsed responses awaiting application, OOB first then by sequence.
    pub pending_responses: Vec<MessageResponse>,
    /// The response currently moving through the pipeline.
    pub current_response: Option<MessageResponse>,
    /// Live request entries by request id.
    pub requests_by_id: HashMap<u64, RequestEntry>,
    next_request_id: u64,
}

impl Connection {
    /// Creates a fresh connection.
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            last_rx_sequence: 0,
            pending_aoi_requests: VecDeque::new(),
            current_aoi_requests: Vec::new(),
            current_aoi_request_id: None,
            unparsed_responses: VecDeque::new(),
            pending_responses: Vec::new(),
            current_response: None,
            requests_by_id: HashMap::new(),
            next_request_id: 0,
        }
    }

    /// Allocates the next request id and registers its entry.
    pub fn register_request(
        &mut self,
        cache_key: Option<String>,
        action: AoiAction,
        addresses: Vec<ChannelAddress>,
    ) -> u64 {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.requests_by_id.insert(
            request_id,
            RequestEntry::new(request_id, cache_key, action, addresses),
        );
        request_id
    }

    /// Returns true if a matching request is queued or in flight.
    pub fn is_aoi_request_pending(
        &self,
        address: &ChannelAddress,
        action: AoiAction,
        filter: &Option<Value>,
    ) -> bool {
        self.pending_aoi_requests
            .iter()
            .chain(self.current_aoi_requests.iter())
            .any(|r| r.matches(address, action, filter))
    }

    /// Returns true if any request of `action` kind targets `address`,
    /// regardless of filter.
    pub fn is_aoi_action_pending(&self, address: &ChannelAddress, action: AoiAction) -> bool {
        self.pending_aoi_requests
            .iter()
            .chain(self.current_aoi_requests.iter())
            .any(|r| r.address == *address && r.action == action)
    }

    /// Returns true if a request of `action` kind covering `address` is in
    /// progress anywhere along its life: queued, dispatched, or answered but
    /// not yet finalized.
    pub fn is_aoi_action_in_progress(&self, address: &ChannelAddress, action: AoiAction) -> bool {
        self.is_aoi_action_pending(address, action)
            || self
                .requests_by_id
                .values()
                .any(|entry| entry.action == action && entry.addresses.contains(address))
    }

    /// Queues a subscription request.
    pub fn enqueue_aoi_request(&mut self, request: AreaOfInterestRequest) {
        self.pending_aoi_requests.push_back(request);
    }

    /// Queues an inbound network payload for parsing.
    pub fn enqueue_response(&mut self, raw: String) {
        self.unparsed_responses
            .push_back(MessageResponse::from_network(raw));
    }

    /// Queues an out-of-band payload (cache replay) for parsing.
    pub fn enqueue_out_of_band_response(&mut self, raw: String) {
        self.unparsed_responses
            .push_back(MessageResponse::out_of_band(raw));
    }

    /// Inserts a parsed response into the pending queue, keeping the queue
    /// ordered with OOB responses first (FIFO among themselves) and the
    /// rest ascending by sequence.
    pub fn enqueue_parsed_response(&mut self, response: MessageResponse) {
        let position = if response.oob {
            self.pending_responses
                .iter()
                .position(|r| !r.oob)
                .unwrap_or(self.pending_responses.len())
        } else {
            let sequence = response.sequence().unwrap_or(0);
            self.pending_responses
                .iter()
                .position(|r| !r.oob && r.sequence().unwrap_or(0) > sequence)
                .unwrap_or(self.pending_responses.len())
        };
        self.pending_responses.insert(position, response);
    }

    /// Promotes the next applicable response, if any, to current.
    ///
    /// Selection order: a parsed OOB response first; else the parsed
    /// response continuing the sequence; else an unparsed payload.
    pub fn select_current_response(&mut self) -> bool {
        if self.current_response.is_some() {
            return true;
        }
        if let Some(head) = self.pending_responses.first() {
            let applicable =
                head.oob || head.sequence() == Some(self.last_rx_sequence.wrapping_add(1));
            if applicable {
                self.current_response = Some(self.pending_responses.remove(0));
                return true;
            }
        }
        if let Some(unparsed) = self.unparsed_responses.pop_front() {
            self.current_response = Some(unparsed);
            return true;
        }
        false
    }

    /// Returns true if any inbound work remains.
    pub fn has_inbound_work(&self) -> bool {
        if self.current_response.is_some() || !self.unparsed_responses.is_empty() {
            return true;
        }
        self.pending_responses.first().map_or(false, |head| {
            head.oob || head.sequence() == Some(self.last_rx_sequence.wrapping_add(1))
        })
    }
}
