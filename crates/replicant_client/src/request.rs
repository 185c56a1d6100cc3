//! Outbound request tracking.

use replicant_protocol::ChannelAddress;
use serde_json::Value;

/// The action an area-of-interest request asks the server to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AoiAction {
    /// Establish a subscription.
    Add,
    /// Remove a subscription.
    Remove,
    /// Change a subscription's filter.
    Update,
}

/// One queued or in-flight subscription request.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterestRequest {
    /// Target channel.
    pub address: ChannelAddress,
    /// Requested action.
    pub action: AoiAction,
    /// Filter to apply (Add/Update).
    pub filter: Option<Value>,
}

impl AreaOfInterestRequest {
    /// Creates a request.
    pub fn new(address: ChannelAddress, action: AoiAction, filter: Option<Value>) -> Self {
        Self {
            address,
            action,
            filter,
        }
    }

    /// Returns true if `other` describes the same pending work: same
    /// address and action, and (for Add/Update) the same filter.
    pub fn matches(&self, address: &ChannelAddress, action: AoiAction, filter: &Option<Value>) -> bool {
        self.address == *address
            && self.action == action
            && (action == AoiAction::Remove || self.filter == *filter)
    }
}

/// Correlates one outbound RPC-style call with its eventual response.
///
/// At most one live entry exists per request id per connection. The entry is
/// removed when a change-set consumes its request id, or early when the
/// request fails or completes out of band.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEntry {
    /// Correlation id.
    pub request_id: u64,
    /// Cache key, when the request may populate the cache.
    pub cache_key: Option<String>,
    /// The action the request asked for.
    pub action: AoiAction,
    /// The addresses the request covers.
    pub addresses: Vec<ChannelAddress>,
    /// False once completion will arrive out of band (cache replay) rather
    /// than through the sequenced response stream.
    pub normal_completion_expected: bool,
    /// Set when the transport acknowledged the request.
    pub results_arrived: bool,
}

impl RequestEntry {
    /// Creates an entry expecting normal completion.
    pub fn new(
        request_id: u64,
        cache_key: Option<String>,
        action: AoiAction,
        addresses: Vec<ChannelAddress>,
    ) -> Self {
        Self {
            request_id,
            cache_key,
            action,
            addresses,
            normal_completion_expected: true,
            results_arrived: false,
        }
    }
}
