//! Error types for the client runtime.

use replicant_protocol::{ChannelAddress, EntityKey, ProtocolError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client runtime.
///
/// Protocol violations are fatal to the current message-processing pass:
/// the connector transitions toward `Disconnecting` when one surfaces.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Wire data could not be interpreted.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An inbound payload was not valid JSON for a change-set.
    #[error("malformed change-set: {0}")]
    Parse(String),

    /// A change-set referenced a request id with no live request entry.
    #[error("change-set references unknown request {request_id}")]
    UnknownRequest {
        /// The unmatched request id.
        request_id: u64,
    },

    /// A channel ADD action arrived for an already-subscribed channel.
    #[error("duplicate subscription for channel {address}")]
    DuplicateSubscription {
        /// The already-subscribed channel.
        address: ChannelAddress,
    },

    /// A channel action or entity change referenced an unsubscribed channel.
    #[error("no subscription for channel {address}")]
    SubscriptionNotFound {
        /// The unsubscribed channel.
        address: ChannelAddress,
    },

    /// A filter change was requested against a channel whose filter is not
    /// dynamic, or against an implicit subscription.
    #[error("filter update not supported for channel {address}")]
    FilterUpdateUnsupported {
        /// The offending channel.
        address: ChannelAddress,
    },

    /// A filter was supplied for a channel that takes none.
    #[error("channel {address} takes no filter")]
    UnexpectedFilter {
        /// The offending channel.
        address: ChannelAddress,
    },

    /// Convergence was invoked against a disposed area of interest.
    /// This is a caller precondition violation, not a recoverable error.
    #[error("area of interest {address} is disposed")]
    AreaOfInterestDisposed {
        /// The disposed area's address.
        address: ChannelAddress,
    },

    /// An entity failed its post-load verification contract.
    #[error("entity {key:?} failed verification: {message}")]
    Verification {
        /// The failing entity.
        key: EntityKey,
        /// Verifier output.
        message: String,
    },

    /// The transport rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation requires a state the connector is not in.
    #[error("invalid connector state transition from {from} to {to}")]
    InvalidState {
        /// Current state name.
        from: &'static str,
        /// Attempted target state name.
        to: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ClientError::UnknownRequest { request_id: 9 };
        assert!(err.to_string().contains('9'));

        let err = ClientError::DuplicateSubscription {
            address: ChannelAddress::new(1, 2),
        };
        assert!(err.to_string().contains("1.2"));
    }
}
