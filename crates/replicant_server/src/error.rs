//! Error types for the server runtime.

use replicant_protocol::{ChannelAddress, ProtocolError};
use thiserror::Error;
use uuid::Uuid;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server runtime.
///
/// Protocol violations close the offending session; loader failures are
/// surfaced to the caller that drove the operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServerError {
    /// Wire data could not be interpreted.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No session exists for the given id.
    #[error("unknown session {session_id}")]
    SessionNotFound {
        /// The unmatched session id.
        session_id: Uuid,
    },

    /// A subscribe carried a different filter for a channel whose filter is
    /// fixed at subscribe time.
    #[error("static filter mismatch on channel {address}")]
    StaticFilterMismatch {
        /// The offending channel.
        address: ChannelAddress,
    },

    /// A filter was supplied for a channel that takes none.
    #[error("channel {address} takes no filter")]
    UnexpectedFilter {
        /// The offending channel.
        address: ChannelAddress,
    },

    /// An unsubscribe targeted a channel the session is not explicitly
    /// subscribed to.
    #[error("session is not explicitly subscribed to channel {address}")]
    NotSubscribed {
        /// The unsubscribed channel.
        address: ChannelAddress,
    },

    /// The data loader failed to collect channel content.
    #[error("failed to load content for channel {address}: {reason}")]
    LoadFailed {
        /// The channel being loaded.
        address: ChannelAddress,
        /// Loader-supplied description.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ServerError::StaticFilterMismatch {
            address: ChannelAddress::new(1, 2),
        };
        assert!(err.to_string().contains("1.2"));

        let err = ServerError::LoadFailed {
            address: ChannelAddress::new(1, 0),
            reason: "backend down".into(),
        };
        assert!(err.to_string().contains("backend down"));
    }
}
