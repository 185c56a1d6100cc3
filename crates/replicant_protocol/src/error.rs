//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while interpreting wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A channel address string could not be parsed.
    #[error("invalid channel address: {0:?}")]
    InvalidAddress(String),

    /// A channel change descriptor had an unknown action prefix.
    #[error("invalid channel change descriptor: {0:?}")]
    InvalidChannelChange(String),

    /// A channel action payload named neither a channel id nor a descriptor.
    #[error("channel action missing channel identification")]
    MissingChannel,

    /// No schema is registered for the given system.
    #[error("no schema registered for system {system_id}")]
    SystemNotFound {
        /// System id that was looked up.
        system_id: u32,
    },

    /// No channel schema exists for the given id within a system.
    #[error("no channel {channel_id} in system {system_id}")]
    ChannelNotFound {
        /// System id that was looked up.
        system_id: u32,
        /// Channel id that was looked up.
        channel_id: u32,
    },
}
