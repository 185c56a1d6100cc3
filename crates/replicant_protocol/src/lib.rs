//! # Replicant Protocol
//!
//! Wire protocol types for the replicant channel replication system.
//!
//! This crate provides:
//! - `ChannelAddress` for identifying channels
//! - `ChannelSchema` metadata and the schema registry
//! - `ChangeSet` for ordered, incremental state deltas
//! - `EntityMessage` broadcast records
//! - WebSocket command envelopes
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod address;
mod change_set;
mod command;
mod entity_message;
mod error;
mod schema;

pub use address::ChannelAddress;
pub use change_set::{
    ChangeSet, ChannelAction, ChannelActionPayload, ChannelActionType, EntityChange, EntityKey,
};
pub use command::{ClientCommand, ServerMessage};
pub use entity_message::{ChannelLink, EntityMessage};
pub use error::{ProtocolError, ProtocolResult};
pub use schema::{ChannelGraph, ChannelSchema, FilterType, SchemaRegistry, SystemSchema};
