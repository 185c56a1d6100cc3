//! # Replicant Server
//!
//! Server-side session and broadcast runtime for the replicant channel
//! replication system.
//!
//! The [`SessionManager`] owns the session registry for one channel system:
//! it establishes subscriptions (pulling content through a [`DataLoader`]),
//! maintains the per-session channel link graph, serves cacheable channels
//! from the [`ChannelCache`], and fans committed entity mutations out to
//! every impacted session as ordered change-sets. The [`CommandHandler`]
//! sits between a WebSocket transport and the manager, parsing command
//! frames and deciding when a violation must close the connection.
//!
//! This crate is transport-agnostic: it produces replies and change-sets,
//! and the embedding server decides how frames move.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod error;
mod handler;
mod loader;
mod session;
mod session_manager;

pub use cache::{new_etag, ChannelCache, ChannelCacheEntry};
pub use error::{ServerError, ServerResult};
pub use handler::{CommandHandler, Disposition, Reply, TokenValidator};
pub use loader::{ChannelContent, DataLoader, LoadOutcome, MemoryLoader};
pub use session::{Session, SessionState, SubscriptionEntry};
pub use session_manager::{SessionManager, SubscribeOutcome};
