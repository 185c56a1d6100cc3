//! Client runtime for channel-based entity replication.
//!
//! The client declares *areas of interest* — channels it wants replicated,
//! optionally filtered — and the [`Connector`] converges the server's view
//! toward that declaration: subscribing, unsubscribing and updating filters
//! as interest comes and goes. Inbound change-sets are applied to a local
//! entity world in strict sequence order, in bounded slices per tick.
//!
//! Everything runs single-threaded under a pull-based scheduler: the
//! embedding application calls [`Connector::step`] until it returns `false`,
//! and decides itself when the next tick happens. The transport performs the
//! actual I/O behind the [`Transport`] trait and reports completions as
//! events drained at the start of each tick.
//!
//! ```no_run
//! use replicant_client::{ClientConfig, Connector, MemoryCacheService, RecordingTransport, ReplicantContext};
//! use replicant_protocol::{ChannelAddress, ChannelSchema, SchemaRegistry, SystemSchema};
//! use std::rc::Rc;
//!
//! let mut registry = SchemaRegistry::new();
//! registry.register(SystemSchema::new(
//!     1,
//!     "shell",
//!     vec![ChannelSchema::type_channel(0, "Projects")],
//! ));
//! let context = Rc::new(ReplicantContext::new(registry));
//!
//! let mut connector = Connector::new(
//!     context,
//!     1,
//!     RecordingTransport::new(),
//!     MemoryCacheService::new(),
//!     ClientConfig::new(),
//! )?;
//! connector.acquire_interest(ChannelAddress::new(1, 0), None)?;
//! connector.connect()?;
//! while connector.step()? {}
//! # Ok::<(), replicant_client::ClientError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod connector;
pub mod context;
pub mod converger;
pub mod entity;
pub mod error;
pub mod events;
pub mod interest;
pub mod request;
pub mod response;
pub mod subscription;
pub mod transport;

pub use cache::{CacheEntry, CacheService, MemoryCacheService};
pub use config::ClientConfig;
pub use connector::{Connector, ConnectorState, FilterMatcher};
pub use context::ReplicantContext;
pub use converger::ConvergeAction;
pub use entity::{Entity, EntityRepository, EntityVerifier};
pub use error::{ClientError, ClientResult};
pub use events::{ClientEvent, EventDispatcher, MessageCounts};
pub use interest::{AreaOfInterest, AreaOfInterestService, AreaOfInterestStatus};
pub use request::{AoiAction, AreaOfInterestRequest, RequestEntry};
pub use subscription::{Subscription, SubscriptionMap};
pub use transport::{
    BulkRequest, RecordedCall, RecordingTransport, SubscribeRequest, SubscriptionUpdateRequest,
    Transport, TransportEvent, UnsubscribeRequest,
};
