//! Channel schema metadata and registry.

use crate::error::{ProtocolError, ProtocolResult};
use std::collections::HashMap;

/// How a channel's filter behaves over the life of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// The channel takes no filter.
    None,
    /// The filter is fixed at subscribe time; changing it requires an
    /// unsubscribe followed by a fresh subscribe.
    Static,
    /// The filter may be updated in place on a live subscription.
    Dynamic,
}

/// Whether a channel covers a whole entity type or a single root instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelGraph {
    /// One channel for the entity type; addresses carry no sub-channel id.
    Type,
    /// One channel instance per root entity; addresses carry the root
    /// entity's id as the sub-channel id.
    Instance,
}

/// Per-channel metadata.
#[derive(Debug, Clone)]
pub struct ChannelSchema {
    /// Channel id within its system.
    pub channel_id: u32,
    /// Human-readable channel name.
    pub name: String,
    /// Filter behavior.
    pub filter_type: FilterType,
    /// Whether initial channel content may be served from cache.
    pub cacheable: bool,
    /// Type vs instance channel.
    pub graph: ChannelGraph,
    /// Whether the server supports bulk initial loads for this channel.
    pub bulk_load_supported: bool,
    /// Whether the server supports bulk filter updates for this channel.
    pub bulk_update_supported: bool,
}

impl ChannelSchema {
    /// Creates a type channel with no filter.
    pub fn type_channel(channel_id: u32, name: impl Into<String>) -> Self {
        Self {
            channel_id,
            name: name.into(),
            filter_type: FilterType::None,
            cacheable: false,
            graph: ChannelGraph::Type,
            bulk_load_supported: false,
            bulk_update_supported: false,
        }
    }

    /// Creates an instance channel with no filter.
    pub fn instance_channel(channel_id: u32, name: impl Into<String>) -> Self {
        Self {
            graph: ChannelGraph::Instance,
            ..Self::type_channel(channel_id, name)
        }
    }

    /// Sets the filter type.
    pub fn with_filter(mut self, filter_type: FilterType) -> Self {
        self.filter_type = filter_type;
        self
    }

    /// Marks the channel cacheable.
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Enables bulk initial loads.
    pub fn with_bulk_loads(mut self) -> Self {
        self.bulk_load_supported = true;
        self
    }

    /// Enables bulk filter updates.
    pub fn with_bulk_updates(mut self) -> Self {
        self.bulk_update_supported = true;
        self
    }

    /// Returns true if the channel accepts a filter.
    pub fn filtered(&self) -> bool {
        self.filter_type != FilterType::None
    }
}

/// Schema for one channel system.
#[derive(Debug, Clone)]
pub struct SystemSchema {
    /// System id.
    pub system_id: u32,
    /// Human-readable system name.
    pub name: String,
    channels: HashMap<u32, ChannelSchema>,
}

impl SystemSchema {
    /// Creates a system schema from its channel list.
    pub fn new(system_id: u32, name: impl Into<String>, channels: Vec<ChannelSchema>) -> Self {
        let channels = channels.into_iter().map(|c| (c.channel_id, c)).collect();
        Self {
            system_id,
            name: name.into(),
            channels,
        }
    }

    /// Looks up a channel schema by id.
    pub fn channel(&self, channel_id: u32) -> ProtocolResult<&ChannelSchema> {
        self.channels
            .get(&channel_id)
            .ok_or(ProtocolError::ChannelNotFound {
                system_id: self.system_id,
                channel_id,
            })
    }

    /// Iterates the registered channel schemas.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelSchema> {
        self.channels.values()
    }
}

/// Registry of system schemas for one replication domain.
///
/// Constructed once at startup and shared by reference; an unknown id is a
/// defined error, never a panic.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    systems: HashMap<u32, SystemSchema>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a system schema, replacing any prior registration.
    pub fn register(&mut self, schema: SystemSchema) {
        self.systems.insert(schema.system_id, schema);
    }

    /// Looks up a system schema by id.
    pub fn system(&self, system_id: u32) -> ProtocolResult<&SystemSchema> {
        self.systems
            .get(&system_id)
            .ok_or(ProtocolError::SystemNotFound { system_id })
    }

    /// Looks up a channel schema by system and channel id.
    pub fn channel(&self, system_id: u32, channel_id: u32) -> ProtocolResult<&ChannelSchema> {
        self.system(system_id)?.channel(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry.register(SystemSchema::new(
            1,
            "shell",
            vec![
                ChannelSchema::type_channel(0, "MetaData").cacheable(),
                ChannelSchema::instance_channel(1, "Project")
                    .with_filter(FilterType::Dynamic)
                    .with_bulk_loads(),
            ],
        ));
        registry
    }

    #[test]
    fn lookup_known_channel() {
        let registry = registry();
        let schema = registry.channel(1, 0).unwrap();
        assert_eq!(schema.name, "MetaData");
        assert!(schema.cacheable);
        assert_eq!(schema.graph, ChannelGraph::Type);
    }

    #[test]
    fn lookup_unknown_system() {
        let registry = registry();
        let err = registry.channel(9, 0).unwrap_err();
        assert_eq!(err, ProtocolError::SystemNotFound { system_id: 9 });
    }

    #[test]
    fn lookup_unknown_channel() {
        let registry = registry();
        let err = registry.channel(1, 42).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ChannelNotFound {
                system_id: 1,
                channel_id: 42
            }
        );
    }

    #[test]
    fn filtered_flag() {
        let registry = registry();
        assert!(!registry.channel(1, 0).unwrap().filtered());
        assert!(registry.channel(1, 1).unwrap().filtered());
    }
}
