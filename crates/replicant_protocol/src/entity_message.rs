//! Entity messages emitted by server-side transaction machinery.
//!
//! An [`EntityMessage`] describes one committed entity mutation together
//! with the routing keys used to decide which channels it belongs to. A
//! message with attribute values is a create-or-update; one without is a
//! delete.

use crate::address::ChannelAddress;
use crate::change_set::EntityKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A directed link between two channels carried by an entity message.
///
/// A link declares that content in the source channel references the target
/// channel's root; the server auto-subscribes sessions to link targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelLink {
    /// The channel whose content references the target.
    pub source: ChannelAddress,
    /// The referenced channel.
    pub target: ChannelAddress,
}

impl ChannelLink {
    /// Creates a new link.
    pub fn new(source: ChannelAddress, target: ChannelAddress) -> Self {
        Self { source, target }
    }
}

/// One committed entity mutation to broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMessage {
    /// Entity id.
    pub id: u64,
    /// Replicated type id.
    pub type_id: u32,
    /// Routing key values, keyed by routing key name. Channels match a
    /// message when their routing key name maps to the channel's address
    /// (or address list) here.
    #[serde(default)]
    pub routing_keys: HashMap<String, Vec<ChannelAddress>>,
    /// Attribute values for create/update; absent for delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_values: Option<serde_json::Map<String, Value>>,
    /// Channel links carried by this mutation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ChannelLink>,
}

impl EntityMessage {
    /// Creates an update (or create) message.
    pub fn update(
        id: u64,
        type_id: u32,
        routing_keys: HashMap<String, Vec<ChannelAddress>>,
        attribute_values: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            id,
            type_id,
            routing_keys,
            attribute_values: Some(attribute_values),
            links: Vec::new(),
        }
    }

    /// Creates a delete message.
    pub fn delete(
        id: u64,
        type_id: u32,
        routing_keys: HashMap<String, Vec<ChannelAddress>>,
    ) -> Self {
        Self {
            id,
            type_id,
            routing_keys,
            attribute_values: None,
            links: Vec::new(),
        }
    }

    /// Attaches channel links.
    pub fn with_links(mut self, links: Vec<ChannelLink>) -> Self {
        self.links = links;
        self
    }

    /// Returns the entity key.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.type_id, self.id)
    }

    /// Returns true if this message creates or updates the entity.
    pub fn is_update(&self) -> bool {
        self.attribute_values.is_some()
    }

    /// Returns true if any routing key routes the message to `address`.
    pub fn routes_to(&self, address: &ChannelAddress) -> bool {
        self.routing_keys
            .values()
            .any(|targets| targets.contains(address))
    }
}
