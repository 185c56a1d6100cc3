//! Change-set wire model.
//!
//! A change-set is one ordered, incremental delta shipped from server to
//! client. Field names are fixed by the wire protocol: `last_id` carries the
//! sequence number, `channel_actions` carries unfiltered channel actions,
//! `fchannels` carries actions for filtered channels, and `changes` carries
//! entity-level changes.

use crate::address::ChannelAddress;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of a channel action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelActionType {
    /// A subscription was established.
    Add,
    /// A subscription was removed.
    Remove,
    /// A subscription's filter changed.
    Update,
    /// The channel's root entity was deleted; the subscription is gone.
    Delete,
}

/// A channel action as carried on the wire.
///
/// The channel is identified either by a `channel` descriptor string
/// (`"cid"` or `"cid.scid"`) or by explicit `cid`/`scid` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelActionPayload {
    /// Channel descriptor string, if used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Channel id, if explicit fields are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<u32>,
    /// Sub-channel id, if explicit fields are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scid: Option<u64>,
    /// The action kind.
    pub action: ChannelActionType,
    /// The filter in effect, for filtered channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
}

impl ChannelActionPayload {
    /// Resolves the payload into a [`ChannelAction`] within a system.
    pub fn resolve(&self, system_id: u32) -> ProtocolResult<ChannelAction> {
        let address = if let Some(ref descriptor) = self.channel {
            ChannelAddress::parse_descriptor(system_id, descriptor)?
        } else {
            let channel_id = self.cid.ok_or(ProtocolError::MissingChannel)?;
            ChannelAddress {
                system_id,
                channel_id,
                sub_channel_id: self.scid,
            }
        };
        Ok(ChannelAction {
            address,
            action: self.action,
            filter: self.filter.clone(),
        })
    }
}

/// A resolved channel action.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAction {
    /// The channel the action applies to.
    pub address: ChannelAddress,
    /// The action kind.
    pub action: ChannelActionType,
    /// The filter in effect, for filtered channels.
    pub filter: Option<Value>,
}

impl ChannelAction {
    /// Parses a compact channel-change descriptor of the form
    /// `"+cid[.scid]"` (add), `"-cid[.scid]"` (remove), `"=cid[.scid]"`
    /// (update) or `"!cid[.scid]"` (delete).
    pub fn parse_change(system_id: u32, descriptor: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidChannelChange(descriptor.to_string());
        let mut chars = descriptor.chars();
        let action = match chars.next().ok_or_else(invalid)? {
            '+' => ChannelActionType::Add,
            '-' => ChannelActionType::Remove,
            '=' => ChannelActionType::Update,
            '!' => ChannelActionType::Delete,
            _ => return Err(invalid()),
        };
        let address = ChannelAddress::parse_descriptor(system_id, chars.as_str())?;
        Ok(Self {
            address,
            action,
            filter: None,
        })
    }
}

/// Identifies an entity by replicated type and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    /// Replicated type id.
    pub type_id: u32,
    /// Entity id.
    pub id: u64,
}

impl EntityKey {
    /// Creates a new key.
    pub fn new(type_id: u32, id: u64) -> Self {
        Self { type_id, id }
    }
}

/// One entity-level change within a change-set.
///
/// A change with `data` present is a create-or-update; a change without
/// `data` is a remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityChange {
    /// Entity id.
    pub id: u64,
    /// Replicated type id.
    #[serde(rename = "type")]
    pub type_id: u32,
    /// Descriptors of the channels the entity belongs to after this change.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Attribute data for create/update; absent for remove.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, Value>>,
}

impl EntityChange {
    /// Returns the entity key.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.type_id, self.id)
    }

    /// Returns true if this change creates or updates the entity.
    pub fn is_update(&self) -> bool {
        self.data.is_some()
    }

    /// Resolves the channel descriptor list into addresses.
    pub fn channel_addresses(&self, system_id: u32) -> ProtocolResult<Vec<ChannelAddress>> {
        self.channels
            .iter()
            .map(|d| ChannelAddress::parse_descriptor(system_id, d))
            .collect()
    }
}

/// One inbound change-set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Sequence number of this change-set on its connection.
    #[serde(rename = "last_id")]
    pub sequence: u64,
    /// Id of the client request this change-set answers, if any.
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    /// Cache validation tag for cacheable channel content.
    #[serde(rename = "etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Compact channel-change descriptors (`"+cid"`, `"-cid.scid"`, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    /// Channel actions for unfiltered channels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channel_actions: Vec<ChannelActionPayload>,
    /// Channel actions for filtered channels.
    #[serde(rename = "fchannels", default, skip_serializing_if = "Vec::is_empty")]
    pub filtered_channel_actions: Vec<ChannelActionPayload>,
    /// Entity-level changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<EntityChange>,
}

impl ChangeSet {
    /// Creates an empty change-set at a sequence number.
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            ..Self::default()
        }
    }

    /// Parses a change-set from its raw JSON wire form.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serializes the change-set to its JSON wire form.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Resolves every channel action in wire order: compact descriptors
    /// first, then unfiltered actions, then filtered actions.
    pub fn resolve_channel_actions(&self, system_id: u32) -> ProtocolResult<Vec<ChannelAction>> {
        let mut actions = Vec::with_capacity(
            self.channels.len() + self.channel_actions.len() + self.filtered_channel_actions.len(),
        );
        for descriptor in &self.channels {
            actions.push(ChannelAction::parse_change(system_id, descriptor)?);
        }
        for payload in &self.channel_actions {
            actions.push(payload.resolve(system_id)?);
        }
        for payload in &self.filtered_channel_actions {
            actions.push(payload.resolve(system_id)?);
        }
        Ok(actions)
    }

    /// Returns true if the change-set carries no channel or entity changes.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
            && self.channel_actions.is_empty()
            && self.filtered_channel_actions.is_empty()
            && self.changes.is_empty()
    }

    /// Appends a resolved channel action (server-side assembly path).
    pub fn push_channel_action(&mut self, action: ChannelAction) {
        let payload = ChannelActionPayload {
            channel: None,
            cid: Some(action.address.channel_id),
            scid: action.address.sub_channel_id,
            action: action.action,
            filter: action.filter,
        };
        if payload.filter.is_some() {
            self.filtered_channel_actions.push(payload);
        } else {
            self.channel_actions.push(payload);
        }
    }

    /// Appends an entity change (server-side assembly path).
    pub fn push_entity_change(&mut self, change: EntityChange) {
        self.changes.push(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_minimal() {
        let cs = ChangeSet::parse(r#"{"last_id":4}"#).unwrap();
        assert_eq!(cs.sequence, 4);
        assert!(cs.request_id.is_none());
        assert!(cs.is_empty());
    }

    #[test]
    fn parse_full_wire_form() {
        let raw = r#"{
            "last_id": 1,
            "requestId": 7,
            "etag": "abc",
            "channel_actions": [{"cid": 0, "action": "add"}],
            "fchannels": [{"cid": 1, "scid": 9, "action": "update", "filter": {"q": 1}}],
            "changes": [{"id": 1, "type": 0, "channels": ["0"], "data": {}}]
        }"#;
        let cs = ChangeSet::parse(raw).unwrap();
        assert_eq!(cs.sequence, 1);
        assert_eq!(cs.request_id, Some(7));
        assert_eq!(cs.etag.as_deref(), Some("abc"));

        let actions = cs.resolve_channel_actions(1).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].address, ChannelAddress::new(1, 0));
        assert_eq!(actions[0].action, ChannelActionType::Add);
        assert_eq!(actions[1].address, ChannelAddress::instance(1, 1, 9));
        assert_eq!(actions[1].action, ChannelActionType::Update);
        assert_eq!(actions[1].filter, Some(json!({"q": 1})));

        assert_eq!(cs.changes.len(), 1);
        assert!(cs.changes[0].is_update());
        assert_eq!(
            cs.changes[0].channel_addresses(1).unwrap(),
            vec![ChannelAddress::new(1, 0)]
        );
    }

    #[test]
    fn parse_compact_channel_changes() {
        let cs = ChangeSet::parse(r#"{"last_id":2,"channels":["+0","-1.5","=2","!3"]}"#).unwrap();
        let actions = cs.resolve_channel_actions(4).unwrap();
        assert_eq!(actions[0].action, ChannelActionType::Add);
        assert_eq!(actions[0].address, ChannelAddress::new(4, 0));
        assert_eq!(actions[1].action, ChannelActionType::Remove);
        assert_eq!(actions[1].address, ChannelAddress::instance(4, 1, 5));
        assert_eq!(actions[2].action, ChannelActionType::Update);
        assert_eq!(actions[3].action, ChannelActionType::Delete);
    }

    #[test]
    fn invalid_channel_change_prefix() {
        let err = ChannelAction::parse_change(1, "*0").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidChannelChange(_)));
    }

    #[test]
    fn entity_change_without_data_is_remove() {
        let cs =
            ChangeSet::parse(r#"{"last_id":3,"changes":[{"id":5,"type":2,"channels":[]}]}"#)
                .unwrap();
        assert!(!cs.changes[0].is_update());
        assert_eq!(cs.changes[0].key(), EntityKey::new(2, 5));
    }

    #[test]
    fn action_payload_missing_channel() {
        let payload = ChannelActionPayload {
            channel: None,
            cid: None,
            scid: None,
            action: ChannelActionType::Add,
            filter: None,
        };
        assert_eq!(payload.resolve(1).unwrap_err(), ProtocolError::MissingChannel);
    }

    #[test]
    fn server_assembly_roundtrip() {
        let mut cs = ChangeSet::new(9);
        cs.push_channel_action(ChannelAction {
            address: ChannelAddress::new(1, 0),
            action: ChannelActionType::Add,
            filter: None,
        });
        cs.push_channel_action(ChannelAction {
            address: ChannelAddress::instance(1, 2, 7),
            action: ChannelActionType::Update,
            filter: Some(json!({"min": 3})),
        });
        cs.push_entity_change(EntityChange {
            id: 11,
            type_id: 4,
            channels: vec!["0".into()],
            data: Some(serde_json::Map::new()),
        });

        let wire = cs.to_wire().unwrap();
        let parsed = ChangeSet::parse(&wire).unwrap();
        assert_eq!(parsed.sequence, 9);
        assert_eq!(parsed.channel_actions.len(), 1);
        assert_eq!(parsed.filtered_channel_actions.len(), 1);
        assert_eq!(parsed.changes.len(), 1);
    }
}
