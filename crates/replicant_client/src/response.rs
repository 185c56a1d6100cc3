//! Staged processing record for one inbound payload.

use crate::events::MessageCounts;
use replicant_protocol::{ChangeSet, ChannelAction, EntityKey};
use std::collections::{HashSet, VecDeque};

/// A mutable record carrying one inbound payload through the processing
/// pipeline. Progress is monotonic: raw JSON → parsed change-set → channel
/// actions applied → entity changes applied → entities linked → world
/// validated → finalized.
#[derive(Debug)]
pub struct MessageResponse {
    raw: Option<String>,
    change_set: Option<ChangeSet>,
    /// Out-of-band responses bypass sequencing entirely.
    pub oob: bool,
    /// Resolved channel actions, populated at parse time.
    pub channel_actions: Vec<ChannelAction>,
    /// Set once the channel-action stage ran.
    pub channel_actions_applied: bool,
    /// Index of the next entity change to apply.
    pub entity_change_index: usize,
    /// Entities awaiting the link stage.
    pub entities_to_link: VecDeque<EntityKey>,
    /// Entities removed within this change-set; a create+remove collision
    /// in one change-set suppresses the link.
    pub removed_entities: HashSet<EntityKey>,
    /// Set once world validation ran.
    pub world_validated: bool,
    /// Aggregate counts reported at finalization.
    pub counts: MessageCounts,
}

impl MessageResponse {
    /// Creates a response for a network payload.
    pub fn from_network(raw: String) -> Self {
        Self::new(raw, false)
    }

    /// Creates an out-of-band response (cache replay).
    pub fn out_of_band(raw: String) -> Self {
        Self::new(raw, true)
    }

    fn new(raw: String, oob: bool) -> Self {
        Self {
            raw: Some(raw),
            change_set: None,
            oob,
            channel_actions: Vec::new(),
            channel_actions_applied: false,
            entity_change_index: 0,
            entities_to_link: VecDeque::new(),
            removed_entities: HashSet::new(),
            world_validated: false,
            counts: MessageCounts::default(),
        }
    }

    /// Returns true until the payload has been parsed.
    pub fn needs_parsing(&self) -> bool {
        self.change_set.is_none()
    }

    /// Takes the raw payload for parsing.
    pub fn take_raw(&mut self) -> Option<String> {
        self.raw.take()
    }

    /// Installs the parsed change-set.
    pub fn set_change_set(&mut self, change_set: ChangeSet, channel_actions: Vec<ChannelAction>) {
        self.change_set = Some(change_set);
        self.channel_actions = channel_actions;
    }

    /// The parsed change-set, if parsing has run.
    pub fn change_set(&self) -> Option<&ChangeSet> {
        self.change_set.as_ref()
    }

    /// Sequence number, once parsed.
    pub fn sequence(&self) -> Option<u64> {
        self.change_set.as_ref().map(|cs| cs.sequence)
    }

    /// Request id carried by the change-set, once parsed.
    pub fn request_id(&self) -> Option<u64> {
        self.change_set.as_ref().and_then(|cs| cs.request_id)
    }

    /// Returns true when every entity change has been applied.
    pub fn entity_changes_done(&self) -> bool {
        match &self.change_set {
            Some(cs) => self.entity_change_index >= cs.changes.len(),
            None => true,
        }
    }

    /// Returns true when the link queue has drained.
    pub fn links_done(&self) -> bool {
        self.entities_to_link.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_progress_monotonically() {
        let mut response = MessageResponse::from_network(r#"{"last_id":3}"#.into());
        assert!(response.needs_parsing());
        assert!(response.sequence().is_none());

        let raw = response.take_raw().unwrap();
        let cs = ChangeSet::parse(&raw).unwrap();
        response.set_change_set(cs, Vec::new());

        assert!(!response.needs_parsing());
        assert_eq!(response.sequence(), Some(3));
        assert!(response.entity_changes_done());
        assert!(response.links_done());
    }

    #[test]
    fn oob_flag() {
        assert!(MessageResponse::out_of_band("{}".into()).oob);
        assert!(!MessageResponse::from_network("{}".into()).oob);
    }
}
