//! Channel addressing.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a single channel instance.
///
/// An address names a channel system, a channel within that system, and an
/// optional sub-channel id for instance channels (one instance per root
/// entity). Identity is value-based; ordering is by
/// `(system_id, channel_id, sub_channel_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Channel system id.
    pub system_id: u32,
    /// Channel id within the system.
    pub channel_id: u32,
    /// Sub-channel id for instance channels.
    pub sub_channel_id: Option<u64>,
}

impl ChannelAddress {
    /// Creates a type-channel address (no sub-channel).
    pub fn new(system_id: u32, channel_id: u32) -> Self {
        Self {
            system_id,
            channel_id,
            sub_channel_id: None,
        }
    }

    /// Creates an instance-channel address.
    pub fn instance(system_id: u32, channel_id: u32, sub_channel_id: u64) -> Self {
        Self {
            system_id,
            channel_id,
            sub_channel_id: Some(sub_channel_id),
        }
    }

    /// Returns the address with the sub-channel id stripped.
    pub fn type_address(&self) -> Self {
        Self::new(self.system_id, self.channel_id)
    }

    /// Returns the channel descriptor used as a cache key and in command
    /// payloads: `"sys.chan"` or `"sys.chan.sub"`.
    pub fn as_channel_descriptor(&self) -> String {
        self.to_string()
    }

    /// Returns the within-system descriptor carried by change-set entity
    /// channel lists: `"chan"` or `"chan.sub"`.
    pub fn local_descriptor(&self) -> String {
        match self.sub_channel_id {
            Some(sub) => format!("{}.{}", self.channel_id, sub),
            None => self.channel_id.to_string(),
        }
    }

    /// Parses a within-system descriptor of the form `"chan"` or
    /// `"chan.sub"`, as carried by change-set entity channel lists.
    pub fn parse_descriptor(system_id: u32, descriptor: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidAddress(descriptor.to_string());
        let mut parts = descriptor.splitn(2, '.');
        let channel_id = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let sub_channel_id = match parts.next() {
            Some(sub) => Some(sub.parse::<u64>().map_err(|_| invalid())?),
            None => None,
        };
        Ok(Self {
            system_id,
            channel_id,
            sub_channel_id,
        })
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_channel_id {
            Some(sub) => write!(f, "{}.{}.{}", self.system_id, self.channel_id, sub),
            None => write!(f, "{}.{}", self.system_id, self.channel_id),
        }
    }
}

impl FromStr for ChannelAddress {
    type Err = ProtocolError;

    /// Parses the full string form `"sys.chan"` or `"sys.chan.sub"`.
    fn from_str(s: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidAddress(s.to_string());
        let mut parts = s.splitn(2, '.');
        let system_id = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let rest = parts.next().ok_or_else(invalid)?;
        Self::parse_descriptor(system_id, rest).map_err(|_| invalid())
    }
}
