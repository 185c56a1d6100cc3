//! WebSocket command envelopes.
//!
//! Client-to-server commands and server-to-client replies, discriminated by
//! a `type` field. Every command except `auth` requires prior authorization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A command sent by the client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Authorizes the connection.
    Auth {
        /// Request correlation id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Bearer token.
        token: String,
    },
    /// Keepalive; answered with `ok`.
    Ping {
        /// Request correlation id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    /// Subscribes to one channel.
    Sub {
        /// Request correlation id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Full channel descriptor (`"sys.chan[.sub]"`).
        channel: String,
        /// Subscription filter, for filtered channels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Value>,
        /// Client's cached eTag for the channel, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        etag: Option<String>,
    },
    /// Subscribes to several instances of one channel in one request.
    BulkSub {
        /// Request correlation id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Full channel descriptors.
        channels: Vec<String>,
        /// Subscription filter shared by every channel in the batch.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Value>,
    },
    /// Unsubscribes from one channel.
    Unsub {
        /// Request correlation id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Full channel descriptor.
        channel: String,
    },
    /// Unsubscribes from several channels in one request.
    BulkUnsub {
        /// Request correlation id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Full channel descriptors.
        channels: Vec<String>,
    },
    /// Uploads the client's known (channel descriptor → eTag) set.
    Etags {
        /// Request correlation id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Channel descriptor to eTag map.
        etags: HashMap<String, String>,
    },
}

impl ClientCommand {
    /// Returns the request correlation id, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientCommand::Auth { request_id, .. }
            | ClientCommand::Ping { request_id }
            | ClientCommand::Sub { request_id, .. }
            | ClientCommand::BulkSub { request_id, .. }
            | ClientCommand::Unsub { request_id, .. }
            | ClientCommand::BulkUnsub { request_id, .. }
            | ClientCommand::Etags { request_id, .. } => *request_id,
        }
    }

    /// Returns true if the command may run before authorization.
    pub fn allowed_unauthorized(&self) -> bool {
        matches!(self, ClientCommand::Auth { .. })
    }
}

/// A reply sent by the server over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The command succeeded.
    Ok {
        /// Echoed request id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    /// A session was established for the connection.
    SessionCreated {
        /// The new session's id.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// The client's cached content for a channel is still valid.
    UseCache {
        /// Echoed request id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Full channel descriptor.
        channel: String,
        /// The eTag that validated.
        etag: String,
    },
    /// The command failed.
    Error {
        /// Echoed request id.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Failure description.
        message: String,
    },
    /// The inbound frame could not be parsed; the socket will close.
    MalformedMessage,
    /// The `type` discriminator named no known command; the socket will
    /// close.
    UnknownCommand,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_wire_tags() {
        let cmd = ClientCommand::Sub {
            request_id: Some(3),
            channel: "1.0".into(),
            filter: None,
            etag: None,
        };
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(wire["type"], "sub");
        assert_eq!(wire["requestId"], 3);
        assert_eq!(wire["channel"], "1.0");

        let cmd = ClientCommand::BulkUnsub {
            request_id: None,
            channels: vec!["1.0".into(), "1.1".into()],
        };
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(wire["type"], "bulk-unsub");
    }

    #[test]
    fn command_parse() {
        let cmd: ClientCommand =
            serde_json::from_value(json!({"type": "auth", "token": "secret"})).unwrap();
        assert!(matches!(cmd, ClientCommand::Auth { .. }));
        assert!(cmd.allowed_unauthorized());

        let cmd: ClientCommand = serde_json::from_value(
            json!({"type": "sub", "requestId": 1, "channel": "1.0", "filter": {"q": 2}}),
        )
        .unwrap();
        assert!(!cmd.allowed_unauthorized());
        assert_eq!(cmd.request_id(), Some(1));
    }

    #[test]
    fn reply_wire_tags() {
        let reply = ServerMessage::UseCache {
            request_id: Some(4),
            channel: "1.0".into(),
            etag: "abc".into(),
        };
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire["type"], "use-cache");
        assert_eq!(wire["etag"], "abc");

        let wire = serde_json::to_value(&ServerMessage::MalformedMessage).unwrap();
        assert_eq!(wire["type"], "malformed-message");

        let wire = serde_json::to_value(&ServerMessage::SessionCreated {
            session_id: "s-1".into(),
        })
        .unwrap();
        assert_eq!(wire["type"], "session-created");
    }
}
