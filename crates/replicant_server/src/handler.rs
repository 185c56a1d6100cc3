//! WebSocket frame handling.
//!
//! The transport layer hands each inbound text frame to the
//! [`CommandHandler`] together with the connection's session and ships back
//! whatever the returned [`Reply`] carries. Unparseable frames and protocol
//! violations poison the connection: the reply asks the transport to close
//! and the session is invalidated.

use crate::error::ServerError;
use crate::loader::DataLoader;
use crate::session::Session;
use crate::session_manager::{SessionManager, SubscribeOutcome};
use replicant_protocol::{ChangeSet, ChannelAddress, ClientCommand, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the transport should do with the connection after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the connection open.
    Continue,
    /// Close the connection; its session has been invalidated.
    Close,
}

/// The handler's answer to one inbound frame.
#[derive(Debug)]
pub struct Reply {
    /// Command replies to send, in order.
    pub messages: Vec<ServerMessage>,
    /// Change-sets to send after the replies.
    pub change_sets: Vec<ChangeSet>,
    /// Connection disposition.
    pub disposition: Disposition,
}

impl Reply {
    fn ok(request_id: Option<u64>) -> Self {
        Self {
            messages: vec![ServerMessage::Ok { request_id }],
            change_sets: Vec::new(),
            disposition: Disposition::Continue,
        }
    }

    fn change_set(change_set: ChangeSet) -> Self {
        Self {
            messages: Vec::new(),
            change_sets: vec![change_set],
            disposition: Disposition::Continue,
        }
    }

    fn closing(message: ServerMessage) -> Self {
        Self {
            messages: vec![message],
            change_sets: Vec::new(),
            disposition: Disposition::Close,
        }
    }
}

/// Validates bearer tokens presented by the `auth` command.
pub type TokenValidator = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Dispatches parsed client commands against the session manager.
pub struct CommandHandler<L: DataLoader> {
    manager: Arc<SessionManager<L>>,
    validator: TokenValidator,
}

impl<L: DataLoader> CommandHandler<L> {
    /// Creates a handler over `manager` with the given token validator.
    pub fn new(manager: Arc<SessionManager<L>>, validator: TokenValidator) -> Self {
        Self { manager, validator }
    }

    /// The session manager this handler dispatches into.
    pub fn manager(&self) -> &Arc<SessionManager<L>> {
        &self.manager
    }

    /// Handles one inbound text frame for `session`.
    pub fn handle_frame(&self, session: &Session, raw: &str) -> Reply {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "unparseable frame");
                self.manager.invalidate_session(&session.id);
                return Reply::closing(ServerMessage::MalformedMessage);
            }
        };
        let command: ClientCommand = match serde_json::from_value(value.clone()) {
            Ok(command) => command,
            Err(err) => {
                // Distinguish an unknown command name from a known command
                // with a bad shape.
                let known = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| {
                        matches!(
                            t,
                            "auth" | "ping" | "sub" | "bulk-sub" | "unsub" | "bulk-unsub"
                                | "etags"
                        )
                    });
                warn!(session_id = %session.id, error = %err, "bad command frame");
                self.manager.invalidate_session(&session.id);
                return Reply::closing(if known {
                    ServerMessage::MalformedMessage
                } else {
                    ServerMessage::UnknownCommand
                });
            }
        };

        if !command.allowed_unauthorized() && !session.lock().authorized {
            warn!(session_id = %session.id, "command before authorization");
            self.manager.invalidate_session(&session.id);
            return Reply::closing(ServerMessage::Error {
                request_id: command.request_id(),
                message: "not authorized".to_string(),
            });
        }

        self.dispatch(session, command)
    }

    fn dispatch(&self, session: &Session, command: ClientCommand) -> Reply {
        match command {
            ClientCommand::Auth { request_id, token } => {
                if (self.validator)(&token) {
                    session.lock().authorized = true;
                    debug!(session_id = %session.id, "session authorized");
                    Reply {
                        messages: vec![ServerMessage::SessionCreated {
                            session_id: session.id.to_string(),
                        }],
                        change_sets: Vec::new(),
                        disposition: Disposition::Continue,
                    }
                } else {
                    self.manager.invalidate_session(&session.id);
                    Reply::closing(ServerMessage::Error {
                        request_id,
                        message: "authorization failed".to_string(),
                    })
                }
            }
            ClientCommand::Ping { request_id } => Reply::ok(request_id),
            ClientCommand::Sub {
                request_id,
                channel,
                filter,
                etag,
            } => {
                let address = match channel.parse::<ChannelAddress>() {
                    Ok(address) => address,
                    Err(err) => return self.fail(session, request_id, err.into()),
                };
                match self
                    .manager
                    .subscribe(session, address, filter, etag.as_deref())
                {
                    Ok((SubscribeOutcome::UseCache { etag }, _)) => Reply {
                        messages: vec![ServerMessage::UseCache {
                            request_id,
                            channel,
                            etag,
                        }],
                        change_sets: Vec::new(),
                        disposition: Disposition::Continue,
                    },
                    Ok((_, Some(mut change_set))) => {
                        change_set.request_id = request_id;
                        Reply::change_set(change_set)
                    }
                    Ok((_, None)) => Reply::ok(request_id),
                    Err(err) => self.fail(session, request_id, err),
                }
            }
            ClientCommand::BulkSub {
                request_id,
                channels,
                filter,
            } => {
                let addresses = match Self::parse_addresses(&channels) {
                    Ok(addresses) => addresses,
                    Err(err) => return self.fail(session, request_id, err),
                };
                match self.manager.bulk_subscribe(session, &addresses, filter) {
                    Ok(Some(mut change_set)) => {
                        change_set.request_id = request_id;
                        Reply::change_set(change_set)
                    }
                    Ok(None) => Reply::ok(request_id),
                    Err(err) => self.fail(session, request_id, err),
                }
            }
            ClientCommand::Unsub {
                request_id,
                channel,
            } => {
                let address = match channel.parse::<ChannelAddress>() {
                    Ok(address) => address,
                    Err(err) => return self.fail(session, request_id, err.into()),
                };
                match self.manager.unsubscribe(session, &address) {
                    Ok(Some(mut change_set)) => {
                        change_set.request_id = request_id;
                        Reply::change_set(change_set)
                    }
                    Ok(None) => Reply::ok(request_id),
                    Err(err) => self.fail(session, request_id, err),
                }
            }
            ClientCommand::BulkUnsub {
                request_id,
                channels,
            } => {
                let addresses = match Self::parse_addresses(&channels) {
                    Ok(addresses) => addresses,
                    Err(err) => return self.fail(session, request_id, err),
                };
                match self.manager.bulk_unsubscribe(session, &addresses) {
                    Ok(Some(mut change_set)) => {
                        change_set.request_id = request_id;
                        Reply::change_set(change_set)
                    }
                    Ok(None) => Reply::ok(request_id),
                    Err(err) => self.fail(session, request_id, err),
                }
            }
            ClientCommand::Etags { request_id, etags } => {
                let mut parsed = HashMap::with_capacity(etags.len());
                for (descriptor, etag) in etags {
                    match descriptor.parse::<ChannelAddress>() {
                        Ok(address) => {
                            parsed.insert(address, etag);
                        }
                        Err(err) => return self.fail(session, request_id, err.into()),
                    }
                }
                self.manager.record_etags(session, parsed);
                Reply::ok(request_id)
            }
        }
    }

    /// Turns an operation failure into a reply. Protocol violations close
    /// the connection; a loader failure leaves it open for retry.
    fn fail(&self, session: &Session, request_id: Option<u64>, err: ServerError) -> Reply {
        let fatal = !matches!(err, ServerError::LoadFailed { .. });
        warn!(session_id = %session.id, error = %err, fatal, "command failed");
        let message = ServerMessage::Error {
            request_id,
            message: err.to_string(),
        };
        if fatal {
            self.manager.invalidate_session(&session.id);
            Reply::closing(message)
        } else {
            Reply {
                messages: vec![message],
                change_sets: Vec::new(),
                disposition: Disposition::Continue,
            }
        }
    }

    fn parse_addresses(channels: &[String]) -> Result<Vec<ChannelAddress>, ServerError> {
        channels
            .iter()
            .map(|c| c.parse::<ChannelAddress>().map_err(ServerError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{ChannelContent, MemoryLoader};
    use replicant_protocol::{ChannelSchema, FilterType, SchemaRegistry, SystemSchema};
    use serde_json::json;

    const SYSTEM: u32 = 1;

    fn registry() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry.register(SystemSchema::new(
            SYSTEM,
            "shell",
            vec![
                ChannelSchema::type_channel(0, "Projects"),
                ChannelSchema::instance_channel(1, "Project"),
                ChannelSchema::type_channel(2, "MetaData").cacheable(),
                ChannelSchema::type_channel(3, "Tasks").with_filter(FilterType::Dynamic),
            ],
        ));
        Arc::new(registry)
    }

    fn handler_with(loader: MemoryLoader) -> CommandHandler<MemoryLoader> {
        let manager =
            Arc::new(SessionManager::new(registry(), SYSTEM, loader).unwrap());
        CommandHandler::new(manager, Box::new(|token| token == "secret"))
    }

    fn handler() -> CommandHandler<MemoryLoader> {
        handler_with(MemoryLoader::new())
    }

    fn authorized_session(handler: &CommandHandler<MemoryLoader>) -> Arc<Session> {
        let session = handler.manager().create_session();
        let reply = handler.handle_frame(&session, r#"{"type":"auth","token":"secret"}"#);
        assert_eq!(reply.disposition, Disposition::Continue);
        session
    }

    #[test]
    fn auth_creates_session_and_authorizes() {
        let handler = handler();
        let session = handler.manager().create_session();

        let reply = handler.handle_frame(&session, r#"{"type":"auth","token":"secret"}"#);
        assert_eq!(
            reply.messages,
            vec![ServerMessage::SessionCreated {
                session_id: session.id.to_string()
            }]
        );
        assert!(session.lock().authorized);
    }

    #[test]
    fn bad_token_closes() {
        let handler = handler();
        let session = handler.manager().create_session();

        let reply = handler.handle_frame(&session, r#"{"type":"auth","token":"wrong"}"#);
        assert_eq!(reply.disposition, Disposition::Close);
        assert!(handler.manager().session(&session.id).is_err());
    }

    #[test]
    fn commands_require_authorization() {
        let handler = handler();
        let session = handler.manager().create_session();

        let reply = handler.handle_frame(&session, r#"{"type":"ping","requestId":1}"#);
        assert_eq!(reply.disposition, Disposition::Close);
        assert!(matches!(reply.messages[0], ServerMessage::Error { .. }));
        assert!(handler.manager().session(&session.id).is_err());
    }

    #[test]
    fn invalid_json_is_malformed_and_closes() {
        let handler = handler();
        let session = authorized_session(&handler);

        let reply = handler.handle_frame(&session, "{not json");
        assert_eq!(reply.messages, vec![ServerMessage::MalformedMessage]);
        assert_eq!(reply.disposition, Disposition::Close);
        assert!(handler.manager().session(&session.id).is_err());
    }

    #[test]
    fn unknown_command_type_closes() {
        let handler = handler();
        let session = authorized_session(&handler);

        let reply = handler.handle_frame(&session, r#"{"type":"warp","requestId":1}"#);
        assert_eq!(reply.messages, vec![ServerMessage::UnknownCommand]);
        assert_eq!(reply.disposition, Disposition::Close);
    }

    #[test]
    fn known_command_with_bad_shape_is_malformed() {
        let handler = handler();
        let session = authorized_session(&handler);

        // `sub` without its required `channel` field.
        let reply = handler.handle_frame(&session, r#"{"type":"sub","requestId":1}"#);
        assert_eq!(reply.messages, vec![ServerMessage::MalformedMessage]);
        assert_eq!(reply.disposition, Disposition::Close);
    }

    #[test]
    fn ping_answers_ok() {
        let handler = handler();
        let session = authorized_session(&handler);

        let reply = handler.handle_frame(&session, r#"{"type":"ping","requestId":7}"#);
        assert_eq!(
            reply.messages,
            vec![ServerMessage::Ok {
                request_id: Some(7)
            }]
        );
    }

    #[test]
    fn sub_ships_correlated_change_set() {
        let mut loader = MemoryLoader::new();
        let address = ChannelAddress::new(SYSTEM, 0);
        loader.seed(address, ChannelContent::default());
        let handler = handler_with(loader);
        let session = authorized_session(&handler);

        let reply = handler.handle_frame(
            &session,
            r#"{"type":"sub","requestId":3,"channel":"1.0"}"#,
        );
        assert_eq!(reply.disposition, Disposition::Continue);
        assert_eq!(reply.change_sets.len(), 1);
        assert_eq!(reply.change_sets[0].request_id, Some(3));
        assert_eq!(reply.change_sets[0].channel_actions.len(), 1);
    }

    #[test]
    fn matching_etag_answers_use_cache() {
        let handler = handler();
        let first = authorized_session(&handler);
        let reply =
            handler.handle_frame(&first, r#"{"type":"sub","requestId":1,"channel":"1.2"}"#);
        let etag = reply.change_sets[0].etag.clone().unwrap();

        let second = authorized_session(&handler);
        let frame = format!(
            r#"{{"type":"sub","requestId":2,"channel":"1.2","etag":"{etag}"}}"#
        );
        let reply = handler.handle_frame(&second, &frame);
        assert_eq!(
            reply.messages,
            vec![ServerMessage::UseCache {
                request_id: Some(2),
                channel: "1.2".to_string(),
                etag,
            }]
        );
        assert!(reply.change_sets.is_empty());
    }

    #[test]
    fn redundant_sub_answers_ok() {
        let handler = handler();
        let session = authorized_session(&handler);
        handler.handle_frame(&session, r#"{"type":"sub","requestId":1,"channel":"1.0"}"#);

        let reply =
            handler.handle_frame(&session, r#"{"type":"sub","requestId":2,"channel":"1.0"}"#);
        assert_eq!(
            reply.messages,
            vec![ServerMessage::Ok {
                request_id: Some(2)
            }]
        );
        assert!(reply.change_sets.is_empty());
    }

    #[test]
    fn unsub_of_unknown_channel_closes() {
        let handler = handler();
        let session = authorized_session(&handler);

        let reply =
            handler.handle_frame(&session, r#"{"type":"unsub","requestId":1,"channel":"1.0"}"#);
        assert!(matches!(reply.messages[0], ServerMessage::Error { .. }));
        assert_eq!(reply.disposition, Disposition::Close);
        assert!(handler.manager().session(&session.id).is_err());
    }

    #[test]
    fn bulk_sub_round_trip() {
        let handler = handler();
        let session = authorized_session(&handler);

        let reply = handler.handle_frame(
            &session,
            r#"{"type":"bulk-sub","requestId":4,"channels":["1.1.1","1.1.2"]}"#,
        );
        assert_eq!(reply.change_sets.len(), 1);
        assert_eq!(reply.change_sets[0].request_id, Some(4));

        let reply = handler.handle_frame(
            &session,
            r#"{"type":"bulk-unsub","requestId":5,"channels":["1.1.1","1.1.2"]}"#,
        );
        assert_eq!(reply.change_sets.len(), 1);
        assert!(session.lock().entries.is_empty());
    }

    #[test]
    fn etags_upload_is_recorded() {
        let handler = handler();
        let session = authorized_session(&handler);

        let reply = handler.handle_frame(
            &session,
            r#"{"type":"etags","requestId":9,"etags":{"1.2":"abc"}}"#,
        );
        assert_eq!(
            reply.messages,
            vec![ServerMessage::Ok {
                request_id: Some(9)
            }]
        );
        assert_eq!(
            session.lock().etags[&ChannelAddress::new(SYSTEM, 2)],
            "abc"
        );
    }

    #[test]
    fn filter_update_flows_through_sub() {
        let handler = handler();
        let session = authorized_session(&handler);
        handler.handle_frame(
            &session,
            r#"{"type":"sub","requestId":1,"channel":"1.3","filter":{"q":1}}"#,
        );

        let reply = handler.handle_frame(
            &session,
            r#"{"type":"sub","requestId":2,"channel":"1.3","filter":{"q":2}}"#,
        );
        assert_eq!(reply.change_sets.len(), 1);
        assert_eq!(
            session.lock().entries[&ChannelAddress::new(SYSTEM, 3)].filter,
            Some(json!({"q": 2}))
        );
    }
}
