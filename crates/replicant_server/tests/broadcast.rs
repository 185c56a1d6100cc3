//! Integration tests for the session manager and command handler.

use replicant_protocol::{
    ChangeSet, ChannelActionType, ChannelAddress, ChannelLink, ChannelSchema, EntityMessage,
    FilterType, SchemaRegistry, ServerMessage, SystemSchema,
};
use replicant_server::{
    ChannelContent, CommandHandler, Disposition, MemoryLoader, SessionManager,
};
use std::collections::HashMap;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const SYSTEM: u32 = 1;

const PROJECTS: u32 = 0;
const PROJECT: u32 = 1;
const DISCIPLINE: u32 = 2;
const META_DATA: u32 = 3;

fn registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register(SystemSchema::new(
        SYSTEM,
        "shell",
        vec![
            ChannelSchema::type_channel(PROJECTS, "Projects"),
            ChannelSchema::instance_channel(PROJECT, "Project").with_filter(FilterType::Dynamic),
            ChannelSchema::instance_channel(DISCIPLINE, "Discipline"),
            ChannelSchema::type_channel(META_DATA, "MetaData").cacheable(),
        ],
    ));
    Arc::new(registry)
}

fn entity_change(id: u64, type_id: u32, channel: &ChannelAddress) -> replicant_protocol::EntityChange {
    replicant_protocol::EntityChange {
        id,
        type_id,
        channels: vec![channel.local_descriptor()],
        data: Some(serde_json::Map::new()),
    }
}

fn handler_with(loader: MemoryLoader) -> CommandHandler<MemoryLoader> {
    let manager = Arc::new(SessionManager::new(registry(), SYSTEM, loader).unwrap());
    CommandHandler::new(manager, Box::new(|token| token == "secret"))
}

fn routed_to(address: ChannelAddress) -> HashMap<String, Vec<ChannelAddress>> {
    let mut keys = HashMap::new();
    keys.insert("project".to_string(), vec![address]);
    keys
}

#[test]
fn subscribe_then_broadcast_reaches_every_session() {
    init_tracing();
    let mut loader = MemoryLoader::new();
    let projects = ChannelAddress::new(SYSTEM, PROJECTS);
    loader.seed(
        projects,
        ChannelContent {
            changes: vec![entity_change(1, 0, &projects)],
            links: Vec::new(),
        },
    );
    let handler = handler_with(loader);
    let manager = Arc::clone(handler.manager());

    let alice = manager.create_session();
    let bob = manager.create_session();
    for session in [&alice, &bob] {
        let reply = handler.handle_frame(session, r#"{"type":"auth","token":"secret"}"#);
        assert_eq!(reply.disposition, Disposition::Continue);
        let reply =
            handler.handle_frame(session, r#"{"type":"sub","requestId":1,"channel":"1.0"}"#);
        assert_eq!(reply.change_sets.len(), 1);
        assert_eq!(reply.change_sets[0].changes.len(), 1);
    }

    let message = EntityMessage::update(2, 0, routed_to(projects), serde_json::Map::new());
    let impacts = manager
        .save_entity_messages(Some(alice.id), Some(8), &[message], None)
        .unwrap();
    assert!(impacts);

    // The initiator's copy carries the request correlation; the bystander's
    // does not. Both advance their own sequence streams.
    let alice_out = manager.take_outbound(&alice);
    assert_eq!(alice_out.len(), 1);
    assert_eq!(alice_out[0].request_id, Some(8));
    assert_eq!(alice_out[0].sequence, 2);

    let bob_out = manager.take_outbound(&bob);
    assert_eq!(bob_out[0].request_id, None);
    assert_eq!(bob_out[0].sequence, 2);
}

#[test]
fn broadcast_change_sets_survive_the_wire() {
    init_tracing();
    let handler = handler_with(MemoryLoader::new());
    let manager = Arc::clone(handler.manager());
    let session = manager.create_session();
    handler.handle_frame(&session, r#"{"type":"auth","token":"secret"}"#);
    handler.handle_frame(&session, r#"{"type":"sub","requestId":1,"channel":"1.0"}"#);
    manager.take_outbound(&session);

    let projects = ChannelAddress::new(SYSTEM, PROJECTS);
    let message = EntityMessage::update(9, 0, routed_to(projects), serde_json::Map::new());
    manager
        .save_entity_messages(None, None, &[message], None)
        .unwrap();

    let out = manager.take_outbound(&session).remove(0);
    let wire = out.to_wire().unwrap();
    let parsed = ChangeSet::parse(&wire).unwrap();
    assert_eq!(parsed.sequence, out.sequence);
    assert_eq!(parsed.changes.len(), 1);
    assert_eq!(
        parsed.changes[0].channel_addresses(SYSTEM).unwrap(),
        vec![projects]
    );
}

#[test]
fn link_graph_grows_and_cascades_end_to_end() {
    init_tracing();
    let mut loader = MemoryLoader::new();
    let project = ChannelAddress::instance(SYSTEM, PROJECT, 1);
    let discipline = ChannelAddress::instance(SYSTEM, DISCIPLINE, 5);
    loader.seed(
        project,
        ChannelContent {
            changes: vec![entity_change(1, 1, &project)],
            links: vec![ChannelLink::new(project, discipline)],
        },
    );
    let handler = handler_with(loader);
    let manager = Arc::clone(handler.manager());
    let session = manager.create_session();
    handler.handle_frame(&session, r#"{"type":"auth","token":"secret"}"#);

    // Subscribing to the project pulls in the discipline through the link.
    let reply =
        handler.handle_frame(&session, r#"{"type":"sub","requestId":1,"channel":"1.1.1"}"#);
    let actions = reply.change_sets[0].resolve_channel_actions(SYSTEM).unwrap();
    let added: Vec<ChannelAddress> = actions
        .iter()
        .filter(|a| a.action == ChannelActionType::Add)
        .map(|a| a.address)
        .collect();
    assert_eq!(added, vec![project, discipline]);

    // Unsubscribing the project removes both: the discipline was only held
    // alive by the link.
    let reply =
        handler.handle_frame(&session, r#"{"type":"unsub","requestId":2,"channel":"1.1.1"}"#);
    let actions = reply.change_sets[0].resolve_channel_actions(SYSTEM).unwrap();
    let removed: Vec<ChannelAddress> = actions
        .iter()
        .filter(|a| a.action == ChannelActionType::Remove)
        .map(|a| a.address)
        .collect();
    assert_eq!(removed, vec![project, discipline]);
    assert!(session.lock().entries.is_empty());
}

#[test]
fn cache_validation_across_sessions_and_invalidation() {
    init_tracing();
    let mut loader = MemoryLoader::new();
    let meta = ChannelAddress::new(SYSTEM, META_DATA);
    loader.seed(
        meta,
        ChannelContent {
            changes: vec![entity_change(1, 3, &meta)],
            links: Vec::new(),
        },
    );
    let handler = handler_with(loader);
    let manager = Arc::clone(handler.manager());

    // First session pays for the load and learns the eTag.
    let first = manager.create_session();
    handler.handle_frame(&first, r#"{"type":"auth","token":"secret"}"#);
    let reply = handler.handle_frame(&first, r#"{"type":"sub","requestId":1,"channel":"1.3"}"#);
    let etag = reply.change_sets[0].etag.clone().unwrap();

    // Second session validates via the etags upload instead of the sub.
    let second = manager.create_session();
    handler.handle_frame(&second, r#"{"type":"auth","token":"secret"}"#);
    let frame = format!(r#"{{"type":"etags","requestId":2,"etags":{{"1.3":"{etag}"}}}}"#);
    handler.handle_frame(&second, &frame);
    let reply = handler.handle_frame(&second, r#"{"type":"sub","requestId":3,"channel":"1.3"}"#);
    assert_eq!(
        reply.messages,
        vec![ServerMessage::UseCache {
            request_id: Some(3),
            channel: "1.3".to_string(),
            etag: etag.clone(),
        }]
    );

    // A broadcast touching the channel invalidates the cache; the next
    // subscriber gets a fresh eTag and a full payload.
    let message = EntityMessage::update(2, 3, routed_to(meta), serde_json::Map::new());
    manager
        .save_entity_messages(None, None, &[message], None)
        .unwrap();

    let third = manager.create_session();
    handler.handle_frame(&third, r#"{"type":"auth","token":"secret"}"#);
    let frame = format!(
        r#"{{"type":"sub","requestId":4,"channel":"1.3","etag":"{etag}"}}"#
    );
    let reply = handler.handle_frame(&third, &frame);
    assert_eq!(reply.change_sets.len(), 1);
    assert_ne!(reply.change_sets[0].etag.as_deref(), Some(etag.as_str()));
}

#[test]
fn closed_session_stops_receiving_broadcasts() {
    init_tracing();
    let handler = handler_with(MemoryLoader::new());
    let manager = Arc::clone(handler.manager());
    let session = manager.create_session();
    handler.handle_frame(&session, r#"{"type":"auth","token":"secret"}"#);
    handler.handle_frame(&session, r#"{"type":"sub","requestId":1,"channel":"1.0"}"#);

    manager.invalidate_session(&session.id);

    let projects = ChannelAddress::new(SYSTEM, PROJECTS);
    let message = EntityMessage::update(1, 0, routed_to(projects), serde_json::Map::new());
    manager
        .save_entity_messages(None, None, &[message], None)
        .unwrap();

    assert!(manager.take_outbound(&session).is_empty());
}
