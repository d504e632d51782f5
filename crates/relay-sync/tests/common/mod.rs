#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use relay_core::events::{types, WireEvent};
use relay_core::ids::{MessageId, SessionId};
use relay_sync::mock::{MockBackend, MockFeed, RecordingSurface};
use relay_sync::{ConnectionManager, MemoryStore, Outcome, SyncConfig};
use relay_telemetry::SyncCounters;

pub const SID: &str = "ses_1";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MockBackend>,
    pub surface: Arc<RecordingSurface>,
    pub feed: Arc<MockFeed>,
    pub counters: Arc<SyncCounters>,
    pub manager: ConnectionManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let surface = Arc::new(RecordingSurface::new());
        let feed = Arc::new(MockFeed::new());
        let counters = Arc::new(SyncCounters::new());
        let manager = ConnectionManager::new(
            config,
            store.clone(),
            backend.clone(),
            surface.clone(),
            feed.clone(),
            counters.clone(),
        );
        Self {
            store,
            backend,
            surface,
            feed,
            counters,
            manager,
        }
    }

    pub fn handle(&self, event: WireEvent) -> Outcome {
        self.manager.dispatcher().handle(&event)
    }
}

/// Let spawned side tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

pub fn sid() -> SessionId {
    SessionId::from_raw(SID)
}

/// Time-sortable message id; larger `n` is newer.
pub fn mid(n: u64) -> MessageId {
    MessageId::from_raw(format!("msg_{n:012}"))
}

pub fn status_event(session: &str, status: &str) -> WireEvent {
    WireEvent::new(
        types::SESSION_STATUS,
        json!({"sessionID": session, "status": {"type": status}}),
    )
}

pub fn text(id: &str, body: &str) -> Value {
    json!({"id": id, "type": "text", "text": body})
}

pub fn part_event(session: &str, message: &MessageId, role: Option<&str>, part: Value) -> WireEvent {
    let mut part = part;
    part["sessionID"] = json!(session);
    part["messageID"] = json!(message.as_str());
    let mut props = json!({"part": part});
    if let Some(role) = role {
        props["role"] = json!(role);
    }
    WireEvent::new(types::PART_UPDATED, props)
}

pub fn assistant(session: &str, message: &MessageId) -> Value {
    json!({"id": message.as_str(), "sessionID": session, "role": "assistant"})
}

pub fn user(session: &str, message: &MessageId, agent: &str, created: i64) -> Value {
    json!({
        "id": message.as_str(),
        "sessionID": session,
        "role": "user",
        "agent": agent,
        "model": {"providerID": "anthropic", "modelID": "sonnet"},
        "time": {"created": created}
    })
}

pub fn message_event(info: Value) -> WireEvent {
    WireEvent::new(types::MESSAGE_UPDATED, json!({"info": info}))
}

pub fn words(n: usize) -> String {
    "x".repeat(n)
}
