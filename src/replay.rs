//! Offline replay of a recorded event stream.
//!
//! Each line of the input is one `{ "type", "properties" }` event, optionally
//! prefixed with `data:` as captured from a server-sent event stream. Events
//! go through the real connection manager and dispatcher into a
//! [`MemoryStore`], whose snapshot is the replay result.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use relay_core::errors::SyncError;
use relay_core::events::WireEvent;
use relay_core::ids::SessionId;
use relay_core::model::{
    ConnectionStatus, MessageRecord, Notification, PendingRequest, SessionInfo, SessionStatus,
};
use relay_sync::{
    ClientSurface, ConnectionManager, EventFeed, FeedHandler, MemoryStore, StoreSnapshot,
    Subscription, SyncBackend, SyncConfig,
};
use relay_telemetry::{CountersSnapshot, SyncCounters};

/// Time given to side tasks (hydration, metadata refresh) after the last event.
const SETTLE: Duration = Duration::from_millis(50);

pub struct ReplayOptions {
    pub active: Option<SessionId>,
    pub agents: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub events: usize,
    pub skipped_lines: usize,
    pub snapshot: StoreSnapshot,
    pub counters: CountersSnapshot,
}

pub struct ParsedLog {
    pub events: Vec<WireEvent>,
    pub skipped: usize,
}

pub fn parse_events(text: &str) -> ParsedLog {
    let mut events = Vec::new();
    let mut skipped = 0;
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        match serde_json::from_str::<WireEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line = n + 1, error = %e, "skipping unparseable event line");
                skipped += 1;
            }
        }
    }
    ParsedLog { events, skipped }
}

pub fn load_events(path: &Path) -> Result<ParsedLog> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read event log {}", path.display()))?;
    Ok(parse_events(&text))
}

/// Feed that opens as soon as it is subscribed and forwards whatever the
/// replay loop pushes into it.
#[derive(Default)]
struct ReplayFeed {
    handler: Mutex<Option<Arc<dyn FeedHandler>>>,
}

struct ReplaySubscription;

impl Subscription for ReplaySubscription {
    fn unsubscribe(self: Box<Self>) {}
}

impl ReplayFeed {
    fn push(&self, event: WireEvent) -> bool {
        let handler = self.handler.lock().clone();
        match handler {
            Some(h) => {
                h.on_event(event);
                true
            }
            None => false,
        }
    }
}

impl EventFeed for ReplayFeed {
    fn subscribe(&self, handler: Arc<dyn FeedHandler>) -> Box<dyn Subscription> {
        *self.handler.lock() = Some(Arc::clone(&handler));
        handler.on_open();
        Box::new(ReplaySubscription)
    }
}

/// Backend for runs without a server: every fetch fails, so resyncs and
/// hydration leave the replayed state untouched.
pub struct OfflineBackend;

fn offline() -> SyncError {
    SyncError::Network("offline replay".into())
}

#[async_trait]
impl SyncBackend for OfflineBackend {
    async fn fetch_messages(
        &self,
        _session: &SessionId,
        _limit: usize,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        Err(offline())
    }

    async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>, SyncError> {
        Err(offline())
    }

    async fn fetch_session(&self, _session: &SessionId) -> Result<SessionInfo, SyncError> {
        Err(offline())
    }

    async fn fetch_statuses(&self) -> Result<Vec<(SessionId, SessionStatus)>, SyncError> {
        Err(offline())
    }

    async fn probe(&self) -> bool {
        false
    }

    async fn refresh_capability(
        &self,
        _capability: &str,
        _directory: Option<&str>,
    ) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Surface that reports to the log.
pub struct LogSurface;

impl ClientSurface for LogSurface {
    fn connection_status(&self, status: ConnectionStatus, hint: Option<&str>) {
        info!(status = %status, hint = hint.unwrap_or(""), "connection");
    }

    fn connectivity(&self, reachable: bool) {
        debug!(reachable, "connectivity");
    }

    fn attention_prompt(&self, request: &PendingRequest) {
        info!(
            session_id = %request.session_id,
            request_id = %request.id,
            kind = request.kind.as_str(),
            "request needs attention"
        );
    }

    fn notify(&self, notification: Notification) {
        info!(title = %notification.title, body = ?notification.body, "notification");
    }
}

pub async fn run_replay(
    events: Vec<WireEvent>,
    options: ReplayOptions,
    config: SyncConfig,
    backend: Arc<dyn SyncBackend>,
    counters: Arc<SyncCounters>,
) -> Result<(StoreSnapshot, CountersSnapshot)> {
    let store = Arc::new(MemoryStore::new());
    store.set_known_agents(options.agents);
    store.set_active_session(options.active);

    let feed = Arc::new(ReplayFeed::default());
    let manager = ConnectionManager::new(
        config,
        store.clone(),
        backend,
        Arc::new(LogSurface),
        feed.clone(),
        counters.clone(),
    );
    manager.start();

    let total = events.len();
    for event in events {
        if !feed.push(event) {
            anyhow::bail!("event feed has no subscriber");
        }
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(SETTLE).await;
    manager.stop();
    info!(events = total, "replay finished");

    Ok((store.snapshot(), counters.snapshot()))
}
