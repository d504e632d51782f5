//! Scriptable collaborators for deterministic tests without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use relay_core::errors::SyncError;
use relay_core::events::WireEvent;
use relay_core::ids::SessionId;
use relay_core::model::{
    ConnectionStatus, MessageRecord, Notification, PendingRequest, SessionInfo, SessionStatus,
};

use crate::backend::{EventFeed, FeedHandler, Subscription, SyncBackend};
use crate::surface::ClientSurface;

/// Backend returning canned data, counting every call.
#[derive(Default)]
pub struct MockBackend {
    messages: Mutex<HashMap<SessionId, Vec<MessageRecord>>>,
    sessions: Mutex<Vec<SessionInfo>>,
    statuses: Mutex<Vec<(SessionId, SessionStatus)>>,
    fetch_delay: Mutex<Duration>,
    fail: AtomicBool,
    unreachable: AtomicBool,
    message_fetches: AtomicUsize,
    session_fetches: AtomicUsize,
    session_list_fetches: AtomicUsize,
    status_polls: AtomicUsize,
    probes: AtomicUsize,
    capability_refreshes: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_messages(&self, session: &SessionId, messages: Vec<MessageRecord>) {
        self.messages.lock().insert(session.clone(), messages);
    }

    pub fn set_sessions(&self, sessions: Vec<SessionInfo>) {
        *self.sessions.lock() = sessions;
    }

    pub fn set_statuses(&self, statuses: Vec<(SessionId, SessionStatus)>) {
        *self.statuses.lock() = statuses;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    pub fn message_fetches(&self) -> usize {
        self.message_fetches.load(Ordering::Relaxed)
    }

    pub fn session_fetches(&self) -> usize {
        self.session_fetches.load(Ordering::Relaxed)
    }

    pub fn session_list_fetches(&self) -> usize {
        self.session_list_fetches.load(Ordering::Relaxed)
    }

    pub fn status_polls(&self) -> usize {
        self.status_polls.load(Ordering::Relaxed)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn capability_refreshes(&self) -> usize {
        self.capability_refreshes.load(Ordering::Relaxed)
    }

    async fn pause(&self) -> Result<(), SyncError> {
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(SyncError::Network("mock failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncBackend for MockBackend {
    async fn fetch_messages(
        &self,
        session: &SessionId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        self.message_fetches.fetch_add(1, Ordering::Relaxed);
        self.pause().await?;
        let all = self.messages.lock().get(session).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>, SyncError> {
        self.session_list_fetches.fetch_add(1, Ordering::Relaxed);
        self.pause().await?;
        Ok(self.sessions.lock().clone())
    }

    async fn fetch_session(&self, session: &SessionId) -> Result<SessionInfo, SyncError> {
        self.session_fetches.fetch_add(1, Ordering::Relaxed);
        self.pause().await?;
        self.sessions
            .lock()
            .iter()
            .find(|s| &s.id == session)
            .cloned()
            .ok_or_else(|| SyncError::from_status(404, format!("no session {session}")))
    }

    async fn fetch_statuses(&self) -> Result<Vec<(SessionId, SessionStatus)>, SyncError> {
        self.status_polls.fetch_add(1, Ordering::Relaxed);
        self.pause().await?;
        Ok(self.statuses.lock().clone())
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::Relaxed);
        !self.unreachable.load(Ordering::Relaxed)
    }

    async fn refresh_capability(
        &self,
        _capability: &str,
        _directory: Option<&str>,
    ) -> Result<(), SyncError> {
        self.capability_refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Event feed driven by the test. `subscribe` records the handler; the
/// test then calls [`MockFeed::open`], [`MockFeed::emit`] and friends.
#[derive(Default)]
pub struct MockFeed {
    handlers: Mutex<Vec<Arc<dyn FeedHandler>>>,
    subscribes: AtomicUsize,
    unsubscribes: Arc<AtomicUsize>,
    auto_open: AtomicBool,
}

struct MockSubscription {
    unsubscribes: Arc<AtomicUsize>,
}

impl Subscription for MockSubscription {
    fn unsubscribe(self: Box<Self>) {
        self.unsubscribes.fetch_add(1, Ordering::Relaxed);
    }
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `on_open` synchronously from inside `subscribe`.
    pub fn auto_open(&self, enabled: bool) {
        self.auto_open.store(enabled, Ordering::Relaxed);
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::Relaxed)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::Relaxed)
    }

    pub fn latest(&self) -> Option<Arc<dyn FeedHandler>> {
        self.handlers.lock().last().cloned()
    }

    /// Handler from an earlier subscription, for stale-callback tests.
    pub fn handler(&self, index: usize) -> Option<Arc<dyn FeedHandler>> {
        self.handlers.lock().get(index).cloned()
    }

    pub fn open(&self) {
        if let Some(h) = self.latest() {
            h.on_open();
        }
    }

    pub fn emit(&self, event: WireEvent) {
        if let Some(h) = self.latest() {
            h.on_event(event);
        }
    }

    pub fn fail(&self, error: SyncError) {
        if let Some(h) = self.latest() {
            h.on_error(error);
        }
    }

    pub fn close(&self) {
        if let Some(h) = self.latest() {
            h.on_closed();
        }
    }
}

impl EventFeed for MockFeed {
    fn subscribe(&self, handler: Arc<dyn FeedHandler>) -> Box<dyn Subscription> {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push(Arc::clone(&handler));
        if self.auto_open.load(Ordering::Relaxed) {
            handler.on_open();
        }
        Box::new(MockSubscription {
            unsubscribes: Arc::clone(&self.unsubscribes),
        })
    }
}

/// Surface that records everything it is told.
#[derive(Default)]
pub struct RecordingSurface {
    statuses: Mutex<Vec<(ConnectionStatus, Option<String>)>>,
    connectivity: Mutex<Vec<bool>>,
    prompts: Mutex<Vec<PendingRequest>>,
    todos: Mutex<Vec<(SessionId, Vec<Value>)>>,
    notifications: Mutex<Vec<Notification>>,
    native_active: AtomicBool,
    disabled: AtomicBool,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<(ConnectionStatus, Option<String>)> {
        self.statuses.lock().clone()
    }

    pub fn last_status(&self) -> Option<ConnectionStatus> {
        self.statuses.lock().last().map(|(s, _)| *s)
    }

    pub fn connectivity_checks(&self) -> Vec<bool> {
        self.connectivity.lock().clone()
    }

    pub fn prompts(&self) -> Vec<PendingRequest> {
        self.prompts.lock().clone()
    }

    pub fn todos(&self) -> Vec<(SessionId, Vec<Value>)> {
        self.todos.lock().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn set_native_active(&self, active: bool) {
        self.native_active.store(active, Ordering::Relaxed);
    }

    pub fn set_notifications_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }
}

impl ClientSurface for RecordingSurface {
    fn connection_status(&self, status: ConnectionStatus, hint: Option<&str>) {
        self.statuses.lock().push((status, hint.map(str::to_owned)));
    }

    fn connectivity(&self, reachable: bool) {
        self.connectivity.lock().push(reachable);
    }

    fn attention_prompt(&self, request: &PendingRequest) {
        self.prompts.lock().push(request.clone());
    }

    fn todos_updated(&self, session: &SessionId, todos: &[Value]) {
        self.todos.lock().push((session.clone(), todos.to_vec()));
    }

    fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }

    fn native_notifications_active(&self) -> bool {
        self.native_active.load(Ordering::Relaxed)
    }

    fn notifications_enabled(&self) -> bool {
        !self.disabled.load(Ordering::Relaxed)
    }
}
