use std::sync::Arc;

use async_trait::async_trait;

use relay_core::errors::SyncError;
use relay_core::events::WireEvent;
use relay_core::ids::SessionId;
use relay_core::model::{MessageRecord, SessionInfo, SessionStatus};

/// Request/response side of the server.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Most recent `limit` messages of a session, oldest first.
    async fn fetch_messages(
        &self,
        session: &SessionId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, SyncError>;

    async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>, SyncError>;

    async fn fetch_session(&self, session: &SessionId) -> Result<SessionInfo, SyncError>;

    /// Status of every non-idle session. Sessions absent from the result are idle.
    async fn fetch_statuses(&self) -> Result<Vec<(SessionId, SessionStatus)>, SyncError>;

    /// Cheap reachability check.
    async fn probe(&self) -> bool;

    /// Ask the server to refresh a capability list (tools, language servers).
    async fn refresh_capability(
        &self,
        capability: &str,
        directory: Option<&str>,
    ) -> Result<(), SyncError>;
}

/// Callbacks a subscribed event feed drives.
pub trait FeedHandler: Send + Sync {
    fn on_event(&self, event: WireEvent);
    fn on_error(&self, error: SyncError);
    fn on_open(&self);
    /// The transport gave up on this connection.
    fn on_closed(&self);
}

/// Live subscription handle. Dropping without `unsubscribe` leaves the
/// transport running.
pub trait Subscription: Send {
    fn unsubscribe(self: Box<Self>);
}

/// Push side of the server.
pub trait EventFeed: Send + Sync {
    fn subscribe(&self, handler: Arc<dyn FeedHandler>) -> Box<dyn Subscription>;
}
