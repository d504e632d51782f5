use serde_json::Value;

use relay_core::ids::SessionId;
use relay_core::model::{ConnectionStatus, Notification, PendingRequest};

/// Everything the sync core tells the user-facing client.
pub trait ClientSurface: Send + Sync {
    fn connection_status(&self, status: ConnectionStatus, hint: Option<&str>);

    fn connectivity(&self, _reachable: bool) {}

    /// A request for a session the user is not looking at needs attention.
    fn attention_prompt(&self, request: &PendingRequest);

    fn todos_updated(&self, _session: &SessionId, _todos: &[Value]) {}

    fn notify(&self, notification: Notification);

    /// A platform-native notification channel already covers this client.
    fn native_notifications_active(&self) -> bool {
        false
    }

    fn notifications_enabled(&self) -> bool {
        true
    }
}

/// Surface that drops everything. Used by headless tools.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSurface;

impl ClientSurface for NullSurface {
    fn connection_status(&self, _status: ConnectionStatus, _hint: Option<&str>) {}
    fn attention_prompt(&self, _request: &PendingRequest) {}
    fn notify(&self, _notification: Notification) {}
}
