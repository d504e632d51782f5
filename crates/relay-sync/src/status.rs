use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use relay_core::model::{ConnectionStatus, StreamConnectionState};

use crate::surface::ClientSurface;

#[derive(Default)]
struct PublisherState {
    stream: StreamConnectionState,
    last_published: Option<(ConnectionStatus, Option<String>)>,
}

/// Owns the process-wide [`StreamConnectionState`] and reports status
/// changes to the client surface, suppressing repeats of the same
/// (status, hint) pair.
pub struct StatusPublisher {
    surface: Arc<dyn ClientSurface>,
    state: Mutex<PublisherState>,
}

impl StatusPublisher {
    pub fn new(surface: Arc<dyn ClientSurface>) -> Self {
        Self {
            surface,
            state: Mutex::new(PublisherState::default()),
        }
    }

    /// Returns whether the surface was notified.
    pub fn publish(&self, status: ConnectionStatus, hint: Option<&str>) -> bool {
        {
            let mut state = self.state.lock();
            let pair = (status, hint.map(str::to_owned));
            if state.last_published.as_ref() == Some(&pair) {
                return false;
            }
            state.stream.status = status;
            state.stream.hint = pair.1.clone();
            state.last_published = Some(pair);
        }
        debug!(status = %status, hint = hint.unwrap_or(""), "connection status");
        self.surface.connection_status(status, hint);
        true
    }

    pub fn touch(&self) {
        self.state.lock().stream.last_event_at = Some(Instant::now());
    }

    pub fn last_event_at(&self) -> Option<Instant> {
        self.state.lock().stream.last_event_at
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().stream.status
    }

    /// Increment the reconnect counter and return the new attempt number.
    pub fn next_attempt(&self) -> u32 {
        let mut state = self.state.lock();
        state.stream.reconnect_attempts = state.stream.reconnect_attempts.saturating_add(1);
        state.stream.reconnect_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().stream.reconnect_attempts
    }

    pub fn reset_attempts(&self) {
        self.state.lock().stream.reconnect_attempts = 0;
    }

    pub fn snapshot(&self) -> StreamConnectionState {
        self.state.lock().stream.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingSurface;

    #[test]
    fn suppresses_repeated_pairs() {
        let surface = Arc::new(RecordingSurface::new());
        let publisher = StatusPublisher::new(surface.clone());

        assert!(publisher.publish(ConnectionStatus::Connecting, None));
        assert!(!publisher.publish(ConnectionStatus::Connecting, None));
        assert!(publisher.publish(ConnectionStatus::Reconnecting, Some("retrying in 1s")));
        assert!(publisher.publish(ConnectionStatus::Reconnecting, Some("retrying in 2s")));
        assert!(!publisher.publish(ConnectionStatus::Reconnecting, Some("retrying in 2s")));

        assert_eq!(surface.statuses().len(), 3);
        assert_eq!(publisher.status(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn first_publish_of_default_status_is_reported() {
        let surface = Arc::new(RecordingSurface::new());
        let publisher = StatusPublisher::new(surface.clone());
        assert!(publisher.publish(ConnectionStatus::Idle, None));
        assert_eq!(surface.statuses(), vec![(ConnectionStatus::Idle, None)]);
    }

    #[test]
    fn attempt_counter() {
        let publisher = StatusPublisher::new(Arc::new(RecordingSurface::new()));
        assert_eq!(publisher.next_attempt(), 1);
        assert_eq!(publisher.next_attempt(), 2);
        publisher.reset_attempts();
        assert_eq!(publisher.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_records_last_event() {
        let publisher = StatusPublisher::new(Arc::new(RecordingSurface::new()));
        assert!(publisher.last_event_at().is_none());
        publisher.touch();
        let first = publisher.last_event_at().unwrap();
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        publisher.touch();
        assert!(publisher.last_event_at().unwrap() > first);
    }
}
