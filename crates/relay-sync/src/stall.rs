//! Busy-session stall detection.
//!
//! A session that turns busy arms a one-shot timer. Any message or part
//! activity for the session disarms it. If the timer fires while the
//! session is still busy and no activity arrived since it was armed, a
//! [`StallAlert`] is sent to whoever owns the reconnect path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use relay_core::ids::SessionId;
use relay_core::model::StatusKind;

use crate::store::SyncStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StallAlert {
    pub session_id: SessionId,
    pub armed_at: Instant,
}

struct ArmedTimer {
    generation: u64,
    armed_at: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct StallState {
    timers: HashMap<SessionId, ArmedTimer>,
    activity: HashMap<SessionId, Instant>,
    last_recovery: Option<Instant>,
    next_generation: u64,
}

struct StallInner {
    timeout: Duration,
    cooldown: Duration,
    store: Arc<dyn SyncStore>,
    state: Mutex<StallState>,
    alerts: mpsc::UnboundedSender<StallAlert>,
}

#[derive(Clone)]
pub struct StallDetector {
    inner: Arc<StallInner>,
}

impl StallDetector {
    pub fn new(
        timeout: Duration,
        cooldown: Duration,
        store: Arc<dyn SyncStore>,
    ) -> (Self, mpsc::UnboundedReceiver<StallAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let detector = Self {
            inner: Arc::new(StallInner {
                timeout,
                cooldown,
                store,
                state: Mutex::new(StallState::default()),
                alerts: tx,
            }),
        };
        (detector, rx)
    }

    /// Feed a status transition. Idle disarms; idle-to-active arms.
    pub fn on_status_change(
        &self,
        session: &SessionId,
        previous: Option<StatusKind>,
        next: StatusKind,
    ) {
        if !next.is_active() {
            self.disarm(session);
            return;
        }
        let was_idle = previous.map_or(true, |p| !p.is_active());
        if was_idle {
            self.arm(session);
        }
    }

    /// Message evidence for a session: record it and disarm.
    pub fn note_activity(&self, session: &SessionId) {
        let mut state = self.inner.state.lock();
        state.activity.insert(session.clone(), Instant::now());
        if let Some(timer) = state.timers.remove(session) {
            timer.handle.abort();
        }
    }

    pub fn disarm(&self, session: &SessionId) {
        if let Some(timer) = self.inner.state.lock().timers.remove(session) {
            timer.handle.abort();
        }
    }

    pub fn forget(&self, session: &SessionId) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timers.remove(session) {
            timer.handle.abort();
        }
        state.activity.remove(session);
    }

    pub fn is_armed(&self, session: &SessionId) -> bool {
        self.inner.state.lock().timers.contains_key(session)
    }

    fn arm(&self, session: &SessionId) {
        let mut state = self.inner.state.lock();
        if let Some(previous) = state.timers.remove(session) {
            previous.handle.abort();
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let armed_at = Instant::now();

        let inner = Arc::clone(&self.inner);
        let sid = session.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            inner.fire(&sid, generation);
        });
        state.timers.insert(
            session.clone(),
            ArmedTimer {
                generation,
                armed_at,
                handle,
            },
        );
        debug!(session_id = %session, "stall timer armed");
    }
}

impl StallInner {
    fn fire(&self, session: &SessionId, generation: u64) {
        let armed_at = {
            let mut state = self.state.lock();
            match state.timers.get(session) {
                Some(timer) if timer.generation == generation => {
                    let armed_at = timer.armed_at;
                    state.timers.remove(session);
                    armed_at
                }
                _ => return,
            }
        };

        let still_active = self
            .store
            .session_status(session)
            .is_some_and(|r| r.kind().is_active());
        if !still_active {
            return;
        }

        {
            let mut state = self.state.lock();
            if state.activity.get(session).is_some_and(|t| *t >= armed_at) {
                return;
            }
            let now = Instant::now();
            if let Some(last) = state.last_recovery {
                if now.duration_since(last) < self.cooldown {
                    debug!(session_id = %session, "stall detected inside recovery cooldown");
                    return;
                }
            }
            state.last_recovery = Some(now);
        }

        warn!(
            session_id = %session,
            timeout_ms = self.timeout.as_millis() as u64,
            "session busy without message activity, recovering"
        );
        let _ = self.alerts.send(StallAlert {
            session_id: session.clone(),
            armed_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use relay_core::model::{SessionStatus, SessionStatusRecord};

    fn setup() -> (
        Arc<MemoryStore>,
        StallDetector,
        mpsc::UnboundedReceiver<StallAlert>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let (detector, rx) = StallDetector::new(
            Duration::from_millis(2_000),
            Duration::from_millis(15_000),
            store.clone(),
        );
        (store, detector, rx)
    }

    fn set_busy(store: &MemoryStore, sid: &SessionId) {
        store.set_session_status(
            sid,
            SessionStatusRecord {
                status: SessionStatus::busy(),
                confirmed_at: None,
            },
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fires_when_busy_and_silent() {
        let (store, detector, mut rx) = setup();
        let sid = SessionId::from_raw("ses_1");
        set_busy(&store, &sid);
        detector.on_status_change(&sid, Some(StatusKind::Idle), StatusKind::Busy);
        assert!(detector.is_armed(&sid));

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.session_id, sid);
        assert!(!detector.is_armed(&sid));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_disarms() {
        let (store, detector, mut rx) = setup();
        let sid = SessionId::from_raw("ses_1");
        set_busy(&store, &sid);
        detector.on_status_change(&sid, None, StatusKind::Busy);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        detector.note_activity(&sid);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_to_busy_does_not_rearm() {
        let (store, detector, mut rx) = setup();
        let sid = SessionId::from_raw("ses_1");
        set_busy(&store, &sid);
        detector.on_status_change(&sid, Some(StatusKind::Idle), StatusKind::Busy);
        detector.note_activity(&sid);
        detector.on_status_change(&sid, Some(StatusKind::Busy), StatusKind::Retry);
        assert!(!detector.is_armed(&sid));
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_before_timeout_cancels() {
        let (store, detector, mut rx) = setup();
        let sid = SessionId::from_raw("ses_1");
        set_busy(&store, &sid);
        detector.on_status_change(&sid, Some(StatusKind::Idle), StatusKind::Busy);
        detector.on_status_change(&sid, Some(StatusKind::Busy), StatusKind::Idle);
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn no_alert_when_store_already_idle() {
        let (_store, detector, mut rx) = setup();
        let sid = SessionId::from_raw("ses_1");
        detector.on_status_change(&sid, Some(StatusKind::Idle), StatusKind::Busy);
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_cooldown_is_process_wide() {
        let (store, detector, mut rx) = setup();
        let a = SessionId::from_raw("ses_a");
        let b = SessionId::from_raw("ses_b");
        set_busy(&store, &a);
        set_busy(&store, &b);

        detector.on_status_change(&a, None, StatusKind::Busy);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(rx.try_recv().unwrap().session_id, a);

        detector.on_status_change(&b, None, StatusKind::Busy);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(rx.try_recv().is_err(), "inside cooldown");

        tokio::time::sleep(Duration::from_millis(15_000)).await;
        detector.on_status_change(&b, Some(StatusKind::Idle), StatusKind::Busy);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(rx.try_recv().unwrap().session_id, b);
    }
}
