//! Serialized history resyncs.
//!
//! At most one resync runs at a time. Callers that arrive while one is in
//! flight join it; callers that arrive shortly after one completed get an
//! already-resolved task. The fetch itself runs on its own spawned task so
//! a caller dropping its handle never cancels it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_core::ids::SessionId;
use relay_telemetry::SyncCounters;

use crate::backend::SyncBackend;
use crate::store::SyncStore;

/// Handle to a resync. Cloneable and awaitable by any number of callers.
pub type ResyncTask = Shared<BoxFuture<'static, ()>>;

fn ready_task() -> ResyncTask {
    futures::future::ready(()).boxed().shared()
}

#[derive(Default)]
struct ResyncState {
    in_flight: Option<ResyncTask>,
    last_completed: Option<Instant>,
}

struct ResyncInner {
    store: Arc<dyn SyncStore>,
    backend: Arc<dyn SyncBackend>,
    counters: Arc<SyncCounters>,
    min_interval: Duration,
    soft_max_delay: Duration,
    limit: usize,
    state: Mutex<ResyncState>,
}

/// Clears the in-flight marker however the resync task ends.
struct InFlightGuard<'a> {
    inner: &'a ResyncInner,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.in_flight = None;
        state.last_completed = Some(Instant::now());
    }
}

#[derive(Clone)]
pub struct ResyncCoordinator {
    inner: Arc<ResyncInner>,
}

impl ResyncCoordinator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn SyncBackend>,
        counters: Arc<SyncCounters>,
        min_interval: Duration,
        soft_max_delay: Duration,
        limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ResyncInner {
                store,
                backend,
                counters,
                min_interval,
                soft_max_delay,
                limit,
                state: Mutex::new(ResyncState::default()),
            }),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.state.lock().in_flight.is_some()
    }

    /// Immediate resync of one session's history.
    pub fn resync(&self, session: &SessionId, reason: &str) -> ResyncTask {
        let mut state = self.inner.state.lock();
        if let Some(task) = &state.in_flight {
            debug!(session_id = %session, reason, "joining in-flight resync");
            self.inner.counters.inc("resyncs", &[("result", "joined")]);
            return task.clone();
        }
        if let Some(done) = state.last_completed {
            if done.elapsed() < self.inner.min_interval {
                debug!(session_id = %session, reason, "resync debounced");
                self.inner.counters.inc("resyncs", &[("result", "debounced")]);
                return ready_task();
            }
        }

        let inner = Arc::clone(&self.inner);
        let sid = session.clone();
        let reason = reason.to_owned();
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard { inner: &inner };
            let started = Instant::now();
            match inner.backend.fetch_messages(&sid, inner.limit).await {
                Ok(mut messages) => {
                    let fetched = messages.len();
                    messages.retain(|m| !inner.store.is_trimmed(&sid, &m.info.id));
                    let count = messages.len();
                    if count < fetched {
                        debug!(session_id = %sid, dropped = fetched - count, "resync skipped trimmed history");
                    }
                    inner.store.replace_messages(&sid, messages);
                    inner.counters.inc("resyncs", &[("result", "ok")]);
                    info!(
                        session_id = %sid,
                        reason = %reason,
                        messages = count,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "resync complete"
                    );
                }
                Err(e) => {
                    inner.counters.inc("resyncs", &[("result", "error")]);
                    warn!(session_id = %sid, reason = %reason, error = %e, "resync failed");
                }
            }
        });
        let task = async move {
            let _ = handle.await;
        }
        .boxed()
        .shared();
        state.in_flight = Some(task.clone());
        task
    }

    /// Resync that waits out a streaming cooldown first, up to the soft delay cap.
    pub fn soft_resync(&self, session: &SessionId, reason: &str) -> ResyncTask {
        let delay = self
            .inner
            .store
            .streaming_cooldown_until(session)
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
            .map(|d| d.min(self.inner.soft_max_delay));

        let Some(delay) = delay else {
            return self.resync(session, reason);
        };

        debug!(session_id = %session, delay_ms = delay.as_millis() as u64, "soft resync delayed");
        let this = self.clone();
        let sid = session.clone();
        let reason = reason.to_owned();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.resync(&sid, &reason).await;
        });
        async move {
            let _ = handle.await;
        }
        .boxed()
        .shared()
    }

    /// Reload the session list, then resync the active session.
    pub fn bootstrap(&self, reason: &str) -> ResyncTask {
        let this = self.clone();
        let reason = reason.to_owned();
        let handle = tokio::spawn(async move {
            match this.inner.backend.fetch_sessions().await {
                Ok(sessions) => {
                    info!(reason = %reason, sessions = sessions.len(), "bootstrap loaded sessions");
                    this.inner.store.replace_sessions(sessions);
                }
                Err(e) => warn!(reason = %reason, error = %e, "bootstrap session fetch failed"),
            }
            this.inner.counters.inc("bootstraps", &[]);
            if let Some(active) = this.inner.store.active_session() {
                this.resync(&active, &reason).await;
            }
        });
        async move {
            let _ = handle.await;
        }
        .boxed()
        .shared()
    }
}
