//! Realtime stream lifecycle.
//!
//! The [`ConnectionManager`] owns the event feed subscription and every
//! timer around it: reconnect backoff, the hidden-pause grace period, the
//! staleness watchdog and the stall recovery listener. Timers only hold a
//! `Weak` back-reference, so dropping the manager ends them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_core::errors::SyncError;
use relay_core::events::WireEvent;
use relay_core::model::{ConnectionStatus, SessionStatus, StreamConnectionState};
use relay_telemetry::SyncCounters;

use crate::backend::{EventFeed, FeedHandler, Subscription, SyncBackend};
use crate::config::SyncConfig;
use crate::context::{Environment, SyncContext};
use crate::dispatch::EventDispatcher;
use crate::stall::StallAlert;
use crate::store::SyncStore;
use crate::surface::ClientSurface;

/// Base backoff for a reconnect attempt, before jitter.
///
/// Attempts 1-3 double from 1s (capped at 8s); later attempts restart at 2s
/// and double up to 32s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let ms = if attempt <= 3 {
        (1_000u64 << (attempt - 1)).min(8_000)
    } else {
        (2_000u64 << (attempt - 4).min(16)).min(32_000)
    };
    Duration::from_millis(ms)
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(h) = handle.take() {
        h.abort();
    }
}

#[derive(Default)]
struct ManagerState {
    subscription: Option<Box<dyn Subscription>>,
    generation: u64,
    connected: bool,
    opened_at: Option<Instant>,
    pending_resume: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    pause_timer: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    stall_listener: Option<JoinHandle<()>>,
}

struct ManagerInner {
    ctx: Arc<SyncContext>,
    dispatcher: EventDispatcher,
    feed: Arc<dyn EventFeed>,
    state: Mutex<ManagerState>,
    stall_alerts: Mutex<Option<mpsc::UnboundedReceiver<StallAlert>>>,
    weak: Weak<ManagerInner>,
}

/// Handler registered with the feed. Callbacks from a superseded
/// subscription carry an old generation and are ignored.
struct FeedRelay {
    manager: Weak<ManagerInner>,
    generation: u64,
}

impl FeedHandler for FeedRelay {
    fn on_event(&self, event: WireEvent) {
        if let Some(m) = self.manager.upgrade() {
            m.on_event(self.generation, event);
        }
    }

    fn on_error(&self, error: SyncError) {
        if let Some(m) = self.manager.upgrade() {
            m.on_error(self.generation, error);
        }
    }

    fn on_open(&self) {
        if let Some(m) = self.manager.upgrade() {
            m.on_open(self.generation);
        }
    }

    fn on_closed(&self) {
        if let Some(m) = self.manager.upgrade() {
            m.on_closed(self.generation);
        }
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn SyncBackend>,
        surface: Arc<dyn ClientSurface>,
        feed: Arc<dyn EventFeed>,
        counters: Arc<SyncCounters>,
    ) -> Self {
        let (ctx, alerts) = SyncContext::new(config, store, backend, surface, counters);
        let inner = Arc::new_cyclic(|weak| ManagerInner {
            dispatcher: EventDispatcher::new(Arc::clone(&ctx)),
            ctx,
            feed,
            state: Mutex::new(ManagerState::default()),
            stall_alerts: Mutex::new(Some(alerts)),
            weak: weak.clone(),
        });
        Self { inner }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.inner.ctx
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> StreamConnectionState {
        self.inner.ctx.status.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn is_pending_resume(&self) -> bool {
        self.inner.state.lock().pending_resume
    }

    pub fn is_reconnect_scheduled(&self) -> bool {
        self.inner.state.lock().reconnect_timer.is_some()
    }

    /// Start background timers and open the stream.
    pub fn start(&self) {
        self.inner.spawn_background();
        self.inner.connect(true);
    }

    /// Tear everything down and publish `idle`.
    pub fn stop(&self) {
        let subscription = {
            let mut st = self.inner.state.lock();
            st.generation += 1;
            st.connected = false;
            abort(&mut st.reconnect_timer);
            abort(&mut st.pause_timer);
            abort(&mut st.watchdog);
            abort(&mut st.stall_listener);
            st.subscription.take()
        };
        if let Some(s) = subscription {
            s.unsubscribe();
        }
        self.inner.ctx.status.publish(ConnectionStatus::Idle, None);
        info!("sync stopped");
    }

    pub fn force_reconnect(&self) {
        self.inner.connect(true);
    }

    /// Returns the delay until the next attempt, if one was scheduled.
    pub fn schedule_reconnect(&self) -> Option<Duration> {
        self.inner.schedule_reconnect()
    }

    pub fn set_visible(&self, visible: bool) {
        self.inner.ctx.update_environment(|e| e.visible = visible);
        if visible {
            abort(&mut self.inner.state.lock().pause_timer);
            self.inner.recover("visible");
        } else {
            self.inner.arm_pause_timer();
        }
    }

    pub fn set_online(&self, online: bool) {
        self.inner.ctx.update_environment(|e| e.online = online);
        if online {
            self.inner.recover("online");
        } else {
            self.inner.suspend("offline");
        }
    }

    pub fn focus_gained(&self) {
        self.inner.recover("focus");
    }

    /// Page restored, possibly from a back/forward cache.
    pub fn page_shown(&self) {
        self.inner.ctx.update_environment(|e| e.visible = true);
        abort(&mut self.inner.state.lock().pause_timer);
        self.inner.recover("page shown");
    }

    pub fn page_hidden(&self) {
        self.inner.ctx.update_environment(|e| e.visible = false);
        self.inner.suspend("page hidden");
    }
}

impl ManagerInner {
    fn env(&self) -> Environment {
        self.ctx.environment()
    }

    fn held_status(env: Environment) -> ConnectionStatus {
        if env.online {
            ConnectionStatus::Paused
        } else {
            ConnectionStatus::Offline
        }
    }

    fn spawn_background(&self) {
        let mut st = self.state.lock();
        if st.watchdog.is_none() {
            let weak = self.weak.clone();
            let period = self.ctx.config.watchdog_interval;
            st.watchdog = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    interval.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    inner.watchdog_tick().await;
                }
            }));
        }
        if st.stall_listener.is_none() {
            if let Some(mut alerts) = self.stall_alerts.lock().take() {
                let weak = self.weak.clone();
                st.stall_listener = Some(tokio::spawn(async move {
                    while let Some(alert) = alerts.recv().await {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.recover_stall(alert);
                    }
                }));
            }
        }
    }

    /// Not holdable: remember to resume and report paused/offline.
    fn hold(&self) {
        let env = self.env();
        self.state.lock().pending_resume = true;
        self.ctx.status.publish(Self::held_status(env), None);
    }

    fn connect(&self, reset_attempts: bool) {
        if !self.env().holdable() {
            self.hold();
            return;
        }
        if reset_attempts {
            self.ctx.status.reset_attempts();
        }
        let (previous, generation) = {
            let mut st = self.state.lock();
            abort(&mut st.reconnect_timer);
            st.connected = false;
            st.generation += 1;
            (st.subscription.take(), st.generation)
        };
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
        if self.ctx.status.attempts() == 0 {
            self.ctx.status.publish(ConnectionStatus::Connecting, None);
        }
        debug!(generation, "subscribing to event feed");

        let handler = Arc::new(FeedRelay {
            manager: self.weak.clone(),
            generation,
        });
        let subscription = self.feed.subscribe(handler);

        let mut st = self.state.lock();
        if st.generation == generation {
            st.subscription = Some(subscription);
        } else {
            drop(st);
            subscription.unsubscribe();
        }
    }

    /// Stop the stream and report paused/offline.
    fn suspend(&self, reason: &str) {
        let subscription = {
            let mut st = self.state.lock();
            st.pending_resume = true;
            st.connected = false;
            st.generation += 1;
            abort(&mut st.reconnect_timer);
            abort(&mut st.pause_timer);
            st.subscription.take()
        };
        if let Some(s) = subscription {
            s.unsubscribe();
        }
        self.ctx.status.publish(Self::held_status(self.env()), None);
        info!(reason, "stream suspended");
    }

    fn arm_pause_timer(&self) {
        let weak = self.weak.clone();
        let grace = self.ctx.config.hidden_pause_grace;
        let mut st = self.state.lock();
        abort(&mut st.pause_timer);
        st.pause_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else { return };
            inner.state.lock().pause_timer = None;
            if !inner.env().visible {
                inner.suspend("hidden");
            }
        }));
    }

    fn recover(&self, reason: &str) {
        if !self.env().holdable() {
            self.hold();
            return;
        }
        let connected = {
            let mut st = self.state.lock();
            if st.connected && !self.is_stale() {
                return;
            }
            st.pending_resume = true;
            st.connected
        };
        info!(reason, connected, "recovering stream");
        if let Some(active) = self.ctx.store.active_session() {
            drop(self.ctx.resync.soft_resync(&active, reason));
            self.dispatcher.refresh_metadata(&active);
        }
        self.connect(true);
    }

    fn is_stale(&self) -> bool {
        self.ctx
            .status
            .last_event_at()
            .is_some_and(|t| t.elapsed() > self.ctx.config.stream_stale_after)
    }

    /// Silence since the last event, or since the stream opened if none arrived.
    fn silence(&self) -> Option<Duration> {
        let opened_at = self.state.lock().opened_at;
        self.ctx
            .status
            .last_event_at()
            .max(opened_at)
            .map(|t| t.elapsed())
    }

    fn schedule_reconnect(&self) -> Option<Duration> {
        if !self.env().holdable() {
            self.hold();
            return None;
        }
        let mut st = self.state.lock();
        if st.reconnect_timer.is_some() {
            return None;
        }
        let attempt = self.ctx.status.next_attempt();
        let delay = reconnect_delay(attempt) + jitter(self.ctx.config.reconnect_jitter_max);

        let weak = self.weak.clone();
        st.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            inner.state.lock().reconnect_timer = None;
            inner.connect(false);
        }));
        drop(st);

        let secs = delay.as_secs_f64().ceil() as u64;
        let hint = format!("retrying in {secs}s (attempt {attempt})");
        self.ctx
            .status
            .publish(ConnectionStatus::Reconnecting, Some(&hint));
        self.ctx.counters.inc("reconnects_scheduled", &[]);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        Some(delay)
    }

    fn on_open(&self, generation: u64) {
        let was_pending = {
            let mut st = self.state.lock();
            if st.generation != generation {
                return;
            }
            st.connected = true;
            st.opened_at = Some(Instant::now());
            std::mem::take(&mut st.pending_resume)
        };
        let cold = self
            .ctx
            .status
            .last_event_at()
            .is_some_and(|t| t.elapsed() > self.ctx.config.bootstrap_stale_after);

        self.ctx.status.reset_attempts();
        self.ctx.status.publish(ConnectionStatus::Connected, None);
        self.ctx.counters.inc("stream_opened", &[]);
        info!(was_pending, cold, "stream connected");
        self.dispatcher.check_connectivity();

        if was_pending || cold {
            drop(self.ctx.resync.bootstrap("reconnected"));
        } else if let Some(active) = self.ctx.store.active_session() {
            drop(self.ctx.resync.soft_resync(&active, "reconnected"));
            self.dispatcher.refresh_metadata(&active);
        }
    }

    fn on_event(&self, generation: u64, event: WireEvent) {
        if self.state.lock().generation != generation {
            debug!(event_type = %event.event_type, "event from superseded subscription");
            return;
        }
        self.dispatcher.handle(&event);
    }

    fn on_error(&self, generation: u64, error: SyncError) {
        if self.state.lock().generation != generation {
            return;
        }
        self.ctx
            .counters
            .inc("stream_errors", &[("kind", error.error_kind())]);
        warn!(error = %error, retryable = error.is_retryable(), "event stream error");
    }

    fn on_closed(&self, generation: u64) {
        {
            let mut st = self.state.lock();
            if st.generation != generation {
                return;
            }
            st.connected = false;
            st.subscription = None;
        }
        debug!("event stream closed");
        self.schedule_reconnect();
    }

    async fn watchdog_tick(&self) {
        if !self.env().holdable() {
            return;
        }
        if !self.ctx.store.active_sessions().is_empty() {
            self.poll_statuses().await;
        }
        let silent = self
            .silence()
            .is_some_and(|s| s > self.ctx.config.stream_stale_after);
        if silent {
            let reachable = self.ctx.backend.probe().await;
            self.ctx.surface.connectivity(reachable);
            warn!(reachable, "event stream silent, forcing reconnect");
            self.ctx.counters.inc("watchdog_reconnects", &[]);
            self.connect(true);
        }
    }

    /// Apply a server-side status snapshot. Active sessions missing from
    /// the snapshot are idle.
    async fn poll_statuses(&self) {
        match self.ctx.backend.fetch_statuses().await {
            Ok(statuses) => {
                let mut reported = std::collections::HashSet::new();
                for (session, status) in statuses {
                    reported.insert(session.clone());
                    self.dispatcher.update_session_status(&session, status);
                }
                for session in self.ctx.store.active_sessions() {
                    if !reported.contains(&session) {
                        debug!(session_id = %session, "status poll reports idle");
                        self.dispatcher
                            .update_session_status(&session, SessionStatus::idle());
                    }
                }
            }
            Err(e) => debug!(error = %e, "status poll failed"),
        }
    }

    fn recover_stall(&self, alert: StallAlert) {
        self.ctx.counters.inc("stall_recoveries", &[]);
        drop(self.ctx.resync.soft_resync(&alert.session_id, "stall"));
        self.connect(true);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        abort(&mut st.reconnect_timer);
        abort(&mut st.pause_timer);
        abort(&mut st.watchdog);
        abort(&mut st.stall_listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule() {
        let ms: Vec<u64> = (1..=9)
            .map(|n| reconnect_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(
            ms,
            vec![1_000, 2_000, 4_000, 2_000, 4_000, 8_000, 16_000, 32_000, 32_000]
        );
        assert_eq!(reconnect_delay(0), Duration::from_millis(1_000));
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_millis(32_000));
    }

    #[test]
    fn jitter_is_bounded() {
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(250)) <= Duration::from_millis(250));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
