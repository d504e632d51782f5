use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use relay_telemetry::SyncCounters;

use crate::backend::SyncBackend;
use crate::config::SyncConfig;
use crate::resync::ResyncCoordinator;
use crate::stall::{StallAlert, StallDetector};
use crate::status::StatusPublisher;
use crate::store::SyncStore;
use crate::surface::ClientSurface;

/// Client environment signals that gate whether a stream may be held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Environment {
    pub visible: bool,
    pub online: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            visible: true,
            online: true,
        }
    }
}

impl Environment {
    pub fn holdable(&self) -> bool {
        self.visible && self.online
    }
}

/// Shared state and collaborators for one sync engine.
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: Arc<dyn SyncStore>,
    pub backend: Arc<dyn SyncBackend>,
    pub surface: Arc<dyn ClientSurface>,
    pub counters: Arc<SyncCounters>,
    pub status: StatusPublisher,
    pub resync: ResyncCoordinator,
    pub stall: StallDetector,
    environment: RwLock<Environment>,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn SyncBackend>,
        surface: Arc<dyn ClientSurface>,
        counters: Arc<SyncCounters>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StallAlert>) {
        let (stall, alerts) = StallDetector::new(
            config.stall_timeout,
            config.stall_recovery_cooldown,
            Arc::clone(&store),
        );
        let resync = ResyncCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            Arc::clone(&counters),
            config.resync_min_interval,
            config.soft_resync_max_delay,
            config.resync_limit,
        );
        let ctx = Arc::new(Self {
            status: StatusPublisher::new(Arc::clone(&surface)),
            config,
            store,
            backend,
            surface,
            counters,
            resync,
            stall,
            environment: RwLock::new(Environment::default()),
        });
        (ctx, alerts)
    }

    pub fn environment(&self) -> Environment {
        *self.environment.read()
    }

    pub fn update_environment(&self, f: impl FnOnce(&mut Environment)) -> Environment {
        let mut env = self.environment.write();
        f(&mut env);
        *env
    }

    pub fn is_active_session(&self, session: &relay_core::ids::SessionId) -> bool {
        self.store.active_session().as_ref() == Some(session)
    }
}
