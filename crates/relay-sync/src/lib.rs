//! # relay-sync
//!
//! Client-side reconciliation between a realtime event stream and a local
//! reactive store.
//!
//! - [`dispatch::EventDispatcher`] applies inbound events with the
//!   anti-regression rules (trimmed head, shrink guard, idempotent finalization).
//! - [`resync::ResyncCoordinator`] serializes authoritative history reloads.
//! - [`stall::StallDetector`] catches busy sessions that went silent.
//! - [`connection::ConnectionManager`] owns the stream lifecycle, backoff and
//!   environment signals.

pub mod backend;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod lookup;
pub mod memory;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod resync;
pub mod stall;
pub mod status;
pub mod store;
pub mod surface;
pub mod text_len;

pub use backend::{EventFeed, FeedHandler, Subscription, SyncBackend};
pub use config::SyncConfig;
pub use connection::{reconnect_delay, ConnectionManager};
pub use context::{Environment, SyncContext};
pub use dispatch::{DropReason, EventDispatcher, Outcome};
pub use memory::{MemoryStore, StoreSnapshot};
pub use store::SyncStore;
pub use surface::{ClientSurface, NullSurface};
