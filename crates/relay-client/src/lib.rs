//! # relay-client
//!
//! HTTP side of the relay client: the REST-backed [`HttpBackend`] the sync
//! core pulls history and session state from, and the `/health` liveness probe.

pub mod backend;
pub mod errors;
pub mod host;

pub use backend::HttpBackend;
pub use errors::ClientError;
pub use host::{normalize_host_url, probe_health, ProbeResult, ProbeStatus};
