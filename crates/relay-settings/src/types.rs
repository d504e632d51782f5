//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial
//! JSON is accepted and missing fields get their production default.
//! Durations are plain milliseconds.

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "client": { "serverUrl": "http://127.0.0.1:4096" },
///   "sync": { "stallTimeoutMs": 2000 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub client: ClientSettings,
    pub sync: SyncSettings,
    pub logging: LoggingSettings,
}

/// HTTP backend settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub server_url: String,
    /// Health probe timeout.
    pub probe_timeout_ms: u64,
    /// Timeout for history/session fetches.
    pub request_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4096".to_string(),
            probe_timeout_ms: 2_000,
            request_timeout_ms: 15_000,
        }
    }
}

/// Reconciliation and connection timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Busy session with no message activity for this long is considered stalled.
    pub stall_timeout_ms: u64,
    /// Minimum spacing between two stall recoveries.
    pub stall_recovery_cooldown_ms: u64,
    /// Minimum spacing between two completed resyncs.
    pub resync_min_interval_ms: u64,
    /// Upper bound for delaying a soft resync behind a streaming cooldown.
    pub soft_resync_max_delay_ms: u64,
    /// Silence after which a reconnect is treated as a cold start.
    pub bootstrap_stale_after_ms: u64,
    /// Silence after which the stream is assumed dead.
    pub stream_stale_after_ms: u64,
    pub watchdog_interval_ms: u64,
    /// Per-session rate limit for metadata refreshes.
    pub metadata_refresh_interval_ms: u64,
    /// Window after an idle confirmation in which streaming-looking parts
    /// do not flip the session back to busy.
    pub idle_confirm_grace_ms: u64,
    /// How much shorter an assistant snapshot may be before it is treated as stale.
    pub shrink_tolerance_chars: usize,
    pub reconnect_jitter_max_ms: u64,
    /// How long the stream survives while the client is hidden.
    pub hidden_pause_grace_ms: u64,
    pub resync_message_limit: usize,
    pub hydration_message_limit: usize,
    pub notifications_enabled: bool,
    pub notification_title: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 2_000,
            stall_recovery_cooldown_ms: 15_000,
            resync_min_interval_ms: 750,
            soft_resync_max_delay_ms: 3_000,
            bootstrap_stale_after_ms: 25_000,
            stream_stale_after_ms: 45_000,
            watchdog_interval_ms: 10_000,
            metadata_refresh_interval_ms: 3_000,
            idle_confirm_grace_ms: 1_200,
            shrink_tolerance_chars: 50,
            reconnect_jitter_max_ms: 250,
            hidden_pause_grace_ms: 30_000,
            resync_message_limit: 200,
            hydration_message_limit: 50,
            notifications_enabled: true,
            notification_title: "Relay".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"sync": {"stallTimeoutMs": 5000}}"#).unwrap();
        assert_eq!(s.sync.stall_timeout_ms, 5000);
        assert_eq!(s.sync.resync_min_interval_ms, 750);
        assert_eq!(s.client.server_url, "http://127.0.0.1:4096");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(SyncSettings::default()).unwrap();
        assert_eq!(json["streamStaleAfterMs"], 45_000);
        assert_eq!(json["shrinkToleranceChars"], 50);
    }
}
