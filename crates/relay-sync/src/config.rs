use std::time::Duration;

use relay_settings::SyncSettings;

/// Duration-typed view of [`SyncSettings`].
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub stall_timeout: Duration,
    pub stall_recovery_cooldown: Duration,
    pub resync_min_interval: Duration,
    pub soft_resync_max_delay: Duration,
    pub bootstrap_stale_after: Duration,
    pub stream_stale_after: Duration,
    pub watchdog_interval: Duration,
    pub metadata_refresh_interval: Duration,
    pub idle_confirm_grace: Duration,
    pub shrink_tolerance: usize,
    pub reconnect_jitter_max: Duration,
    pub hidden_pause_grace: Duration,
    pub resync_limit: usize,
    pub hydration_limit: usize,
    pub notifications_enabled: bool,
    pub notification_title: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SyncConfig {
    fn from(s: &SyncSettings) -> Self {
        let ms = Duration::from_millis;
        Self {
            stall_timeout: ms(s.stall_timeout_ms),
            stall_recovery_cooldown: ms(s.stall_recovery_cooldown_ms),
            resync_min_interval: ms(s.resync_min_interval_ms),
            soft_resync_max_delay: ms(s.soft_resync_max_delay_ms),
            bootstrap_stale_after: ms(s.bootstrap_stale_after_ms),
            stream_stale_after: ms(s.stream_stale_after_ms),
            watchdog_interval: ms(s.watchdog_interval_ms),
            metadata_refresh_interval: ms(s.metadata_refresh_interval_ms),
            idle_confirm_grace: ms(s.idle_confirm_grace_ms),
            shrink_tolerance: s.shrink_tolerance_chars,
            reconnect_jitter_max: ms(s.reconnect_jitter_max_ms),
            hidden_pause_grace: ms(s.hidden_pause_grace_ms),
            resync_limit: s.resync_message_limit,
            hydration_limit: s.hydration_message_limit,
            notifications_enabled: s.notifications_enabled,
            notification_title: s.notification_title.clone(),
        }
    }
}
