//! Reads `~/.relay/settings.json` over the compiled defaults, then applies
//! `RELAY_*` environment overrides.

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::RelaySettings;

pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults. An unreadable or malformed file, or a
/// non-http server URL, is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let malformed = |source| SettingsError::Malformed {
        path: path.to_path_buf(),
        source,
    };

    let mut settings = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(malformed)?;
        let defaults = serde_json::to_value(RelaySettings::default()).map_err(malformed)?;
        serde_json::from_value(overlay(defaults, user)).map_err(malformed)?
    } else {
        debug!(?path, "no settings file, using defaults");
        RelaySettings::default()
    };

    apply_env_overrides(&mut settings);
    let url = settings.client.server_url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(SettingsError::ServerUrl(url.to_owned()));
    }
    Ok(settings)
}

/// Lays `user` over `base` key by key. Nested sections merge, so a file
/// that sets only `sync.stallTimeoutMs` keeps every other sync default.
/// A `null` keeps the base value.
pub fn overlay(base: Value, user: Value) -> Value {
    match (base, user) {
        (Value::Object(mut base), Value::Object(user)) => {
            for (key, value) in user.into_iter().filter(|(_, v)| !v.is_null()) {
                let merged = match base.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, user) => user,
    }
}

/// Out-of-range or unparseable values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let text = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = text("RELAY_SERVER_URL") {
        settings.client.server_url = v;
    }
    if let Some(v) = bounded(&lookup, "RELAY_STALL_TIMEOUT_MS", 100..=600_000) {
        settings.sync.stall_timeout_ms = v;
    }
    if let Some(v) = bounded(&lookup, "RELAY_STREAM_STALE_AFTER_MS", 1_000..=3_600_000) {
        settings.sync.stream_stale_after_ms = v;
    }
    if let Some(v) = bounded(&lookup, "RELAY_RESYNC_MESSAGE_LIMIT", 1..=10_000) {
        settings.sync.resync_message_limit = v;
    }
    if let Some(raw) = lookup("RELAY_NOTIFICATIONS") {
        match parse_flag(&raw) {
            Some(v) => settings.sync.notifications_enabled = v,
            None => warn!(key = "RELAY_NOTIFICATIONS", value = %raw, "ignoring invalid flag"),
        }
    }
    if let Some(v) = text("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

fn bounded<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    range: RangeInclusive<T>,
) -> Option<T>
where
    T: FromStr + PartialOrd + Display,
{
    let raw = lookup(name)?;
    let value = raw.trim().parse::<T>().ok().filter(|v| range.contains(v));
    if value.is_none() {
        warn!(
            key = name,
            value = %raw,
            min = %range.start(),
            max = %range.end(),
            "ignoring out-of-range override"
        );
    }
    value
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn overlay_keeps_sibling_defaults() {
        let base = json!({"sync": {"stallTimeoutMs": 2000, "watchdogIntervalMs": 10000}});
        let user = json!({"sync": {"stallTimeoutMs": 4000, "watchdogIntervalMs": null}});
        let merged = overlay(base, user);
        assert_eq!(merged["sync"]["stallTimeoutMs"], 4000);
        assert_eq!(merged["sync"]["watchdogIntervalMs"], 10000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(
            settings.sync.stall_timeout_ms,
            RelaySettings::default().sync.stall_timeout_ms
        );
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"client": {"serverUrl": "https://box.local:4096"}, "sync": {"hiddenPauseGraceMs": 5000}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.client.server_url, "https://box.local:4096");
        assert_eq!(settings.sync.hidden_pause_grace_ms, 5000);
        assert_eq!(settings.sync.resync_min_interval_ms, 750);
    }

    #[test]
    fn invalid_json_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Malformed { .. })
        ));
    }

    #[test]
    fn non_http_server_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"client": {"serverUrl": "file:///etc/passwd"}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::ServerUrl(_))
        ));
    }

    #[test]
    fn env_overrides_apply_within_bounds() {
        let mut settings = RelaySettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("RELAY_SERVER_URL", "http://10.0.0.2:4096"),
                ("RELAY_STALL_TIMEOUT_MS", "4500"),
                ("RELAY_RESYNC_MESSAGE_LIMIT", "50"),
                ("RELAY_NOTIFICATIONS", "off"),
            ]),
        );
        assert_eq!(settings.client.server_url, "http://10.0.0.2:4096");
        assert_eq!(settings.sync.stall_timeout_ms, 4500);
        assert_eq!(settings.sync.resync_message_limit, 50);
        assert!(!settings.sync.notifications_enabled);
    }

    #[test]
    fn bad_env_values_keep_current_settings() {
        let defaults = RelaySettings::default();
        let mut settings = RelaySettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("RELAY_SERVER_URL", ""),
                ("RELAY_STALL_TIMEOUT_MS", "5"),
                ("RELAY_STREAM_STALE_AFTER_MS", "soon"),
                ("RELAY_NOTIFICATIONS", "maybe"),
            ]),
        );
        assert_eq!(settings.client.server_url, defaults.client.server_url);
        assert_eq!(settings.sync.stall_timeout_ms, defaults.sync.stall_timeout_ms);
        assert_eq!(
            settings.sync.stream_stale_after_ms,
            defaults.sync.stream_stale_after_ms
        );
        assert_eq!(
            settings.sync.notifications_enabled,
            defaults.sync.notifications_enabled
        );
    }
}
