//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SwitchboardSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `SWITCHBOARD_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use switchboard_core::config::IsolationStrategy;

use crate::errors::{Result, SettingsError};
use crate::types::{switchboard_dir, SwitchboardSettings};

/// `~/.switchboard/settings.json`.
pub fn settings_path() -> PathBuf {
    switchboard_dir().join("settings.json")
}

/// Load settings from the default path with env overrides.
pub fn load_settings() -> Result<SwitchboardSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchboardSettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<SwitchboardSettings> {
    let defaults = serde_json::to_value(SwitchboardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SWITCHBOARD_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut SwitchboardSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("SWITCHBOARD_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => warn!(key = "SWITCHBOARD_PORT", value = %v, "invalid port, ignoring"),
        }
    }
    if let Some(v) = read("SWITCHBOARD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("SWITCHBOARD_ENGINE_URL") {
        settings.engine.url = v;
    }
    if let Some(v) = read("SWITCHBOARD_SUMMARIZER_URL") {
        settings.summarizer.url = Some(v);
    }
    if let Some(v) = read("SWITCHBOARD_ISOLATION") {
        match v.parse::<IsolationStrategy>() {
            Ok(strategy) => settings.orchestration.isolation = strategy,
            Err(e) => warn!(key = "SWITCHBOARD_ISOLATION", error = %e, "ignoring"),
        }
    }
    if let Some(v) = read("SWITCHBOARD_DB_PATH") {
        settings.storage.db_path = PathBuf::from(v);
    }
    if let Some(v) = read("SWITCHBOARD_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read("SWITCHBOARD_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.telemetry.json = b,
            None => warn!(key = "SWITCHBOARD_LOG_JSON", value = %v, "invalid boolean, ignoring"),
        }
    }
    if let Some(v) = read("SWITCHBOARD_DELEGATION_WINDOW_MS") {
        match parse_u64_range(&v, 100, 600_000) {
            Some(ms) => settings.orchestration.delegation_window_ms = ms,
            None => warn!(key = "SWITCHBOARD_DELEGATION_WINDOW_MS", value = %v, "out of range, ignoring"),
        }
    }
    if let Some(v) = read("SWITCHBOARD_RUN_TIMEOUT_SECS") {
        match parse_u64_range(&v, 1, 3600) {
            Some(secs) => settings.orchestration.run_timeout_secs = secs,
            None => warn!(key = "SWITCHBOARD_RUN_TIMEOUT_SECS", value = %v, "out of range, ignoring"),
        }
    }
}

/// Reject settings the service cannot run with.
pub fn validate(settings: &SwitchboardSettings) -> Result<()> {
    let o = &settings.orchestration;
    if o.delegation_window_ms == 0 {
        return Err(SettingsError::InvalidValue("orchestration.delegation_window_ms must be > 0".into()));
    }
    if o.run_timeout_secs == 0 {
        return Err(SettingsError::InvalidValue("orchestration.run_timeout_secs must be > 0".into()));
    }
    if o.retry_base_secs > o.retry_cap_secs {
        return Err(SettingsError::InvalidValue(format!(
            "orchestration.retry_base_secs ({}) exceeds retry_cap_secs ({})",
            o.retry_base_secs, o.retry_cap_secs
        )));
    }
    if o.tool_unavailable_threshold == 0 {
        return Err(SettingsError::InvalidValue(
            "orchestration.tool_unavailable_threshold must be > 0".into(),
        ));
    }
    if settings.engine.url.trim().is_empty() {
        return Err(SettingsError::InvalidValue("engine.url is empty".into()));
    }
    Ok(())
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
