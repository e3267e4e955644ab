//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::LoomSettings;

/// `~/.loom`, falling back to `/tmp/.loom` when `HOME` is unset.
pub fn loom_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".loom")
}

/// Resolve the path to the settings file (`~/.loom/settings.json`).
pub fn settings_path() -> PathBuf {
    loom_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LoomSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<LoomSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<LoomSettings> {
    let defaults = serde_json::to_value(LoomSettings::default())?;

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
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LOOM_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value
/// stays in place.
pub fn apply_overrides<F>(settings: &mut LoomSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("LOOM_DB_PATH") {
        settings.store.db_path = PathBuf::from(v);
    }
    if let Some(v) = read("LOOM_TOKEN_TTL_SECS") {
        match parse_u64_range(&v, 1, 604_800) {
            Some(n) => settings.session.token_ttl_secs = n,
            None => warn!(key = "LOOM_TOKEN_TTL_SECS", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("LOOM_TOKEN_BYTES") {
        match parse_u64_range(&v, MIN_TOKEN_BYTES as u64, MAX_TOKEN_BYTES as u64) {
            Some(n) => settings.session.token_bytes = n as usize,
            None => warn!(key = "LOOM_TOKEN_BYTES", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("LOOM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("LOOM_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn!(key = "LOOM_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

const MIN_TOKEN_BYTES: usize = 16;
const MAX_TOKEN_BYTES: usize = 128;

fn validate(settings: &LoomSettings) -> Result<()> {
    if settings.session.token_ttl_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "session.tokenTtlSecs must be positive".into(),
        ));
    }
    if !(MIN_TOKEN_BYTES..=MAX_TOKEN_BYTES).contains(&settings.session.token_bytes) {
        return Err(SettingsError::InvalidValue(format!(
            "session.tokenBytes must be between {MIN_TOKEN_BYTES} and {MAX_TOKEN_BYTES}, got {}",
            settings.session.token_bytes
        )));
    }
    if settings.session.default_branch.trim().is_empty() {
        return Err(SettingsError::InvalidValue(
            "session.defaultBranch must not be empty".into(),
        ));
    }
    Ok(())
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
