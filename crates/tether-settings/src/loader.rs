//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.tether/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tether_core::TransportKind;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ClientSettings;

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides, then validate.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged result
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let mut settings = read_layered(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_layered(path: &Path) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Values are range-checked. Invalid values are ignored with a warning and
/// leave the file/default value in place.
pub fn apply_overrides<F>(settings: &mut ClientSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("TETHER_ENDPOINT_URL") {
        settings.endpoint_url = v;
    }
    if let Some(v) = env.u64("TETHER_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64("TETHER_HEARTBEAT_INTERVAL_MS", 1000, 3_600_000) {
        settings.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("TETHER_HEARTBEAT_TIMEOUT_MS", 100, 600_000) {
        settings.heartbeat_timeout_ms = v;
    }
    if let Some(v) = env.u64("TETHER_POLL_INTERVAL_MS", 100, 3_600_000) {
        settings.poll_interval_ms = v;
    }
    if let Some(v) = env.u32("TETHER_MAX_ATTEMPTS", 0, 1000) {
        settings.reconnect.max_attempts = v;
    }
    if let Some(v) = env.u64("TETHER_BASE_DELAY_MS", 1, 600_000) {
        settings.reconnect.base_delay_ms = v;
    }
    if let Some(v) = env.u64("TETHER_MAX_DELAY_MS", 1, 3_600_000) {
        settings.reconnect.max_delay_ms = v;
    }
    if let Some(v) = env.transports("TETHER_TRANSPORTS") {
        settings.transports_order = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a comma-separated transport list such as `raw_socket,polling`.
///
/// Any unknown name, a duplicate, or an empty list rejects the whole value.
pub fn parse_transport_list(val: &str) -> Option<Vec<TransportKind>> {
    let mut kinds = Vec::new();
    for part in val.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let kind: TransportKind = part.parse().ok()?;
        if kinds.contains(&kind) {
            return None;
        }
        kinds.push(kind);
    }
    (!kinds.is_empty()).then_some(kinds)
}

// ── Variable readers ────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid u64 env var, ignoring");
        }
        result
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        let val = (self.lookup)(name)?;
        let result = parse_u32_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid u32 env var, ignoring");
        }
        result
    }

    fn transports(&self, name: &str) -> Option<Vec<TransportKind>> {
        let val = (self.lookup)(name)?;
        let result = parse_transport_list(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid transport list env var, ignoring");
        }
        result
    }
}
