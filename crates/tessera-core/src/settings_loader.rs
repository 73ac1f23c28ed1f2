//! Settings loading from configuration files.
//!
//! This module loads [`Settings`] from TOML and JSON files and applies
//! environment variable overrides.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML or JSON file (overriding defaults, key by key).
//! 3. Apply environment variable overrides (highest priority).
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `TESSERA_DEBUG` | `debug` |
//! | `TESSERA_LOG_LEVEL` | `log_level` |
//! | `TESSERA_TEMPLATE_DIRS` | `templates.dirs` (comma-separated) |
//! | `TESSERA_AUTO_ESCAPE` | `templates.auto_escape` |
//! | `TESSERA_OPTIMIZE` | `templates.optimize` |
//! | `TESSERA_MAX_RENDER_DEPTH` | `templates.max_render_depth` |
//! | `TESSERA_CACHE_ENABLED` | `cache.enabled` |
//! | `TESSERA_CACHE_DIR` | `cache.dir` |
//! | `TESSERA_CACHE_TTL` | `cache.ttl_secs` |
//!
//! ## Examples
//!
//! ```rust,no_run
//! use tessera_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file("tessera.toml").unwrap();
//! let settings = settings_loader::from_json_file_with_env("tessera.json").unwrap();
//! ```

use std::path::{Path, PathBuf};

use crate::error::TesseraError;
use crate::settings::Settings;

/// Loads settings from a TOML string.
///
/// Keys absent from the TOML keep their default values, including keys of
/// nested tables such as `[cache]`.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or cannot be deserialized.
pub fn from_toml_str(toml_str: &str) -> Result<Settings, TesseraError> {
    // Deserialize into a generic value first so a partial table merges over
    // the defaults instead of requiring every field.
    let toml_value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| TesseraError::ConfigurationError(format!("Failed to parse TOML: {e}")))?;

    merge_over_defaults(toml_to_json(toml_value), "TOML")
}

/// Loads settings from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Settings, TesseraError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        TesseraError::ConfigurationError(format!(
            "Failed to read TOML file '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    from_toml_str(&content)
}

/// Loads settings from a TOML file and then applies environment variable overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> Result<Settings, TesseraError> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from a JSON string.
///
/// # Errors
///
/// Returns an error if the JSON is malformed or cannot be deserialized.
pub fn from_json_str(json_str: &str) -> Result<Settings, TesseraError> {
    let json_value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| TesseraError::ConfigurationError(format!("Failed to parse JSON: {e}")))?;

    merge_over_defaults(json_value, "JSON")
}

/// Loads settings from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the JSON is malformed.
pub fn from_json_file(path: impl AsRef<Path>) -> Result<Settings, TesseraError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        TesseraError::ConfigurationError(format!(
            "Failed to read JSON file '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    from_json_str(&content)
}

/// Loads settings from a JSON file and then applies environment variable overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the JSON is malformed.
pub fn from_json_file_with_env(path: impl AsRef<Path>) -> Result<Settings, TesseraError> {
    let mut settings = from_json_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from just environment variables (starting from defaults).
pub fn from_env() -> Settings {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings);
    settings
}

/// Applies `TESSERA_*` environment variable overrides to a settings struct.
///
/// Boolean variables accept "true", "1" and "yes" (case-insensitive); any
/// other value means false. Numeric variables that fail to parse are ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(val) = std::env::var("TESSERA_DEBUG") {
        settings.debug = parse_bool(&val);
    }

    if let Ok(val) = std::env::var("TESSERA_LOG_LEVEL") {
        settings.log_level = val;
    }

    if let Ok(val) = std::env::var("TESSERA_TEMPLATE_DIRS") {
        settings.templates.dirs = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
    }

    if let Ok(val) = std::env::var("TESSERA_AUTO_ESCAPE") {
        settings.templates.auto_escape = parse_bool(&val);
    }

    if let Ok(val) = std::env::var("TESSERA_OPTIMIZE") {
        settings.templates.optimize = parse_bool(&val);
    }

    if let Ok(val) = std::env::var("TESSERA_MAX_RENDER_DEPTH") {
        if let Ok(depth) = val.parse::<usize>() {
            settings.templates.max_render_depth = depth;
        }
    }

    if let Ok(val) = std::env::var("TESSERA_CACHE_ENABLED") {
        settings.cache.enabled = parse_bool(&val);
    }

    if let Ok(val) = std::env::var("TESSERA_CACHE_DIR") {
        settings.cache.dir = PathBuf::from(val);
    }

    if let Ok(val) = std::env::var("TESSERA_CACHE_TTL") {
        if let Ok(ttl) = val.parse::<u64>() {
            settings.cache.ttl_secs = ttl;
        }
    }
}

// ============================================================
// Helpers
// ============================================================

fn parse_bool(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn merge_over_defaults(value: serde_json::Value, format: &str) -> Result<Settings, TesseraError> {
    let default_json = serde_json::to_value(Settings::default()).map_err(|e| {
        TesseraError::ConfigurationError(format!("Failed to serialize default settings: {e}"))
    })?;

    let merged = merge_json(default_json, value);
    serde_json::from_value(merged).map_err(|e| {
        TesseraError::ConfigurationError(format!("Failed to deserialize settings from {format}: {e}"))
    })
}

/// Converts a TOML value to a `serde_json::Value`.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => {
            let map: serde_json::Map<String, serde_json::Value> = table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
    }
}

/// Deep-merges two JSON values. The `override_val` takes precedence.
fn merge_json(base: serde_json::Value, override_val: serde_json::Value) -> serde_json::Value {
    match (base, override_val) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, override_v) in override_map {
                let merged = if let Some(base_v) = base_map.remove(&key) {
                    merge_json(base_v, override_v)
                } else {
                    override_v
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}
