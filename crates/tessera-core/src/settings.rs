//! Settings for the tessera compiler.
//!
//! [`Settings`] holds every tunable of the pipeline with sensible defaults:
//! template discovery and rendering limits, the persistent artifact cache,
//! the fragment cache and the compile rate limiter. Settings are plain values
//! passed to the engine that uses them; there is no process-wide instance.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Template discovery and rendering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSettings {
    /// Directories to search for template files.
    pub dirs: Vec<PathBuf>,
    /// Extensions tried, in order, when a template name has no match as-is.
    pub extensions: Vec<String>,
    /// Whether variable output is HTML-escaped by default.
    pub auto_escape: bool,
    /// Whether constant folding and dead-branch elimination run.
    pub optimize: bool,
    /// Maximum nesting depth of includes while rendering.
    pub max_render_depth: usize,
    /// Maximum template source size in bytes.
    pub max_template_bytes: usize,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            extensions: vec!["html".to_string(), "tpl".to_string()],
            auto_escape: true,
            optimize: true,
            max_render_depth: 32,
            max_template_bytes: 1024 * 1024,
        }
    }
}

/// Persistent artifact cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Whether parsed and compiled artifacts are cached on disk.
    pub enabled: bool,
    /// Directory holding one file per cache key plus the tag index.
    pub dir: PathBuf,
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Version tag mixed into every key; bump it to orphan old entries.
    pub version: String,
    /// How long to keep retrying a file lock before giving up, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Whether saves are handed to a background writer.
    pub background_writes: bool,
    /// Capacity of the background write queue.
    pub write_queue_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from(".tessera-cache"),
            ttl_secs: 3600,
            version: env!("CARGO_PKG_VERSION").to_string(),
            lock_timeout_ms: 3000,
            background_writes: false,
            write_queue_capacity: 64,
        }
    }
}

/// Render-time fragment cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentSettings {
    /// Fragment lifetime in seconds.
    pub ttl_secs: u64,
}

impl Default for FragmentSettings {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

/// Per-template compile rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Whether the limiter is active.
    pub enabled: bool,
    /// Compilations allowed per template within one window.
    pub max_compiles: usize,
    /// Sliding window length in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_compiles: 10,
            window_secs: 60,
        }
    }
}

/// The complete set of tessera settings.
///
/// # Examples
///
/// ```
/// use tessera_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert!(settings.templates.auto_escape);
/// assert_eq!(settings.templates.max_render_depth, 32);
/// assert!(!settings.cache.enabled);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Whether debug mode is enabled (pretty logs instead of JSON).
    pub debug: bool,
    /// The log level filter (e.g. "info", "tessera_template=debug").
    pub log_level: String,
    /// Template discovery and rendering.
    pub templates: TemplateSettings,
    /// Persistent artifact cache.
    pub cache: CacheSettings,
    /// Fragment cache.
    pub fragments: FragmentSettings,
    /// Compile rate limiter.
    pub rate_limit: RateLimitSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_string(),
            templates: TemplateSettings::default(),
            cache: CacheSettings::default(),
            fragments: FragmentSettings::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl Settings {
    /// Returns default settings with the given log level.
    pub fn with_log_level(level: impl Into<String>) -> Self {
        Self {
            log_level: level.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert!(!s.debug);
        assert_eq!(s.log_level, "info");
        assert!(s.templates.dirs.is_empty());
        assert_eq!(s.templates.extensions, vec!["html", "tpl"]);
        assert!(s.templates.optimize);
        assert_eq!(s.templates.max_template_bytes, 1024 * 1024);
    }

    #[test]
    fn test_default_cache() {
        let s = Settings::default();
        assert!(!s.cache.enabled);
        assert_eq!(s.cache.ttl_secs, 3600);
        assert_eq!(s.cache.lock_timeout_ms, 3000);
        assert_eq!(s.cache.dir, PathBuf::from(".tessera-cache"));
    }

    #[test]
    fn test_default_limits() {
        let s = Settings::default();
        assert!(!s.rate_limit.enabled);
        assert_eq!(s.rate_limit.max_compiles, 10);
        assert_eq!(s.fragments.ttl_secs, 300);
    }

    #[test]
    fn test_with_log_level() {
        let s = Settings::with_log_level("debug");
        assert_eq!(s.log_level, "debug");
        assert!(s.templates.auto_escape);
    }
}
