//! Render-time fragment caching.
//!
//! Stores raw rendered output of named components, keyed by the component
//! name and a hash of its parameters, with its own TTL. Independent of the
//! artifact cache: nothing here touches the filesystem.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tessera_core::error::{TesseraError, TesseraResult};

use super::sha256_hex;

struct Fragment {
    content: String,
    expires_at: Instant,
}

/// An in-memory cache of rendered components.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tessera_template::cache::FragmentCache;
///
/// let cache = FragmentCache::new(Duration::from_secs(60));
/// let key = FragmentCache::key("card", &serde_json::json!({"id": 1})).unwrap();
/// cache.set(&key, "<div>1</div>");
/// assert_eq!(cache.get(&key).as_deref(), Some("<div>1</div>"));
///
/// cache.invalidate_component("card");
/// assert!(cache.get(&key).is_none());
/// ```
pub struct FragmentCache {
    entries: RwLock<HashMap<String, Fragment>>,
    ttl: Duration,
}

impl FragmentCache {
    /// Creates an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// `name:sha256(json(params))`.
    ///
    /// Parameters must serialize deterministically; use ordered maps.
    pub fn key(name: &str, params: &impl Serialize) -> TesseraResult<String> {
        let json = serde_json::to_vec(params)
            .map_err(|e| TesseraError::SerializationError(e.to_string()))?;
        Ok(format!("{name}:{}", sha256_hex(&json)))
    }

    /// Returns the fragment for `key` unless missing or expired. An expired
    /// fragment is dropped.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                None => return None,
                Some(f) if now < f.expires_at => return Some(f.content.clone()),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|f| f.expires_at <= now) {
            entries.remove(key);
        }
        None
    }

    /// Stores `content` under `key` with the cache's TTL.
    pub fn set(&self, key: impl Into<String>, content: impl Into<String>) {
        self.set_with_ttl(key, content, self.ttl);
    }

    /// Stores `content` under `key` for `ttl`. Expired fragments are swept
    /// on every store.
    pub fn set_with_ttl(&self, key: impl Into<String>, content: impl Into<String>, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, f| now < f.expires_at);
        entries.insert(
            key.into(),
            Fragment {
                content: content.into(),
                expires_at: now + ttl,
            },
        );
    }

    /// Returns the cached fragment for `name` and `params`, rendering and
    /// storing it on a miss. Render errors are not cached.
    pub fn get_or_render(
        &self,
        name: &str,
        params: &impl Serialize,
        render: impl FnOnce() -> TesseraResult<String>,
    ) -> TesseraResult<String> {
        let key = Self::key(name, params)?;
        if let Some(hit) = self.get(&key) {
            tracing::debug!(component = name, "fragment cache hit");
            return Ok(hit);
        }
        let content = render()?;
        self.set(key, content.clone());
        Ok(content)
    }

    /// Removes the fragment stored under `key`.
    pub fn invalidate(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Removes every fragment of component `name`. Returns how many.
    ///
    /// The hash is the last `:`-separated segment of a key, so names may
    /// themselves contain `:`.
    pub fn invalidate_component(&self, name: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| component_of(key) != Some(name));
        before - entries.len()
    }

    /// Removes every fragment.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored fragments, expired ones included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn component_of(key: &str) -> Option<&str> {
    key.rsplit_once(':').map(|(name, _)| name)
}

impl std::fmt::Debug for FragmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
