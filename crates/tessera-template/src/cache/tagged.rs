//! Tag-based invalidation on top of [`CacheManager`].
//!
//! The index maps each tag to the set of cache keys saved under it and lives
//! in a single side file, `tags.index.json`, rewritten under an exclusive
//! lock. Entry files can disappear independently of the index (TTL cleanup,
//! [`CacheManager::clear`]); [`TaggedCacheManager::clean_tag_index`]
//! reconciles the two.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tessera_core::error::{TesseraError, TesseraResult};

use super::lock::LockedFile;
use super::{CacheManager, SourceStamp, TAG_INDEX_FILE};
use crate::compiler::CompiledTemplate;
use crate::parser::ParsedTemplate;

type TagIndex = BTreeMap<String, BTreeSet<String>>;

/// A [`CacheManager`] with a tag index.
#[derive(Debug, Clone)]
pub struct TaggedCacheManager {
    inner: CacheManager,
}

impl TaggedCacheManager {
    /// Wraps `inner`. The index lives in the same directory.
    pub const fn new(inner: CacheManager) -> Self {
        Self { inner }
    }

    /// Unwraps the underlying manager.
    pub fn into_inner(self) -> CacheManager {
        self.inner
    }

    /// The underlying manager, for untagged reads and writes.
    pub const fn inner(&self) -> &CacheManager {
        &self.inner
    }

    /// Location of the tag index side file.
    pub fn index_path(&self) -> PathBuf {
        self.inner.dir().join(TAG_INDEX_FILE)
    }

    /// Saves a parse and records its key under each tag.
    pub fn save_parsed_tagged(
        &self,
        source: &SourceStamp,
        parsed: &ParsedTemplate,
        tags: &[&str],
    ) -> Option<String> {
        let key = self.inner.save_parsed(source, parsed)?;
        self.tag_key(&key, tags);
        Some(key)
    }

    /// Saves a compilation and records its key under each tag.
    pub fn save_compiled_tagged(
        &self,
        source: &SourceStamp,
        compiled: &CompiledTemplate,
        dependencies: &[SourceStamp],
        tags: &[&str],
    ) -> Option<String> {
        let key = self.inner.save_compiled(source, compiled, dependencies)?;
        self.tag_key(&key, tags);
        Some(key)
    }

    /// Deletes every entry saved under `tag` and drops the tag. Returns the
    /// number of entry files removed.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        self.inner.flush();
        let mut removed = 0;
        let result = self.update_index(|index| {
            if let Some(keys) = index.remove(tag) {
                removed = keys.iter().filter(|k| self.inner.remove_key(k)).count();
            }
        });
        if let Err(e) = result {
            tracing::warn!(tag, error = %e, "tag invalidation skipped");
        }
        tracing::debug!(tag, removed, "invalidated tag");
        removed
    }

    /// Removes keys whose entry file no longer exists, then empty tags.
    /// Returns the number of keys dropped.
    pub fn clean_tag_index(&self) -> usize {
        self.inner.flush();
        let mut dropped = 0;
        let result = self.update_index(|index| {
            for keys in index.values_mut() {
                let before = keys.len();
                keys.retain(|k| self.inner.key_exists(k));
                dropped += before - keys.len();
            }
            index.retain(|_, keys| !keys.is_empty());
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "tag index cleanup skipped");
        }
        dropped
    }

    /// Tags recorded for `key`, sorted.
    pub fn tags_for(&self, key: &str) -> Vec<String> {
        self.read_index()
            .into_iter()
            .filter(|(_, keys)| keys.contains(key))
            .map(|(tag, _)| tag)
            .collect()
    }

    /// Removes every entry and empties the index.
    pub fn clear(&self) -> usize {
        let removed = self.inner.clear();
        if let Err(e) = self.update_index(BTreeMap::clear) {
            tracing::warn!(error = %e, "tag index reset skipped");
        }
        removed
    }

    fn tag_key(&self, key: &str, tags: &[&str]) {
        if tags.is_empty() {
            return;
        }
        let result = self.update_index(|index| {
            for tag in tags {
                index
                    .entry((*tag).to_string())
                    .or_default()
                    .insert(key.to_string());
            }
        });
        if let Err(e) = result {
            tracing::warn!(key, error = %e, "tag index update skipped");
        }
    }

    fn read_index(&self) -> TagIndex {
        let path = self.index_path();
        if !path.is_file() {
            return TagIndex::new();
        }
        match super::lock::read_locked(&path, self.inner.lock_options()) {
            Ok(raw) => parse_index(&raw),
            Err(e) => {
                tracing::warn!(error = %e, "tag index unreadable");
                TagIndex::new()
            }
        }
    }

    fn update_index(&self, mutate: impl FnOnce(&mut TagIndex)) -> TesseraResult<()> {
        std::fs::create_dir_all(self.inner.dir())?;
        let mut file = LockedFile::open_exclusive(&self.index_path(), self.inner.lock_options())?;
        let mut index = parse_index(&file.read_to_string()?);
        mutate(&mut index);
        let json = serde_json::to_vec_pretty(&index)
            .map_err(|e| TesseraError::SerializationError(e.to_string()))?;
        file.replace(&json)
    }
}

fn parse_index(raw: &str) -> TagIndex {
    if raw.trim().is_empty() {
        return TagIndex::new();
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "corrupt tag index discarded");
        TagIndex::new()
    })
}
