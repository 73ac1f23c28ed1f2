//! Persistent artifact cache.
//!
//! Parsed and compiled templates are stored one JSON file per key under the
//! cache directory. An entry is served only while all of the following hold:
//!
//! - it is younger than the TTL,
//! - the source file still has the modification time observed when it was
//!   read for compilation,
//! - so does every recorded dependency (parent or imported template).
//!
//! Keys are scoped: artifacts validated under one security policy are never
//! served to an engine running another.
//!
//! Anything else, including unreadable or foreign payloads and lock
//! timeouts, is logged and treated as a miss. Cache failures never reach
//! the caller.

pub mod fragment;
pub mod lock;
pub mod tagged;
pub mod writer;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_core::error::{TesseraError, TesseraResult};
use tessera_core::settings::CacheSettings;

use crate::compiler::CompiledTemplate;
use crate::parser::ParsedTemplate;

pub use fragment::FragmentCache;
pub use lock::LockOptions;
pub use tagged::TaggedCacheManager;
pub use writer::BackgroundWriter;

/// Name of the tag index side file inside the cache directory.
pub const TAG_INDEX_FILE: &str = "tags.index.json";

/// Which pipeline stage an artifact comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Parsed,
    Compiled,
}

impl ArtifactKind {
    /// The name mixed into cache keys.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Compiled => "compiled",
        }
    }
}

/// A cached payload. Files holding anything else fail to deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "artifact", rename_all = "snake_case")]
pub enum CachedArtifact {
    Parsed(ParsedTemplate),
    Compiled(CompiledTemplate),
}

impl CachedArtifact {
    /// Which stage produced the payload.
    pub const fn kind(&self) -> ArtifactKind {
        match self {
            Self::Parsed(_) => ArtifactKind::Parsed,
            Self::Compiled(_) => ArtifactKind::Compiled,
        }
    }
}

/// A source file and its modification time when it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub path: PathBuf,
    pub mtime: Option<DateTime<Utc>>,
}

impl SourceStamp {
    /// Records the current modification time of `path`. Take the stamp
    /// before reading the file, so a concurrent edit shows up as a change.
    pub fn observe(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mtime = modified_at(&path);
        Self { path, mtime }
    }

    /// `true` while the file exists with the observed modification time.
    pub fn is_current(&self) -> bool {
        self.mtime.is_some() && modified_at(&self.path) == self.mtime
    }
}

/// One cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub source: SourceStamp,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub dependencies: Vec<SourceStamp>,
    pub payload: CachedArtifact,
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

/// Fingerprint of a source path: the hash of its canonical form.
pub fn path_fingerprint(path: &Path) -> String {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    sha256_hex(canonical.to_string_lossy().as_bytes())
}

/// The modification time of `path`, if it exists.
pub fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Reads and writes cache entries.
#[derive(Debug, Clone)]
pub struct CacheManager {
    dir: PathBuf,
    ttl: Duration,
    version: String,
    scope: String,
    lock: LockOptions,
    writer: Option<Arc<BackgroundWriter>>,
}

impl CacheManager {
    /// A manager storing entries under `dir`, served for at most `ttl`.
    /// Changing `version` orphans every existing entry.
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, version: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            version: version.into(),
            scope: String::new(),
            lock: LockOptions::default(),
            writer: None,
        }
    }

    /// A manager configured from the `[cache]` settings, with a background
    /// writer when enabled.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        let lock = LockOptions::with_timeout(Duration::from_millis(settings.lock_timeout_ms));
        let mut manager = Self::new(
            &settings.dir,
            Duration::from_secs(settings.ttl_secs),
            &settings.version,
        )
        .with_lock_options(lock);
        if settings.background_writes {
            manager = manager.with_background_writer(Arc::new(BackgroundWriter::new(
                settings.write_queue_capacity,
                lock,
            )));
        }
        manager
    }

    /// Mixes `scope` into every key, so managers with different scopes
    /// never see each other's entries in a shared directory.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Replaces the lock retry behavior.
    #[must_use]
    pub const fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    /// Hands writes to `writer` instead of performing them inline.
    #[must_use]
    pub fn with_background_writer(mut self, writer: Arc<BackgroundWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The lock retry behavior used for entries and the tag index.
    pub const fn lock_options(&self) -> LockOptions {
        self.lock
    }

    /// The cache key of `source`'s artifact of the given kind.
    pub fn key_for(&self, source: &Path, kind: ArtifactKind) -> String {
        let material = format!(
            "{}|{}|{}|{}",
            self.version,
            self.scope,
            kind.tag(),
            path_fingerprint(source)
        );
        sha256_hex(material.as_bytes())
    }

    /// The file holding the entry for `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Returns the cached parse of `source`, if still valid.
    pub fn get_parsed(&self, source: &Path) -> Option<ParsedTemplate> {
        match self.lookup(source, ArtifactKind::Parsed)?.payload {
            CachedArtifact::Parsed(parsed) => Some(parsed),
            CachedArtifact::Compiled(_) => None,
        }
    }

    /// Returns the cached compilation of `source`, if still valid.
    pub fn get_compiled(&self, source: &Path) -> Option<CompiledTemplate> {
        self.get_compiled_stamped(source).map(|(compiled, _)| compiled)
    }

    /// Like [`Self::get_compiled`], also returning the stamps of the source
    /// and its dependencies that the entry was validated against.
    pub fn get_compiled_stamped(
        &self,
        source: &Path,
    ) -> Option<(CompiledTemplate, Vec<SourceStamp>)> {
        let entry = self.lookup(source, ArtifactKind::Compiled)?;
        match entry.payload {
            CachedArtifact::Compiled(compiled) => {
                let stamps = std::iter::once(entry.source)
                    .chain(entry.dependencies)
                    .collect();
                Some((compiled, stamps))
            }
            CachedArtifact::Parsed(_) => None,
        }
    }

    /// Stores a parse of `source`. Returns the key, or `None` if the write
    /// was abandoned.
    pub fn save_parsed(&self, source: &SourceStamp, parsed: &ParsedTemplate) -> Option<String> {
        self.save(source, CachedArtifact::Parsed(parsed.clone()), Vec::new())
    }

    /// Stores a compilation of `source` along with the stamps of the parents
    /// and imports it was built from.
    pub fn save_compiled(
        &self,
        source: &SourceStamp,
        compiled: &CompiledTemplate,
        dependencies: &[SourceStamp],
    ) -> Option<String> {
        self.save(
            source,
            CachedArtifact::Compiled(compiled.clone()),
            dependencies.to_vec(),
        )
    }

    /// Removes every artifact of `source`. Returns the number of files
    /// deleted.
    pub fn invalidate(&self, source: &Path) -> usize {
        [ArtifactKind::Parsed, ArtifactKind::Compiled]
            .into_iter()
            .filter(|&kind| self.remove_key(&self.key_for(source, kind)))
            .count()
    }

    /// Removes every entry file. The tag index is left for
    /// [`TaggedCacheManager`] to reconcile.
    pub fn clear(&self) -> usize {
        self.flush();
        let Ok(read_dir) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for path in read_dir.flatten().map(|e| e.path()) {
            let is_entry = path.extension().is_some_and(|e| e == "json")
                && path.file_name().is_some_and(|n| n != TAG_INDEX_FILE);
            if is_entry && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        tracing::debug!(dir = %self.dir.display(), removed, "cleared artifact cache");
        removed
    }

    /// Waits for queued background writes.
    pub fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.drain();
        }
    }

    pub(crate) fn remove_key(&self, key: &str) -> bool {
        std::fs::remove_file(self.entry_path(key)).is_ok()
    }

    pub(crate) fn key_exists(&self, key: &str) -> bool {
        self.entry_path(key).is_file()
    }

    fn lookup(&self, source: &Path, kind: ArtifactKind) -> Option<CacheEntry> {
        let key = self.key_for(source, kind);
        match self.load_entry(&key) {
            Ok(Some(entry)) if entry.payload.kind() != kind => {
                tracing::debug!(%key, "cache kind mismatch");
                None
            }
            Ok(Some(entry)) if self.is_valid(&entry) => {
                tracing::debug!(%key, source = %source.display(), kind = kind.tag(), "cache hit");
                Some(entry)
            }
            Ok(_) => {
                tracing::debug!(%key, source = %source.display(), kind = kind.tag(), "cache miss");
                None
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "unreadable cache entry treated as a miss");
                None
            }
        }
    }

    fn load_entry(&self, key: &str) -> TesseraResult<Option<CacheEntry>> {
        let path = self.entry_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = lock::read_locked(&path, self.lock)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let entry: CacheEntry = serde_json::from_str(&raw)
            .map_err(|e| TesseraError::CacheError(format!("corrupt entry {key}: {e}")))?;
        if entry.key != key {
            return Err(TesseraError::CacheError(format!(
                "entry {key} records foreign key {}",
                entry.key
            )));
        }
        Ok(Some(entry))
    }

    fn is_valid(&self, entry: &CacheEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.created_at);
        let fresh = age
            .to_std()
            .map_or(true, |age| age < self.ttl);
        fresh
            && entry.source.is_current()
            && entry.dependencies.iter().all(SourceStamp::is_current)
    }

    fn save(
        &self,
        source: &SourceStamp,
        payload: CachedArtifact,
        dependencies: Vec<SourceStamp>,
    ) -> Option<String> {
        let kind = payload.kind();
        let key = self.key_for(&source.path, kind);
        let entry = CacheEntry {
            key: key.clone(),
            source: source.clone(),
            created_at: DateTime::<Utc>::from(SystemTime::now()),
            dependencies,
            payload,
        };
        match self.write_entry(&entry) {
            Ok(()) => {
                tracing::debug!(%key, source = %source.path.display(), kind = kind.tag(), "cache store");
                Some(key)
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "cache write abandoned");
                None
            }
        }
    }

    fn write_entry(&self, entry: &CacheEntry) -> TesseraResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec(entry)
            .map_err(|e| TesseraError::SerializationError(e.to_string()))?;
        let path = self.entry_path(&entry.key);
        match &self.writer {
            Some(writer) => {
                writer.submit(path, json);
                Ok(())
            }
            None => lock::write_locked(&path, &json, self.lock),
        }
    }
}
