//! Template loaders.
//!
//! A loader finds template source by name. The [`TemplateLoader`] trait is
//! the interface; [`FileSystemLoader`] and [`StringLoader`] are the built-in
//! implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tessera_core::error::{TesseraError, TesseraResult};

use crate::cache::{modified_at, SourceStamp};

/// Template text together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub name: String,
    pub content: String,
    /// The file the content was read from. `None` for in-memory templates,
    /// which are never written to the artifact cache.
    pub origin: Option<PathBuf>,
    /// Modification time of `origin`, taken before the content was read.
    pub modified: Option<DateTime<Utc>>,
}

impl TemplateSource {
    /// An in-memory source with no backing file.
    pub fn in_memory(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            origin: None,
            modified: None,
        }
    }

    /// The origin file with the modification time seen when it was read.
    pub fn stamp(&self) -> Option<SourceStamp> {
        self.origin.as_ref().map(|path| SourceStamp {
            path: path.clone(),
            mtime: self.modified,
        })
    }
}

/// Loads template source by name.
pub trait TemplateLoader: Send + Sync {
    /// Loads the template with the given name.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::TemplateNotFound`] if the template cannot be
    /// found. Loaders never return empty content for a missing template.
    fn load(&self, name: &str) -> TesseraResult<TemplateSource>;
}

/// Loads templates from one or more directories.
///
/// Each directory is searched in order for `name` itself, then for `name`
/// with each configured extension appended.
#[derive(Debug, Clone)]
pub struct FileSystemLoader {
    dirs: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl FileSystemLoader {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            extensions: Vec::new(),
        }
    }

    /// Adds extensions (without the dot) to try when `name` has no match.
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for dir in &self.dirs {
            paths.push(dir.join(name));
            for ext in &self.extensions {
                paths.push(dir.join(format!("{name}.{}", ext.trim_start_matches('.'))));
            }
        }
        paths
    }

    /// Returns the first existing file for `name`.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        if escapes_root(name) {
            return None;
        }
        self.candidates(name).into_iter().find(|p| p.is_file())
    }
}

/// Rejects absolute names and `..` segments.
fn escapes_root(name: &str) -> bool {
    let path = Path::new(name);
    path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

impl TemplateLoader for FileSystemLoader {
    fn load(&self, name: &str) -> TesseraResult<TemplateSource> {
        let Some(path) = self.find(name) else {
            tracing::debug!(template = name, dirs = ?self.dirs, "template not found on disk");
            return Err(TesseraError::TemplateNotFound(name.to_string()));
        };
        let origin = std::fs::canonicalize(&path).unwrap_or(path);
        let modified = modified_at(&origin);
        let content = std::fs::read_to_string(&origin)?;
        Ok(TemplateSource {
            name: name.to_string(),
            content,
            origin: Some(origin),
            modified,
        })
    }
}

/// Loads templates from an in-memory map of name to source.
#[derive(Debug, Default)]
pub struct StringLoader {
    templates: RwLock<HashMap<String, String>>,
}

impl StringLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(templates: HashMap<String, String>) -> Self {
        Self {
            templates: RwLock::new(templates),
        }
    }

    /// Adds or replaces a template.
    pub fn add(&self, name: impl Into<String>, source: impl Into<String>) {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), source.into());
    }
}

impl TemplateLoader for StringLoader {
    fn load(&self, name: &str) -> TesseraResult<TemplateSource> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|content| TemplateSource::in_memory(name, content.clone()))
            .ok_or_else(|| TesseraError::TemplateNotFound(name.to_string()))
    }
}

/// Tries each loader in order and returns the first hit.
#[derive(Default)]
pub struct ChainLoader {
    loaders: Vec<Box<dyn TemplateLoader>>,
}

impl ChainLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loader: Box<dyn TemplateLoader>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl std::fmt::Debug for ChainLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainLoader")
            .field("loaders", &self.loaders.len())
            .finish()
    }
}

impl TemplateLoader for ChainLoader {
    fn load(&self, name: &str) -> TesseraResult<TemplateSource> {
        for loader in &self.loaders {
            match loader.load(name) {
                Err(TesseraError::TemplateNotFound(_)) => continue,
                other => return other,
            }
        }
        Err(TesseraError::TemplateNotFound(name.to_string()))
    }
}
