//! Core error types for tessera.
//!
//! [`TesseraError`] covers every failure the template pipeline can surface.
//! Each variant belongs to one [`ErrorKind`], which tells callers how the
//! failure should be treated:
//!
//! - **Structural** errors (unbalanced tags, malformed expressions) are always
//!   fatal.
//! - **Resolution** errors (missing ancestor, circular inheritance, undefined
//!   macro, missing parameter, unknown filter) are fatal and carry the
//!   offending name.
//! - **Cache** errors are recovered by the cache layer itself and never reach
//!   a caller of the engine.
//! - **Limit** errors are deliberate circuit breakers (rate limit, recursion
//!   depth, oversize input).

use thiserror::Error;

/// Broad classification of a [`TesseraError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unbalanced tags or malformed syntax.
    Structural,
    /// A name (template, macro, filter) could not be resolved.
    Resolution,
    /// Cache I/O, locking or payload failure. Recovered locally.
    Cache,
    /// A configured limit was exceeded.
    Limit,
    /// The sandbox policy rejected the template.
    Security,
    /// Configuration, serialization or I/O failure outside the cache.
    Configuration,
}

/// The primary error type for tessera.
#[derive(Error, Debug)]
pub enum TesseraError {
    // ── Structural ───────────────────────────────────────────────────

    /// A tag or expression has invalid syntax.
    #[error("Template syntax error: {0}")]
    SyntaxError(String),

    /// A block tag was opened but never closed, or closed without being opened.
    #[error("Unbalanced structure: {0}")]
    UnbalancedStructure(String),

    /// Instruction generation produced an inconsistent program.
    #[error("Compile error: {0}")]
    CompileError(String),

    // ── Resolution ───────────────────────────────────────────────────

    /// The requested template (or an ancestor of it) could not be found.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// A template extends itself, directly or through its ancestors.
    #[error("Circular inheritance: {}", chain.join(" -> "))]
    CircularInheritance {
        /// Every template visited, ending with the repeated name.
        chain: Vec<String>,
    },

    /// A call site refers to a macro that was never defined or imported.
    #[error("Undefined macro: '{0}'")]
    UndefinedMacro(String),

    /// A macro parameter has neither an argument nor a default value.
    #[error("Missing required parameter '{parameter}' for macro '{macro_name}'")]
    MissingRequiredParameter {
        /// The macro being called.
        macro_name: String,
        /// The parameter with no value.
        parameter: String,
    },

    /// The template uses a construct this compiler refuses to handle.
    #[error("Unsupported construct: {0}")]
    Unsupported(String),

    /// A filter chain names a filter that is not registered.
    #[error("Unknown filter: '{0}'")]
    UnknownFilter(String),

    // ── Cache ────────────────────────────────────────────────────────

    /// A cache entry could not be read, locked or written.
    #[error("Cache error: {0}")]
    CacheError(String),

    // ── Limits ───────────────────────────────────────────────────────

    /// Too many compilations of the same template within the rate window.
    #[error("Compile rate limit exceeded for '{name}': {limit} compilations per {window_secs}s")]
    RateLimitExceeded {
        /// The template being compiled.
        name: String,
        /// Maximum compilations allowed in the window.
        limit: usize,
        /// Window length in seconds.
        window_secs: u64,
    },

    /// Rendering nested deeper than the configured maximum.
    #[error("Render recursion depth exceeded (limit {limit}) while rendering '{name}'")]
    RecursionLimitExceeded {
        /// The template that would have exceeded the limit.
        name: String,
        /// The configured maximum depth.
        limit: usize,
    },

    /// The template source is larger than the configured maximum.
    #[error("Template source is {size} bytes, limit is {limit} bytes")]
    InputTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        limit: usize,
    },

    // ── Security ─────────────────────────────────────────────────────

    /// The sandbox policy rejected the template source.
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    // ── Configuration ────────────────────────────────────────────────

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TesseraError {
    /// Returns the broad category of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SyntaxError(_) | Self::UnbalancedStructure(_) | Self::CompileError(_) => {
                ErrorKind::Structural
            }
            Self::TemplateNotFound(_)
            | Self::CircularInheritance { .. }
            | Self::UndefinedMacro(_)
            | Self::MissingRequiredParameter { .. }
            | Self::Unsupported(_)
            | Self::UnknownFilter(_) => ErrorKind::Resolution,
            Self::CacheError(_) => ErrorKind::Cache,
            Self::RateLimitExceeded { .. }
            | Self::RecursionLimitExceeded { .. }
            | Self::InputTooLarge { .. } => ErrorKind::Limit,
            Self::SecurityViolation(_) => ErrorKind::Security,
            Self::ConfigurationError(_) | Self::SerializationError(_) | Self::IoError(_) => {
                ErrorKind::Configuration
            }
        }
    }

    /// Returns `true` if this error is a deliberate circuit breaker rather
    /// than a template bug.
    pub const fn is_limit(&self) -> bool {
        matches!(self.kind(), ErrorKind::Limit)
    }
}

/// A convenience type alias for `Result<T, TesseraError>`.
pub type TesseraResult<T> = Result<T, TesseraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TesseraError::UnbalancedStructure("x".into()).kind(),
            ErrorKind::Structural
        );
        assert_eq!(TesseraError::SyntaxError("x".into()).kind(), ErrorKind::Structural);
        assert_eq!(TesseraError::CompileError("x".into()).kind(), ErrorKind::Structural);
        assert_eq!(
            TesseraError::TemplateNotFound("x".into()).kind(),
            ErrorKind::Resolution
        );
        assert_eq!(
            TesseraError::UndefinedMacro("x".into()).kind(),
            ErrorKind::Resolution
        );
        assert_eq!(TesseraError::UnknownFilter("x".into()).kind(), ErrorKind::Resolution);
        assert_eq!(TesseraError::CacheError("x".into()).kind(), ErrorKind::Cache);
        assert_eq!(
            TesseraError::InputTooLarge { size: 2, limit: 1 }.kind(),
            ErrorKind::Limit
        );
        assert_eq!(
            TesseraError::SecurityViolation("x".into()).kind(),
            ErrorKind::Security
        );
        assert_eq!(
            TesseraError::ConfigurationError("x".into()).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_circular_inheritance_names_full_chain() {
        let err = TesseraError::CircularInheritance {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Circular inheritance: a -> b -> a");
    }

    #[test]
    fn test_missing_parameter_display() {
        let err = TesseraError::MissingRequiredParameter {
            macro_name: "f".into(),
            parameter: "b".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing required parameter 'b' for macro 'f'"
        );
    }

    #[test]
    fn test_limit_errors_are_distinguishable() {
        let rate = TesseraError::RateLimitExceeded {
            name: "page".into(),
            limit: 3,
            window_secs: 10,
        };
        let depth = TesseraError::RecursionLimitExceeded {
            name: "page".into(),
            limit: 32,
        };
        assert!(rate.is_limit());
        assert!(depth.is_limit());
        assert!(!TesseraError::SyntaxError("x".into()).is_limit());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: TesseraError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("file missing"));
    }
}
