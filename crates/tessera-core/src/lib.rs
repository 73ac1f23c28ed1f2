//! # tessera-core
//!
//! Core types, settings and error types for the tessera template compiler.
//! This crate has no dependency on the compiler itself and provides the
//! foundation the other crates build on.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy and result alias
//! - [`settings`] - Compiler, cache and limit configuration
//! - [`settings_loader`] - Loading settings from TOML, JSON and the environment
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{ErrorKind, TesseraError, TesseraResult};
pub use settings::Settings;
