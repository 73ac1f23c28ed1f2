//! # tessera
//!
//! A template compiler with a persistent artifact cache.
//!
//! This is the meta-crate that re-exports all sub-crates for convenient access.
//! You can depend on `tessera` to get the whole toolchain, or depend on the
//! individual crates for finer-grained control.
//!
//! ```
//! use tessera::template::context::{Context, ContextValue};
//! use tessera::template::engine::Engine;
//!
//! let engine = Engine::new();
//! engine.add_string_template("hello", "Hello {{ name|upper }}!");
//!
//! let mut ctx = Context::new();
//! ctx.set("name", ContextValue::from("world"));
//! assert_eq!(engine.render("hello", &ctx).unwrap(), "Hello WORLD!");
//! ```

/// Core types: errors, settings and logging.
pub use tessera_core as core;

/// Lexer, resolution passes, optimizer, compiler, runtime and cache.
pub use tessera_template as template;

pub use tessera_core::{Settings, TesseraError, TesseraResult};
pub use tessera_template::engine::Engine;

pub use serde_json;
pub use tracing;
