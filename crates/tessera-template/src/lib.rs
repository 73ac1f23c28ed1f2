//! # tessera-template
//!
//! The tessera template compiler. Source text goes through a fixed pipeline
//! and comes out as a flat, serializable instruction list that renders
//! against any [`context::Context`]:
//!
//! lexer → parser → inheritance → macros → optimizer → compiler
//!
//! Parsed and compiled artifacts are cached on disk keyed by source path,
//! and rendered components can be cached in memory.
//!
//! ## Modules
//!
//! - [`lexer`] - Comment stripping, whitespace control and tokenizing
//! - [`ast`] - Arena syntax tree
//! - [`parser`] - Tokens to tree with tag matching
//! - [`expr`] - The expression language: parsing and evaluation
//! - [`inheritance`] - `extends`, block overrides and `parent()`
//! - [`macros`] - Macro collection, imports and call expansion
//! - [`optimizer`] - Constant folding and dead-branch elimination
//! - [`compiler`] - Instruction generation and execution
//! - [`helpers`] - Runtime hooks used by compiled templates
//! - [`filters`] - Built-in filters
//! - [`context`] - Values and variable scopes
//! - [`loaders`] - Finding template source by name
//! - [`sandbox`] - Source validation before parsing
//! - [`limits`] - Compile rate limiting
//! - [`cache`] - Artifact, tag and fragment caches
//! - [`engine`] - The façade tying it all together

pub mod ast;
pub mod cache;
pub mod compiler;
pub mod context;
pub mod engine;
pub mod expr;
pub mod filters;
pub mod helpers;
pub mod inheritance;
pub mod lexer;
pub mod limits;
pub mod loaders;
pub mod macros;
pub mod optimizer;
pub mod parser;
pub mod sandbox;

pub use compiler::CompiledTemplate;
pub use context::{Context, ContextValue};
pub use engine::Engine;
pub use parser::ParsedTemplate;
