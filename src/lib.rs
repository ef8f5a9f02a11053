//! mdflow – directive-extended Markdown compiled into a streaming, cancellable program
//!
//! This crate provides:
//! - A compiler from Markdown with `{% tag %}` directives and `$variable`
//!   references to a typed node tree with diagnostics
//! - An interpreter that walks the tree as a lazy stream of render nodes
//! - Built-in directives for completions, loops, conditionals, user input,
//!   media, nested flows and parallel fan-out
//! - A scoped variable stack with a hash-chained, verifiable history
//! - Plugins, adapters and cooperative abort and timeout handling

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Markdown and directive compiler
pub mod compiler;

/// Interpreter, state and extension points
pub mod runtime;

// Re-export key types for convenience
pub use compiler::{CompileOutput, Document, compile};
pub use runtime::{Execution, ExecuteOptions, RenderNode, Runtime, RuntimeConfig, RuntimeError};

/// Current version of the mdflow runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
