//! Document compiler
//!
//! Turns directive-extended Markdown into a [`Document`]:
//!
//! 1. split off and parse the YAML frontmatter
//! 2. tokenize the body into Markdown chunks and directive tags
//! 3. fold tokens into a tree (Markdown through `pulldown-cmark`)
//! 4. resolve variable references against the scope tracker
//! 5. validate each directive's attributes
//!
//! Compilation never fails; every problem is reported as a [`Diagnostic`]
//! alongside a best-effort tree.

pub mod ast;
pub mod diagnostic;
pub mod directives;
pub mod frontmatter;
pub mod parser;
pub mod scope;
pub mod tokenizer;
pub mod validate;

pub use ast::{
    AttributeValue, Document, FunctionCall, InlineStyle, Literal, Node, NodeKind, PRIMARY_ATTRIBUTE,
    ReferenceSyntax, TextPart, VariableReference,
};
pub use diagnostic::{Diagnostic, DiagnosticKind, Level};
pub use directives::{AttributeSpec, DirectiveSchema, DirectiveTable};
pub use frontmatter::{Frontmatter, FrontmatterError, InputParameter, InputSchema};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of one compile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOutput {
    /// The compiled tree.
    pub document: Document,
    /// Copy of the document frontmatter.
    pub frontmatter: Frontmatter,
    /// Error-level diagnostics.
    pub errors: Vec<Diagnostic>,
    /// Warning-level diagnostics, including undefined variables.
    pub warnings: Vec<Diagnostic>,
}

impl CompileOutput {
    /// Whether any error-level diagnostic was produced.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Errors followed by warnings.
    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.errors.iter().chain(self.warnings.iter())
    }
}

/// Compile `content` against a directive table.
pub fn compile(content: &str, table: &DirectiveTable) -> CompileOutput {
    let mut diagnostics = diagnostic::Diagnostics::default();

    let (parsed, body_start) = frontmatter::split_frontmatter(content);
    let frontmatter = match parsed {
        None => Frontmatter::default(),
        Some(Ok(frontmatter)) => frontmatter,
        Some(Err(err)) => {
            diagnostics.push(Diagnostic::error(
                DiagnosticKind::Frontmatter,
                err.to_string(),
                0..body_start,
            ));
            Frontmatter::default()
        }
    };

    let (tokens, lex_diagnostics) = tokenizer::tokenize(content, body_start);
    let mut tree_diagnostics = lex_diagnostics;
    let mut blocks = parser::build_tree(content, tokens, &mut tree_diagnostics);
    for diagnostic in tree_diagnostics {
        diagnostics.push(diagnostic);
    }

    for warning in scope::resolve_references(&mut blocks, &frontmatter) {
        diagnostics.push(warning);
    }
    for diagnostic in validate::validate(&blocks, table) {
        diagnostics.push(diagnostic);
    }

    let (errors, warnings) = diagnostics.partition();
    debug!(
        blocks = blocks.len(),
        errors = errors.len(),
        warnings = warnings.len(),
        "compiled document"
    );

    CompileOutput {
        document: Document {
            frontmatter: frontmatter.clone(),
            blocks,
        },
        frontmatter,
        errors,
        warnings,
    }
}
