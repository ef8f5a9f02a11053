//! Compile diagnostics

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Informational, never blocks execution.
    Warning,
    /// Callers usually refuse to execute when any are present.
    Error,
}

/// Category of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    /// Frontmatter YAML could not be parsed.
    Frontmatter,
    /// Malformed tag syntax.
    Syntax,
    /// Closing tag without a matching open tag.
    MismatchedTag,
    /// Open tag never closed before end of file.
    UnclosedTag,
    /// Reference to a name not yet declared.
    UndefinedVariable,
    /// Directive attribute rules violated.
    Validation,
    /// Directive name with no built-in or plugin handler.
    UnknownDirective,
    /// Function name with no built-in or plugin implementation.
    UnknownFunction,
    /// Same `set` id declared twice.
    DuplicateDeclaration,
}

/// One compile diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity.
    pub level: Level,
    /// Category.
    pub kind: DiagnosticKind,
    /// Human-readable message.
    pub message: String,
    /// Node the diagnostic is attached to, if any.
    pub node_id: Option<String>,
    /// Byte span in the source.
    pub span: Range<usize>,
}

impl Diagnostic {
    /// Error-level diagnostic.
    pub fn error(kind: DiagnosticKind, message: impl Into<String>, span: Range<usize>) -> Self {
        Self {
            level: Level::Error,
            kind,
            message: message.into(),
            node_id: None,
            span,
        }
    }

    /// Warning-level diagnostic.
    pub fn warning(kind: DiagnosticKind, message: impl Into<String>, span: Range<usize>) -> Self {
        Self {
            level: Level::Warning,
            kind,
            message: message.into(),
            node_id: None,
            span,
        }
    }

    /// Attach a node id.
    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// 1-based line and column of the span start within `source`.
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        let upto = &source[..self.span.start.min(source.len())];
        let line = upto.matches('\n').count() + 1;
        let col = upto.rsplit('\n').next().map(|l| l.chars().count()).unwrap_or(0) + 1;
        (line, col)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            Level::Warning => "warning",
            Level::Error => "error",
        };
        write!(f, "{}: {}", level, self.message)?;
        if let Some(id) = &self.node_id {
            write!(f, " (at {})", id)?;
        }
        Ok(())
    }
}

/// Accumulates diagnostics during a compile.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Record a diagnostic.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    /// Split into `(errors, warnings)`.
    pub fn partition(self) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
        self.items
            .into_iter()
            .partition(|d| d.level == Level::Error)
    }
}
