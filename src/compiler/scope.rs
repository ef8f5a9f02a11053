//! Variable scope tracking
//!
//! Declarations are recorded textually in file order: a block registers its
//! name when it is visited (pre-order), before its own attributes and its
//! descendants are resolved. Forward references stay unresolved and produce a
//! warning; frontmatter inputs may still satisfy them at run time.

use std::collections::HashMap;

use super::ast::{Node, NodeKind, ReferenceSyntax};
use super::diagnostic::{Diagnostic, DiagnosticKind};
use super::frontmatter::Frontmatter;

/// Id and kind of the block the frontmatter frame is published under.
pub const FRONTMATTER_FRAME: &str = "frontmatter";

/// Directives whose id never names a published frame.
const NON_PUBLISHING: &[&str] = &["group", "parallel", "else"];

/// Where a name was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Declaring block id.
    pub block_id: String,
    /// Declaring block kind (directive name, `fence`, or `frontmatter`).
    pub block_kind: String,
}

/// Map from variable name to its most recent declaration.
#[derive(Debug, Default)]
pub struct ScopeTracker {
    declared: HashMap<String, Declaration>,
}

impl ScopeTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` as declared by the given block. Later declarations win.
    pub fn declare(&mut self, name: impl Into<String>, block_id: &str, block_kind: &str) {
        self.declared.insert(
            name.into(),
            Declaration {
                block_id: block_id.to_string(),
                block_kind: block_kind.to_string(),
            },
        );
    }

    /// Look up a declared name.
    pub fn lookup(&self, name: &str) -> Option<&Declaration> {
        self.declared.get(name)
    }

    /// Whether `name` has been declared.
    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    fn declare_node(&mut self, node: &Node) {
        let kind = node.kind.label().to_string();
        match &node.kind {
            NodeKind::Tag { name, .. } if NON_PUBLISHING.contains(&name.as_str()) => {}
            NodeKind::Tag { name, .. } => {
                self.declare(node.id.clone(), &node.id, &kind);
                if name == "loop" {
                    if let Some(alias) = node.literal_str("as") {
                        self.declare(alias, &node.id, &kind);
                    }
                }
            }
            NodeKind::Fence { .. } => self.declare(node.id.clone(), &node.id, &kind),
            _ => {}
        }
    }
}

/// Resolve every reference in `blocks`, filling in declaring blocks.
///
/// Returns one undefined-variable warning per unresolved reference.
pub fn resolve_references(blocks: &mut [Node], frontmatter: &Frontmatter) -> Vec<Diagnostic> {
    let mut tracker = ScopeTracker::new();
    tracker.declare(FRONTMATTER_FRAME, FRONTMATTER_FRAME, FRONTMATTER_FRAME);
    let mut warnings = Vec::new();
    for node in blocks {
        resolve_node(node, &mut tracker, frontmatter, &mut warnings);
    }
    warnings
}

fn resolve_node(
    node: &mut Node,
    tracker: &mut ScopeTracker,
    frontmatter: &Frontmatter,
    warnings: &mut Vec<Diagnostic>,
) {
    tracker.declare_node(node);

    let node_id = node.id.clone();
    let span = node.span.clone();
    for reference in node.references_mut() {
        if reference.syntax == ReferenceSyntax::Template {
            let input = reference.path.get(1).cloned().unwrap_or_default();
            if !frontmatter.declares_input(&input) {
                warnings.push(
                    Diagnostic::warning(
                        DiagnosticKind::UndefinedVariable,
                        format!("Undefined variable: input '{}' is not declared in frontmatter", input),
                        span.clone(),
                    )
                    .on_node(node_id.clone()),
                );
            }
        }
        match tracker.lookup(&reference.name) {
            Some(declaration) => {
                reference.declaring_block_id = Some(declaration.block_id.clone());
                reference.declaring_block_kind = Some(declaration.block_kind.clone());
            }
            None => warnings.push(
                Diagnostic::warning(
                    DiagnosticKind::UndefinedVariable,
                    format!("Undefined variable: ${}", reference.dotted()),
                    span.clone(),
                )
                .on_node(node_id.clone()),
            ),
        }
    }

    for child in &mut node.children {
        resolve_node(child, tracker, frontmatter, warnings);
    }
}
