//! Semantic validation per directive kind
//!
//! Runs after reference resolution so rules can inspect declaring blocks.
//! Violations become diagnostics; the tree is never rejected.

use std::collections::HashSet;

use super::ast::{AttributeValue, Node, NodeKind, PRIMARY_ATTRIBUTE, TextPart};
use super::diagnostic::{Diagnostic, DiagnosticKind};
use super::directives::DirectiveTable;

/// Validate every block in the tree.
pub fn validate(blocks: &[Node], table: &DirectiveTable) -> Vec<Diagnostic> {
    let mut validator = Validator {
        table,
        set_ids: HashSet::new(),
        diagnostics: Vec::new(),
    };
    for node in blocks {
        validator.visit(node, None);
    }
    validator.diagnostics
}

struct Validator<'a> {
    table: &'a DirectiveTable,
    set_ids: HashSet<String>,
    diagnostics: Vec<Diagnostic>,
}

impl Validator<'_> {
    fn visit(&mut self, node: &Node, parent: Option<&Node>) {
        for value in node.attributes.values() {
            for function in value.function_names() {
                if !self.table.has_function(function) {
                    self.warn(
                        node,
                        DiagnosticKind::UnknownFunction,
                        format!("Unknown function '{}'", function),
                    );
                }
            }
        }

        if let NodeKind::Tag { name, .. } = &node.kind {
            self.check_directive(name, node, parent);
        }

        for child in &node.children {
            self.visit(child, Some(node));
        }
    }

    fn check_directive(&mut self, name: &str, node: &Node, parent: Option<&Node>) {
        let has = |key: &str| node.attributes.contains_key(key);
        match name {
            "loop" => {
                let count = has("count");
                let items = has("items");
                let condition = has(PRIMARY_ATTRIBUTE);
                if items && !has("as") {
                    self.error(node, "loop with 'items' requires an 'as' iterator name");
                }
                let modes = [count, items, condition].iter().filter(|m| **m).count();
                if modes == 0 {
                    self.error(node, "loop requires exactly one of 'count' or 'items'");
                } else if modes > 1 {
                    self.error(node, "loop accepts only one of 'count', 'items' or a condition");
                }
            }
            "if" => {
                if !has("condition") && !has(PRIMARY_ATTRIBUTE) {
                    self.error(node, "if requires a 'condition' attribute");
                }
            }
            "else" => {
                if !parent.is_some_and(|p| p.is_tag("if")) {
                    self.error(node, "else is only allowed inside an if block");
                }
            }
            "ai" => {
                if !has("model") {
                    self.error(node, "ai requires a 'model' attribute");
                }
                if node.literal_str("type") == Some("vision") {
                    let references_media = node.attribute("input").is_some_and(|value| {
                        let mut refs = Vec::new();
                        collect(value, &mut refs);
                        refs.iter().any(|(name, kind)| name == "media" || kind.as_deref() == Some("media"))
                    });
                    if !references_media {
                        self.error(node, "vision ai requires an 'input' referencing a media block");
                    }
                }
            }
            "input" => match node.literal_str("type") {
                None if !has("type") => self.error(node, "input requires a 'type' attribute"),
                Some("choice") if !has("options") => {
                    self.error(node, "choice input requires 'options'")
                }
                Some("slider") if !has("min") || !has("max") => {
                    self.error(node, "slider input requires 'min' and 'max'")
                }
                _ => {}
            },
            "media" => {
                for key in ["type", "src"] {
                    if !has(key) {
                        self.error(node, format!("media requires a '{}' attribute", key));
                    }
                }
            }
            "flow" => {
                for key in ["src", "inputs"] {
                    if !has(key) {
                        self.error(node, format!("flow requires a '{}' attribute", key));
                    }
                }
            }
            "set" => {
                if node.explicit_id && !self.set_ids.insert(node.id.clone()) {
                    self.diagnostics.push(
                        Diagnostic::error(
                            DiagnosticKind::DuplicateDeclaration,
                            format!("Duplicate set declaration for id '{}'", node.id),
                            node.span.clone(),
                        )
                        .on_node(node.id.clone()),
                    );
                }
            }
            "group" | "parallel" => {}
            other => match self.table.get(other) {
                Some(schema) => {
                    let missing: Vec<String> = schema
                        .attributes
                        .iter()
                        .filter(|(key, spec)| spec.required && !has(key.as_str()))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in missing {
                        self.error(node, format!("'{}' requires a '{}' attribute", other, key));
                    }
                }
                None => self.warn(
                    node,
                    DiagnosticKind::UnknownDirective,
                    format!("Unknown directive '{}'", other),
                ),
            },
        }
    }

    fn error(&mut self, node: &Node, message: impl Into<String>) {
        self.diagnostics.push(
            Diagnostic::error(DiagnosticKind::Validation, message, node.span.clone())
                .on_node(node.id.clone()),
        );
    }

    fn warn(&mut self, node: &Node, kind: DiagnosticKind, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::warning(kind, message, node.span.clone()).on_node(node.id.clone()));
    }
}

/// `(name, declaring kind)` of every reference inside `value`.
fn collect(value: &AttributeValue, out: &mut Vec<(String, Option<String>)>) {
    match value {
        AttributeValue::Variable(r) => out.push((r.name.clone(), r.declaring_block_kind.clone())),
        AttributeValue::Template(parts) => {
            for part in parts {
                if let TextPart::Variable(r) = part {
                    out.push((r.name.clone(), r.declaring_block_kind.clone()));
                }
            }
        }
        AttributeValue::List(items) => items.iter().for_each(|item| collect(item, out)),
        AttributeValue::Nested(map) => map.values().for_each(|item| collect(item, out)),
        AttributeValue::Function(call) => call.args.iter().for_each(|arg| collect(arg, out)),
        AttributeValue::Literal(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::frontmatter::Frontmatter;
    use crate::compiler::parser::build_tree;
    use crate::compiler::scope::resolve_references;
    use crate::compiler::tokenizer::tokenize;

    fn check(src: &str) -> Vec<Diagnostic> {
        let (tokens, mut diags) = tokenize(src, 0);
        let mut nodes = build_tree(src, tokens, &mut diags);
        resolve_references(&mut nodes, &Frontmatter::default());
        validate(&nodes, &DirectiveTable::builtin())
    }

    fn messages(diags: &[Diagnostic]) -> Vec<String> {
        diags.iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn test_loop_items_without_as() {
        let diags = check("{% loop items=[1] %}x{% /loop %}");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("'as'"));
    }

    #[test]
    fn test_loop_mixed_modes() {
        let diags = check("{% loop count=2 items=[1] as=\"i\" %}x{% /loop %}");
        assert_eq!(messages(&diags).len(), 1);
    }

    #[test]
    fn test_valid_loops() {
        assert!(check("{% loop count=2 %}x{% /loop %}").is_empty());
        assert!(check("{% loop items=[1] as=\"i\" %}x{% /loop %}").is_empty());
    }

    #[test]
    fn test_if_requires_condition() {
        assert_eq!(check("{% if %}x{% /if %}").len(), 1);
        assert!(check("{% if true %}x{% /if %}").is_empty());
    }

    #[test]
    fn test_else_outside_if() {
        let diags = check("{% group %}{% else /%}{% /group %}");
        assert!(diags[0].message.contains("else"));
    }

    #[test]
    fn test_vision_requires_media() {
        let bad = check("{% ai #a model=\"openai/gpt\" type=\"vision\" input=\"x\" /%}");
        assert_eq!(bad.len(), 1);
        let good = check(
            "{% media #pic type=\"image\" src=\"https://x/y.png\" /%}\n{% ai model=\"openai/gpt\" type=\"vision\" input=$pic /%}",
        );
        assert!(good.is_empty(), "{:?}", good);
    }

    #[test]
    fn test_input_rules() {
        assert_eq!(check("{% input #i /%}").len(), 1);
        assert_eq!(check("{% input #i type=\"choice\" /%}").len(), 1);
        assert_eq!(check("{% input #i type=\"slider\" min=1 /%}").len(), 1);
        assert!(check("{% input #i type=\"slider\" min=1 max=2 /%}").is_empty());
    }

    #[test]
    fn test_duplicate_set_id() {
        let diags = check("{% set #x a=1 /%}\n{% set #x b=2 /%}");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::DuplicateDeclaration);
    }

    #[test]
    fn test_unknown_directive_and_function_warn() {
        let diags = check("{% sparkle value=glitter(1) /%}");
        assert_eq!(diags.len(), 2);
        assert!(diags.iter().all(|d| d.level == crate::compiler::diagnostic::Level::Warning));
    }

    #[test]
    fn test_media_and_flow_required() {
        assert_eq!(check("{% media #m type=\"image\" /%}").len(), 1);
        assert_eq!(check("{% flow #f /%}").len(), 2);
    }
}
