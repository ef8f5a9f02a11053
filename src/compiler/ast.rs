//! Syntax tree produced by the document compiler
//!
//! Nodes carry a stable id, a closed attribute value type, and their children.
//! Attribute values stay symbolic (variables, function calls, templates) until
//! the interpreter resolves them against the current runtime variables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use uuid::Uuid;

use super::frontmatter::Frontmatter;

/// Key under which the first bare attribute value of a tag is stored.
pub const PRIMARY_ATTRIBUTE: &str = "primary";

/// A compiled document: frontmatter plus top-level blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Parsed metadata header.
    pub frontmatter: Frontmatter,
    /// Top-level nodes in source order.
    pub blocks: Vec<Node>,
}

impl Document {
    /// Depth-first iterator over every node in the document.
    pub fn walk(&self) -> impl Iterator<Item = &Node> {
        let mut pending: Vec<&Node> = self.blocks.iter().rev().collect();
        std::iter::from_fn(move || {
            let node = pending.pop()?;
            pending.extend(node.children.iter().rev());
            Some(node)
        })
    }

    /// Find a node by id.
    pub fn find(&self, id: &str) -> Option<&Node> {
        self.walk().find(|node| node.id == id)
    }
}

/// A single block in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Explicit (`id="..."` / `#id`) or generated identifier.
    pub id: String,
    /// Whether the id was written in the source.
    pub explicit_id: bool,
    /// Block kind.
    pub kind: NodeKind,
    /// Tag attributes (empty for plain Markdown nodes).
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Child nodes.
    pub children: Vec<Node>,
    /// Byte span in the source document.
    pub span: Range<usize>,
}

impl Node {
    /// Create a node with a generated id.
    pub fn new(kind: NodeKind, span: Range<usize>) -> Self {
        let id = generate_id(kind.label());
        Self {
            id,
            explicit_id: false,
            kind,
            attributes: BTreeMap::new(),
            children: Vec::new(),
            span,
        }
    }

    /// Directive name for tag nodes.
    pub fn tag_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Tag { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Whether this node is the directive `name`.
    pub fn is_tag(&self, name: &str) -> bool {
        self.tag_name() == Some(name)
    }

    /// Look up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Literal string value of an attribute, if it is one.
    pub fn literal_str(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(AttributeValue::Literal(Literal::String(s))) => Some(s),
            _ => None,
        }
    }

    /// Every variable reference held by this node (attributes and text).
    pub fn references(&self) -> Vec<&VariableReference> {
        let mut refs = Vec::new();
        for value in self.attributes.values() {
            value.collect_references(&mut refs);
        }
        if let NodeKind::Text { parts } = &self.kind {
            for part in parts {
                if let TextPart::Variable(reference) = part {
                    refs.push(reference);
                }
            }
        }
        refs
    }

    /// Mutable access to every variable reference held by this node.
    pub fn references_mut(&mut self) -> Vec<&mut VariableReference> {
        let mut refs = Vec::new();
        for value in self.attributes.values_mut() {
            value.collect_references_mut(&mut refs);
        }
        if let NodeKind::Text { parts } = &mut self.kind {
            for part in parts {
                if let TextPart::Variable(reference) = part {
                    refs.push(reference);
                }
            }
        }
        refs
    }
}

/// Generate a fresh node id for the given kind label.
///
/// Generated ids are random; two compiles of the same source differ here.
pub fn generate_id(label: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", label, &uuid[..8])
}

/// Kind of a tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    /// Markdown paragraph.
    Paragraph,
    /// Markdown heading with level 1-6.
    Heading {
        /// Heading level.
        level: u8,
    },
    /// Inline formatting span (strong, emphasis, link, code…).
    Inline {
        /// Formatting style.
        style: InlineStyle,
    },
    /// Literal text with embedded variable references.
    Text {
        /// Text segments.
        parts: Vec<TextPart>,
    },
    /// Fenced code block.
    Fence {
        /// Info-string language, if any.
        language: Option<String>,
        /// Raw code content.
        content: String,
    },
    /// Directive block.
    Tag {
        /// Directive name selecting the handler.
        name: String,
        /// Written as `{% name /%}`.
        self_closing: bool,
    },
}

impl NodeKind {
    /// Text kind holding the given parts.
    pub fn text(parts: Vec<TextPart>) -> Self {
        NodeKind::Text { parts }
    }

    /// Short label used for generated ids and rendered tags.
    pub fn label(&self) -> &str {
        match self {
            NodeKind::Paragraph => "paragraph",
            NodeKind::Heading { .. } => "heading",
            NodeKind::Inline { style } => style.label(),
            NodeKind::Text { .. } => "text",
            NodeKind::Fence { .. } => "fence",
            NodeKind::Tag { name, .. } => name,
        }
    }
}

/// Inline formatting styles preserved from Markdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InlineStyle {
    /// `**strong**`
    Strong,
    /// `*emphasis*`
    Emphasis,
    /// `~~strikethrough~~`
    Strikethrough,
    /// `` `code` ``
    Code,
    /// `[text](dest)`
    Link,
}

impl InlineStyle {
    /// Rendered tag label.
    pub fn label(&self) -> &'static str {
        match self {
            InlineStyle::Strong => "strong",
            InlineStyle::Emphasis => "em",
            InlineStyle::Strikethrough => "s",
            InlineStyle::Code => "code",
            InlineStyle::Link => "link",
        }
    }
}

/// One segment of a text node or template string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TextPart {
    /// Literal text.
    Literal(String),
    /// `$name` or `{{input.name}}` reference.
    Variable(VariableReference),
}

/// Literal attribute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Literal {
    /// Quoted string.
    String(String),
    /// Numeric literal.
    Number(f64),
    /// `true` / `false`.
    Bool(bool),
    /// `null`.
    Null,
}

/// Closed attribute value type, resolved at the point of use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttributeValue {
    /// Literal string, number, boolean, or null.
    Literal(Literal),
    /// `$path` reference.
    Variable(VariableReference),
    /// `name(args…)` call.
    Function(FunctionCall),
    /// String literal with embedded references.
    Template(Vec<TextPart>),
    /// `[a, b, …]`
    List(Vec<AttributeValue>),
    /// `{key: value, …}`
    Nested(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Shorthand for a literal string value.
    pub fn string(value: impl Into<String>) -> Self {
        AttributeValue::Literal(Literal::String(value.into()))
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a VariableReference>) {
        match self {
            AttributeValue::Literal(_) => {}
            AttributeValue::Variable(reference) => out.push(reference),
            AttributeValue::Function(call) => {
                for arg in &call.args {
                    arg.collect_references(out);
                }
            }
            AttributeValue::Template(parts) => {
                for part in parts {
                    if let TextPart::Variable(reference) = part {
                        out.push(reference);
                    }
                }
            }
            AttributeValue::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            AttributeValue::Nested(map) => {
                for value in map.values() {
                    value.collect_references(out);
                }
            }
        }
    }

    fn collect_references_mut<'a>(&'a mut self, out: &mut Vec<&'a mut VariableReference>) {
        match self {
            AttributeValue::Literal(_) => {}
            AttributeValue::Variable(reference) => out.push(reference),
            AttributeValue::Function(call) => {
                for arg in &mut call.args {
                    arg.collect_references_mut(out);
                }
            }
            AttributeValue::Template(parts) => {
                for part in parts {
                    if let TextPart::Variable(reference) = part {
                        out.push(reference);
                    }
                }
            }
            AttributeValue::List(items) => {
                for item in items {
                    item.collect_references_mut(out);
                }
            }
            AttributeValue::Nested(map) => {
                for value in map.values_mut() {
                    value.collect_references_mut(out);
                }
            }
        }
    }

    /// Names of every function called inside this value.
    pub fn function_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_function_names(&mut names);
        names
    }

    fn collect_function_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            AttributeValue::Function(call) => {
                out.push(&call.name);
                for arg in &call.args {
                    arg.collect_function_names(out);
                }
            }
            AttributeValue::List(items) => {
                for item in items {
                    item.collect_function_names(out);
                }
            }
            AttributeValue::Nested(map) => {
                for value in map.values() {
                    value.collect_function_names(out);
                }
            }
            _ => {}
        }
    }
}

/// Syntax a reference was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceSyntax {
    /// `$name.path`
    Dollar,
    /// `{{input.name}}`
    Template,
}

/// A variable reference with its best-known declaring block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableReference {
    /// Root variable name (a frame id).
    pub name: String,
    /// Property path below the root.
    pub path: Vec<String>,
    /// Source syntax.
    pub syntax: ReferenceSyntax,
    /// Id of the block that declared `name`, when seen before this reference.
    pub declaring_block_id: Option<String>,
    /// Kind of the declaring block.
    pub declaring_block_kind: Option<String>,
}

impl VariableReference {
    /// Unresolved `$name.path` reference.
    pub fn dollar(name: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            name: name.into(),
            path,
            syntax: ReferenceSyntax::Dollar,
            declaring_block_id: None,
            declaring_block_kind: None,
        }
    }

    /// Unresolved `{{input.name}}` reference.
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: "frontmatter".to_string(),
            path: vec!["input".to_string(), name.into()],
            syntax: ReferenceSyntax::Template,
            declaring_block_id: None,
            declaring_block_kind: None,
        }
    }

    /// Dotted display form (`name.a.b`).
    pub fn dotted(&self) -> String {
        let mut out = self.name.clone();
        for segment in &self.path {
            out.push('.');
            out.push_str(segment);
        }
        out
    }
}

/// Function call attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<AttributeValue>,
}

/// Replace generated ids (and references to them) by their kind label.
///
/// Two compiles of the same source compare equal after normalization.
pub fn normalize_generated_ids(nodes: &mut [Node]) {
    let mut generated = HashMap::new();
    collect_generated(nodes, &mut generated);
    rewrite_generated(nodes, &generated);
}

fn collect_generated(nodes: &[Node], out: &mut HashMap<String, String>) {
    for node in nodes {
        if !node.explicit_id {
            out.insert(node.id.clone(), node.kind.label().to_string());
        }
        collect_generated(&node.children, out);
    }
}

fn rewrite_generated(nodes: &mut [Node], generated: &HashMap<String, String>) {
    for node in nodes {
        if let Some(label) = generated.get(&node.id) {
            node.id = label.clone();
        }
        for reference in node.references_mut() {
            let renamed = reference
                .declaring_block_id
                .as_ref()
                .and_then(|id| generated.get(id))
                .cloned();
            if let Some(label) = renamed {
                reference.declaring_block_id = Some(label);
            }
        }
        rewrite_generated(&mut node.children, generated);
    }
}
