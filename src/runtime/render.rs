//! Renderable output nodes

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node of the output tree handed to an external renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderNode {
    /// Source block id.
    pub id: String,
    /// Output tag (`p`, `h2`, `text`, `loop`, `ai`, …).
    pub tag: String,
    /// Tag-specific values (loop index, published result, …).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    /// Leaf text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Nested output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RenderNode>,
}

impl RenderNode {
    /// Empty node with the given id and tag.
    pub fn new(id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tag: tag.into(),
            attributes: Map::new(),
            content: None,
            children: Vec::new(),
        }
    }

    /// Leaf text node.
    pub fn text(id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut node = Self::new(id, "text");
        node.content = Some(content.into());
        node
    }

    /// Builder: set children.
    pub fn with_children(mut self, children: Vec<RenderNode>) -> Self {
        self.children = children;
        self
    }

    /// Builder: set one attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Builder: replace all attributes.
    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Concatenated text content of this subtree, depth first.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(content) = &self.content {
            out.push_str(content);
        }
        for child in &self.children {
            child.collect_text(out);
        }
    }

    /// Every node in this subtree with tag `tag`, depth first.
    pub fn find_all<'a>(&'a self, tag: &str) -> Vec<&'a RenderNode> {
        let mut found = Vec::new();
        self.collect_tag(tag, &mut found);
        found
    }

    fn collect_tag<'a>(&'a self, tag: &str, out: &mut Vec<&'a RenderNode>) {
        if self.tag == tag {
            out.push(self);
        }
        for child in &self.children {
            child.collect_tag(tag, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_content_and_find() {
        let node = RenderNode::new("p1", "p").with_children(vec![
            RenderNode::text("t1", "Hello "),
            RenderNode::new("s1", "strong").with_children(vec![RenderNode::text("t2", "world")]),
        ]);
        assert_eq!(node.text_content(), "Hello world");
        assert_eq!(node.find_all("text").len(), 2);
    }
}
