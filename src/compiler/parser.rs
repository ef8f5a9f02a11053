//! Tree builder
//!
//! Folds the token stream into a node tree. Directive tags nest by a stack of
//! open containers; Markdown chunks between tags go through `pulldown-cmark`
//! and become paragraph, heading, inline, text and fence nodes.

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser as CmarkParser, Tag, TagEnd};
use std::collections::BTreeMap;
use std::ops::Range;

use super::ast::{AttributeValue, InlineStyle, Literal, Node, NodeKind, TextPart};
use super::diagnostic::{Diagnostic, DiagnosticKind};
use super::tokenizer::{self, TagToken, Token};

/// Directives that never take a body, whatever closing syntax is used.
const ALWAYS_SELF_CLOSING: &[&str] = &["else"];

/// Build the block tree for `src` from its tokens.
pub fn build_tree(src: &str, tokens: Vec<Token>, diagnostics: &mut Vec<Diagnostic>) -> Vec<Node> {
    let mut roots: Vec<Node> = Vec::new();
    let mut open: Vec<(TagToken, Vec<Node>)> = Vec::new();

    for token in tokens {
        match token {
            Token::Markdown(range) => {
                let nodes = markdown_nodes(src, range, diagnostics);
                match open.last_mut() {
                    Some((_, children)) => children.extend(nodes),
                    None => roots.extend(nodes),
                }
            }
            Token::Open(tag) => {
                if tag.self_closing || ALWAYS_SELF_CLOSING.contains(&tag.name.as_str()) {
                    let node = tag_node(tag, Vec::new(), None, diagnostics);
                    match open.last_mut() {
                        Some((_, children)) => children.push(node),
                        None => roots.push(node),
                    }
                } else {
                    open.push((tag, Vec::new()));
                }
            }
            Token::Close { name, span } => {
                let matches_top = open.last().is_some_and(|(tag, _)| tag.name == name);
                if !matches_top {
                    let expected = open
                        .last()
                        .map(|(tag, _)| format!(" (expected '{{% /{} %}}')", tag.name))
                        .unwrap_or_default();
                    diagnostics.push(Diagnostic::error(
                        DiagnosticKind::MismatchedTag,
                        format!("Closing tag '{}' has no matching open tag{}", name, expected),
                        span,
                    ));
                    continue;
                }
                if let Some((tag, children)) = open.pop() {
                    let node = tag_node(tag, children, Some(span.end), diagnostics);
                    match open.last_mut() {
                        Some((_, parent)) => parent.push(node),
                        None => roots.push(node),
                    }
                }
            }
        }
    }

    while let Some((tag, children)) = open.pop() {
        diagnostics.push(Diagnostic::error(
            DiagnosticKind::UnclosedTag,
            format!("Tag '{}' is never closed", tag.name),
            tag.span.clone(),
        ));
        let node = tag_node(tag, children, Some(src.len()), diagnostics);
        match open.last_mut() {
            Some((_, parent)) => parent.push(node),
            None => roots.push(node),
        }
    }

    roots
}

fn tag_node(
    tag: TagToken,
    children: Vec<Node>,
    end: Option<usize>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Node {
    let span = tag.span.start..end.unwrap_or(tag.span.end);
    let mut node = Node::new(
        NodeKind::Tag {
            name: tag.name,
            self_closing: tag.self_closing,
        },
        span,
    );
    node.attributes = tag.attributes;
    node.children = children;
    apply_explicit_id(&mut node, diagnostics);
    node
}

/// Move a literal `id` attribute onto the node; anything else is an error.
fn apply_explicit_id(node: &mut Node, diagnostics: &mut Vec<Diagnostic>) {
    match node.attributes.remove("id") {
        None => {}
        Some(AttributeValue::Literal(Literal::String(id))) if !id.is_empty() => {
            node.id = id;
            node.explicit_id = true;
        }
        Some(_) => diagnostics.push(
            Diagnostic::error(
                DiagnosticKind::Validation,
                format!("'{}' id must be a non-empty string literal", node.kind.label()),
                node.span.clone(),
            )
            .on_node(node.id.clone()),
        ),
    }
}

struct Open {
    kind: NodeKind,
    attributes: BTreeMap<String, AttributeValue>,
    span: Range<usize>,
    children: Vec<Node>,
}

struct CodeBuffer {
    language: Option<String>,
    attributes: BTreeMap<String, AttributeValue>,
    span: Range<usize>,
    content: String,
}

/// Convert one Markdown chunk into nodes with absolute spans.
fn markdown_nodes(src: &str, range: Range<usize>, diagnostics: &mut Vec<Diagnostic>) -> Vec<Node> {
    let base = range.start;
    let chunk = &src[range];
    if chunk.trim().is_empty() {
        return Vec::new();
    }

    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TABLES;
    let parser = CmarkParser::new_ext(chunk, options);

    let mut out: Vec<Node> = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let mut text: Option<(String, Range<usize>)> = None;
    let mut code: Option<CodeBuffer> = None;
    let mut skip_until: Option<usize> = None;

    for (event, local) in parser.into_offset_iter() {
        let span = base + local.start..base + local.end;

        if let Some(end) = skip_until {
            if local.start < end {
                continue;
            }
            skip_until = None;
        }

        if code.is_some() {
            match event {
                Event::Text(s) => {
                    if let Some(buffer) = code.as_mut() {
                        buffer.content.push_str(&s);
                    }
                }
                Event::End(TagEnd::CodeBlock) => {
                    if let Some(buffer) = code.take() {
                        let mut node = Node::new(
                            NodeKind::Fence {
                                language: buffer.language,
                                content: buffer.content,
                            },
                            buffer.span,
                        );
                        node.attributes = buffer.attributes;
                        apply_explicit_id(&mut node, diagnostics);
                        push_node(&mut stack, &mut out, node);
                    }
                }
                _ => {}
            }
            continue;
        }

        match event {
            Event::Text(s) => append_text(&mut text, &s, span),
            Event::SoftBreak | Event::HardBreak => append_text(&mut text, "\n", span),
            Event::Code(s) => {
                flush_text(&mut text, &mut stack, &mut out);
                let mut node = Node::new(
                    NodeKind::Inline {
                        style: InlineStyle::Code,
                    },
                    span.clone(),
                );
                node.children.push(Node::new(
                    NodeKind::text(vec![TextPart::Literal(s.to_string())]),
                    span,
                ));
                push_node(&mut stack, &mut out, node);
            }
            Event::Start(tag) => {
                flush_text(&mut text, &mut stack, &mut out);
                match tag {
                    Tag::Paragraph => stack.push(open_frame(NodeKind::Paragraph, span)),
                    Tag::Heading { level, .. } => stack.push(open_frame(
                        NodeKind::Heading {
                            level: heading_level(level),
                        },
                        span,
                    )),
                    Tag::Strong => stack.push(open_frame(inline(InlineStyle::Strong), span)),
                    Tag::Emphasis => stack.push(open_frame(inline(InlineStyle::Emphasis), span)),
                    Tag::Strikethrough => {
                        stack.push(open_frame(inline(InlineStyle::Strikethrough), span))
                    }
                    Tag::Link { dest_url, .. } => {
                        let mut frame = open_frame(inline(InlineStyle::Link), span);
                        frame
                            .attributes
                            .insert("href".to_string(), AttributeValue::string(dest_url.to_string()));
                        stack.push(frame);
                    }
                    Tag::CodeBlock(kind) => {
                        let (language, attributes) = match kind {
                            CodeBlockKind::Fenced(info) => fence_info(&info, &span, diagnostics),
                            CodeBlockKind::Indented => (None, BTreeMap::new()),
                        };
                        code = Some(CodeBuffer {
                            language,
                            attributes,
                            span,
                            content: String::new(),
                        });
                    }
                    _ => {
                        // Lists, quotes, tables, images: keep the raw source as text.
                        skip_until = Some(local.end);
                        let raw = &src[span.clone()];
                        push_node(
                            &mut stack,
                            &mut out,
                            Node::new(NodeKind::text(tokenizer::scan_references(raw)), span),
                        );
                    }
                }
            }
            Event::End(end) => {
                flush_text(&mut text, &mut stack, &mut out);
                let closes_frame = matches!(
                    end,
                    TagEnd::Paragraph
                        | TagEnd::Heading(_)
                        | TagEnd::Strong
                        | TagEnd::Emphasis
                        | TagEnd::Strikethrough
                        | TagEnd::Link
                );
                if closes_frame {
                    if let Some(frame) = stack.pop() {
                        let mut node = Node::new(frame.kind, frame.span);
                        node.attributes = frame.attributes;
                        node.children = frame.children;
                        push_node(&mut stack, &mut out, node);
                    }
                }
            }
            _ => {
                let raw = &src[span.clone()];
                append_text(&mut text, raw, span);
            }
        }
    }

    flush_text(&mut text, &mut stack, &mut out);
    while let Some(frame) = stack.pop() {
        let mut node = Node::new(frame.kind, frame.span);
        node.children = frame.children;
        push_node(&mut stack, &mut out, node);
    }
    out
}

fn open_frame(kind: NodeKind, span: Range<usize>) -> Open {
    Open {
        kind,
        attributes: BTreeMap::new(),
        span,
        children: Vec::new(),
    }
}

fn inline(style: InlineStyle) -> NodeKind {
    NodeKind::Inline { style }
}

fn push_node(stack: &mut [Open], out: &mut Vec<Node>, node: Node) {
    match stack.last_mut() {
        Some(frame) => frame.children.push(node),
        None => out.push(node),
    }
}

fn append_text(text: &mut Option<(String, Range<usize>)>, s: &str, span: Range<usize>) {
    match text {
        Some((buf, range)) => {
            buf.push_str(s);
            range.end = span.end;
        }
        None => *text = Some((s.to_string(), span)),
    }
}

fn flush_text(text: &mut Option<(String, Range<usize>)>, stack: &mut [Open], out: &mut Vec<Node>) {
    if let Some((buf, span)) = text.take() {
        let node = Node::new(NodeKind::text(tokenizer::scan_references(&buf)), span);
        push_node(stack, out, node);
    }
}

/// Split a fence info string into language and attributes.
///
/// Accepts `python`, `python id=calc` and `python {% #calc %}`.
fn fence_info(
    info: &str,
    span: &Range<usize>,
    diagnostics: &mut Vec<Diagnostic>,
) -> (Option<String>, BTreeMap<String, AttributeValue>) {
    let info = info.trim();
    let (first, rest) = match info.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (info, ""),
    };
    let (language, rest) = if first.starts_with('{') || first.contains('=') || first.starts_with('#') {
        (None, info)
    } else if first.is_empty() {
        (None, "")
    } else {
        (Some(first.to_string()), rest)
    };

    let rest = rest
        .strip_prefix("{%")
        .and_then(|r| r.strip_suffix("%}"))
        .unwrap_or(rest)
        .trim();
    if rest.is_empty() {
        return (language, BTreeMap::new());
    }
    match tokenizer::parse_attributes(rest) {
        Ok(attributes) => (language, attributes),
        Err(message) => {
            diagnostics.push(Diagnostic::error(
                DiagnosticKind::Syntax,
                format!("Invalid fence attributes: {}", message),
                span.clone(),
            ));
            (language, BTreeMap::new())
        }
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tokenizer::tokenize;

    fn build(src: &str) -> (Vec<Node>, Vec<Diagnostic>) {
        let (tokens, mut diags) = tokenize(src, 0);
        let nodes = build_tree(src, tokens, &mut diags);
        (nodes, diags)
    }

    #[test]
    fn test_markdown_paragraph_with_inline() {
        let (nodes, diags) = build("Hello **$name**\n");
        assert!(diags.is_empty());
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::Paragraph);
        let strong = &nodes[0].children[1];
        assert_eq!(
            strong.kind,
            NodeKind::Inline {
                style: InlineStyle::Strong
            }
        );
        assert_eq!(strong.children[0].references()[0].name, "name");
    }

    #[test]
    fn test_nested_tags() {
        let src = "{% loop count=2 #outer %}\n{% if $x %}\nyes\n{% else /%}\nno\n{% /if %}\n{% /loop %}\n";
        let (nodes, diags) = build(src);
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "outer");
        assert!(nodes[0].explicit_id);
        let if_node = &nodes[0].children[0];
        assert!(if_node.is_tag("if"));
        let kinds: Vec<&str> = if_node.children.iter().map(|n| n.kind.label()).collect();
        assert_eq!(kinds, vec!["paragraph", "else", "paragraph"]);
    }

    #[test]
    fn test_mismatched_close_is_ignored() {
        let (nodes, diags) = build("{% group %}\ntext\n{% /loop %}\n{% /group %}\n");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::MismatchedTag);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_tag("group"));
    }

    #[test]
    fn test_unclosed_tag_closes_at_eof() {
        let (nodes, diags) = build("{% group %}\ntext\n");
        assert_eq!(diags[0].kind, DiagnosticKind::UnclosedTag);
        assert_eq!(nodes[0].children.len(), 1);
    }

    #[test]
    fn test_fence_with_attributes() {
        let src = "```python {% #calc %}\nprint(1)\n```\n";
        let (nodes, diags) = build(src);
        assert!(diags.is_empty());
        assert_eq!(nodes[0].id, "calc");
        assert_eq!(
            nodes[0].kind,
            NodeKind::Fence {
                language: Some("python".into()),
                content: "print(1)\n".into()
            }
        );
    }

    #[test]
    fn test_list_kept_as_raw_text() {
        let (nodes, _) = build("- one $a\n- two\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind.label(), "text");
        assert_eq!(nodes[0].references()[0].name, "a");
    }

    #[test]
    fn test_non_literal_id_is_error() {
        let (_, diags) = build("{% set id=$x value=1 /%}");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::Validation);
    }
}
