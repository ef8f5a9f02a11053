//! Directive tokenizer
//!
//! Splits document text into Markdown chunks and `{% … %}` directive tags.
//! Fenced and indented code blocks and inline code spans stay inside
//! Markdown chunks untouched, so `{%` inside code never opens a tag. Attribute values are lexed into [`AttributeValue`]s
//! here; references inside string literals become templates.

use regex::Regex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::OnceLock;

use super::ast::{
    AttributeValue, FunctionCall, Literal, PRIMARY_ATTRIBUTE, TextPart, VariableReference,
};
use super::diagnostic::{Diagnostic, DiagnosticKind};

/// A lexed piece of the document body.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Plain Markdown between tags (may contain fences).
    Markdown(Range<usize>),
    /// Opening or self-closing tag.
    Open(TagToken),
    /// `{% /name %}`
    Close {
        /// Directive name being closed.
        name: String,
        /// Byte span of the tag.
        span: Range<usize>,
    },
}

/// An opening or self-closing directive tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TagToken {
    /// Directive name.
    pub name: String,
    /// Parsed attributes, with the bare value under [`PRIMARY_ATTRIBUTE`].
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Written as `{% name … /%}`.
    pub self_closing: bool,
    /// Byte span of the tag.
    pub span: Range<usize>,
}

/// Tokenize `src` starting at byte offset `start`.
///
/// Malformed tags produce a syntax diagnostic and are left in the Markdown.
pub fn tokenize(src: &str, start: usize) -> (Vec<Token>, Vec<Diagnostic>) {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();
    let mut chunk_start = start;
    let mut index = start;
    let mut at_line_start = start == 0 || bytes.get(start.wrapping_sub(1)) == Some(&b'\n');
    // Indented code needs a blank line (or the start) before it.
    let mut after_blank = true;
    let mut in_indented = false;

    while index < bytes.len() {
        if at_line_start {
            if let Some(end) = fence_end(bytes, index) {
                index = end;
                after_blank = true;
                in_indented = false;
                continue;
            }
            let line_end = next_line(bytes, index);
            let line = &bytes[index..line_end];
            if line.iter().all(u8::is_ascii_whitespace) {
                after_blank = true;
            } else if (after_blank || in_indented) && is_indented_code(line) {
                in_indented = true;
                after_blank = false;
                index = line_end;
                continue;
            } else {
                after_blank = false;
                in_indented = false;
            }
        }

        if bytes[index] == b'\\' && bytes.get(index + 1) == Some(&b'`') {
            index += 2;
            at_line_start = false;
            continue;
        }
        if bytes[index] == b'`' {
            let run = backtick_run(bytes, index);
            index = code_span_end(bytes, index, run).unwrap_or(index + run);
            at_line_start = false;
            continue;
        }

        if bytes[index..].starts_with(b"{%") {
            let mut lexer = Lexer::new(src, index);
            match lexer.tag() {
                Ok(token) => {
                    if chunk_start < index {
                        tokens.push(Token::Markdown(chunk_start..index));
                    }
                    tokens.push(token);
                    index = lexer.index;
                    chunk_start = index;
                    at_line_start = bytes.get(index.wrapping_sub(1)) == Some(&b'\n');
                }
                Err(message) => {
                    let end = lexer.index.max(index + 2).min(bytes.len());
                    diagnostics.push(Diagnostic::error(DiagnosticKind::Syntax, message, index..end));
                    index += 2;
                    at_line_start = false;
                }
            }
            continue;
        }

        at_line_start = bytes[index] == b'\n';
        index += 1;
    }

    if chunk_start < bytes.len() {
        tokens.push(Token::Markdown(chunk_start..bytes.len()));
    }
    (tokens, diagnostics)
}

/// Parse a free-standing attribute list, as found in a fence info string.
pub fn parse_attributes(src: &str) -> Result<BTreeMap<String, AttributeValue>, String> {
    let mut lexer = Lexer::new(src, 0);
    let mut attributes = BTreeMap::new();
    loop {
        lexer.skip_ws();
        if lexer.eof() {
            return Ok(attributes);
        }
        lexer.attribute(&mut attributes)?;
    }
}

/// If a fenced code block opens at `start`, return the offset just past its end.
fn fence_end(bytes: &[u8], start: usize) -> Option<usize> {
    let (marker, width, after) = fence_marker(bytes, start)?;
    if width < 3 {
        return None;
    }
    let mut line = next_line(bytes, after);
    while line < bytes.len() {
        if let Some((close, close_width, rest)) = fence_marker(bytes, line) {
            let trailing_blank = bytes[rest..next_line(bytes, rest)]
                .iter()
                .all(|b| b.is_ascii_whitespace());
            if close == marker && close_width >= width && trailing_blank {
                return Some(next_line(bytes, rest));
            }
        }
        line = next_line(bytes, line);
    }
    Some(bytes.len())
}

/// Four spaces or a tab of indentation.
fn is_indented_code(line: &[u8]) -> bool {
    line.starts_with(b"    ") || line.starts_with(b"\t")
}

fn backtick_run(bytes: &[u8], start: usize) -> usize {
    bytes[start..].iter().take_while(|&&b| b == b'`').count()
}

/// Offset just past the backtick run closing a code span opened at `start`.
///
/// Spans never cross a blank line.
fn code_span_end(bytes: &[u8], start: usize, run: usize) -> Option<usize> {
    let mut index = start + run;
    while index < bytes.len() {
        match bytes[index] {
            b'`' => {
                let close = backtick_run(bytes, index);
                if close == run {
                    return Some(index + close);
                }
                index += close;
            }
            b'\n' => {
                let line_end = next_line(bytes, index + 1);
                if bytes[index + 1..line_end].iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                index += 1;
            }
            _ => index += 1,
        }
    }
    None
}

/// `(marker byte, run length, offset after the run)` for a line starting at `start`.
fn fence_marker(bytes: &[u8], start: usize) -> Option<(u8, usize, usize)> {
    let mut index = start;
    while index < bytes.len() && bytes[index] == b' ' && index - start < 3 {
        index += 1;
    }
    let marker = *bytes.get(index)?;
    if marker != b'`' && marker != b'~' {
        return None;
    }
    let run_start = index;
    while bytes.get(index) == Some(&marker) {
        index += 1;
    }
    Some((marker, index - run_start, index))
}

fn next_line(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| from + p + 1)
        .unwrap_or(bytes.len())
}

static REFERENCE_REGEX: OnceLock<Regex> = OnceLock::new();

fn reference_regex() -> &'static Regex {
    REFERENCE_REGEX.get_or_init(|| {
        Regex::new(
            r"\{\{\s*input\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}|\$([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)",
        )
        .unwrap()
    })
}

/// Split text into literal runs and `$name` / `{{input.name}}` references.
pub fn scan_references(text: &str) -> Vec<TextPart> {
    let mut parts = Vec::new();
    let mut last = 0;
    for captures in reference_regex().captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if whole.start() > last {
            parts.push(TextPart::Literal(text[last..whole.start()].to_string()));
        }
        if let Some(input) = captures.get(1) {
            parts.push(TextPart::Variable(VariableReference::input(input.as_str())));
        } else if let Some(path) = captures.get(2) {
            let mut segments = path.as_str().split('.').map(str::to_string);
            let name = segments.next().unwrap_or_default();
            parts.push(TextPart::Variable(VariableReference::dollar(
                name,
                segments.collect(),
            )));
        }
        last = whole.end();
    }
    if last < text.len() {
        parts.push(TextPart::Literal(text[last..].to_string()));
    }
    parts
}

type LexResult<T> = std::result::Result<T, String>;

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, index: usize) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    fn starts_with(&self, pat: &str) -> bool {
        self.bytes[self.index.min(self.bytes.len())..].starts_with(pat.as_bytes())
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_ascii_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, pat: &str) -> LexResult<()> {
        if self.starts_with(pat) {
            self.index += pat.len();
            Ok(())
        } else {
            Err(format!("expected '{}'", pat))
        }
    }

    fn tag(&mut self) -> LexResult<Token> {
        let start = self.index;
        self.expect("{%")?;
        self.skip_ws();

        if self.current() == Some(b'/') {
            self.advance();
            self.skip_ws();
            let name = self.identifier(true);
            if name.is_empty() {
                return Err("expected directive name after '/'".to_string());
            }
            self.skip_ws();
            self.expect("%}")
                .map_err(|_| format!("unterminated closing tag '{}'", name))?;
            return Ok(Token::Close {
                name,
                span: start..self.index,
            });
        }

        let name = self.identifier(true);
        if name.is_empty() {
            return Err("expected directive name".to_string());
        }

        let mut attributes = BTreeMap::new();
        let self_closing = loop {
            self.skip_ws();
            if self.starts_with("/%}") {
                self.index += 3;
                break true;
            }
            if self.starts_with("%}") {
                self.index += 2;
                break false;
            }
            if self.eof() {
                return Err(format!("unterminated tag '{}'", name));
            }
            self.attribute(&mut attributes)?;
        };

        Ok(Token::Open(TagToken {
            name,
            attributes,
            self_closing,
            span: start..self.index,
        }))
    }

    fn attribute(&mut self, attributes: &mut BTreeMap<String, AttributeValue>) -> LexResult<()> {
        if self.current() == Some(b'#') {
            self.advance();
            let id = self.identifier(true);
            if id.is_empty() {
                return Err("expected identifier after '#'".to_string());
            }
            attributes.insert("id".to_string(), AttributeValue::string(id));
            return Ok(());
        }

        if self.current().is_some_and(is_ident_start) {
            let word_start = self.index;
            let word = self.identifier(true);
            let after_word = self.index;
            self.skip_ws();
            if self.current() == Some(b'=') {
                self.advance();
                self.skip_ws();
                let value = self.value()?;
                attributes.insert(word, value);
                return Ok(());
            }
            self.index = after_word;
            let is_value_word =
                matches!(word.as_str(), "true" | "false" | "null") || self.current() == Some(b'(');
            if !is_value_word {
                attributes.insert(word, AttributeValue::Literal(Literal::Bool(true)));
                return Ok(());
            }
            self.index = word_start;
        }

        let value = self.value()?;
        if attributes.contains_key(PRIMARY_ATTRIBUTE) {
            return Err("only one bare attribute value is allowed".to_string());
        }
        attributes.insert(PRIMARY_ATTRIBUTE.to_string(), value);
        Ok(())
    }

    fn value(&mut self) -> LexResult<AttributeValue> {
        match self.current() {
            None => Err("expected attribute value".to_string()),
            Some(b'"') | Some(b'\'') => self.string(),
            Some(b'$') => self.variable().map(AttributeValue::Variable),
            Some(b'[') => self.list(),
            Some(b'{') => self.map(),
            Some(b'-') | Some(b'0'..=b'9') => self.number(),
            Some(ch) if is_ident_start(ch) => {
                let word = self.identifier(false);
                if self.current() == Some(b'(') {
                    let args = self.sequence(b'(', b')')?;
                    return Ok(AttributeValue::Function(FunctionCall { name: word, args }));
                }
                Ok(match word.as_str() {
                    "true" => AttributeValue::Literal(Literal::Bool(true)),
                    "false" => AttributeValue::Literal(Literal::Bool(false)),
                    "null" => AttributeValue::Literal(Literal::Null),
                    _ => AttributeValue::string(word),
                })
            }
            Some(ch) => Err(format!("unexpected character '{}' in attribute", ch as char)),
        }
    }

    fn string(&mut self) -> LexResult<AttributeValue> {
        let quote = self.current().unwrap_or(b'"');
        self.advance();
        let mut buf = String::new();
        let mut run_start = self.index;
        loop {
            let Some(ch) = self.current() else {
                return Err("unterminated string".to_string());
            };
            if ch == quote {
                buf.push_str(&self.src[run_start..self.index]);
                self.advance();
                break;
            }
            if ch == b'\\' {
                buf.push_str(&self.src[run_start..self.index]);
                self.advance();
                match self.current() {
                    Some(b'n') => buf.push('\n'),
                    Some(b't') => buf.push('\t'),
                    Some(b'"') => buf.push('"'),
                    Some(b'\'') => buf.push('\''),
                    Some(b'\\') => buf.push('\\'),
                    Some(b'$') => buf.push('\u{0}'),
                    Some(_) => {
                        let Some(other) = self.src[self.index..].chars().next() else {
                            return Err("unterminated string".to_string());
                        };
                        buf.push('\\');
                        buf.push(other);
                        self.index += other.len_utf8();
                        run_start = self.index;
                        continue;
                    }
                    None => return Err("unterminated string".to_string()),
                }
                self.advance();
                run_start = self.index;
                continue;
            }
            self.advance();
        }

        let parts = scan_references(&buf);
        let restore = |s: &str| s.replace('\u{0}', "$");
        if parts.iter().any(|p| matches!(p, TextPart::Variable(_))) {
            Ok(AttributeValue::Template(
                parts
                    .into_iter()
                    .map(|part| match part {
                        TextPart::Literal(text) => TextPart::Literal(restore(&text)),
                        other => other,
                    })
                    .collect(),
            ))
        } else {
            Ok(AttributeValue::string(restore(&buf)))
        }
    }

    fn variable(&mut self) -> LexResult<VariableReference> {
        self.advance();
        let name = self.identifier(false);
        if name.is_empty() {
            return Err("expected variable name after '$'".to_string());
        }
        let mut path = Vec::new();
        loop {
            match (self.current(), self.peek(1)) {
                (Some(b'.'), Some(next)) if is_ident_char(next) => {
                    self.advance();
                    path.push(self.identifier(false));
                }
                (Some(b'['), Some(b'0'..=b'9')) => {
                    self.advance();
                    let start = self.index;
                    while self.current().is_some_and(|c| c.is_ascii_digit()) {
                        self.advance();
                    }
                    path.push(self.src[start..self.index].to_string());
                    self.expect("]")?;
                }
                _ => break,
            }
        }
        Ok(VariableReference::dollar(name, path))
    }

    fn list(&mut self) -> LexResult<AttributeValue> {
        self.sequence(b'[', b']').map(AttributeValue::List)
    }

    fn sequence(&mut self, open: u8, close: u8) -> LexResult<Vec<AttributeValue>> {
        if self.current() != Some(open) {
            return Err(format!("expected '{}'", open as char));
        }
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.current() {
                None => return Err(format!("expected '{}'", close as char)),
                Some(ch) if ch == close => {
                    self.advance();
                    return Ok(items);
                }
                Some(b',') => self.advance(),
                Some(_) => items.push(self.value()?),
            }
        }
    }

    fn map(&mut self) -> LexResult<AttributeValue> {
        self.advance();
        let mut entries = BTreeMap::new();
        loop {
            self.skip_ws();
            match self.current() {
                None => return Err("expected '}'".to_string()),
                Some(b'}') => {
                    self.advance();
                    return Ok(AttributeValue::Nested(entries));
                }
                Some(b',') => self.advance(),
                Some(_) => {
                    let key = match self.current() {
                        Some(b'"') | Some(b'\'') => match self.string()? {
                            AttributeValue::Literal(Literal::String(key)) => key,
                            _ => return Err("map keys cannot contain references".to_string()),
                        },
                        _ => self.identifier(true),
                    };
                    if key.is_empty() {
                        return Err("expected map key".to_string());
                    }
                    self.skip_ws();
                    match self.current() {
                        Some(b':') | Some(b'=') => self.advance(),
                        _ => return Err(format!("expected ':' after key '{}'", key)),
                    }
                    self.skip_ws();
                    let value = self.value()?;
                    entries.insert(key, value);
                }
            }
        }
    }

    fn number(&mut self) -> LexResult<AttributeValue> {
        let start = self.index;
        if self.current() == Some(b'-') {
            self.advance();
        }
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() || ch == b'.' || ch == b'e' || ch == b'E' {
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.src[start..self.index];
        text.parse::<f64>()
            .map(|n| AttributeValue::Literal(Literal::Number(n)))
            .map_err(|_| format!("invalid number '{}'", text))
    }

    fn identifier(&mut self, allow_dash: bool) -> String {
        let start = self.index;
        if !self.current().is_some_and(is_ident_start) {
            return String::new();
        }
        while let Some(ch) = self.current() {
            if is_ident_char(ch) || (allow_dash && ch == b'-') {
                self.advance();
            } else {
                break;
            }
        }
        self.src[start..self.index].to_string()
    }
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(token: &Token) -> &TagToken {
        match token {
            Token::Open(tag) => tag,
            other => panic!("expected open tag, got {:?}", other),
        }
    }

    #[test]
    fn test_tokenize_open_close() {
        let src = "Hi\n{% loop count=3 #outer %}\nbody\n{% /loop %}\n";
        let (tokens, diags) = tokenize(src, 0);
        assert!(diags.is_empty());
        assert_eq!(tokens.len(), 5);
        let tag = open(&tokens[1]);
        assert_eq!(tag.name, "loop");
        assert!(!tag.self_closing);
        assert_eq!(
            tag.attributes["count"],
            AttributeValue::Literal(Literal::Number(3.0))
        );
        assert_eq!(tag.attributes["id"], AttributeValue::string("outer"));
        assert!(matches!(&tokens[3], Token::Close { name, .. } if name == "loop"));
    }

    #[test]
    fn test_primary_and_function_values() {
        let (tokens, _) = tokenize("{% if equals($a.b, \"x\") /%}", 0);
        let tag = open(&tokens[0]);
        assert!(tag.self_closing);
        match &tag.attributes[PRIMARY_ATTRIBUTE] {
            AttributeValue::Function(call) => {
                assert_eq!(call.name, "equals");
                assert_eq!(call.args.len(), 2);
                assert_eq!(
                    call.args[0],
                    AttributeValue::Variable(VariableReference::dollar("a", vec!["b".into()]))
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_with_reference_is_template() {
        let (tokens, _) = tokenize("{% set id=\"x\" greeting=\"hi $name!\" /%}", 0);
        let tag = open(&tokens[0]);
        assert_eq!(
            tag.attributes["greeting"],
            AttributeValue::Template(vec![
                TextPart::Literal("hi ".into()),
                TextPart::Variable(VariableReference::dollar("name", vec![])),
                TextPart::Literal("!".into()),
            ])
        );
    }

    #[test]
    fn test_lists_and_maps() {
        let (tokens, _) = tokenize("{% set id=\"x\" list=[1, \"a\"] map={k: true} /%}", 0);
        let tag = open(&tokens[0]);
        assert!(matches!(&tag.attributes["list"], AttributeValue::List(items) if items.len() == 2));
        assert!(matches!(&tag.attributes["map"], AttributeValue::Nested(m) if m.contains_key("k")));
    }

    #[test]
    fn test_tags_inside_fences_are_ignored() {
        let src = "```\n{% loop %}\n```\n{% set id=\"a\" /%}";
        let (tokens, diags) = tokenize(src, 0);
        assert!(diags.is_empty());
        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[0], Token::Markdown(_)));
        assert_eq!(open(&tokens[1]).name, "set");
    }

    #[test]
    fn test_tags_inside_code_spans_are_ignored() {
        let src = "Write `{% set #x v=1 /%}` or ``{% if `a` %}`` to declare.\n";
        let (tokens, diags) = tokenize(src, 0);
        assert!(diags.is_empty());
        assert!(matches!(tokens.as_slice(), [Token::Markdown(r)] if *r == (0..src.len())));

        let (tokens, _) = tokenize("a ` lone tick {% set #y /%}\n", 0);
        assert_eq!(open(&tokens[1]).name, "set");
    }

    #[test]
    fn test_tags_inside_indented_code_are_ignored() {
        let src = "Intro\n\n    {% set #x v=1 /%}\n    more\n\n{% set #y /%}\n";
        let (tokens, diags) = tokenize(src, 0);
        assert!(diags.is_empty());
        assert_eq!(tokens.len(), 3);
        assert_eq!(open(&tokens[1]).name, "set");
        assert_eq!(open(&tokens[1]).attributes["id"], AttributeValue::string("y"));

        let (tokens, _) = tokenize("{% loop count=1 %}\n    {% set #z /%}\n{% /loop %}\n", 0);
        assert_eq!(open(&tokens[2]).name, "set");
    }

    #[test]
    fn test_escape_before_multibyte_char() {
        let (tokens, diags) = tokenize("{% set #x v=\"a\\é b\" /%}\n", 0);
        assert!(diags.is_empty());
        assert_eq!(open(&tokens[0]).attributes["v"], AttributeValue::string("a\\é b"));
    }

    #[test]
    fn test_unterminated_tag_is_diagnostic() {
        let (tokens, diags) = tokenize("text {% loop count=3", 0);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::Syntax);
        assert!(matches!(tokens.as_slice(), [Token::Markdown(r)] if r.start == 0));
    }

    #[test]
    fn test_scan_references() {
        let parts = scan_references("Topic: {{input.topic}} by $author.name.");
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[1], TextPart::Variable(VariableReference::input("topic")));
        assert_eq!(
            parts[3],
            TextPart::Variable(VariableReference::dollar("author", vec!["name".into()]))
        );
        assert_eq!(parts[4], TextPart::Literal(".".into()));
    }

    #[test]
    fn test_fence_info_attributes() {
        let attrs = parse_attributes("#calc runtime=\"py\"").unwrap();
        assert_eq!(attrs["id"], AttributeValue::string("calc"));
        assert_eq!(attrs["runtime"], AttributeValue::string("py"));
    }
}
