//! Document metadata header
//!
//! A document may open with a YAML block fenced by `---` lines. The block
//! declares a title, a description and the document's formal `input`
//! parameters; any other keys are kept verbatim in `extra`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use thiserror::Error;

/// Frontmatter parse failure.
#[derive(Debug, Error)]
pub enum FrontmatterError {
    /// The header block is not valid YAML for [`Frontmatter`].
    #[error("Invalid frontmatter YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Parsed document metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frontmatter {
    /// Document title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Document description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Formal input parameters.
    #[serde(default)]
    pub input: Vec<InputParameter>,
    /// Remaining keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Frontmatter {
    /// Whether the document declares an input named `name`.
    pub fn declares_input(&self, name: &str) -> bool {
        self.input.iter().any(|param| param.name == name)
    }

    /// Bind supplied values (or schema defaults) to the declared inputs.
    ///
    /// Undeclared supplied keys pass through unchanged.
    pub fn bind_inputs(&self, supplied: &Map<String, Value>) -> Map<String, Value> {
        let mut bound = supplied.clone();
        for param in &self.input {
            let value = match supplied.get(&param.name) {
                Some(value) => param.coerce(value.clone()),
                None => param.schema.default.clone().unwrap_or(Value::Null),
            };
            bound.insert(param.name.clone(), value);
        }
        bound
    }
}

/// One declared input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    /// Parameter name, referenced as `{{input.name}}`.
    pub name: String,
    /// Declared type (`string`, `number`, `boolean`, …).
    #[serde(rename = "type", default = "default_input_type")]
    pub kind: String,
    /// Default value, description and any extra schema keys.
    #[serde(default)]
    pub schema: InputSchema,
}

fn default_input_type() -> String {
    "string".to_string()
}

impl InputParameter {
    /// Coerce a string value to the declared `number` or `boolean` type.
    pub fn coerce(&self, value: Value) -> Value {
        let coerced = match (self.kind.as_str(), &value) {
            ("number", Value::String(raw)) => parse_number(raw.trim()),
            ("boolean", Value::String(raw)) => match raw.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        };
        coerced.unwrap_or(value)
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(int) = raw.parse::<i64>() {
        return Some(Value::from(int));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

/// Schema block of an input parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    /// Value used when the caller supplies none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Description shown to users and to input generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Remaining schema keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

static FRONTMATTER_REGEX: OnceLock<Regex> = OnceLock::new();

fn frontmatter_regex() -> &'static Regex {
    FRONTMATTER_REGEX
        .get_or_init(|| Regex::new(r"(?s)^---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|$)").unwrap())
}

/// Split a document into its frontmatter and the byte offset where the body starts.
///
/// Without a header the frontmatter is `None` and the body starts at 0. On a
/// YAML error the body offset is still returned so the rest can compile.
pub fn split_frontmatter(
    content: &str,
) -> (Option<Result<Frontmatter, FrontmatterError>>, usize) {
    let Some(captures) = frontmatter_regex().captures(content) else {
        return (None, 0);
    };
    let (Some(whole), Some(yaml)) = (captures.get(0), captures.get(1)) else {
        return (None, 0);
    };
    let parsed = if yaml.as_str().trim().is_empty() {
        Ok(Frontmatter::default())
    } else {
        serde_yaml::from_str::<Frontmatter>(yaml.as_str()).map_err(FrontmatterError::from)
    };
    (Some(parsed), whole.end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inputs() {
        let src = "---\ntitle: Demo\ninput:\n  - name: count\n    type: number\n    schema:\n      default: 2\n---\nbody\n";
        let (fm, offset) = split_frontmatter(src);
        let fm = fm.unwrap().unwrap();
        assert_eq!(fm.title.as_deref(), Some("Demo"));
        assert_eq!(fm.input.len(), 1);
        assert_eq!(fm.input[0].kind, "number");
        assert_eq!(fm.input[0].schema.default, Some(json!(2)));
        assert_eq!(&src[offset..], "body\n");
    }

    #[test]
    fn test_crlf_header() {
        let src = "---\r\ntitle: Demo\r\ninput:\r\n  - name: count\r\n    type: number\r\n---\r\nbody\r\n";
        let (fm, offset) = split_frontmatter(src);
        let fm = fm.unwrap().unwrap();
        assert_eq!(fm.title.as_deref(), Some("Demo"));
        assert_eq!(fm.input.len(), 1);
        assert_eq!(&src[offset..], "body\r\n");
    }

    #[test]
    fn test_no_frontmatter() {
        let (fm, offset) = split_frontmatter("# Title\n");
        assert!(fm.is_none());
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_malformed_yaml_keeps_body_offset() {
        let src = "---\ninput: [unclosed\n---\nrest";
        let (fm, offset) = split_frontmatter(src);
        assert!(fm.unwrap().is_err());
        assert_eq!(&src[offset..], "rest");
    }

    #[test]
    fn test_bind_inputs_coerces_and_defaults() {
        let fm: Frontmatter = serde_yaml::from_str(
            "input:\n  - name: count\n    type: number\n  - name: flag\n    type: boolean\n    schema:\n      default: false\n",
        )
        .unwrap();
        let mut supplied = Map::new();
        supplied.insert("count".into(), json!("3"));
        let bound = fm.bind_inputs(&supplied);
        assert_eq!(bound["count"], json!(3));
        assert_eq!(bound["flag"], json!(false));
    }
}
