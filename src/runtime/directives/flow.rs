//! `flow` directive and the document map it reads from
//!
//! A flow compiles another document with the caller's directive table and
//! runs it against the same [`StateManager`](crate::runtime::state::StateManager).
//! Nested failures are wrapped in [`RuntimeError::Flow`]; aborts pass through
//! unwrapped.

use async_stream::try_stream;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::compiler::{Frontmatter, Node, compile};
use crate::runtime::completion::{CompletionRequest, Message, Role};
use crate::runtime::error::{CompletionError, Result, RuntimeError};
use crate::runtime::events::LogLevel;
use crate::runtime::interpreter::{Interpreter, MAX_FLOW_DEPTH, NodeStream};

/// Documents a `flow` directive may load, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowFiles {
    files: BTreeMap<String, String>,
}

impl FlowFiles {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(normalize(&path.into()), content.into());
    }

    /// Builder form of [`FlowFiles::insert`].
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    /// Document at `path`; `./` prefixes are ignored and `.md` is optional.
    pub fn get(&self, path: &str) -> Option<&str> {
        let key = normalize(path);
        self.files
            .get(&key)
            .or_else(|| self.files.get(&format!("{}.md", key)))
            .map(String::as_str)
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Known paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Every `.md` file under `root`, keyed by its `/`-separated relative path.
    pub fn from_dir(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let mut files = Self::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.insert(key, std::fs::read_to_string(&path)?);
            }
        }
        debug!(root = %root.display(), count = files.len(), "loaded flow files");
        Ok(files)
    }
}

fn normalize(path: &str) -> String {
    let mut path = path.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.to_string()
}

fn wrap(path: &str, err: RuntimeError) -> RuntimeError {
    if err.is_abort() {
        err
    } else {
        RuntimeError::Flow {
            path: path.to_string(),
            source: Box::new(err),
        }
    }
}

fn check_depth(interp: &Interpreter) -> Result<()> {
    if interp.depth() >= MAX_FLOW_DEPTH {
        Err(RuntimeError::FlowDepthExceeded(MAX_FLOW_DEPTH))
    } else {
        Ok(())
    }
}

/// Run a nested document and publish `{src, inputs, result}`.
pub fn run(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        let src = interp
            .string_attribute(&node, "src")?
            .ok_or_else(|| RuntimeError::directive("flow", "flow requires a src"))?;
        check_depth(&interp).map_err(|err| wrap(&src, err))?;
        let content = interp
            .files()
            .get(&src)
            .map(str::to_string)
            .ok_or_else(|| wrap(&src, RuntimeError::FlowNotFound(src.clone())))?;

        let compiled = compile(&content, interp.table());
        for diagnostic in &compiled.errors {
            interp.events().log(
                LogLevel::Warn,
                format!("ignoring compile error in flow '{}': {}", src, diagnostic),
            );
        }

        let supplied = match interp.attribute(&node, "inputs")? {
            Some(Value::Object(map)) if !map.is_empty() => map,
            _ if !compiled.frontmatter.input.is_empty() => {
                generate_inputs(&interp, &node, &scope, &src, &compiled.frontmatter)
                    .await
                    .map_err(|err| wrap(&src, err))?
            }
            _ => Map::new(),
        };
        let inputs = compiled.frontmatter.bind_inputs(&supplied);

        let scoped = interp.settings().use_scoping;
        let flow_scope = if scoped { node.id.clone() } else { scope.clone() };
        debug!(flow = %src, scope = %flow_scope, depth = interp.depth() + 1, "entering flow");

        let mut nodes = interp.nested().run_document(
            Arc::new(compiled.document),
            flow_scope.clone(),
            inputs.clone(),
        );
        let mut result = String::new();
        while let Some(item) = nodes.next().await {
            let rendered = item.map_err(|err| wrap(&src, err))?;
            result.push_str(&rendered.text_content());
            yield rendered;
        }

        if scoped {
            interp.state().pop_stack(&flow_scope);
        }
        let mut frame = Map::new();
        frame.insert("src".into(), Value::String(src));
        frame.insert("inputs".into(), Value::Object(inputs));
        frame.insert("result".into(), Value::String(result));
        interp.publish(&node.id, &scope, frame)?;
    })
}

/// JSON schema describing a document's declared inputs.
pub fn input_schema(frontmatter: &Frontmatter) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in &frontmatter.input {
        let kind = match param.kind.as_str() {
            "number" | "integer" => "number",
            "boolean" => "boolean",
            "array" => "array",
            "object" => "object",
            _ => "string",
        };
        let mut property = Map::new();
        property.insert("type".into(), Value::String(kind.to_string()));
        if let Some(description) = &param.schema.description {
            property.insert("description".into(), Value::String(description.clone()));
        }
        match &param.schema.default {
            Some(default) => {
                property.insert("default".into(), default.clone());
            }
            None => required.push(Value::String(param.name.clone())),
        }
        properties.insert(param.name.clone(), Value::Object(property));
    }
    json!({ "type": "object", "properties": properties, "required": required })
}

async fn generate_inputs(
    interp: &Interpreter,
    node: &Node,
    scope: &str,
    src: &str,
    frontmatter: &Frontmatter,
) -> Result<Map<String, Value>> {
    let model = match interp.string_attribute(node, "model")? {
        Some(model) => model,
        None => interp.current_config().default_model.ok_or_else(|| {
            RuntimeError::directive("flow", "generating flow inputs requires a model")
        })?,
    };

    let mut messages = Vec::new();
    let context = interp.state().get_text(scope).join("\n\n");
    if !context.trim().is_empty() {
        messages.push(Message::new(Role::User, context));
    }
    let mut ask = format!("Generate the inputs for the flow '{}'.", src);
    if let Some(description) = &frontmatter.description {
        ask.push_str(&format!(" The flow: {}", description));
    }
    messages.push(Message::new(Role::User, ask));

    let request = CompletionRequest {
        model,
        messages,
        tools: Vec::new(),
        response_schema: Some(input_schema(frontmatter)),
        media: Vec::new(),
        credential: None,
        options: Map::new(),
    };
    let completion_error = |source| RuntimeError::Completion {
        directive: node.id.clone(),
        source,
    };
    let response = interp
        .signal()
        .race(interp.completion().complete(request))
        .await?
        .map_err(completion_error)?;

    let value = match response.structured {
        Some(value) => value,
        None => serde_json::from_str(&response.text).map_err(|err| {
            completion_error(CompletionError::InvalidResponse(format!(
                "generated inputs are not JSON: {}",
                err
            )))
        })?,
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(completion_error(CompletionError::InvalidResponse(
            "generated inputs must be an object".to_string(),
        ))),
    }
}
