//! Completion service boundary
//!
//! The interpreter never talks to a model provider directly. It builds a
//! [`CompletionRequest`] and hands it to a [`CompletionService`]. Retries,
//! streaming and provider quirks belong to the implementation.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

use super::error::CompletionError;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// Document context and instructions.
    User,
    /// Model output.
    Assistant,
    /// Tool results.
    Tool,
}

/// One prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author.
    pub role: Role,
    /// Text content.
    pub content: String,
}

impl Message {
    /// Message with role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

/// Tool callback run when the model calls it.
pub type ToolExecutor = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Caller-supplied tool: definition plus executor.
#[derive(Clone)]
pub struct Tool {
    /// Definition sent to the model.
    pub definition: ToolDefinition,
    /// Executor.
    pub execute: ToolExecutor,
}

impl Tool {
    /// Tool from a definition and an async closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        execute: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            definition: ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            execute: Arc::new(move |args| execute(args).boxed()),
        }
    }

    /// Tool name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// One completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model name, optionally `provider/model`.
    pub model: String,
    /// Prompt messages.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// JSON schema for structured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    /// Media descriptors attached to vision requests.
    #[serde(default)]
    pub media: Vec<Value>,
    /// Provider credential, when one was found.
    #[serde(skip)]
    pub credential: Option<String>,
    /// Remaining `ai` attributes (temperature, …).
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// A tool call in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments.
    pub arguments: Value,
}

/// Completion result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub text: String,
    /// Tool calls requested by the model.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Parsed structured output, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

/// Language model client.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Produce a completion.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;
}

/// Offline service that echoes the last message back.
///
/// Structured requests get an object filled from each schema property's
/// `default`, or a zero value of its type.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCompletion;

#[async_trait]
impl CompletionService for EchoCompletion {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let structured = request
            .response_schema
            .as_ref()
            .map(|schema| value_for_schema(schema, &text));
        Ok(CompletionResponse {
            text,
            tool_calls: Vec::new(),
            structured,
        })
    }
}

fn value_for_schema(schema: &Value, text: &str) -> Value {
    if let Some(default) = schema.get("default") {
        return default.clone();
    }
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            let mut out = Map::new();
            if let Some(Value::Object(properties)) = schema.get("properties") {
                for (key, property) in properties {
                    out.insert(key.clone(), value_for_schema(property, text));
                }
            }
            Value::Object(out)
        }
        Some("number") | Some("integer") => Value::from(0),
        Some("boolean") => Value::Bool(false),
        Some("array") => Value::Array(Vec::new()),
        Some("null") => Value::Null,
        _ => Value::String(text.to_string()),
    }
}
