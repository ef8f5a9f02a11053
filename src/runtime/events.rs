//! Caller-facing event callbacks
//!
//! Plain notifications (`on_log`, `on_error`, `on_abort`, `on_data`) are
//! synchronous and their results ignored. `on_tool_call` and `on_user_input`
//! are async and awaited by the interpreter.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::error::{AbortReason, RuntimeError};
use super::render::RenderNode;

/// Severity of a [`LogEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Dispatch detail.
    Debug,
    /// Execution milestones.
    Info,
    /// Recoverable problems.
    Warn,
    /// Failures.
    Error,
}

/// One log message forwarded to `on_log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}

/// A tool call requested by the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Call arguments.
    pub arguments: Value,
    /// Id of the `ai` block that made the call.
    pub directive_id: String,
}

/// Request for a value from the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    /// `input` block id.
    pub id: String,
    /// Input type (`text`, `choice`, `slider`, …).
    #[serde(rename = "type")]
    pub kind: String,
    /// Prompt label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Choices for `choice` inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    /// Lower bound for `slider` inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    /// Upper bound for `slider` inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    /// Value used when nobody answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Log callback.
pub type LogCallback = Arc<dyn Fn(&LogEvent) + Send + Sync>;
/// Error callback.
pub type ErrorCallback = Arc<dyn Fn(&RuntimeError) + Send + Sync>;
/// Abort callback.
pub type AbortCallback = Arc<dyn Fn(&AbortReason) + Send + Sync>;
/// Per-node data callback.
pub type DataCallback = Arc<dyn Fn(&RenderNode) + Send + Sync>;
/// Awaited before a tool executes.
pub type ToolCallCallback =
    Arc<dyn Fn(ToolCall) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
/// Awaited to collect an `input` value.
pub type UserInputCallback =
    Arc<dyn Fn(InputRequest) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Callbacks subscribed by the caller.
#[derive(Clone, Default)]
pub struct Events {
    /// Log messages.
    pub on_log: Option<LogCallback>,
    /// Non-abort failures.
    pub on_error: Option<ErrorCallback>,
    /// Aborts (caller or timeout).
    pub on_abort: Option<AbortCallback>,
    /// Every yielded top-level node.
    pub on_data: Option<DataCallback>,
    /// Tool call notifications.
    pub on_tool_call: Option<ToolCallCallback>,
    /// User input collection.
    pub on_user_input: Option<UserInputCallback>,
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("on_log", &self.on_log.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_abort", &self.on_abort.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_tool_call", &self.on_tool_call.is_some())
            .field("on_user_input", &self.on_user_input.is_some())
            .finish()
    }
}

impl Events {
    /// Set `on_log`.
    pub fn on_log(mut self, f: impl Fn(&LogEvent) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Arc::new(f));
        self
    }

    /// Set `on_error`.
    pub fn on_error(mut self, f: impl Fn(&RuntimeError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Set `on_abort`.
    pub fn on_abort(mut self, f: impl Fn(&AbortReason) + Send + Sync + 'static) -> Self {
        self.on_abort = Some(Arc::new(f));
        self
    }

    /// Set `on_data`.
    pub fn on_data(mut self, f: impl Fn(&RenderNode) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    /// Set `on_tool_call`.
    pub fn on_tool_call<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_tool_call = Some(Arc::new(move |call| f(call).boxed()));
        self
    }

    /// Set `on_user_input`.
    pub fn on_user_input<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(InputRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.on_user_input = Some(Arc::new(move |request| f(request).boxed()));
        self
    }

    /// Emit through `tracing` and forward to `on_log`.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        if let Some(callback) = &self.on_log {
            callback(&LogEvent { level, message });
        }
    }

    pub(crate) fn emit_data(&self, node: &RenderNode) {
        if let Some(callback) = &self.on_data {
            callback(node);
        }
    }

    pub(crate) fn emit_error(&self, error: &RuntimeError) {
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }

    pub(crate) fn emit_abort(&self, reason: &AbortReason) {
        if let Some(callback) = &self.on_abort {
            callback(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_log_forwards_to_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let events = Events::default().on_log({
            let seen = Arc::clone(&seen);
            move |event| seen.lock().push(event.clone())
        });
        events.log(LogLevel::Info, "started");
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, LogLevel::Info);
        assert_eq!(seen[0].message, "started");
    }

    #[tokio::test]
    async fn test_user_input_callback_is_awaited() {
        let events = Events::default().on_user_input(|request: InputRequest| async move {
            Ok(Value::String(format!("answer for {}", request.id)))
        });
        let callback = events.on_user_input.clone().unwrap();
        let value = callback(InputRequest {
            id: "name".into(),
            kind: "text".into(),
            label: None,
            options: None,
            min: None,
            max: None,
            default: None,
        })
        .await
        .unwrap();
        assert_eq!(value, Value::String("answer for name".into()));
    }
}
