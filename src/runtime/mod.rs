//! Runtime orchestrator and public API
//!
//! [`Runtime`] registers plugins and adapters, compiles the document and
//! hands back an [`Execution`]: a pull-driven stream of rendered nodes backed
//! by one [`StateManager`]. Nothing is walked until the caller polls.

use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::info;

// Submodules
pub mod cancel;
pub mod completion;
pub mod directives;
pub mod error;
pub mod events;
pub mod history;
pub mod interpreter;
pub mod plugin;
pub mod render;
pub mod state;
pub mod value;

pub use cancel::{AbortController, AbortSignal};
pub use completion::{CompletionService, EchoCompletion, Tool};
pub use directives::FlowFiles;
pub use error::{AbortReason, Result, RuntimeError};
pub use events::{Events, LogLevel};
pub use plugin::{Adapter, Plugin, TagSpec};
pub use render::RenderNode;
pub use state::StateManager;

use crate::compiler::{self, CompileOutput, Diagnostic, DirectiveTable};
use interpreter::{DispatchTable, GLOBAL_SCOPE, Interpreter, NodeStream, Shared};

/// Configuration visible to every execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base variables, overridden by published frames
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Model used by `ai` blocks without a `model` attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Directive names contributed by registered plugins
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Execution behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Run each flow in its own scope and pop it afterwards
    #[serde(default)]
    pub use_scoping: bool,
}

/// Everything one execution needs besides the document
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Base configuration for variable resolution
    pub config: RuntimeConfig,
    /// Values for the document's declared inputs
    pub input: Map<String, Value>,
    /// Caller callbacks
    pub events: Events,
    /// External abort signal
    pub signal: Option<AbortSignal>,
    /// Behaviour switches
    pub settings: Settings,
    /// Secrets such as provider API keys
    pub env: HashMap<String, String>,
    /// Whole-document deadline
    pub timeout: Option<Duration>,
    /// Plugins to register
    pub plugins: Vec<Plugin>,
    /// Adapters to register, before plugins
    pub adapters: Vec<Adapter>,
    /// Tools offered to `ai` blocks
    pub tools: Vec<Tool>,
    /// Documents reachable by `flow`
    pub files: FlowFiles,
}

impl ExecuteOptions {
    /// Set one input value.
    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.input.insert(name.into(), value);
        self
    }

    /// Add a plugin.
    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Add an adapter.
    pub fn with_adapter(mut self, adapter: Adapter) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Add a tool.
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Set the callbacks.
    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    /// Set the flow documents.
    pub fn with_files(mut self, files: FlowFiles) -> Self {
        self.files = files;
        self
    }

    /// Set the whole-document timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set an external abort signal.
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// The main runtime entry point
///
/// Holds the completion service and the runtime-level configuration shared
/// by every execution.
#[derive(Clone)]
pub struct Runtime {
    completion: Arc<dyn CompletionService>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime backed by a completion service
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self {
            completion,
            config: RuntimeConfig::default(),
        }
    }

    /// Replace the runtime-level configuration
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Compile against the built-ins plus the given plugins' directives
    pub fn compile(&self, content: &str, plugins: &[Plugin]) -> CompileOutput {
        let mut table = DirectiveTable::builtin();
        for plugin in plugins {
            for tag in plugin.tags.values() {
                table.register_directive(tag.schema());
            }
            for name in plugin.functions.keys() {
                table.register_function(name.clone());
            }
        }
        compiler::compile(content, &table)
    }

    /// Prepare an execution
    ///
    /// Registration and compilation happen now; the walk happens as the
    /// returned stream is polled. Compile errors are logged and ignored.
    pub fn execute(&self, content: &str, options: ExecuteOptions) -> Result<Execution> {
        let ExecuteOptions {
            config,
            input,
            events,
            signal,
            settings,
            env,
            timeout,
            plugins,
            adapters,
            tools,
            files,
        } = options;

        let state = Arc::new(StateManager::with_env(self.config.clone(), env));
        for adapter in adapters {
            state.register_adapter(adapter)?;
        }
        for plugin in plugins {
            state.register_plugin(plugin)?;
        }

        let table = state.directive_table();
        let compiled = compiler::compile(content, &table);
        for diagnostic in &compiled.errors {
            events.log(LogLevel::Warn, format!("ignoring compile error: {}", diagnostic));
        }

        let controller = AbortController::new();
        let mut signal = AbortSignal::any(
            std::iter::once(controller.signal()).chain(signal),
        );
        if let Some(timeout) = timeout {
            signal = signal.with_timeout(timeout);
        }

        let inputs = compiled.frontmatter.bind_inputs(&input);
        let interpreter = Interpreter::new(Shared {
            state: Arc::clone(&state),
            completion: Arc::clone(&self.completion),
            dispatch: DispatchTable::build(&state),
            table,
            signal: signal.clone(),
            events: events.clone(),
            settings,
            base_config: config,
            tools,
            files,
        });
        let stream = interpreter.run_document(
            Arc::new(compiled.document.clone()),
            GLOBAL_SCOPE.to_string(),
            inputs,
        );

        info!(
            blocks = compiled.document.blocks.len(),
            errors = compiled.errors.len(),
            warnings = compiled.warnings.len(),
            "execution prepared"
        );
        Ok(Execution {
            stream,
            state,
            controller,
            signal,
            events,
            compiled,
            yielded: 0,
            started: false,
            finished: false,
        })
    }
}

/// A running document
///
/// Yields top-level [`RenderNode`]s. After an abort it yields one
/// `Err(Aborted)` and ends; after any other error it yields that error and ends.
pub struct Execution {
    stream: NodeStream,
    state: Arc<StateManager>,
    controller: AbortController,
    signal: AbortSignal,
    events: Events,
    compiled: CompileOutput,
    yielded: usize,
    started: bool,
    finished: bool,
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("yielded", &self.yielded)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Execution {
    /// Abort the execution.
    pub fn abort(&self) {
        self.controller.abort(AbortReason::User(None));
    }

    /// Abort with a message.
    pub fn abort_with(&self, message: impl Into<String>) {
        self.controller.abort(AbortReason::User(Some(message.into())));
    }

    /// Controller behind [`Execution::abort`], for aborting from another task.
    pub fn controller(&self) -> AbortController {
        self.controller.clone()
    }

    /// Shared state.
    pub fn state(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    /// Compile diagnostics, errors first.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.compiled.diagnostics().cloned().collect()
    }

    /// Compiled document.
    pub fn compiled(&self) -> &CompileOutput {
        &self.compiled
    }

    /// Drain the stream.
    pub async fn collect(self) -> Result<Vec<RenderNode>> {
        self.try_collect().await
    }

    fn finish(&mut self, error: RuntimeError) -> Poll<Option<Result<RenderNode>>> {
        self.finished = true;
        let error = match error.abort_reason().cloned() {
            Some(reason) => {
                self.events
                    .log(LogLevel::Info, format!("execution aborted: {}", reason));
                self.events.emit_abort(&reason);
                RuntimeError::Aborted(reason)
            }
            None => {
                self.events
                    .log(LogLevel::Error, format!("execution failed: {}", error));
                self.events.emit_error(&error);
                error
            }
        };
        Poll::Ready(Some(Err(error)))
    }
}

impl Stream for Execution {
    type Item = Result<RenderNode>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if !this.started {
            this.started = true;
            this.events.log(LogLevel::Info, "execution started");
        }
        if let Some(reason) = this.signal.reason() {
            return this.finish(RuntimeError::Aborted(reason));
        }
        match this.stream.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(node))) => {
                if let Some(reason) = this.signal.reason() {
                    return this.finish(RuntimeError::Aborted(reason));
                }
                this.yielded += 1;
                this.events.emit_data(&node);
                Poll::Ready(Some(Ok(node)))
            }
            Poll::Ready(Some(Err(error))) => this.finish(error),
            Poll::Ready(None) => {
                this.finished = true;
                this.events.log(
                    LogLevel::Info,
                    format!(
                        "execution finished: {} nodes, {} history blocks",
                        this.yielded,
                        this.state.history_len()
                    ),
                );
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        let settings: Settings = serde_json::from_str(r#"{"use_scoping": true}"#).unwrap();
        assert!(settings.use_scoping);
    }

    #[test]
    fn test_compile_sees_plugin_directives() {
        let runtime = Runtime::new(Arc::new(EchoCompletion));
        let plugin = Plugin::new("charts", "1.0")
            .with_tag(TagSpec::new("chart", |_ctx| async { Ok(plugin::TagOutput::default()) }));
        let without = runtime.compile("{% chart /%}\n", &[]);
        assert!(!without.warnings.is_empty());
        let with = runtime.compile("{% chart /%}\n", &[plugin]);
        assert!(with.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_registration_errors_surface_synchronously() {
        let runtime = Runtime::new(Arc::new(EchoCompletion));
        let options = ExecuteOptions::default()
            .with_plugin(Plugin::new("a", "1"))
            .with_plugin(Plugin::new("a", "1"));
        let err = runtime.execute("hello\n", options).unwrap_err();
        assert!(matches!(err, RuntimeError::Registration(_)));
    }
}
