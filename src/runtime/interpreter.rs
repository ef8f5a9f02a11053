//! Tag interpreter
//!
//! Walks a compiled [`Document`] and produces a lazy stream of
//! [`RenderNode`]s. Every walk step is a boxed `async-stream`, so nested
//! directives compose without unbounded future types and nothing runs until
//! the caller polls. The dispatch table is resolved once per execution.
//!
//! Cancellation is cooperative: the abort signal is checked at every node
//! entry and every suspension point is raced against it.

use async_stream::try_stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::RuntimeConfig;
use super::Settings;
use super::cancel::AbortSignal;
use super::completion::{CompletionService, Tool};
use super::directives::{Builtin, FlowFiles};
use super::error::{Result, RuntimeError};
use super::events::Events;
use super::plugin::{HookContext, Hooks, PluginFunction, TagContext, TagHandler};
use super::render::RenderNode;
use super::state::{StackFrame, StateManager};
use super::value::Resolver;
use crate::compiler::scope::FRONTMATTER_FRAME;
use crate::compiler::{
    AttributeValue, DirectiveTable, Document, Frontmatter, Node, NodeKind, PRIMARY_ATTRIBUTE,
};

/// Stream of rendered nodes.
pub type NodeStream = BoxStream<'static, Result<RenderNode>>;

/// Scope of top-level documents.
pub const GLOBAL_SCOPE: &str = "global";

/// Maximum nesting of `flow` directives.
pub const MAX_FLOW_DEPTH: usize = 16;

// ========== Dispatch ==========

/// How a directive name is handled.
#[derive(Clone)]
pub enum Handler {
    /// Built-in directive.
    Builtin(Builtin),
    /// Plugin tag handler.
    Plugin {
        /// Owning plugin.
        plugin: String,
        /// Handler closure.
        handler: TagHandler,
    },
}

/// Directive handlers, hooks and functions, resolved once at start.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Handler>,
    hooks: Vec<Hooks>,
    functions: HashMap<String, PluginFunction>,
}

impl DispatchTable {
    /// Built-ins plus everything registered with `state`.
    pub fn build(state: &StateManager) -> Self {
        let mut handlers: HashMap<String, Handler> = Builtin::ALL
            .iter()
            .map(|builtin| (builtin.name().to_string(), Handler::Builtin(*builtin)))
            .collect();
        let mut hooks = Vec::new();
        for plugin in state.plugins() {
            for tag in plugin.tags.values() {
                handlers.insert(
                    tag.name.clone(),
                    Handler::Plugin {
                        plugin: plugin.name.clone(),
                        handler: Arc::clone(&tag.handler),
                    },
                );
            }
            if let Some(plugin_hooks) = &plugin.hooks {
                hooks.push(plugin_hooks.clone());
            }
        }
        Self {
            handlers,
            hooks,
            functions: state.functions(),
        }
    }

    /// Handler for a directive name.
    pub fn handler(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    /// Plugin functions by name.
    pub fn functions(&self) -> &HashMap<String, PluginFunction> {
        &self.functions
    }
}

enum HookPhase {
    Before,
    After,
}

// ========== Interpreter ==========

/// Everything one execution shares across its walks and nested flows.
pub(crate) struct Shared {
    pub state: Arc<StateManager>,
    pub completion: Arc<dyn CompletionService>,
    pub dispatch: DispatchTable,
    pub table: DirectiveTable,
    pub signal: AbortSignal,
    pub events: Events,
    pub settings: Settings,
    pub base_config: RuntimeConfig,
    pub tools: Vec<Tool>,
    pub files: FlowFiles,
}

/// Cheaply cloneable handle that walks nodes.
#[derive(Clone)]
pub struct Interpreter {
    shared: Arc<Shared>,
    depth: usize,
}

impl Interpreter {
    pub(crate) fn new(shared: Shared) -> Self {
        Self {
            shared: Arc::new(shared),
            depth: 0,
        }
    }

    /// Shared state manager.
    pub fn state(&self) -> &Arc<StateManager> {
        &self.shared.state
    }

    /// Execution abort signal.
    pub fn signal(&self) -> &AbortSignal {
        &self.shared.signal
    }

    /// Caller callbacks.
    pub fn events(&self) -> &Events {
        &self.shared.events
    }

    /// Completion service.
    pub fn completion(&self) -> &Arc<dyn CompletionService> {
        &self.shared.completion
    }

    /// Execution settings.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Tools offered to `ai` directives.
    pub fn tools(&self) -> &[Tool] {
        &self.shared.tools
    }

    /// Documents reachable by `flow`.
    pub fn files(&self) -> &FlowFiles {
        &self.shared.files
    }

    /// Directive table used to compile nested flows.
    pub fn table(&self) -> &DirectiveTable {
        &self.shared.table
    }

    /// Flow nesting depth of this handle.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Handle one flow level deeper.
    pub fn nested(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            depth: self.depth + 1,
        }
    }

    // ========== Variables ==========

    /// Merged configuration at this point of the walk.
    pub fn current_config(&self) -> RuntimeConfig {
        self.shared.state.get_current_config(&self.shared.base_config)
    }

    /// Merged variables at this point of the walk.
    pub fn variables(&self) -> Map<String, Value> {
        self.current_config().variables
    }

    /// Resolve one attribute value against the current variables.
    pub fn evaluate(&self, value: &AttributeValue) -> Result<Value> {
        let variables = self.variables();
        Resolver::new(&variables, &self.shared.dispatch.functions).resolve(value)
    }

    /// Resolve a node attribute, `None` when absent.
    pub fn attribute(&self, node: &Node, key: &str) -> Result<Option<Value>> {
        node.attribute(key).map(|value| self.evaluate(value)).transpose()
    }

    /// Resolve a node attribute that must be a string.
    pub fn string_attribute(&self, node: &Node, key: &str) -> Result<Option<String>> {
        Ok(match self.attribute(node, key)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(super::value::to_text(&other)),
        })
    }

    /// Resolve every attribute of `node` except `skip`.
    pub fn resolve_attributes(&self, node: &Node, skip: &[&str]) -> Result<Map<String, Value>> {
        let variables = self.variables();
        Resolver::new(&variables, &self.shared.dispatch.functions)
            .resolve_all(&node.attributes, skip)
    }

    /// Publish `variables` as frame `id` in `scope`.
    pub fn publish(&self, id: &str, scope: &str, variables: Map<String, Value>) -> Result<()> {
        self.shared.signal.check()?;
        debug!(id, scope, "publish");
        self.shared
            .state
            .push_stack(StackFrame::new(id, scope, variables));
        Ok(())
    }

    // ========== Walking ==========

    /// Run a whole document in `scope`.
    ///
    /// The frontmatter frame is pushed when the stream is first polled.
    pub fn run_document(
        &self,
        document: Arc<Document>,
        scope: String,
        inputs: Map<String, Value>,
    ) -> NodeStream {
        let this = self.clone();
        Box::pin(try_stream! {
            this.shared.signal.check()?;
            let frame = frontmatter_frame(&document.frontmatter, inputs);
            this.publish(FRONTMATTER_FRAME, &scope, frame)?;
            for block in &document.blocks {
                let mut nodes = this.walk(Arc::new(block.clone()), scope.clone());
                while let Some(node) = nodes.next().await {
                    yield node?;
                }
            }
        })
    }

    /// Walk one node.
    pub fn walk(&self, node: Arc<Node>, scope: String) -> NodeStream {
        let this = self.clone();
        Box::pin(try_stream! {
            this.shared.signal.check()?;
            match &node.kind {
                NodeKind::Paragraph
                | NodeKind::Heading { .. }
                | NodeKind::Inline { .. }
                | NodeKind::Text { .. } => {
                    let rendered = this.render_inline(&node);
                    this.shared.state.add_text(&scope, rendered.text_content());
                    yield rendered;
                }
                NodeKind::Fence { .. } => {
                    let mut nodes = super::directives::code::run(this.clone(), Arc::clone(&node), scope.clone());
                    while let Some(rendered) = nodes.next().await {
                        yield rendered?;
                    }
                }
                NodeKind::Tag { name, .. } => {
                    let handler = this.shared.dispatch.handler(name).cloned();
                    match handler {
                        None => {
                            debug!(directive = %name, id = %node.id, "skipping unknown directive");
                        }
                        Some(handler) => {
                            debug!(directive = %name, id = %node.id, "dispatch");
                            this.run_hooks(HookPhase::Before, name, &node.id, &scope)?;
                            let mut nodes = match handler {
                                Handler::Builtin(builtin) => {
                                    builtin.run(this.clone(), Arc::clone(&node), scope.clone())
                                }
                                Handler::Plugin { plugin, handler } => {
                                    this.plugin_tag(plugin, handler, Arc::clone(&node), scope.clone())
                                }
                            };
                            while let Some(rendered) = nodes.next().await {
                                yield rendered?;
                            }
                            this.run_hooks(HookPhase::After, name, &node.id, &scope)?;
                        }
                    }
                }
            }
        })
    }

    /// Walk `children` in order and collect everything they yield.
    pub async fn walk_children(&self, children: &[Node], scope: &str) -> Result<Vec<RenderNode>> {
        let mut out = Vec::new();
        for child in children {
            let mut nodes = self.walk(Arc::new(child.clone()), scope.to_string());
            while let Some(rendered) = nodes.next().await {
                out.push(rendered?);
            }
        }
        Ok(out)
    }

    /// Render inline content synchronously against one variable snapshot.
    pub fn render_inline(&self, node: &Node) -> RenderNode {
        let variables = self.variables();
        let resolver = Resolver::new(&variables, &self.shared.dispatch.functions);
        render_inline(node, &resolver)
    }

    fn run_hooks(&self, phase: HookPhase, directive: &str, id: &str, scope: &str) -> Result<()> {
        if self.shared.dispatch.hooks.is_empty() {
            return Ok(());
        }
        let ctx = HookContext {
            directive: directive.to_string(),
            id: id.to_string(),
            scope: scope.to_string(),
        };
        for hooks in &self.shared.dispatch.hooks {
            let hook = match phase {
                HookPhase::Before => &hooks.before_directive,
                HookPhase::After => &hooks.after_directive,
            };
            if let Some(hook) = hook {
                hook(&ctx).map_err(|err| RuntimeError::Plugin {
                    name: directive.to_string(),
                    detail: err.to_string(),
                })?;
            }
        }
        Ok(())
    }

    fn plugin_tag(
        &self,
        plugin: String,
        handler: TagHandler,
        node: Arc<Node>,
        scope: String,
    ) -> NodeStream {
        let this = self.clone();
        Box::pin(try_stream! {
            let name = node.tag_name().unwrap_or_default().to_string();
            let ctx = TagContext {
                id: node.id.clone(),
                name: name.clone(),
                attributes: this.resolve_attributes(&node, &[])?,
                scope: scope.clone(),
                state: Arc::clone(&this.shared.state),
                signal: this.shared.signal.clone(),
            };
            let output = this
                .shared
                .signal
                .race(handler(ctx))
                .await?
                .map_err(|err| RuntimeError::Plugin {
                    name: format!("{}:{}", plugin, name),
                    detail: err.to_string(),
                })?;
            if let Some(variables) = output.variables {
                this.publish(&node.id, &scope, variables)?;
            }
            if let Some(rendered) = output.node {
                yield rendered;
            }
        })
    }
}

/// `primary` attribute, falling back to `key`.
pub fn primary_or<'a>(node: &'a Node, key: &str) -> Option<&'a AttributeValue> {
    node.attribute(key).or_else(|| node.attribute(PRIMARY_ATTRIBUTE))
}

fn frontmatter_frame(frontmatter: &Frontmatter, inputs: Map<String, Value>) -> Map<String, Value> {
    let mut frame = Map::new();
    frame.insert("input".to_string(), Value::Object(inputs));
    if let Some(title) = &frontmatter.title {
        frame.insert("title".to_string(), Value::String(title.clone()));
    }
    if let Some(description) = &frontmatter.description {
        frame.insert("description".to_string(), Value::String(description.clone()));
    }
    frame
}

fn render_inline(node: &Node, resolver: &Resolver<'_>) -> RenderNode {
    let children = || -> Vec<RenderNode> {
        node.children
            .iter()
            .map(|child| render_inline(child, resolver))
            .collect()
    };
    match &node.kind {
        NodeKind::Text { parts } => RenderNode::text(&node.id, resolver.render(parts)),
        NodeKind::Paragraph => RenderNode::new(&node.id, "p").with_children(children()),
        NodeKind::Heading { level } => {
            RenderNode::new(&node.id, format!("h{}", level)).with_children(children())
        }
        NodeKind::Inline { style } => {
            let attributes = resolver
                .resolve_all(&node.attributes, &[])
                .unwrap_or_default();
            RenderNode::new(&node.id, style.label())
                .with_attributes(attributes)
                .with_children(children())
        }
        NodeKind::Fence { language, content } => {
            let mut rendered = RenderNode::new(&node.id, "fence");
            if let Some(language) = language {
                rendered = rendered.with_attribute("language", Value::String(language.clone()));
            }
            rendered.content = Some(content.clone());
            rendered
        }
        NodeKind::Tag { name, .. } => RenderNode::new(&node.id, name.as_str()).with_children(children()),
    }
}
