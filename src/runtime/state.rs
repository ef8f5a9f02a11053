//! Runtime state manager
//!
//! Owns the scoped variable stack, the per-scope data and text registries,
//! the plugin and adapter registries, and the history chain. The current
//! [`RuntimeContext`] is immutable behind an `Arc`; every mutation clones it,
//! applies the change, installs the new context and appends a [`StateBlock`],
//! all under one write lock. Readers get cheap snapshots.
//!
//! Secrets live in a separate map and never enter the context or history.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, trace};

use super::RuntimeConfig;
use super::error::{HistoryError, RegistrationError, RegistrationResult};
use super::history::{self, GENESIS_HASH, StateBlock, StateDiff};
use super::plugin::{Adapter, Dependency, Plugin, PluginFunction};
use crate::compiler::DirectiveTable;

/// A named bundle of variables published under one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Frame id (usually the publishing block's id).
    pub id: String,
    /// Scope the frame belongs to.
    pub scope: String,
    /// Published variables.
    pub variables: Map<String, Value>,
}

impl StackFrame {
    /// Construct a frame.
    pub fn new(id: impl Into<String>, scope: impl Into<String>, variables: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            scope: scope.into(),
            variables,
        }
    }
}

/// Immutable snapshot of runtime state.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    /// Frames in publication order.
    pub stack: Vec<StackFrame>,
    /// Per-scope key/value data.
    pub data: BTreeMap<String, Map<String, Value>>,
    /// Per-scope text entries fed to `ai` prompts.
    pub text_registry: BTreeMap<String, Vec<String>>,
    /// Registered plugins by name.
    pub plugins: BTreeMap<String, Arc<Plugin>>,
    /// Registered adapters by type.
    pub adapters: BTreeMap<String, Arc<Adapter>>,
    /// Active configuration.
    pub config: RuntimeConfig,
}

struct StateInner {
    current: Arc<RuntimeContext>,
    history: Vec<StateBlock>,
}

/// Single source of truth for one execution and its nested flows.
pub struct StateManager {
    inner: RwLock<StateInner>,
    secrets: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StateManager")
            .field("frames", &inner.current.stack.len())
            .field("history", &inner.history.len())
            .finish_non_exhaustive()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl StateManager {
    /// Create a manager; the history starts with an `init` block.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_env(config, HashMap::new())
    }

    /// Create a manager with seeded secrets.
    pub fn with_env(config: RuntimeConfig, env: HashMap<String, String>) -> Self {
        let context = Arc::new(RuntimeContext {
            config,
            ..RuntimeContext::default()
        });
        let genesis = StateBlock::new(
            0,
            "init",
            GENESIS_HASH,
            Arc::clone(&context),
            StateDiff::default(),
        );
        Self {
            inner: RwLock::new(StateInner {
                current: context,
                history: vec![genesis],
            }),
            secrets: RwLock::new(env),
        }
    }

    // ========== Transitions ==========

    /// Apply a fallible change and record it. Nothing is recorded on error.
    fn transition<T, E>(
        &self,
        action: impl Into<String>,
        change: impl FnOnce(&mut RuntimeContext) -> Result<T, E>,
    ) -> Result<T, E> {
        let action = action.into();
        let mut inner = self.inner.write();
        let mut next = RuntimeContext::clone(&inner.current);
        let output = change(&mut next)?;

        let diff = StateDiff::between(&inner.current, &next);
        let next = Arc::new(next);
        let (index, previous) = match inner.history.last() {
            Some(last) => (last.index + 1, last.hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };
        trace!(%action, index, "state transition");
        let block = StateBlock::new(index, action, previous, Arc::clone(&next), diff);
        inner.history.push(block);
        inner.current = next;
        Ok(output)
    }

    fn mutate(&self, action: impl Into<String>, change: impl FnOnce(&mut RuntimeContext)) {
        let _ = self.transition::<(), Infallible>(action, |ctx| {
            change(ctx);
            Ok(())
        });
    }

    // ========== Stack ==========

    /// Insert a frame, merging into an existing frame with the same id and scope.
    pub fn push_stack(&self, frame: StackFrame) {
        let action = format!("pushStack:{}", frame.id);
        self.mutate(action, move |ctx| {
            match ctx
                .stack
                .iter_mut()
                .find(|f| f.id == frame.id && f.scope == frame.scope)
            {
                Some(existing) => existing.variables.extend(frame.variables),
                None => ctx.stack.push(frame),
            }
        });
    }

    /// Remove every frame in `scope`.
    pub fn pop_stack(&self, scope: &str) {
        self.mutate(format!("popStack:{}", scope), |ctx| {
            ctx.stack.retain(|frame| frame.scope != scope);
        });
    }

    /// Frame with the given id and scope.
    pub fn get_frame(&self, id: &str, scope: &str) -> Option<StackFrame> {
        self.inner
            .read()
            .current
            .stack
            .iter()
            .find(|f| f.id == id && f.scope == scope)
            .cloned()
    }

    /// Frame variables of one scope, keyed by frame id.
    pub fn get_scoped_variables(&self, scope: &str) -> Map<String, Value> {
        let inner = self.inner.read();
        let mut out = Map::new();
        for frame in inner.current.stack.iter().filter(|f| f.scope == scope) {
            merge_value(&mut out, &frame.id, Value::Object(frame.variables.clone()));
        }
        out
    }

    /// Merge `base`, this manager's config and every stack frame.
    ///
    /// Precedence increases in that order; objects merge key-wise and later
    /// frames win.
    pub fn get_current_config(&self, base: &RuntimeConfig) -> RuntimeConfig {
        let inner = self.inner.read();
        let own = &inner.current.config;

        let mut variables = Map::new();
        for (key, value) in base.variables.iter().chain(own.variables.iter()) {
            merge_value(&mut variables, key, value.clone());
        }
        for frame in &inner.current.stack {
            merge_value(&mut variables, &frame.id, Value::Object(frame.variables.clone()));
        }

        let mut tags = base.tags.clone();
        tags.extend(own.tags.iter().cloned());
        RuntimeConfig {
            variables,
            default_model: own.default_model.clone().or_else(|| base.default_model.clone()),
            tags,
        }
    }

    /// Merged variables with no base config.
    pub fn variables(&self) -> Map<String, Value> {
        self.get_current_config(&RuntimeConfig::default()).variables
    }

    // ========== Data and text registries ==========

    /// Store a value under `scope`.
    pub fn set_data(&self, scope: &str, key: &str, value: Value) {
        self.mutate(format!("setData:{}.{}", scope, key), |ctx| {
            ctx.data
                .entry(scope.to_string())
                .or_default()
                .insert(key.to_string(), value);
        });
    }

    /// Read a value from `scope`.
    pub fn get_data(&self, scope: &str, key: &str) -> Option<Value> {
        self.inner
            .read()
            .current
            .data
            .get(scope)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    /// Append a text entry to `scope`.
    pub fn add_text(&self, scope: &str, text: impl Into<String>) {
        let text = text.into();
        self.mutate(format!("addText:{}", scope), |ctx| {
            ctx.text_registry
                .entry(scope.to_string())
                .or_default()
                .push(text);
        });
    }

    /// Text entries of `scope` in insertion order.
    pub fn get_text(&self, scope: &str) -> Vec<String> {
        self.inner
            .read()
            .current
            .text_registry
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    // ========== Registration ==========

    /// Register a plugin after validating shape, uniqueness and dependencies.
    pub fn register_plugin(&self, plugin: Plugin) -> RegistrationResult<()> {
        plugin.validate_shape()?;
        self.check_plugin(&self.inner.read().current, &plugin)?;

        if let Some(init) = &plugin.init {
            init(self).map_err(|err| RegistrationError::InitFailed {
                plugin: plugin.name.clone(),
                detail: err.to_string(),
            })?;
        }

        let name = plugin.name.clone();
        self.transition(format!("registerPlugin:{}", name), |ctx| {
            self.check_plugin(ctx, &plugin)?;
            ctx.config.tags.extend(plugin.tags.keys().cloned());
            ctx.plugins.insert(plugin.name.clone(), Arc::new(plugin));
            Ok(())
        })?;
        debug!(plugin = %name, "registered plugin");
        Ok(())
    }

    fn check_plugin(&self, ctx: &RuntimeContext, plugin: &Plugin) -> RegistrationResult<()> {
        if ctx.plugins.contains_key(&plugin.name) {
            return Err(RegistrationError::DuplicatePlugin(plugin.name.clone()));
        }
        for existing in ctx.plugins.values() {
            if let Some(tag) = plugin.tags.keys().find(|tag| existing.tags.contains_key(*tag)) {
                return Err(RegistrationError::ReservedTag {
                    plugin: plugin.name.clone(),
                    tag: tag.clone(),
                });
            }
        }
        for dependency in &plugin.dependencies {
            let present = match dependency {
                Dependency::Plugin(name) => ctx.plugins.contains_key(name),
                Dependency::Adapter(kind) => ctx.adapters.contains_key(kind),
            };
            if !present {
                return Err(RegistrationError::MissingDependency {
                    owner: plugin.name.clone(),
                    dependency: dependency.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Register an adapter; one per type.
    pub fn register_adapter(&self, adapter: Adapter) -> RegistrationResult<()> {
        adapter.validate_shape()?;
        let kind = adapter.kind.clone();
        self.transition(format!("registerAdapter:{}", kind), |ctx| {
            if ctx.adapters.contains_key(&adapter.kind) {
                return Err(RegistrationError::DuplicateAdapter(adapter.kind.clone()));
            }
            ctx.adapters.insert(adapter.kind.clone(), Arc::new(adapter));
            Ok(())
        })?;
        debug!(adapter = %kind, "registered adapter");
        Ok(())
    }

    /// Registered plugin by name.
    pub fn plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.inner.read().current.plugins.get(name).cloned()
    }

    /// All registered plugins.
    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.inner.read().current.plugins.values().cloned().collect()
    }

    /// Registered adapter by type.
    pub fn adapter(&self, kind: &str) -> Option<Arc<Adapter>> {
        self.inner.read().current.adapters.get(kind).cloned()
    }

    /// Every plugin function by name.
    pub fn functions(&self) -> HashMap<String, PluginFunction> {
        let inner = self.inner.read();
        inner
            .current
            .plugins
            .values()
            .flat_map(|plugin| {
                plugin
                    .functions
                    .iter()
                    .map(|(name, function)| (name.clone(), Arc::clone(function)))
            })
            .collect()
    }

    /// Built-in directives plus every registered plugin's tags and functions.
    pub fn directive_table(&self) -> DirectiveTable {
        let mut table = DirectiveTable::builtin();
        for plugin in self.plugins() {
            for tag in plugin.tags.values() {
                table.register_directive(tag.schema());
            }
            for name in plugin.functions.keys() {
                table.register_function(name.clone());
            }
        }
        table
    }

    // ========== Secrets ==========

    /// Secret by key, falling back to the process environment.
    pub fn get_secret(&self, key: &str) -> Option<String> {
        if let Some(value) = self.secrets.read().get(key) {
            return Some(value.clone());
        }
        std::env::var(key).ok()
    }

    /// Store a secret.
    pub fn set_secret(&self, key: impl Into<String>, value: impl Into<String>) {
        self.secrets.write().insert(key.into(), value.into());
    }

    // ========== History ==========

    /// Current context.
    pub fn snapshot(&self) -> Arc<RuntimeContext> {
        Arc::clone(&self.inner.read().current)
    }

    /// Copy of the full history chain.
    pub fn history(&self) -> Vec<StateBlock> {
        self.inner.read().history.clone()
    }

    /// Number of history blocks.
    pub fn history_len(&self) -> usize {
        self.inner.read().history.len()
    }

    /// Context recorded by the block with `hash`.
    pub fn state_at(&self, hash: &str) -> Option<Arc<RuntimeContext>> {
        self.inner
            .read()
            .history
            .iter()
            .find(|block| block.hash == hash)
            .map(|block| Arc::clone(&block.state))
    }

    /// Recompute every hash and link in the chain.
    pub fn verify_history(&self) -> Result<(), HistoryError> {
        history::verify_chain(&self.inner.read().history)
    }
}

/// Insert `value` at `key`, merging objects key-wise.
fn merge_value(target: &mut Map<String, Value>, key: &str, value: Value) {
    match (target.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => existing.extend(incoming),
        (_, value) => {
            target.insert(key.to_string(), value);
        }
    }
}
