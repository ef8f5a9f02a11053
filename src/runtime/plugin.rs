//! Plugin and adapter extension points
//!
//! A [`Plugin`] contributes directive handlers ([`TagSpec`]), functions usable
//! in attribute expressions, and optional lifecycle hooks. An [`Adapter`]
//! provides named async operations for one backend type, such as `"code"`
//! for fenced code evaluation. Handlers are stored as `Arc<dyn Fn>` so the
//! registry can be cloned into every runtime context cheaply.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::cancel::AbortSignal;
use super::error::{RegistrationError, RegistrationResult};
use super::render::RenderNode;
use super::state::StateManager;
use crate::compiler::{AttributeSpec, DirectiveSchema, DirectiveTable};

/// Function callable from attribute expressions.
pub type PluginFunction = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Async handler for a plugin directive.
pub type TagHandler =
    Arc<dyn Fn(TagContext) -> BoxFuture<'static, anyhow::Result<TagOutput>> + Send + Sync>;

/// Async adapter operation.
pub type AdapterHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Hook run around every directive dispatch.
pub type DirectiveHook = Arc<dyn Fn(&HookContext) -> anyhow::Result<()> + Send + Sync>;

/// Plugin initializer, run once at registration.
pub type PluginInit = Arc<dyn Fn(&StateManager) -> anyhow::Result<()> + Send + Sync>;

/// What a plugin tag handler sees.
pub struct TagContext {
    /// Block id.
    pub id: String,
    /// Directive name.
    pub name: String,
    /// Attributes resolved against the current variables.
    pub attributes: Map<String, Value>,
    /// Scope the directive runs in.
    pub scope: String,
    /// Shared state.
    pub state: Arc<StateManager>,
    /// Execution abort signal.
    pub signal: AbortSignal,
}

/// What a plugin tag handler returns.
#[derive(Debug, Clone, Default)]
pub struct TagOutput {
    /// Published under the block id when present.
    pub variables: Option<Map<String, Value>>,
    /// Yielded when present.
    pub node: Option<RenderNode>,
}

/// Context passed to directive hooks.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Directive name.
    pub directive: String,
    /// Block id.
    pub id: String,
    /// Scope the directive runs in.
    pub scope: String,
}

/// Optional directive hooks.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Before each directive dispatch.
    pub before_directive: Option<DirectiveHook>,
    /// After each directive completes without error.
    pub after_directive: Option<DirectiveHook>,
}

/// A dependency a plugin needs registered first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Another plugin by name.
    Plugin(String),
    /// An adapter by type.
    Adapter(String),
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Plugin(name) => write!(f, "plugin '{}'", name),
            Dependency::Adapter(kind) => write!(f, "adapter '{}'", kind),
        }
    }
}

/// Directive contributed by a plugin.
#[derive(Clone)]
pub struct TagSpec {
    /// Directive name.
    pub name: String,
    /// Attribute declarations for compile-time validation.
    pub attributes: BTreeMap<String, AttributeSpec>,
    /// Runtime handler.
    pub handler: TagHandler,
}

impl TagSpec {
    /// Directive `name` handled by an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TagContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TagOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
        }
    }

    /// Declare a required attribute.
    pub fn require(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.insert(attribute.into(), AttributeSpec::required());
        self
    }

    /// Declare an optional attribute.
    pub fn optional(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.insert(attribute.into(), AttributeSpec::optional());
        self
    }

    /// Compile-time schema.
    pub fn schema(&self) -> DirectiveSchema {
        DirectiveSchema {
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            builtin: false,
        }
    }
}

impl fmt::Debug for TagSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagSpec")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

/// Third-party extension bundle.
#[derive(Clone)]
pub struct Plugin {
    /// Unique plugin name.
    pub name: String,
    /// Plugin version string.
    pub version: String,
    /// Contributed directives.
    pub tags: BTreeMap<String, TagSpec>,
    /// Contributed functions.
    pub functions: HashMap<String, PluginFunction>,
    /// Registrations required beforehand.
    pub dependencies: Vec<Dependency>,
    /// Run once at registration.
    pub init: Option<PluginInit>,
    /// Directive hooks.
    pub hooks: Option<Hooks>,
}

impl Plugin {
    /// Empty plugin.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tags: BTreeMap::new(),
            functions: HashMap::new(),
            dependencies: Vec::new(),
            init: None,
            hooks: None,
        }
    }

    /// Add a directive.
    pub fn with_tag(mut self, tag: TagSpec) -> Self {
        self.tags.insert(tag.name.clone(), tag);
        self
    }

    /// Add a function.
    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    /// Declare a dependency.
    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Set the initializer.
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&StateManager) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(init));
        self
    }

    /// Set directive hooks.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Check names before registration.
    pub fn validate_shape(&self) -> RegistrationResult<()> {
        let invalid = |detail: &str| RegistrationError::InvalidSchema {
            name: self.name.clone(),
            detail: detail.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("plugin name must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("plugin version must not be empty"));
        }
        for (key, tag) in &self.tags {
            if key != &tag.name || !is_identifier(&tag.name) {
                return Err(invalid(&format!("invalid tag name '{}'", tag.name)));
            }
            if DirectiveTable::is_builtin(&tag.name) {
                return Err(RegistrationError::ReservedTag {
                    plugin: self.name.clone(),
                    tag: tag.name.clone(),
                });
            }
        }
        for name in self.functions.keys() {
            if !is_identifier(name) {
                return Err(invalid(&format!("invalid function name '{}'", name)));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("tags", &self.tags.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Backend for one adapter type.
#[derive(Clone)]
pub struct Adapter {
    /// Adapter type key, unique per runtime (e.g. `"code"`).
    pub kind: String,
    /// Operations by name.
    pub handlers: HashMap<String, AdapterHandler>,
}

impl Adapter {
    /// Adapter with no operations.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            handlers: HashMap::new(),
        }
    }

    /// Add an async operation.
    pub fn with_handler<F, Fut>(mut self, operation: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(operation.into(), Arc::new(move |input| handler(input).boxed()));
        self
    }

    /// Look up an operation.
    pub fn handler(&self, operation: &str) -> Option<&AdapterHandler> {
        self.handlers.get(operation)
    }

    /// Check the shape before registration.
    pub fn validate_shape(&self) -> RegistrationResult<()> {
        if self.kind.trim().is_empty() {
            return Err(RegistrationError::InvalidSchema {
                name: self.kind.clone(),
                detail: "adapter type must not be empty".to_string(),
            });
        }
        if self.handlers.is_empty() {
            return Err(RegistrationError::InvalidSchema {
                name: self.kind.clone(),
                detail: "adapter must provide at least one handler".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("kind", &self.kind)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
