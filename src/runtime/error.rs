//! Error types for the runtime
//!
//! Domain errors use thiserror. User-supplied callbacks (tools, adapters,
//! plugin handlers, input collection) return `anyhow::Result` and are wrapped
//! with directive context when they cross into the interpreter.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why an execution stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The caller aborted, optionally with a message.
    User(Option<String>),
    /// The execution deadline elapsed.
    Timeout,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::User(Some(message)) => write!(f, "{}", message),
            AbortReason::User(None) => write!(f, "aborted by caller"),
            AbortReason::Timeout => write!(f, "execution timed out"),
        }
    }
}

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The abort signal fired
    #[error("Execution aborted: {0}")]
    Aborted(AbortReason),

    /// A directive's attributes cannot be satisfied
    #[error("Invalid '{directive}' directive: {detail}")]
    Directive {
        /// Directive name
        directive: String,
        /// What was wrong
        detail: String,
    },

    /// A nested flow failed
    #[error("Failed to execute flow '{path}': {source}")]
    Flow {
        /// Flow source path
        path: String,
        /// Underlying failure
        #[source]
        source: Box<RuntimeError>,
    },

    /// A flow's `src` is not in the file map
    #[error("Flow file '{0}' not found")]
    FlowNotFound(String),

    /// Flows nested too deeply
    #[error("Flow nesting exceeds the maximum depth of {0}")]
    FlowDepthExceeded(usize),

    /// The completion service failed
    #[error("Completion failed in '{directive}': {source}")]
    Completion {
        /// Directive id
        directive: String,
        /// Underlying failure
        #[source]
        source: CompletionError,
    },

    /// A tool callback failed
    #[error("Tool '{name}' failed: {detail}")]
    Tool {
        /// Tool name
        name: String,
        /// Failure detail
        detail: String,
    },

    /// A plugin handler or hook failed
    #[error("Plugin '{name}' failed: {detail}")]
    Plugin {
        /// Plugin or directive name
        name: String,
        /// Failure detail
        detail: String,
    },

    /// The user-input callback failed
    #[error("User input failed: {0}")]
    UserInput(String),

    /// Plugin or adapter registration was rejected
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),
}

impl RuntimeError {
    /// Shorthand for a directive error.
    pub fn directive(directive: impl Into<String>, detail: impl Into<String>) -> Self {
        RuntimeError::Directive {
            directive: directive.into(),
            detail: detail.into(),
        }
    }

    /// Whether this error (or the error a flow wraps) is an abort.
    pub fn is_abort(&self) -> bool {
        self.abort_reason().is_some()
    }

    /// The abort reason, looking through flow wrapping.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            RuntimeError::Aborted(reason) => Some(reason),
            RuntimeError::Flow { source, .. } => source.abort_reason(),
            _ => None,
        }
    }
}

/// Convenience result alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Plugin and adapter registration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// A plugin with this name is already registered
    #[error("Plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    /// An adapter with this type is already registered
    #[error("Adapter for type '{0}' is already registered")]
    DuplicateAdapter(String),

    /// A declared dependency is not registered
    #[error("'{owner}' depends on missing {dependency}")]
    MissingDependency {
        /// Plugin declaring the dependency
        owner: String,
        /// Description of the missing dependency
        dependency: String,
    },

    /// The plugin or adapter shape is invalid
    #[error("Invalid schema for '{name}': {detail}")]
    InvalidSchema {
        /// Plugin name or adapter type
        name: String,
        /// What was wrong
        detail: String,
    },

    /// A plugin tag would shadow a built-in directive or another plugin's tag
    #[error("Plugin '{plugin}' cannot register reserved tag '{tag}'")]
    ReservedTag {
        /// Plugin name
        plugin: String,
        /// Tag name
        tag: String,
    },

    /// The plugin's init hook failed
    #[error("Plugin '{plugin}' failed to initialize: {detail}")]
    InitFailed {
        /// Plugin name
        plugin: String,
        /// Failure detail
        detail: String,
    },
}

/// Convenience result alias for registration
pub type RegistrationResult<T> = std::result::Result<T, RegistrationError>;

/// Completion service errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The request failed upstream
    #[error("Completion request failed: {0}")]
    Request(String),

    /// No credential available for the provider
    #[error("Missing credentials: secret '{0}' is not set")]
    MissingCredentials(String),

    /// The response could not be used
    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),
}

/// History verification errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// A block's previous hash does not match its predecessor
    #[error("Block {index} links to '{found}', expected '{expected}'")]
    BrokenLink {
        /// Block index
        index: u64,
        /// Expected previous hash
        expected: String,
        /// Recorded previous hash
        found: String,
    },

    /// A block's recorded hash does not match its recomputed hash
    #[error("Block {index} hash mismatch: recorded '{recorded}', computed '{computed}'")]
    HashMismatch {
        /// Block index
        index: u64,
        /// Hash stored on the block
        recorded: String,
        /// Hash recomputed from content
        computed: String,
    },
}
