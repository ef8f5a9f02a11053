//! Built-in directive handlers
//!
//! Each handler takes an [`Interpreter`] handle, the directive node and the
//! scope it runs in, and returns a [`NodeStream`]. Handlers validate their
//! attributes at run time too, since compile errors never stop execution.

pub mod ai;
pub mod code;
pub mod control;
pub mod data;
pub mod flow;

pub use flow::FlowFiles;

use futures::StreamExt;
use std::sync::Arc;

use super::interpreter::{Interpreter, NodeStream};
use crate::compiler::Node;

/// Directives the interpreter handles itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `ai`: completion request.
    Ai,
    /// `loop`: count, items or condition iteration.
    Loop,
    /// `if`: conditional branches.
    If,
    /// `else`: branch marker inside `if`.
    Else,
    /// `set`: publish attributes.
    Set,
    /// `input`: ask the user for a value.
    Input,
    /// `media`: media reference.
    Media,
    /// `flow`: run another document.
    Flow,
    /// `group`: sequential wrapper.
    Group,
    /// `parallel`: concurrent children.
    Parallel,
}

impl Builtin {
    /// Every built-in directive.
    pub const ALL: [Builtin; 10] = [
        Builtin::Ai,
        Builtin::Loop,
        Builtin::If,
        Builtin::Else,
        Builtin::Set,
        Builtin::Input,
        Builtin::Media,
        Builtin::Flow,
        Builtin::Group,
        Builtin::Parallel,
    ];

    /// Tag name.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Ai => "ai",
            Builtin::Loop => "loop",
            Builtin::If => "if",
            Builtin::Else => "else",
            Builtin::Set => "set",
            Builtin::Input => "input",
            Builtin::Media => "media",
            Builtin::Flow => "flow",
            Builtin::Group => "group",
            Builtin::Parallel => "parallel",
        }
    }

    /// Built-in for a tag name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|builtin| builtin.name() == name)
    }

    /// Run this directive.
    pub fn run(self, interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
        match self {
            Builtin::Ai => ai::run(interp, node, scope),
            Builtin::Loop => control::run_loop(interp, node, scope),
            Builtin::If => control::run_if(interp, node, scope),
            // Only meaningful inside `if`, which consumes it.
            Builtin::Else => futures::stream::empty().boxed(),
            Builtin::Set => data::run_set(interp, node, scope),
            Builtin::Input => data::run_input(interp, node, scope),
            Builtin::Media => data::run_media(interp, node, scope),
            Builtin::Flow => flow::run(interp, node, scope),
            Builtin::Group => control::run_group(interp, node, scope),
            Builtin::Parallel => control::run_parallel(interp, node, scope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::directives::BUILTIN_DIRECTIVES;

    #[test]
    fn test_builtins_match_compiler_table() {
        let names: Vec<&str> = Builtin::ALL.iter().map(|b| b.name()).collect();
        assert_eq!(names, BUILTIN_DIRECTIVES);
        assert_eq!(Builtin::from_name("parallel"), Some(Builtin::Parallel));
        assert_eq!(Builtin::from_name("chart"), None);
    }
}
