//! Directive table consulted during validation
//!
//! Holds the built-in directive schemas plus whatever plugins contribute. The
//! runtime builds one table per execution and hands it to the compiler so
//! nested flows see the same directives and functions as their parent.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Directives handled by the interpreter itself.
pub const BUILTIN_DIRECTIVES: &[&str] = &[
    "ai", "loop", "if", "else", "set", "input", "media", "flow", "group", "parallel",
];

/// Functions evaluated by the interpreter itself.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "equals", "notEquals", "and", "or", "not", "default", "gt", "gte", "lt", "lte", "includes",
    "length", "join", "concat",
];

/// Attribute declaration inside a directive schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    /// Missing required attributes are compile errors.
    #[serde(default)]
    pub required: bool,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AttributeSpec {
    /// Required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            description: None,
        }
    }

    /// Optional attribute.
    pub fn optional() -> Self {
        Self::default()
    }
}

/// Compile-time view of one directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveSchema {
    /// Directive name.
    pub name: String,
    /// Declared attributes.
    pub attributes: BTreeMap<String, AttributeSpec>,
    /// Provided by the interpreter rather than a plugin.
    pub builtin: bool,
}

/// Known directives and functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveTable {
    directives: BTreeMap<String, DirectiveSchema>,
    functions: BTreeSet<String>,
}

impl Default for DirectiveTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DirectiveTable {
    /// Table with only the built-in directives and functions.
    pub fn builtin() -> Self {
        let directives = BUILTIN_DIRECTIVES
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    DirectiveSchema {
                        name: name.to_string(),
                        attributes: BTreeMap::new(),
                        builtin: true,
                    },
                )
            })
            .collect();
        let functions = BUILTIN_FUNCTIONS.iter().map(|f| f.to_string()).collect();
        Self {
            directives,
            functions,
        }
    }

    /// Add a plugin directive. Returns `false` if the name is already taken.
    pub fn register_directive(&mut self, schema: DirectiveSchema) -> bool {
        if self.directives.contains_key(&schema.name) {
            return false;
        }
        self.directives.insert(schema.name.clone(), schema);
        true
    }

    /// Add a plugin function name.
    pub fn register_function(&mut self, name: impl Into<String>) {
        self.functions.insert(name.into());
    }

    /// Schema for a directive name.
    pub fn get(&self, name: &str) -> Option<&DirectiveSchema> {
        self.directives.get(name)
    }

    /// Whether a name is a built-in directive.
    pub fn is_builtin(name: &str) -> bool {
        BUILTIN_DIRECTIVES.contains(&name)
    }

    /// Whether a function name is known.
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    /// All directive names.
    pub fn directive_names(&self) -> impl Iterator<Item = &str> {
        self.directives.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_directive_rejects_duplicates() {
        let mut table = DirectiveTable::builtin();
        let schema = DirectiveSchema {
            name: "chart".into(),
            attributes: BTreeMap::from([("data".to_string(), AttributeSpec::required())]),
            builtin: false,
        };
        assert!(table.register_directive(schema.clone()));
        assert!(!table.register_directive(schema));
        assert!(!table.register_directive(DirectiveSchema {
            name: "loop".into(),
            attributes: BTreeMap::new(),
            builtin: false,
        }));
        assert!(table.get("chart").is_some_and(|s| !s.builtin));
    }

    #[test]
    fn test_builtin_functions_known() {
        let table = DirectiveTable::builtin();
        assert!(table.has_function("equals"));
        assert!(!table.has_function("launch"));
    }
}
