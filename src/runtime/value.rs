//! Attribute resolution and built-in functions
//!
//! Attribute values stay symbolic in the tree. A [`Resolver`] turns them into
//! `serde_json::Value`s against the merged runtime variables at the point of
//! use. Missing paths resolve to `null`.

use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::warn;

use super::error::{Result, RuntimeError};
use super::plugin::PluginFunction;
use crate::compiler::{AttributeValue, FunctionCall, Literal, TextPart, VariableReference};

/// Resolves attribute values against one snapshot of variables.
pub struct Resolver<'a> {
    variables: &'a Map<String, Value>,
    functions: &'a HashMap<String, PluginFunction>,
}

impl<'a> Resolver<'a> {
    /// Resolver over merged variables and plugin functions.
    pub fn new(
        variables: &'a Map<String, Value>,
        functions: &'a HashMap<String, PluginFunction>,
    ) -> Self {
        Self {
            variables,
            functions,
        }
    }

    /// Resolve one attribute value.
    pub fn resolve(&self, value: &AttributeValue) -> Result<Value> {
        match value {
            AttributeValue::Literal(literal) => Ok(literal_value(literal)),
            AttributeValue::Variable(reference) => Ok(self.lookup(reference)),
            AttributeValue::Template(parts) => Ok(Value::String(self.render(parts))),
            AttributeValue::List(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            AttributeValue::Nested(entries) => {
                let mut out = Map::new();
                for (key, item) in entries {
                    out.insert(key.clone(), self.resolve(item)?);
                }
                Ok(Value::Object(out))
            }
            AttributeValue::Function(call) => self.call(call),
        }
    }

    /// Resolve every attribute of a node except `skip`.
    pub fn resolve_all<'k>(
        &self,
        attributes: impl IntoIterator<Item = (&'k String, &'k AttributeValue)>,
        skip: &[&str],
    ) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for (key, value) in attributes {
            if skip.contains(&key.as_str()) {
                continue;
            }
            out.insert(key.clone(), self.resolve(value)?);
        }
        Ok(out)
    }

    /// Value at a reference's path, or `null`.
    pub fn lookup(&self, reference: &VariableReference) -> Value {
        let Some(mut current) = self.variables.get(&reference.name) else {
            return Value::Null;
        };
        for segment in &reference.path {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Value::Null,
            }
        }
        current.clone()
    }

    /// Render text parts to a string; `null` renders as empty.
    pub fn render(&self, parts: &[TextPart]) -> String {
        let mut out = String::new();
        for part in parts {
            match part {
                TextPart::Literal(text) => out.push_str(text),
                TextPart::Variable(reference) => out.push_str(&to_text(&self.lookup(reference))),
            }
        }
        out
    }

    fn call(&self, call: &FunctionCall) -> Result<Value> {
        let args = call
            .args
            .iter()
            .map(|arg| self.resolve(arg))
            .collect::<Result<Vec<_>>>()?;

        if let Some(function) = self.functions.get(&call.name) {
            return function(&args).map_err(|err| RuntimeError::Plugin {
                name: call.name.clone(),
                detail: err.to_string(),
            });
        }
        match call_builtin(&call.name, &args) {
            Some(value) => Ok(value),
            None => {
                warn!(function = %call.name, "unknown function resolves to null");
                Ok(Value::Null)
            }
        }
    }
}

/// Convert a literal to a JSON value. Integral numbers become integers.
pub fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
        Literal::Number(n) => number_value(*n),
    }
}

/// JSON number for `n`; integral values become integers, NaN becomes `null`.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// JavaScript-style truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form used when interpolating a value.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Numeric view of a value (strings are parsed).
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_))
        | (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

/// Evaluate a built-in function. `None` when the name is not built in.
pub fn call_builtin(name: &str, args: &[Value]) -> Option<Value> {
    static NULL: Value = Value::Null;
    let arg = |i: usize| args.get(i).unwrap_or(&NULL);
    let ordered = |accept: fn(Ordering) -> bool| {
        Value::Bool(compare(arg(0), arg(1)).is_some_and(accept))
    };
    let value = match name {
        "equals" => Value::Bool(values_equal(arg(0), arg(1))),
        "notEquals" => Value::Bool(!values_equal(arg(0), arg(1))),
        "and" => Value::Bool(!args.is_empty() && args.iter().all(is_truthy)),
        "or" => Value::Bool(args.iter().any(is_truthy)),
        "not" => Value::Bool(!is_truthy(arg(0))),
        "default" => args
            .iter()
            .find(|v| !v.is_null() && v.as_str() != Some(""))
            .cloned()
            .unwrap_or(Value::Null),
        "gt" => ordered(Ordering::is_gt),
        "gte" => ordered(Ordering::is_ge),
        "lt" => ordered(Ordering::is_lt),
        "lte" => ordered(Ordering::is_le),
        "includes" => Value::Bool(match arg(0) {
            Value::Array(items) => items.iter().any(|item| values_equal(item, arg(1))),
            Value::String(s) => s.contains(&to_text(arg(1))),
            Value::Object(map) => map.contains_key(&to_text(arg(1))),
            _ => false,
        }),
        "length" => Value::from(match arg(0) {
            Value::Array(items) => items.len(),
            Value::String(s) => s.chars().count(),
            Value::Object(map) => map.len(),
            _ => 0,
        }),
        "join" => {
            let separator = match args.get(1) {
                Some(sep) => to_text(sep),
                None => ",".to_string(),
            };
            match arg(0) {
                Value::Array(items) => Value::String(
                    items.iter().map(to_text).collect::<Vec<_>>().join(&separator),
                ),
                other => Value::String(to_text(other)),
            }
        }
        "concat" => {
            if !args.is_empty() && args.iter().all(Value::is_array) {
                Value::Array(
                    args.iter()
                        .filter_map(Value::as_array)
                        .flatten()
                        .cloned()
                        .collect(),
                )
            } else {
                Value::String(args.iter().map(to_text).collect())
            }
        }
        _ => return None,
    };
    Some(value)
}
