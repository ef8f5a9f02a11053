//! Control flow: `loop`, `if`/`else`, `group`, `parallel`

use async_stream::try_stream;
use futures::TryStreamExt;
use futures::future::try_join_all;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::compiler::{AttributeValue, Node, PRIMARY_ATTRIBUTE};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::interpreter::{Interpreter, NodeStream, primary_or};
use crate::runtime::render::RenderNode;
use crate::runtime::value::{as_number, is_truthy, to_text};

// ========== loop ==========

enum LoopMode {
    Count(usize),
    Items { items: Vec<Value>, alias: String },
    Condition(AttributeValue),
}

impl LoopMode {
    fn resolve(interp: &Interpreter, node: &Node) -> Result<Self> {
        let count = node.attribute("count");
        let items = node.attribute("items");
        let condition = node.attribute(PRIMARY_ATTRIBUTE);
        match (count, items, condition) {
            (Some(count), None, None) => {
                let value = interp.evaluate(count)?;
                let n = as_number(&value)
                    .filter(|n| n.is_finite() && *n >= 0.0)
                    .ok_or_else(|| {
                        RuntimeError::directive(
                            "loop",
                            format!("count must be a non-negative number, got '{}'", to_text(&value)),
                        )
                    })?;
                Ok(LoopMode::Count(n.floor() as usize))
            }
            (None, Some(items), None) => {
                let items = match interp.evaluate(items)? {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => {
                        return Err(RuntimeError::directive(
                            "loop",
                            format!("items must be a list, got '{}'", to_text(&other)),
                        ));
                    }
                };
                let alias = interp
                    .string_attribute(node, "as")?
                    .ok_or_else(|| RuntimeError::directive("loop", "looping over items requires `as`"))?;
                Ok(LoopMode::Items { items, alias })
            }
            (None, None, Some(condition)) => Ok(LoopMode::Condition(condition.clone())),
            _ => Err(RuntimeError::directive(
                "loop",
                "exactly one of count, items or a condition is required",
            )),
        }
    }
}

/// Iterate the children; publishes `{index, count, isFirst, isLast, item?}`.
pub fn run_loop(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        let mode = LoopMode::resolve(&interp, &node)?;
        let mut index = 0usize;
        loop {
            interp.signal().check()?;
            let (count, item) = match &mode {
                LoopMode::Count(n) => {
                    if index >= *n {
                        break;
                    }
                    (Some(*n), None)
                }
                LoopMode::Items { items, .. } => {
                    if index >= items.len() {
                        break;
                    }
                    (Some(items.len()), Some(items[index].clone()))
                }
                LoopMode::Condition(condition) => {
                    if !is_truthy(&interp.evaluate(condition)?) {
                        break;
                    }
                    (None, None)
                }
            };

            let mut frame = Map::new();
            frame.insert("index".into(), Value::from(index));
            frame.insert("count".into(), count.map(Value::from).unwrap_or(Value::Null));
            frame.insert("isFirst".into(), Value::Bool(index == 0));
            frame.insert("isLast".into(), Value::Bool(count.is_some_and(|n| index + 1 == n)));
            if let Some(item) = &item {
                frame.insert("item".into(), item.clone());
            }
            interp.publish(&node.id, &scope, frame)?;

            if let (LoopMode::Items { alias, .. }, Some(item)) = (&mode, item) {
                let variables = match item {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("value".into(), other);
                        map
                    }
                };
                interp.publish(alias, &scope, variables)?;
            }

            let children = interp.walk_children(&node.children, &scope).await?;
            yield RenderNode::new(&node.id, "loop")
                .with_attribute("index", Value::from(index))
                .with_children(children);
            index += 1;
        }
    })
}

// ========== if / else ==========

struct Branch<'a> {
    /// `None` for a bare `else`.
    condition: Option<&'a AttributeValue>,
    children: Vec<Node>,
}

fn branches(node: &Node) -> Vec<Branch<'_>> {
    let mut out = vec![Branch {
        condition: primary_or(node, "condition"),
        children: Vec::new(),
    }];
    for child in &node.children {
        if child.is_tag("else") {
            out.push(Branch {
                condition: primary_or(child, "condition"),
                children: Vec::new(),
            });
        } else if let Some(current) = out.last_mut() {
            current.children.push(child.clone());
        }
    }
    out
}

/// Only `else` branches may omit their condition.
fn check_head(chain: &[Branch<'_>]) -> Result<()> {
    match chain.first() {
        Some(head) if head.condition.is_none() => Err(RuntimeError::directive(
            "if",
            "if requires a condition",
        )),
        _ => Ok(()),
    }
}

/// Run the first truthy branch; publishes `{condition, isTrue, branch}`.
pub fn run_if(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        let chain = branches(&node);
        check_head(&chain)?;
        let mut selected = None;
        let mut condition = Value::Null;
        for (index, branch) in chain.iter().enumerate() {
            interp.signal().check()?;
            let truthy = match branch.condition {
                Some(expr) => {
                    let value = interp.evaluate(expr)?;
                    let truthy = is_truthy(&value);
                    if index == 0 || truthy {
                        condition = value;
                    }
                    truthy
                }
                None => true,
            };
            if truthy {
                selected = Some(index);
                break;
            }
        }

        let mut frame = Map::new();
        frame.insert("condition".into(), condition);
        frame.insert("isTrue".into(), Value::Bool(selected.is_some()));
        frame.insert("branch".into(), selected.map(Value::from).unwrap_or(Value::Null));
        interp.publish(&node.id, &scope, frame)?;

        if let Some(index) = selected {
            let children = interp.walk_children(&chain[index].children, &scope).await?;
            yield RenderNode::new(&node.id, "if")
                .with_attribute("branch", Value::from(index))
                .with_children(children);
        }
    })
}

// ========== group / parallel ==========

/// Walk the children in order inside one wrapper.
pub fn run_group(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        let children = interp.walk_children(&node.children, &scope).await?;
        yield RenderNode::new(&node.id, "group").with_children(children);
    })
}

/// Drive every child subtree concurrently; output keeps declaration order.
pub fn run_parallel(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        interp.signal().check()?;
        let branches = node.children.iter().map(|child| {
            let interp = interp.clone();
            let child = Arc::new(child.clone());
            let scope = scope.clone();
            async move { interp.walk(child, scope).try_collect::<Vec<_>>().await }
        });
        let results = interp.signal().race(try_join_all(branches)).await??;
        interp.signal().check()?;
        yield RenderNode::new(&node.id, "parallel")
            .with_children(results.into_iter().flatten().collect());
    })
}
