//! Fenced code blocks
//!
//! The code is always added to the scope's text registry. When a `"code"`
//! adapter is registered its `execute` operation runs with
//! `{language, code, id}` and the outcome is published under the fence id.

use async_stream::try_stream;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::compiler::{Node, NodeKind};
use crate::runtime::interpreter::{Interpreter, NodeStream};

/// Adapter type consulted for code execution.
pub const CODE_ADAPTER: &str = "code";

/// Adapter operation called for each fence.
pub const EXECUTE_OPERATION: &str = "execute";

/// Register the fence and run it through the code adapter when present.
pub fn run(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        let (language, code) = match &node.kind {
            NodeKind::Fence { language, content } => (language.clone(), content.clone()),
            _ => (None, String::new()),
        };
        interp.state().add_text(&scope, code.clone());

        let mut rendered = interp.render_inline(&node);
        let handler = interp
            .state()
            .adapter(CODE_ADAPTER)
            .and_then(|adapter| adapter.handler(EXECUTE_OPERATION).cloned());
        if let Some(handler) = handler {
            debug!(id = %node.id, language = ?language, "executing fence");
            let input = json!({
                "language": language,
                "code": code,
                "id": node.id,
            });
            let outcome = interp.signal().race(handler(input)).await?;
            let mut frame = Map::new();
            match outcome {
                Ok(result) => {
                    rendered = rendered.with_attribute("result", result.clone());
                    frame.insert("result".into(), result);
                }
                Err(err) => {
                    let message = Value::String(err.to_string());
                    rendered = rendered.with_attribute("error", message.clone());
                    frame.insert("error".into(), message);
                }
            }
            interp.publish(&node.id, &scope, frame)?;
        }
        yield rendered;
    })
}
