//! `ai` directive
//!
//! The prompt is the scope's text registry followed by the text of the
//! directive's own children. Tool calls in the response run before the result
//! is published; `structuredOutputs` triggers a second, schema-constrained
//! request.

use async_stream::try_stream;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::compiler::Node;
use crate::runtime::completion::{
    CompletionRequest, CompletionResponse, Message, Role, Tool, ToolCallRequest,
};
use crate::runtime::error::{CompletionError, Result, RuntimeError};
use crate::runtime::events::ToolCall;
use crate::runtime::interpreter::{Interpreter, NodeStream};
use crate::runtime::render::RenderNode;

/// Attributes consumed by the directive itself; the rest become request options.
const RESERVED: &[&str] = &["id", "model", "type", "input", "tools", "structuredOutputs", "system"];

const STRUCTURED_INSTRUCTION: &str = "Respond with JSON matching the provided schema.";

/// Run one completion and publish `{result, context, structuredOutputs?}`.
pub fn run(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        let model = match interp.string_attribute(&node, "model")? {
            Some(model) => model,
            None => interp
                .current_config()
                .default_model
                .ok_or_else(|| RuntimeError::directive("ai", "ai requires a model"))?,
        };

        let context = interp.state().get_text(&scope).join("\n\n");
        let instruction = node
            .children
            .iter()
            .map(|child| interp.render_inline(child).text_content())
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut messages = Vec::new();
        if let Some(system) = interp.string_attribute(&node, "system")? {
            messages.push(Message::new(Role::System, system));
        }
        if !context.trim().is_empty() {
            messages.push(Message::new(Role::User, context.clone()));
        }
        if !instruction.is_empty() {
            messages.push(Message::new(Role::User, instruction));
        }

        let tools = offered_tools(&interp, &node)?;
        let media = match interp.string_attribute(&node, "type")?.as_deref() {
            Some("vision") => media_inputs(interp.attribute(&node, "input")?)?,
            _ => Vec::new(),
        };

        let request = CompletionRequest {
            model: model.clone(),
            messages,
            tools: tools.iter().map(|tool| tool.definition.clone()).collect(),
            response_schema: None,
            media,
            credential: credential(&interp, &model),
            options: interp.resolve_attributes(&node, RESERVED)?,
        };
        debug!(id = %node.id, %model, messages = request.messages.len(), "completion request");
        let response = complete(&interp, &node.id, request.clone()).await?;

        for call in &response.tool_calls {
            interp.signal().check()?;
            let result = run_tool(&interp, &node.id, &tools, call).await?;
            interp.state().add_text(
                &scope,
                format!("Tool {}({}) returned {}", call.name, call.arguments, result),
            );
        }

        let structured = match interp.attribute(&node, "structuredOutputs")? {
            None | Some(Value::Null) => None,
            Some(schema) => {
                let schema = normalize_schema(schema)?;
                Some(structured_output(&interp, &node.id, request, &response, schema).await?)
            }
        };

        interp.state().add_text(&scope, response.text.clone());

        let mut frame = Map::new();
        frame.insert("result".into(), Value::String(response.text.clone()));
        frame.insert("context".into(), Value::String(context));
        if let Some(structured) = &structured {
            frame.insert("structuredOutputs".into(), structured.clone());
        }
        interp.publish(&node.id, &scope, frame)?;

        let mut rendered = RenderNode::new(&node.id, "ai")
            .with_attribute("model", Value::String(model));
        if let Some(structured) = structured {
            rendered = rendered.with_attribute("structuredOutputs", structured);
        }
        rendered.content = Some(response.text);
        yield rendered;
    })
}

/// `<PROVIDER>_API_KEY` for a `provider/model` name.
pub fn credential_key(model: &str) -> Option<String> {
    let (provider, _) = model.split_once('/')?;
    Some(format!("{}_API_KEY", provider.to_ascii_uppercase().replace('-', "_")))
}

fn credential(interp: &Interpreter, model: &str) -> Option<String> {
    credential_key(model).and_then(|key| interp.state().get_secret(&key))
}

/// Tools from the execution options, filtered by a `tools` list when present.
fn offered_tools(interp: &Interpreter, node: &Node) -> Result<Vec<Tool>> {
    let all = interp.tools();
    match interp.attribute(node, "tools")? {
        None | Some(Value::Null) => Ok(all.to_vec()),
        Some(Value::Array(names)) => {
            let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            Ok(all
                .iter()
                .filter(|tool| names.contains(&tool.name()))
                .cloned()
                .collect())
        }
        Some(Value::String(name)) => Ok(all.iter().filter(|tool| tool.name() == name).cloned().collect()),
        Some(_) => Err(RuntimeError::directive("ai", "tools must be a list of tool names")),
    }
}

/// Media descriptors from the `input` attribute of a vision request.
fn media_inputs(input: Option<Value>) -> Result<Vec<Value>> {
    match input {
        Some(Value::Array(items)) if !items.is_empty() => Ok(items),
        Some(Value::Object(media)) => Ok(vec![Value::Object(media)]),
        Some(Value::String(src)) => Ok(vec![json!({ "src": src })]),
        _ => Err(RuntimeError::directive("ai", "vision requests require media input")),
    }
}

/// Accept either a JSON schema or a `{field: type}` shorthand.
fn normalize_schema(schema: Value) -> Result<Value> {
    let schema = match schema {
        Value::String(text) => serde_json::from_str(&text).map_err(|err| {
            RuntimeError::directive("ai", format!("structuredOutputs is not valid JSON: {}", err))
        })?,
        other => other,
    };
    match schema {
        Value::Object(map) if map.contains_key("type") => Ok(Value::Object(map)),
        Value::Object(fields) => {
            let properties: Map<String, Value> = fields
                .into_iter()
                .map(|(name, kind)| {
                    let property = match kind {
                        Value::String(kind) => json!({ "type": kind }),
                        other => other,
                    };
                    (name, property)
                })
                .collect();
            let required: Vec<Value> = properties.keys().cloned().map(Value::String).collect();
            Ok(json!({ "type": "object", "properties": properties, "required": required }))
        }
        _ => Err(RuntimeError::directive("ai", "structuredOutputs must be an object schema")),
    }
}

async fn complete(
    interp: &Interpreter,
    id: &str,
    request: CompletionRequest,
) -> Result<CompletionResponse> {
    interp
        .signal()
        .race(interp.completion().complete(request))
        .await?
        .map_err(|source| RuntimeError::Completion {
            directive: id.to_string(),
            source,
        })
}

async fn run_tool(
    interp: &Interpreter,
    id: &str,
    tools: &[Tool],
    call: &ToolCallRequest,
) -> Result<Value> {
    let failed = |detail: String| RuntimeError::Tool {
        name: call.name.clone(),
        detail,
    };
    if let Some(callback) = interp.events().on_tool_call.clone() {
        let notice = ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            directive_id: id.to_string(),
        };
        interp
            .signal()
            .race(callback(notice))
            .await?
            .map_err(|err| failed(err.to_string()))?;
    }
    let tool = tools
        .iter()
        .find(|tool| tool.name() == call.name)
        .ok_or_else(|| failed("tool is not available".to_string()))?;
    interp
        .signal()
        .race((tool.execute)(call.arguments.clone()))
        .await?
        .map_err(|err| failed(err.to_string()))
}

async fn structured_output(
    interp: &Interpreter,
    id: &str,
    mut request: CompletionRequest,
    first: &CompletionResponse,
    schema: Value,
) -> Result<Value> {
    request
        .messages
        .push(Message::new(Role::Assistant, first.text.clone()));
    request
        .messages
        .push(Message::new(Role::User, STRUCTURED_INSTRUCTION));
    request.tools.clear();
    request.response_schema = Some(schema);

    let response = complete(interp, id, request).await?;
    if let Some(value) = response.structured {
        return Ok(value);
    }
    serde_json::from_str(&response.text).map_err(|err| RuntimeError::Completion {
        directive: id.to_string(),
        source: CompletionError::InvalidResponse(format!("structured output is not JSON: {}", err)),
    })
}
