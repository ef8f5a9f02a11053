//! Value directives: `set`, `input`, `media`

use async_stream::try_stream;
use futures::{StreamExt, TryStreamExt, future, stream};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::compiler::Node;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::events::InputRequest;
use crate::runtime::interpreter::{Interpreter, NodeStream};
use crate::runtime::render::RenderNode;
use crate::runtime::value::as_number;

/// Publish every attribute except `id`. Yields nothing.
pub fn run_set(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    stream::once(async move {
        let variables = interp.resolve_attributes(&node, &["id"])?;
        interp.publish(&node.id, &scope, variables)
    })
    .try_filter_map(|()| future::ready(Ok(None::<RenderNode>)))
    .boxed()
}

/// Collect a value from `on_user_input`, or fall back to `default`.
pub fn run_input(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        let kind = interp
            .string_attribute(&node, "type")?
            .ok_or_else(|| RuntimeError::directive("input", "input requires a type"))?;
        let label = interp.string_attribute(&node, "label")?;
        let options = interp.attribute(&node, "options")?.filter(|v| !v.is_null());
        let min = interp.attribute(&node, "min")?.filter(|v| !v.is_null());
        let max = interp.attribute(&node, "max")?.filter(|v| !v.is_null());
        let default = interp.attribute(&node, "default")?.filter(|v| !v.is_null());

        check_input_shape(&kind, &options, &min, &max)?;

        let request = InputRequest {
            id: node.id.clone(),
            kind: kind.clone(),
            label: label.clone(),
            options: options.clone(),
            min: min.clone(),
            max: max.clone(),
            default: default.clone(),
        };
        let value = match interp.events().on_user_input.clone() {
            Some(callback) => interp
                .signal()
                .race(callback(request))
                .await?
                .map_err(|err| RuntimeError::UserInput(err.to_string()))?,
            None => {
                debug!(id = %node.id, "no input callback, using default");
                default.unwrap_or(Value::Null)
            }
        };

        let mut frame = Map::new();
        frame.insert("type".into(), Value::String(kind));
        frame.insert("value".into(), value);
        if let Some(label) = label {
            frame.insert("label".into(), Value::String(label));
        }
        for (key, value) in [("options", options), ("min", min), ("max", max)] {
            if let Some(value) = value {
                frame.insert(key.into(), value);
            }
        }
        interp.publish(&node.id, &scope, frame.clone())?;
        yield RenderNode::new(&node.id, "input").with_attributes(frame);
    })
}

fn check_input_shape(
    kind: &str,
    options: &Option<Value>,
    min: &Option<Value>,
    max: &Option<Value>,
) -> Result<()> {
    let numeric = |v: &Option<Value>| v.as_ref().and_then(as_number).is_some();
    match kind {
        "choice" if !matches!(options, Some(Value::Array(_))) => Err(RuntimeError::directive(
            "input",
            "choice input requires a list of options",
        )),
        "slider" if !numeric(min) || !numeric(max) => Err(RuntimeError::directive(
            "input",
            "slider input requires numeric min and max",
        )),
        _ => Ok(()),
    }
}

const MEDIA_SCHEMES: &[&str] = &["file://", "http://", "https://"];

/// MIME type for a media path, from its extension.
pub fn mime_type(src: &str) -> &'static str {
    let path = src.split(['?', '#']).next().unwrap_or(src);
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn check_scheme(src: &str) -> Result<()> {
    if MEDIA_SCHEMES.iter().any(|scheme| src.starts_with(scheme)) {
        Ok(())
    } else {
        Err(RuntimeError::directive(
            "media",
            format!("unsupported media source '{}'", src),
        ))
    }
}

/// Publish a media reference as `{type, src, mimeType}`.
pub fn run_media(interp: Interpreter, node: Arc<Node>, scope: String) -> NodeStream {
    Box::pin(try_stream! {
        let kind = interp
            .string_attribute(&node, "type")?
            .ok_or_else(|| RuntimeError::directive("media", "media requires a type"))?;
        let src = interp
            .string_attribute(&node, "src")?
            .ok_or_else(|| RuntimeError::directive("media", "media requires a src"))?;
        check_scheme(&src)?;

        let mut frame = Map::new();
        frame.insert("type".into(), Value::String(kind));
        frame.insert("mimeType".into(), Value::String(mime_type(&src).to_string()));
        frame.insert("src".into(), Value::String(src));
        interp.publish(&node.id, &scope, frame.clone())?;
        yield RenderNode::new(&node.id, "media").with_attributes(frame);
    })
}
