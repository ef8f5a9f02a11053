//! Abort and timeout behaviour
//!
//! Uses paused tokio time so deadlines and slow handlers resolve instantly.

use futures::StreamExt;
use mdflow::runtime::events::Events;
use mdflow::runtime::plugin::TagOutput;
use mdflow::runtime::{
    AbortController, AbortReason, EchoCompletion, Execution, ExecuteOptions, Plugin, RenderNode,
    Runtime, RuntimeError, TagSpec,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// `{% wait ms=N /%}` sleeps for N milliseconds.
fn wait_plugin() -> Plugin {
    Plugin::new("timing", "1.0").with_tag(TagSpec::new("wait", |ctx| async move {
        let ms = ctx.attributes.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(TagOutput::default())
    }))
}

async fn drain(mut execution: Execution) -> Vec<Result<RenderNode, RuntimeError>> {
    let mut items = Vec::new();
    while let Some(item) = execution.next().await {
        items.push(item);
    }
    items
}

fn aborted_with(item: &Result<RenderNode, RuntimeError>) -> Option<AbortReason> {
    match item {
        Err(RuntimeError::Aborted(reason)) => Some(reason.clone()),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_interrupts_slow_directive() {
    let aborts = Arc::new(AtomicUsize::new(0));
    let events = Events::default().on_abort({
        let aborts = Arc::clone(&aborts);
        move |_| {
            aborts.fetch_add(1, Ordering::SeqCst);
        }
    });
    let options = ExecuteOptions::default()
        .with_plugin(wait_plugin())
        .with_events(events)
        .with_timeout(Duration::from_secs(1));
    let doc = "before\n\n{% wait ms=10000 /%}\n\nafter\n";
    let execution = Runtime::new(Arc::new(EchoCompletion)).execute(doc, options).unwrap();
    let items = drain(execution).await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap().text_content(), "before");
    assert_eq!(aborted_with(&items[1]), Some(AbortReason::Timeout));
    assert_eq!(aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_abort_between_nodes_stops_stream() {
    let doc = "one\n\ntwo\n\nthree\n";
    let mut execution = Runtime::new(Arc::new(EchoCompletion))
        .execute(doc, ExecuteOptions::default())
        .unwrap();
    let state = execution.state();

    let first = execution.next().await.unwrap().unwrap();
    assert_eq!(first.text_content(), "one");
    execution.abort();

    let next = execution.next().await.unwrap();
    assert_eq!(aborted_with(&next), Some(AbortReason::User(None)));
    assert!(execution.next().await.is_none());
    assert!(state.verify_history().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_parallel_yields_nothing_further() {
    let doc = "intro\n\n{% parallel #fan %}\n{% wait ms=5000 /%}\n{% wait ms=5000 /%}\n{% /parallel %}\n\nafter\n";
    let execution = Runtime::new(Arc::new(EchoCompletion))
        .execute(doc, ExecuteOptions::default().with_plugin(wait_plugin()))
        .unwrap();
    let state = execution.state();
    let controller = execution.controller();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        controller.abort(AbortReason::User(Some("stop".into())));
    });

    let items = drain(execution).await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap().text_content(), "intro");
    assert_eq!(
        aborted_with(&items[1]),
        Some(AbortReason::User(Some("stop".into())))
    );
    assert!(state.get_text("global").iter().all(|text| text != "after"));
    assert!(state.verify_history().is_ok());
}

#[tokio::test]
async fn test_external_signal_aborts_before_start() {
    let external = AbortController::new();
    external.abort(AbortReason::User(Some("cancelled upstream".into())));
    let execution = Runtime::new(Arc::new(EchoCompletion))
        .execute(
            "{% set #x v=1 /%}\n",
            ExecuteOptions::default().with_signal(external.signal()),
        )
        .unwrap();
    let state = execution.state();

    let items = drain(execution).await;
    assert_eq!(items.len(), 1);
    assert!(items[0].as_ref().unwrap_err().is_abort());
    assert_eq!(state.history_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_input_is_aborted_not_failed() {
    let events = Events::default()
        .on_user_input(|_| futures::future::pending::<anyhow::Result<Value>>());
    let options = ExecuteOptions::default()
        .with_events(events)
        .with_timeout(Duration::from_millis(500));
    let execution = Runtime::new(Arc::new(EchoCompletion))
        .execute("{% input type=\"text\" #name /%}\n", options)
        .unwrap();
    let err = execution.collect().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Aborted(AbortReason::Timeout)));
}

#[tokio::test]
async fn test_abort_with_message() {
    let execution = Runtime::new(Arc::new(EchoCompletion))
        .execute("hello\n", ExecuteOptions::default())
        .unwrap();
    execution.abort_with("enough");
    let err = execution.collect().await.unwrap_err();
    assert_eq!(err.to_string(), "Execution aborted: enough");
}
