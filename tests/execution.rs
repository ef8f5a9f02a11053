//! Integration tests for document execution
//!
//! Runs whole documents through `Runtime::execute` and checks the rendered
//! stream, the published frames and the history chain.

use async_trait::async_trait;
use futures::StreamExt;
use mdflow::compiler::DiagnosticKind;
use mdflow::runtime::completion::{
    CompletionRequest, CompletionResponse, CompletionService, ToolCallRequest,
};
use mdflow::runtime::error::CompletionError;
use mdflow::runtime::events::{Events, InputRequest, ToolCall};
use mdflow::runtime::history::GENESIS_HASH;
use mdflow::runtime::plugin::{HookContext, Hooks, TagOutput};
use mdflow::runtime::{
    Adapter, EchoCompletion, ExecuteOptions, Plugin, RenderNode, Runtime, RuntimeError,
    StateManager, TagSpec, Tool,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn runtime() -> Runtime {
    Runtime::new(Arc::new(EchoCompletion))
}

async fn run(content: &str, options: ExecuteOptions) -> (Vec<RenderNode>, Arc<StateManager>) {
    let execution = runtime().execute(content, options).unwrap();
    let state = execution.state();
    let nodes = execution.collect().await.unwrap();
    (nodes, state)
}

#[tokio::test]
async fn test_frontmatter_count_drives_loop() {
    let doc = "---\ninput:\n  - name: count\n    type: number\n---\n{% loop count=$frontmatter.input.count #repeat %}\nItem $repeat.index\n{% /loop %}\n";
    let options = ExecuteOptions::default().with_input("count", json!(3));
    let (nodes, state) = run(doc, options).await;

    assert_eq!(nodes.len(), 3);
    for (i, node) in nodes.iter().enumerate() {
        assert_eq!(node.tag, "loop");
        assert_eq!(node.attributes["index"], json!(i));
        assert_eq!(node.text_content(), format!("Item {}", i));
    }

    let loop_pushes = state
        .history()
        .iter()
        .filter(|block| block.action == "pushStack:repeat")
        .count();
    assert_eq!(loop_pushes, 3);
    let frame = state.get_frame("repeat", "global").unwrap();
    assert_eq!(frame.variables["index"], json!(2));
    assert_eq!(frame.variables["isLast"], json!(true));
}

#[tokio::test]
async fn test_string_input_is_coerced_and_frontmatter_frame_pushed() {
    let doc = "---\ntitle: Coerce\ninput:\n  - name: count\n    type: number\n---\n{% loop count=$frontmatter.input.count %}\nx\n{% /loop %}\n";
    let options = ExecuteOptions::default().with_input("count", json!("2"));
    let (nodes, state) = run(doc, options).await;
    assert_eq!(nodes.len(), 2);

    let history = state.history();
    assert_eq!(history[1].action, "pushStack:frontmatter");
    let frame = state.get_frame("frontmatter", "global").unwrap();
    assert_eq!(frame.variables["input"]["count"], json!(2));
    assert_eq!(frame.variables["title"], json!("Coerce"));
}

#[tokio::test]
async fn test_set_with_same_id_merges() {
    let doc = "{% set id=\"x\" value=\"1\" /%}\n{% set id=\"x\" value2=\"2\" /%}\nGot $x.value and $x.value2\n";
    let execution = runtime().execute(doc, ExecuteOptions::default()).unwrap();
    assert!(
        execution
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::DuplicateDeclaration)
    );
    let state = execution.state();
    let nodes = execution.collect().await.unwrap();

    assert_eq!(
        state.get_scoped_variables("global")["x"],
        json!({"value": "1", "value2": "2"})
    );
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].text_content(), "Got 1 and 2");
}

#[tokio::test]
async fn test_if_runs_first_truthy_branch_only() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = {
        let calls = Arc::clone(&calls);
        Plugin::new("tally", "1.0").with_function("tally", move |args| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(args.first().cloned().unwrap_or(Value::Null))
        })
    };
    let doc = "{% set #flags a=false b=true /%}\n{% if tally($flags.a) #check %}\nfirst\n{% else tally($flags.b) /%}\nsecond\n{% else tally(true) /%}\nthird\n{% /if %}\n";
    let (nodes, state) = run(doc, ExecuteOptions::default().with_plugin(counter)).await;

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].tag, "if");
    assert_eq!(nodes[0].text_content(), "second");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let frame = state.get_frame("check", "global").unwrap();
    assert_eq!(frame.variables["branch"], json!(1));
    assert_eq!(frame.variables["isTrue"], json!(true));
}

#[tokio::test]
async fn test_if_without_match_yields_nothing() {
    let doc = "{% if false #never %}\nhidden\n{% /if %}\nafter\n";
    let (nodes, state) = run(doc, ExecuteOptions::default()).await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].text_content(), "after");
    let frame = state.get_frame("never", "global").unwrap();
    assert_eq!(frame.variables["isTrue"], json!(false));
    assert_eq!(frame.variables["branch"], Value::Null);
}

#[tokio::test]
async fn test_if_without_condition_fails_without_running_body() {
    let doc = "{% if #c %}\nsecret\n{% /if %}\n";
    let execution = runtime().execute(doc, ExecuteOptions::default()).unwrap();
    let state = execution.state();
    let err = execution.collect().await.unwrap_err();

    assert!(matches!(err, RuntimeError::Directive { ref directive, .. } if directive == "if"));
    assert!(state.get_frame("c", "global").is_none());
    assert!(state.get_text("global").is_empty());
}

#[tokio::test]
async fn test_loop_modes() {
    let doc = "{% loop items=[\"a\", \"b\"] as=\"letter\" #letters %}\n$letter.value\n{% /loop %}\n";
    let (nodes, state) = run(doc, ExecuteOptions::default()).await;
    let texts: Vec<String> = nodes.iter().map(RenderNode::text_content).collect();
    assert_eq!(texts, vec!["a", "b"]);
    assert_eq!(state.get_frame("letters", "global").unwrap().variables["item"], json!("b"));

    let doc = "{% set #state go=true /%}\n{% loop $state.go #spin %}\ntick\n{% set #state go=false /%}\n{% /loop %}\n";
    let (nodes, state) = run(doc, ExecuteOptions::default()).await;
    assert_eq!(nodes.len(), 1);
    let frame = state.get_frame("spin", "global").unwrap();
    assert_eq!(frame.variables["count"], Value::Null);
    assert_eq!(frame.variables["isLast"], json!(false));
}

#[tokio::test]
async fn test_loop_with_mixed_modes_fails() {
    let doc = "{% loop count=2 items=[1] as=\"n\" %}\nx\n{% /loop %}\n";
    let execution = runtime().execute(doc, ExecuteOptions::default()).unwrap();
    let err = execution.collect().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Directive { ref directive, .. } if directive == "loop"));
    assert!(!err.is_abort());
}

#[tokio::test]
async fn test_text_registry_feeds_ai_prompt() {
    let doc = "# Notes\n\nThe sky is blue.\n\n{% ai model=\"echo\" #summary %}\nSummarize.\n{% /ai %}\n\nResult: $summary.result\n";
    let (nodes, state) = run(doc, ExecuteOptions::default()).await;

    let ai = nodes.iter().find(|n| n.tag == "ai").unwrap();
    assert_eq!(ai.content.as_deref(), Some("Summarize."));
    let frame = state.get_frame("summary", "global").unwrap();
    assert_eq!(frame.variables["context"], json!("Notes\n\nThe sky is blue."));
    assert_eq!(nodes.last().unwrap().text_content(), "Result: Summarize.");
}

struct ScriptedCompletion {
    requests: Mutex<Vec<CompletionRequest>>,
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let first = self.requests.lock().is_empty();
        self.requests.lock().push(request.clone());
        if request.response_schema.is_some() {
            return Ok(CompletionResponse {
                text: r#"{"answer": 42}"#.into(),
                tool_calls: Vec::new(),
                structured: None,
            });
        }
        let tool_calls = if first {
            vec![ToolCallRequest {
                id: "call-1".into(),
                name: "lookup".into(),
                arguments: json!({"q": "weather"}),
            }]
        } else {
            Vec::new()
        };
        Ok(CompletionResponse {
            text: "done".into(),
            tool_calls,
            structured: None,
        })
    }
}

#[tokio::test]
async fn test_ai_tools_credentials_and_structured_output() {
    let service = Arc::new(ScriptedCompletion {
        requests: Mutex::new(Vec::new()),
    });
    let notified = Arc::new(Mutex::new(Vec::<ToolCall>::new()));
    let events = Events::default().on_tool_call({
        let notified = Arc::clone(&notified);
        move |call| {
            let notified = Arc::clone(&notified);
            async move {
                notified.lock().push(call);
                Ok(())
            }
        }
    });
    let options = ExecuteOptions {
        env: [("OPENAI_API_KEY".to_string(), "sk-test".to_string())].into(),
        ..ExecuteOptions::default()
    }
    .with_events(events)
    .with_tool(Tool::new("lookup", "Look things up", json!({}), |args| async move {
        Ok(json!({"found": args["q"]}))
    }))
    .with_tool(Tool::new("unused", "Not offered", json!({}), |_| async { Ok(Value::Null) }));

    let doc = "{% ai model=\"openai/gpt-4o\" tools=[\"lookup\"] structuredOutputs={answer: \"number\"} temperature=0.2 #ask %}\nWhat is the answer?\n{% /ai %}\n";
    let execution = Runtime::new(service.clone()).execute(doc, options).unwrap();
    let state = execution.state();
    let nodes = execution.collect().await.unwrap();

    assert_eq!(nodes[0].content.as_deref(), Some("done"));
    let requests = service.requests.lock();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].credential.as_deref(), Some("sk-test"));
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].tools[0].name, "lookup");
    assert_eq!(requests[0].options["temperature"], json!(0.2));
    assert!(requests[1].response_schema.is_some());

    assert_eq!(notified.lock().len(), 1);
    assert_eq!(notified.lock()[0].directive_id, "ask");
    let text = state.get_text("global");
    assert!(text.iter().any(|t| t.contains("lookup") && t.contains("weather")));

    let frame = state.get_frame("ask", "global").unwrap();
    assert_eq!(frame.variables["structuredOutputs"], json!({"answer": 42}));
    assert_eq!(frame.variables["result"], json!("done"));
}

#[tokio::test]
async fn test_ai_without_model_fails() {
    let doc = "{% ai %}\nhi\n{% /ai %}\n";
    let err = runtime()
        .execute(doc, ExecuteOptions::default())
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Directive { .. }));
}

#[tokio::test]
async fn test_input_uses_callback_or_default() {
    let doc = "{% input type=\"text\" label=\"Name\" default=\"anon\" #name /%}\nHello $name.value\n";
    let (nodes, _) = run(doc, ExecuteOptions::default()).await;
    assert_eq!(nodes[1].text_content(), "Hello anon");

    let seen = Arc::new(Mutex::new(None::<InputRequest>));
    let events = Events::default().on_user_input({
        let seen = Arc::clone(&seen);
        move |request| {
            *seen.lock() = Some(request);
            async { Ok(json!("Ada")) }
        }
    });
    let (nodes, state) = run(doc, ExecuteOptions::default().with_events(events)).await;
    assert_eq!(nodes[0].tag, "input");
    assert_eq!(nodes[1].text_content(), "Hello Ada");
    assert_eq!(seen.lock().as_ref().unwrap().label.as_deref(), Some("Name"));
    assert_eq!(state.get_frame("name", "global").unwrap().variables["type"], json!("text"));
}

#[tokio::test]
async fn test_slider_without_bounds_fails() {
    let doc = "{% input type=\"slider\" min=0 #level /%}\n";
    let err = runtime()
        .execute(doc, ExecuteOptions::default())
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Directive { ref directive, .. } if directive == "input"));
}

#[tokio::test]
async fn test_media_publishes_mime_type() {
    let doc = "{% media type=\"image\" src=\"https://example.com/cat.png\" #photo /%}\n";
    let (nodes, state) = run(doc, ExecuteOptions::default()).await;
    assert_eq!(nodes[0].tag, "media");
    let frame = state.get_frame("photo", "global").unwrap();
    assert_eq!(frame.variables["mimeType"], json!("image/png"));

    let doc = "{% media type=\"image\" src=\"ftp://example.com/cat.png\" /%}\n";
    let err = runtime()
        .execute(doc, ExecuteOptions::default())
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Directive { .. }));
}

#[tokio::test]
async fn test_fence_runs_code_adapter() {
    let adapter = Adapter::new("code").with_handler("execute", |input| async move {
        if input["code"].as_str().unwrap_or_default().contains("boom") {
            anyhow::bail!("exploded");
        }
        Ok(json!(format!("ran {}", input["language"].as_str().unwrap_or("?"))))
    });
    let doc = "```python {% #calc %}\nprint(1)\n```\n\n```python {% #bad %}\nboom\n```\n\n$calc.result / $bad.error\n";
    let (nodes, state) = run(doc, ExecuteOptions::default().with_adapter(adapter)).await;

    assert_eq!(nodes[0].tag, "fence");
    assert_eq!(nodes[0].attributes["result"], json!("ran python"));
    assert_eq!(state.get_frame("bad", "global").unwrap().variables["error"], json!("exploded"));
    assert_eq!(nodes[2].text_content(), "ran python / exploded");
    assert!(state.get_text("global").contains(&"print(1)\n".to_string()));
}

#[tokio::test]
async fn test_plugin_tag_hooks_and_functions() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let hooks = Hooks {
        before_directive: Some(Arc::new({
            let order = Arc::clone(&order);
            move |ctx: &HookContext| -> anyhow::Result<()> {
                order.lock().push(format!("before:{}", ctx.directive));
                Ok(())
            }
        })),
        after_directive: Some(Arc::new({
            let order = Arc::clone(&order);
            move |ctx: &HookContext| -> anyhow::Result<()> {
                order.lock().push(format!("after:{}", ctx.directive));
                Ok(())
            }
        })),
    };
    let plugin = Plugin::new("shout", "0.1.0")
        .with_tag(
            TagSpec::new("shout", |ctx| async move {
                let text = ctx.attributes["text"].as_str().unwrap_or_default().to_uppercase();
                let mut variables = serde_json::Map::new();
                variables.insert("text".into(), json!(text.clone()));
                Ok(TagOutput {
                    variables: Some(variables),
                    node: Some(RenderNode::text(ctx.id, text)),
                })
            })
            .require("text"),
        )
        .with_function("twice", |args| {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(format!("{}{}", text, text)))
        })
        .with_hooks(hooks);

    let doc = "{% shout text=twice(\"hi\") #loud /%}\n";
    let (nodes, state) = run(doc, ExecuteOptions::default().with_plugin(plugin)).await;
    assert_eq!(nodes[0].content.as_deref(), Some("HIHI"));
    assert_eq!(state.get_frame("loud", "global").unwrap().variables["text"], json!("HIHI"));
    assert_eq!(*order.lock(), vec!["before:shout", "after:shout"]);
    assert!(state.snapshot().config.tags.contains("shout"));
}

#[tokio::test]
async fn test_group_and_parallel_keep_order() {
    let doc = "{% parallel #fan %}\none\n\n{% group %}\ntwo\n\nthree\n{% /group %}\n{% /parallel %}\n";
    let (nodes, _) = run(doc, ExecuteOptions::default()).await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].tag, "parallel");
    let tags: Vec<&str> = nodes[0].children.iter().map(|c| c.tag.as_str()).collect();
    assert_eq!(tags, vec!["p", "group"]);
    assert_eq!(nodes[0].text_content(), "onetwothree");
}

#[tokio::test]
async fn test_events_receive_data_and_errors() {
    let data = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let events = Events::default()
        .on_data({
            let data = Arc::clone(&data);
            move |_| {
                data.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_error({
            let errors = Arc::clone(&errors);
            move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        });
    let doc = "first\n\nsecond\n\n{% loop %}\nbad\n{% /loop %}\n\nnever\n";
    let mut execution = runtime()
        .execute(doc, ExecuteOptions::default().with_events(events))
        .unwrap();
    let mut items = Vec::new();
    while let Some(item) = execution.next().await {
        items.push(item);
    }
    assert_eq!(items.len(), 3);
    assert!(items[2].is_err());
    assert_eq!(data.load(Ordering::SeqCst), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_history_chain_round_trip() {
    let doc = "{% set #a v=1 /%}\n{% loop count=2 %}\nline\n{% /loop %}\n";
    let (_, state) = run(doc, ExecuteOptions::default()).await;
    let history = state.history();
    assert!(history.len() > 5);
    assert_eq!(history[0].previous_hash, GENESIS_HASH);
    assert_eq!(history[0].action, "init");
    for pair in history.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].hash);
        assert_eq!(pair[1].index, pair[0].index + 1);
    }
    assert!(state.verify_history().is_ok());
    let past = state.state_at(&history[2].hash).unwrap();
    assert_eq!(past.stack.len(), 2);
}

#[tokio::test]
async fn test_nothing_runs_before_poll() {
    let execution = runtime()
        .execute("{% set #x v=1 /%}\n", ExecuteOptions::default())
        .unwrap();
    assert_eq!(execution.state().history_len(), 1);
    let state = execution.state();
    execution.collect().await.unwrap();
    assert!(state.get_frame("x", "global").is_some());
}

#[tokio::test]
async fn test_on_log_sees_lifecycle_and_ignored_errors() {
    let messages = Arc::new(Mutex::new(Vec::<String>::new()));
    let events = Events::default().on_log({
        let messages = Arc::clone(&messages);
        move |event| messages.lock().push(event.message.clone())
    });
    let doc = "{% loop count=1 %}\nunclosed\n";
    runtime()
        .execute(doc, ExecuteOptions::default().with_events(events))
        .unwrap()
        .collect()
        .await
        .unwrap();

    let messages = messages.lock();
    assert!(messages[0].starts_with("ignoring compile error"));
    assert!(messages.iter().any(|m| m == "execution started"));
    assert!(messages.last().unwrap().starts_with("execution finished"));
}
