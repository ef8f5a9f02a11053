//! Variable stack and history chain

use mdflow::runtime::history::{GENESIS_HASH, verify_chain};
use mdflow::runtime::state::StackFrame;
use mdflow::runtime::{EchoCompletion, ExecuteOptions, Runtime, RuntimeConfig, StateManager};
use proptest::prelude::*;
use serde_json::{Map, Value, json};
use std::sync::Arc;

fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

#[test]
fn test_push_merges_same_id_and_scope() {
    let state = StateManager::new(RuntimeConfig::default());
    state.push_stack(StackFrame::new("x", "global", vars(json!({"value": "1"}))));
    state.push_stack(StackFrame::new("x", "global", vars(json!({"value2": "2"}))));
    state.push_stack(StackFrame::new("x", "other", vars(json!({"value": "3"}))));

    assert_eq!(
        state.get_frame("x", "global").unwrap().variables,
        vars(json!({"value": "1", "value2": "2"}))
    );
    assert_eq!(state.snapshot().stack.len(), 2);
    assert_eq!(state.get_scoped_variables("other")["x"], json!({"value": "3"}));

    state.pop_stack("other");
    assert!(state.get_frame("x", "other").is_none());
    assert_eq!(state.history_len(), 5);
}

#[test]
fn test_tampered_history_fails_verification() {
    let state = StateManager::new(RuntimeConfig::default());
    state.push_stack(StackFrame::new("a", "global", vars(json!({"n": 1}))));
    state.add_text("global", "hello");
    let mut blocks = state.history();
    assert!(verify_chain(&blocks).is_ok());

    blocks[1].action = "pushStack:b".to_string();
    assert!(verify_chain(&blocks).is_err());
}

#[test]
fn test_state_at_returns_past_snapshot() {
    let state = StateManager::new(RuntimeConfig::default());
    state.set_data("global", "k", json!(1));
    let earlier = state.history().last().unwrap().hash.clone();
    state.set_data("global", "k", json!(2));

    let past = state.state_at(&earlier).unwrap();
    assert_eq!(past.data["global"]["k"], json!(1));
    assert_eq!(state.get_data("global", "k"), Some(json!(2)));
    assert!(state.state_at("not-a-hash").is_none());
}

proptest! {
    #[test]
    fn prop_loop_publishes_one_frame_per_iteration(count in 0usize..12) {
        let doc = format!("{{% loop count={} #spin %}}\ntick\n{{% /loop %}}\n", count);
        let (nodes, state) = block_on(async {
            let execution = Runtime::new(Arc::new(EchoCompletion))
                .execute(&doc, ExecuteOptions::default())
                .unwrap();
            let state = execution.state();
            (execution.collect().await.unwrap(), state)
        });
        prop_assert_eq!(nodes.len(), count);

        let frames: Vec<Map<String, Value>> = state
            .history()
            .iter()
            .filter(|block| block.action == "pushStack:spin")
            .filter_map(|block| {
                block
                    .state
                    .stack
                    .iter()
                    .find(|frame| frame.id == "spin")
                    .map(|frame| frame.variables.clone())
            })
            .collect();
        prop_assert_eq!(frames.len(), count);
        for (i, frame) in frames.iter().enumerate() {
            prop_assert_eq!(&frame["index"], &json!(i));
            prop_assert_eq!(&frame["isFirst"], &json!(i == 0));
            prop_assert_eq!(&frame["isLast"], &json!(i + 1 == count));
        }
    }

    #[test]
    fn prop_execution_history_is_chained(sets in prop::collection::vec("[a-z]{1,6}", 1..6)) {
        let doc: String = sets
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{{% set #{} n={} /%}}\nline $ {}\n\n", name, i, i))
            .collect();
        let state = block_on(async {
            let execution = Runtime::new(Arc::new(EchoCompletion))
                .execute(&doc, ExecuteOptions::default())
                .unwrap();
            let state = execution.state();
            execution.collect().await.unwrap();
            state
        });

        let history = state.history();
        prop_assert_eq!(history[0].previous_hash.as_str(), GENESIS_HASH);
        for pair in history.windows(2) {
            prop_assert_eq!(&pair[1].previous_hash, &pair[0].hash);
            prop_assert_eq!(pair[1].recompute_hash(), pair[1].hash.clone());
        }
        prop_assert!(state.verify_history().is_ok());
    }
}
