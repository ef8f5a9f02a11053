//! Hash-chained state history
//!
//! Every state mutation appends one [`StateBlock`]. Blocks link to their
//! predecessor by hash, starting from [`GENESIS_HASH`]. A block hash covers the
//! previous hash, the block index, the action, and a preserves-packed digest
//! of the resulting state. The timestamp is not hashed, so a chain can be
//! re-verified from its content alone.

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::RuntimeConfig;
use super::error::HistoryError;
use super::state::{RuntimeContext, StackFrame};

/// `previous_hash` of the first block in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Net change a mutation made to the context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateDiff {
    /// Change in number of stack frames.
    pub stack: i64,
    /// Change in total text registry entries.
    pub text_registry: i64,
    /// Change in total data entries.
    pub data: i64,
}

impl StateDiff {
    /// Diff between two contexts.
    pub fn between(before: &RuntimeContext, after: &RuntimeContext) -> Self {
        let text = |ctx: &RuntimeContext| ctx.text_registry.values().map(Vec::len).sum::<usize>() as i64;
        let data = |ctx: &RuntimeContext| ctx.data.values().map(Map::len).sum::<usize>() as i64;
        Self {
            stack: after.stack.len() as i64 - before.stack.len() as i64,
            text_registry: text(after) - text(before),
            data: data(after) - data(before),
        }
    }
}

/// One immutable history record.
#[derive(Debug, Clone)]
pub struct StateBlock {
    /// Position in the chain, from 0.
    pub index: u64,
    /// Wall-clock time of the mutation (not hashed).
    pub timestamp: DateTime<Utc>,
    /// Mutation label, e.g. `pushStack:x`.
    pub action: String,
    /// Hash of this block.
    pub hash: String,
    /// Hash of the preceding block, or [`GENESIS_HASH`].
    pub previous_hash: String,
    /// Context after the mutation.
    pub state: Arc<RuntimeContext>,
    /// Net change from the previous context.
    pub diff: StateDiff,
}

impl StateBlock {
    /// Build and hash a block.
    pub fn new(
        index: u64,
        action: impl Into<String>,
        previous_hash: impl Into<String>,
        state: Arc<RuntimeContext>,
        diff: StateDiff,
    ) -> Self {
        let action = action.into();
        let previous_hash = previous_hash.into();
        let hash = compute_block_hash(&previous_hash, index, &action, &state);
        Self {
            index,
            timestamp: Utc::now(),
            action,
            hash,
            previous_hash,
            state,
            diff,
        }
    }

    /// Recompute this block's hash.
    pub fn recompute_hash(&self) -> String {
        compute_block_hash(&self.previous_hash, self.index, &self.action, &self.state)
    }
}

/// Serializable view of a context; plugins and adapters contribute their names.
#[derive(Serialize)]
struct StateDigest<'a> {
    stack: &'a [StackFrame],
    data: &'a BTreeMap<String, Map<String, Value>>,
    text_registry: &'a BTreeMap<String, Vec<String>>,
    plugins: Vec<&'a str>,
    adapters: Vec<&'a str>,
    config: &'a RuntimeConfig,
}

/// Hash of one block.
pub fn compute_block_hash(
    previous_hash: &str,
    index: u64,
    action: &str,
    state: &RuntimeContext,
) -> String {
    use preserves::PackedWriter;

    let mut hasher = Hasher::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(&index.to_le_bytes());
    hasher.update(action.as_bytes());

    let digest = StateDigest {
        stack: &state.stack,
        data: &state.data,
        text_registry: &state.text_registry,
        plugins: state.plugins.keys().map(String::as_str).collect(),
        adapters: state.adapters.keys().map(String::as_str).collect(),
        config: &state.config,
    };

    let mut buf = Vec::new();
    let packed = {
        let mut writer = PackedWriter::new(&mut buf);
        preserves::serde::to_writer(&mut writer, &digest).is_ok()
    };
    if !packed {
        buf = serde_json::to_vec(&digest).unwrap_or_default();
    }
    hasher.update(&buf);

    hasher.finalize().to_hex().to_string()
}

/// Check every link and recompute every hash.
pub fn verify_chain(blocks: &[StateBlock]) -> Result<(), HistoryError> {
    let mut expected_previous = GENESIS_HASH.to_string();
    for block in blocks {
        if block.previous_hash != expected_previous {
            return Err(HistoryError::BrokenLink {
                index: block.index,
                expected: expected_previous,
                found: block.previous_hash.clone(),
            });
        }
        let computed = block.recompute_hash();
        if computed != block.hash {
            return Err(HistoryError::HashMismatch {
                index: block.index,
                recorded: block.hash.clone(),
                computed,
            });
        }
        expected_previous = block.hash.clone();
    }
    Ok(())
}
