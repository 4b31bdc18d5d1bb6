//! Message merge reducer.
//!
//! Folds a batch of incoming messages into an existing history:
//! entries whose id already exists are replaced in place, everything else is
//! appended in the order the batch presented it.

use std::collections::HashMap;

use tracing::trace;

use crate::error::{ConvoyError, Result};
use crate::types::{Message, MessageId};

/// Merge `incoming` into `existing`, returning the new history.
///
/// Incoming messages without an id get a fresh one. If the same id appears
/// more than once in `incoming`, the last version wins and keeps the position
/// of the first. Duplicate ids inside `existing` mean the history is corrupt
/// and yield [`ConvoyError::InvariantViolation`].
pub fn merge(existing: &[Message], incoming: Vec<Message>) -> Result<Vec<Message>> {
    let mut merged: Vec<Message> = existing.to_vec();
    let mut index: HashMap<MessageId, usize> = HashMap::with_capacity(merged.len());

    for (pos, msg) in merged.iter().enumerate() {
        let id = msg.id.clone().ok_or_else(|| {
            ConvoyError::InvariantViolation(format!("history entry {} has no id", pos))
        })?;
        if let Some(prev) = index.insert(id.clone(), pos) {
            return Err(ConvoyError::InvariantViolation(format!(
                "duplicate message id '{}' at positions {} and {}",
                id, prev, pos
            )));
        }
    }

    let mut replaced = 0usize;
    for mut msg in incoming {
        let id = msg.id.get_or_insert_with(MessageId::new).clone();
        match index.get(&id) {
            Some(&pos) => {
                merged[pos] = msg;
                replaced += 1;
            }
            None => {
                index.insert(id, merged.len());
                merged.push(msg);
            }
        }
    }

    trace!(
        existing = existing.len(),
        replaced,
        merged = merged.len(),
        "Merged messages"
    );
    Ok(merged)
}

/// Check that every message has an id and no id repeats.
pub fn validate_history(history: &[Message]) -> Result<()> {
    merge(history, Vec::new()).map(|_| ())
}
