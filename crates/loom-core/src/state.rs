//! Helpers over opaque checkpoint state.
//!
//! The state blob belongs to the agent runtime. The only thing read out of it
//! here is a message count, taken from the first message list found.

use serde_json::Value;

/// Keys checked, in order, for the message list inside an object state.
const MESSAGE_KEYS: &[&str] = &["messages", "msgs"];

/// Number of messages in a state snapshot.
///
/// A top-level array counts its elements. An object counts the first array
/// found under one of the well-known message keys. Anything else is zero.
pub fn message_count(state: &Value) -> u32 {
    match state {
        Value::Array(items) => items.len() as u32,
        Value::Object(map) => MESSAGE_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map_or(0, |items| items.len() as u32),
        _ => 0,
    }
}
