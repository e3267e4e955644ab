//! Separation of reasoning output from user-facing output.
//!
//! Everything here is a pure function of an ordered chunk slice. Nothing is
//! persisted; callers recompute on demand.

use serde::{Deserialize, Serialize};

use crate::chunks::{ContentType, StreamChunk};
use crate::tokens::estimate_text_tokens;

/// Reasoning content derived from a chunk slice.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    /// THINKING chunk contents concatenated in buffer order.
    pub thinking_text: String,
    /// `estimate_text_tokens(thinking_text)`.
    pub thinking_tokens: u32,
    /// Number of TOOL_CALL chunks in the slice.
    pub tool_calls_planned: u32,
}

impl ThinkingBlock {
    pub fn is_empty(&self) -> bool {
        self.thinking_text.is_empty() && self.tool_calls_planned == 0
    }
}

/// Build a [`ThinkingBlock`] from chunks. Returns a zeroed block when the
/// slice holds no reasoning.
pub fn extract_thinking(chunks: &[StreamChunk]) -> ThinkingBlock {
    let mut thinking_text = String::new();
    let mut tool_calls_planned = 0u32;

    for chunk in chunks {
        match chunk.content_type {
            ContentType::Thinking => thinking_text.push_str(&chunk.content),
            ContentType::ToolCall => tool_calls_planned += 1,
            ContentType::Text | ContentType::ToolResult => {}
        }
    }

    let thinking_tokens = estimate_text_tokens(&thinking_text);
    ThinkingBlock {
        thinking_text,
        thinking_tokens,
        tool_calls_planned,
    }
}

/// Concatenate user-facing TEXT chunks, dropping reasoning and tool traffic.
pub fn visible_text(chunks: &[StreamChunk]) -> String {
    chunks
        .iter()
        .filter(|c| c.content_type == ContentType::Text)
        .map(|c| c.content.as_str())
        .collect()
}
