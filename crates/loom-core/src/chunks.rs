use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Category of a produced output chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Thinking,
    ToolCall,
    ToolResult,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "thinking" => Ok(Self::Thinking),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            other => Err(format!("unknown content type: {other}")),
        }
    }
}

/// One unit of streamed output. Immutable once appended.
///
/// `metadata` may carry a `position` hint from the producer. It is advisory:
/// replay order is the buffer index assigned at append time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl StreamChunk {
    pub fn new(content_type: ContentType, content: impl Into<String>) -> Self {
        Self {
            content_type,
            content: content.into(),
            metadata: Map::new(),
            timestamp: crate::time::now(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(ContentType::Text, content)
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(ContentType::Thinking, content)
    }

    pub fn tool_call(content: impl Into<String>) -> Self {
        Self::new(ContentType::ToolCall, content)
    }

    pub fn tool_result(content: impl Into<String>) -> Self {
        Self::new(ContentType::ToolResult, content)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.metadata.insert(key.into(), value);
        self
    }

    /// Producer-supplied position hint, if any.
    pub fn position_hint(&self) -> Option<u64> {
        self.metadata.get("position").and_then(Value::as_u64)
    }

    pub fn is_thinking(&self) -> bool {
        self.content_type == ContentType::Thinking
    }
}
