use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in a conversation's replayable item sequence.
///
/// The ordering of items is what lets the model engine attribute tool results
/// to the calls that produced them, so the sequence is append-only and is
/// always replayed in full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnItem {
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        output: Value,
    },
}

impl TurnItem {
    pub fn user(content: impl Into<String>) -> Self {
        TurnItem::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        TurnItem::Assistant {
            content: content.into(),
        }
    }
}

/// Token usage reported by the model engine for one turn.
///
/// Absent usage means the provider did not report it; it is never
/// conflated with a zero count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A tool as advertised by the server's catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

impl ToolInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }
}
