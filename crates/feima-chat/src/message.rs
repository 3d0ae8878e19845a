//! Host-domain chat messages.
//!
//! The host delivers heterogeneous message parts; modelling them as a sum
//! type makes the wire translation a pattern match per variant instead of a
//! walk over loosely typed values.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// A tool invocation the model issued on an earlier turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub call_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// The host's answer to a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    pub call_id: String,
    pub content: Vec<ChatPart>,
}

impl ToolResultPart {
    /// Result payload as sent on the wire: its text parts joined.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ChatPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Opaque binary attachment (images and the like).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPart {
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatPart {
    Text(String),
    ToolCall(ToolCallPart),
    ToolResult(ToolResultPart),
    Data(DataPart),
    Thinking(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub parts: Vec<ChatPart>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            parts: vec![ChatPart::Text(text.into())],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            parts: vec![ChatPart::Text(text.into())],
        }
    }

    /// Concatenated text parts, the wire `content` for plain messages.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ChatPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.parts.iter().filter_map(|p| match p {
            ChatPart::ToolCall(c) => Some(c),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultPart> {
        self.parts.iter().filter_map(|p| match p {
            ChatPart::ToolResult(r) => Some(r),
            _ => None,
        })
    }

    pub fn has_tool_results(&self) -> bool {
        self.tool_results().next().is_some()
    }
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments; an empty object means "no parameters".
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolMode {
    #[default]
    Auto,
    Required,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub tools: Vec<ToolDefinition>,
    pub tool_mode: ToolMode,
}
