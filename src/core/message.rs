// src/core/message.rs
//! Protocol-neutral message representation shared by both HTTP surfaces and
//! the generation engine boundary.
//!
//! Tool-call arguments are ALWAYS a structured `serde_json::Value` here.
//! String-encoding is an OpenAI wire concern and happens only at that
//! boundary (see `server::canonical_tool_calls_to_wire`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum MessageContent {
    #[serde(rename = "text", alias = "input_text")]
    Text { text: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContentType {
    PureText(String),
    Multi(Vec<MessageContent>),
}

impl MessageContentType {
    /// Flatten to plain text, joining multi-part content with spaces.
    pub fn joined_text(&self) -> String {
        match self {
            MessageContentType::PureText(text) => text.clone(),
            MessageContentType::Multi(items) => items
                .iter()
                .map(|MessageContent::Text { text }| text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// One model-emitted (or caller-replayed) tool invocation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: role.into(),
            content: Some(MessageContentType::PureText(content.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        ChatMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool-result message answering one prior tool call.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: "tool".to_string(),
            content: Some(MessageContentType::PureText(content.into())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}
