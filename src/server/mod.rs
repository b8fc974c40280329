pub mod claude_server;
pub mod logger;
pub mod server;
pub mod streaming;

use crate::core::engine::{EngineError, GenerationEngine};
use crate::core::message::{ChatMessage, MessageContent, MessageContentType, ToolCall};
use crate::server::streaming::Streamer;
use crate::tools::{Tool, ToolChoice};
use crate::utils::config::GatewayConfig;
use axum::extract::Json;
use axum::http::{self, StatusCode};
use axum::response::{IntoResponse, Sse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<WireMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub top_k: Option<isize>,
    pub top_p: Option<f32>,
    pub stream: Option<bool>,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub tools: Option<Vec<Tool>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum StopSequences {
    Single(String),
    Multiple(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::Single(s) => vec![s],
            StopSequences::Multiple(v) => v,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

/// One message as it appears on the OpenAI wire. `function.arguments` may
/// arrive either as a JSON text string (the protocol's contract) or as a
/// structured value from callers that mix encodings; `process_message_content`
/// normalizes the latter to the former.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WireMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<WireContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<MessageContent>),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WireToolCall {
    #[serde(default = "crate::tools::generate_tool_call_id")]
    pub id: String,
    #[serde(rename = "type", default = "default_wire_tool_type")]
    pub tool_type: String,
    pub function: WireFunctionCall,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WireFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

fn default_wire_tool_type() -> String {
    "function".to_string()
}

/// Normalize a constructed OpenAI-shaped message list in place: every tool
/// call whose `function.arguments` is a structured value is re-encoded as a
/// JSON text string, as the wire contract requires. Idempotent.
pub fn process_message_content(messages: &mut [WireMessage]) {
    for message in messages {
        let Some(tool_calls) = message.tool_calls.as_mut() else {
            continue;
        };
        for call in tool_calls {
            let arguments = &mut call.function.arguments;
            if arguments.is_string() {
                continue;
            }
            let encoded = if arguments.is_null() {
                "{}".to_string()
            } else {
                encode_arguments(arguments)
            };
            *arguments = Value::String(encoded);
        }
    }
}

/// String-encode a structured argument value for the OpenAI wire.
pub fn encode_arguments(arguments: &Value) -> String {
    serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string())
}

/// Parse wire argument text into the canonical structured value. Unparsable
/// text is preserved as a string value rather than rejected.
pub fn parse_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Value::Object(serde_json::Map::new());
            }
            serde_json::from_str(trimmed).unwrap_or_else(|_| arguments.clone())
        }
        Value::Null => Value::Object(serde_json::Map::new()),
        structured => structured.clone(),
    }
}

/// OpenAI wire messages -> canonical messages.
pub fn wire_messages_to_canonical(messages: &[WireMessage]) -> Result<Vec<ChatMessage>, String> {
    let mut out = Vec::with_capacity(messages.len());
    for (idx, message) in messages.iter().enumerate() {
        let role = message.role.as_str();
        match role {
            "system" | "user" | "assistant" | "tool" => {}
            other => return Err(format!("unsupported role at messages[{idx}]: {other}")),
        }
        if role == "tool" && message.tool_call_id.is_none() {
            return Err(format!("messages[{idx}]: tool messages require tool_call_id"));
        }

        let content = message.content.as_ref().map(|content| match content {
            WireContent::Text(text) => MessageContentType::PureText(text.clone()),
            WireContent::Parts(parts) => MessageContentType::Multi(parts.clone()),
        });

        let tool_calls = message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|call| ToolCall {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: parse_arguments(&call.function.arguments),
                })
                .collect::<Vec<_>>()
        });

        out.push(ChatMessage {
            role: role.to_string(),
            content,
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        });
    }
    Ok(out)
}

/// Canonical tool calls -> OpenAI wire shape, arguments string-encoded.
pub fn canonical_tool_calls_to_wire(calls: &[ToolCall]) -> Vec<WireToolCall> {
    calls
        .iter()
        .map(|call| WireToolCall {
            id: call.id.clone(),
            tool_type: "function".to_string(),
            function: WireFunctionCall {
                name: call.name.clone(),
                arguments: Value::String(encode_arguments(&call.arguments)),
            },
        })
        .collect()
}

#[derive(Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize, Clone, Debug)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoiceChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Serialize)]
pub struct ChatChoiceChunk {
    pub index: usize,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Serialize, Default)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Serialize)]
pub struct ToolCallChunk {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<&'static str>,
    pub function: FunctionChunk,
}

#[derive(Serialize)]
pub struct FunctionChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arguments: String,
}

pub struct ServerData {
    pub engine: Arc<dyn GenerationEngine>,
    pub config: GatewayConfig,
}

trait ErrorToResponse: Serialize {
    fn to_response(&self, code: StatusCode) -> axum::response::Response {
        let mut r = Json(self).into_response();
        *r.status_mut() = code;
        r
    }
}

#[derive(Serialize)]
struct JsonError {
    message: String,
}

impl JsonError {
    fn new(message: String) -> Self {
        Self { message }
    }
}
impl ErrorToResponse for JsonError {}

pub enum ChatResponder {
    Streamer(Sse<Streamer>),
    Completion(ChatCompletionResponse),
    /// Engine failure: status and body pass through unmodified.
    Upstream(EngineError),
    InternalError(String),
    ValidationError(String),
}

impl IntoResponse for ChatResponder {
    fn into_response(self) -> axum::response::Response {
        match self {
            ChatResponder::Streamer(s) => s.into_response(),
            ChatResponder::Completion(s) => Json(s).into_response(),
            ChatResponder::Upstream(err) => {
                let status = StatusCode::from_u16(err.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, err.message).into_response()
            }
            ChatResponder::InternalError(e) => {
                JsonError::new(e).to_response(http::StatusCode::INTERNAL_SERVER_ERROR)
            }
            ChatResponder::ValidationError(e) => {
                JsonError::new(e).to_response(http::StatusCode::UNPROCESSABLE_ENTITY)
            }
        }
    }
}

pub(crate) fn created_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub(crate) fn sse_buffer_size() -> usize {
    env::var("LMBRIDGE_SSE_BUFFER")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(256)
}

pub(crate) fn keep_alive_interval() -> Duration {
    Duration::from_millis(
        env::var("KEEP_ALIVE_INTERVAL")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .unwrap_or(100),
    )
}

pub(crate) fn stream_idle_timeout() -> Duration {
    Duration::from_millis(
        env::var("LMBRIDGE_STREAM_IDLE_TIMEOUT_MS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .unwrap_or(300_000),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn process_message_content_string_encodes_structured_arguments() {
        let mut messages = vec![WireMessage {
            role: "assistant".to_string(),
            content: Some(WireContent::Text(String::new())),
            tool_calls: Some(vec![WireToolCall {
                id: "call_1".to_string(),
                tool_type: "function".to_string(),
                function: WireFunctionCall {
                    name: "echo".to_string(),
                    arguments: json!({"text": "ok"}),
                },
            }]),
            tool_call_id: None,
        }];

        process_message_content(&mut messages);

        let args = &messages[0].tool_calls.as_ref().unwrap()[0].function.arguments;
        let text = args.as_str().expect("string-encoded arguments");
        assert_eq!(
            serde_json::from_str::<Value>(text).unwrap(),
            json!({"text": "ok"})
        );

        // Idempotent: a second pass leaves the encoding alone.
        let before = serde_json::to_value(&messages).unwrap();
        process_message_content(&mut messages);
        assert_eq!(serde_json::to_value(&messages).unwrap(), before);
    }

    #[test]
    fn wire_round_trip_parses_string_arguments() {
        let messages = vec![WireMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![WireToolCall {
                id: "call_1".to_string(),
                tool_type: "function".to_string(),
                function: WireFunctionCall {
                    name: "echo".to_string(),
                    arguments: json!(r#"{"text": "hi"}"#),
                },
            }]),
            tool_call_id: None,
        }];

        let canonical = wire_messages_to_canonical(&messages).unwrap();
        let calls = canonical[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].arguments, json!({"text": "hi"}));

        let wire = canonical_tool_calls_to_wire(calls);
        let encoded = wire[0].function.arguments.as_str().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(encoded).unwrap(),
            json!({"text": "hi"})
        );
    }

    #[test]
    fn unparsable_argument_text_is_preserved() {
        assert_eq!(
            parse_arguments(&json!(r#"{"broken":"#)),
            json!(r#"{"broken":"#)
        );
        assert_eq!(parse_arguments(&json!("")), json!({}));
        assert_eq!(parse_arguments(&Value::Null), json!({}));
    }

    #[test]
    fn tool_messages_require_tool_call_id() {
        let messages = vec![WireMessage {
            role: "tool".to_string(),
            content: Some(WireContent::Text("result".to_string())),
            tool_calls: None,
            tool_call_id: None,
        }];
        assert!(wire_messages_to_canonical(&messages).is_err());
    }

    #[test]
    fn multipart_content_maps_to_canonical_parts() {
        let messages = vec![WireMessage {
            role: "user".to_string(),
            content: Some(WireContent::Parts(vec![MessageContent::Text {
                text: "hello".to_string(),
            }])),
            tool_calls: None,
            tool_call_id: None,
        }];
        let canonical = wire_messages_to_canonical(&messages).unwrap();
        assert_eq!(
            canonical[0].content.as_ref().unwrap().joined_text(),
            "hello"
        );
    }
}
