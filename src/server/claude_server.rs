// src/server/claude_server.rs
//! Anthropic-shaped messages endpoint: wire types, request validation,
//! conversion to canonical messages, and the nested stream assembler
//! (message -> content blocks -> deltas).

use super::logger::ChatCompletionLogger;
use super::{keep_alive_interval, sse_buffer_size, stream_idle_timeout, ServerData};
use crate::core::engine::{
    CanonicalEvent, EngineError, EngineRequest, EngineStream, GenerationEngine,
};
use crate::core::message::{ChatMessage, MessageContent, MessageContentType, ToolCall};
use crate::tools::assembler::ToolCallAssembler;
use crate::tools::repair::ToolFixContext;
use crate::tools::{Tool, ToolChoice};
use crate::utils::config::SamplingParams;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
};
use flume::r#async::RecvStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::watch;
use tokio::task;
use tokio::time;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClaudeContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: Value },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: ClaudeToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClaudeToolResultContent {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: ClaudeContent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClaudeSystem {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "input_schema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClaudeToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "tool")]
    Tool { name: String },
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeMessageRequest {
    pub model: String,
    pub messages: Vec<ClaudeMessage>,
    #[serde(default)]
    pub system: Option<ClaudeSystem>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<ClaudeTool>>,
    #[serde(default)]
    pub tool_choice: Option<ClaudeToolChoice>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeTokenCountRequest {
    pub model: String,
    pub messages: Vec<ClaudeMessage>,
    #[serde(default)]
    pub system: Option<ClaudeSystem>,
    #[serde(default)]
    pub tools: Option<Vec<ClaudeTool>>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct ClaudeTokenCountResponse {
    pub input_tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct ClaudeMessageResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: &'static str,
    pub role: &'static str,
    pub content: Vec<ClaudeContentBlockOut>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClaudeContentBlockOut {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Serialize)]
pub struct ClaudeUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct ClaudeMessageStartEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub message: ClaudeMessageResponse,
}

#[derive(Debug, Serialize)]
pub struct ClaudeContentBlockStartEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub index: usize,
    pub content_block: ClaudeContentBlockOut,
}

#[derive(Debug, Serialize)]
pub struct ClaudeContentBlockDeltaEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub index: usize,
    pub delta: ClaudeContentDelta,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClaudeContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta {
        #[serde(rename = "partial_json")]
        partial_json: String,
    },
}

#[derive(Debug, Serialize)]
pub struct ClaudeContentBlockStopEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub index: usize,
}

#[derive(Debug, Serialize)]
pub struct ClaudeMessageDeltaEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub delta: ClaudeMessageDelta,
    pub usage: ClaudeUsageDelta,
}

#[derive(Debug, Serialize)]
pub struct ClaudeMessageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaudeUsageDelta {
    pub output_tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct ClaudeMessageStopEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ClaudeErrorResponse {
    #[serde(rename = "type")]
    pub response_type: &'static str,
    pub error: ClaudeErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ClaudeErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// One frame of the named-event SSE stream.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum ClaudeEvent {
    MessageStart(ClaudeMessageStartEvent),
    BlockStart(ClaudeContentBlockStartEvent),
    BlockDelta(ClaudeContentBlockDeltaEvent),
    BlockStop(ClaudeContentBlockStopEvent),
    MessageDelta(ClaudeMessageDeltaEvent),
    MessageStop(ClaudeMessageStopEvent),
}

impl ClaudeEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ClaudeEvent::MessageStart(_) => "message_start",
            ClaudeEvent::BlockStart(_) => "content_block_start",
            ClaudeEvent::BlockDelta(_) => "content_block_delta",
            ClaudeEvent::BlockStop(_) => "content_block_stop",
            ClaudeEvent::MessageDelta(_) => "message_delta",
            ClaudeEvent::MessageStop(_) => "message_stop",
        }
    }
}

pub enum ClaudeResponder {
    Streamer(Sse<ClaudeStreamer>),
    Message(ClaudeMessageResponse),
    TokenCount(ClaudeTokenCountResponse),
    Error(ClaudeErrorResponse, StatusCode),
    /// Engine failure: status and body pass through unmodified.
    Upstream(EngineError),
}

impl IntoResponse for ClaudeResponder {
    fn into_response(self) -> axum::response::Response {
        match self {
            ClaudeResponder::Streamer(s) => s.into_response(),
            ClaudeResponder::Message(m) => Json(m).into_response(),
            ClaudeResponder::TokenCount(c) => Json(c).into_response(),
            ClaudeResponder::Error(err, status) => {
                let mut resp = Json(err).into_response();
                *resp.status_mut() = status;
                resp
            }
            ClaudeResponder::Upstream(err) => {
                let status = StatusCode::from_u16(err.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, err.message).into_response()
            }
        }
    }
}

fn invalid_request(message: String) -> ClaudeResponder {
    ClaudeResponder::Error(
        ClaudeErrorResponse {
            response_type: "error",
            error: ClaudeErrorBody {
                error_type: "invalid_request_error".to_string(),
                message,
            },
        },
        StatusCode::UNPROCESSABLE_ENTITY,
    )
}

#[derive(PartialEq)]
enum ClaudeStreamingStatus {
    Uninitialized,
    Started,
    Interrupted,
    Stopped,
}

enum ClaudeStreamItem {
    Event(Event),
    Done,
}

/// SSE body for the messages endpoint. The protocol has no `[DONE]` sentinel;
/// the stream just ends after `message_stop`.
pub struct ClaudeStreamer {
    rx: RecvStream<'static, ClaudeStreamItem>,
    status: ClaudeStreamingStatus,
    disconnect_tx: Option<watch::Sender<bool>>,
}

impl ClaudeStreamer {
    fn new(rx: flume::Receiver<ClaudeStreamItem>, disconnect_tx: Option<watch::Sender<bool>>) -> Self {
        Self {
            rx: rx.into_stream(),
            status: ClaudeStreamingStatus::Uninitialized,
            disconnect_tx,
        }
    }
}

impl Drop for ClaudeStreamer {
    fn drop(&mut self) {
        if self.status != ClaudeStreamingStatus::Stopped {
            if let Some(tx) = self.disconnect_tx.as_ref() {
                let _ = tx.send(true);
            }
        }
    }
}

impl Stream for ClaudeStreamer {
    type Item = Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.status == ClaudeStreamingStatus::Stopped {
            return Poll::Ready(None);
        }
        match self.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(item)) => match item {
                ClaudeStreamItem::Event(event) => {
                    if self.status != ClaudeStreamingStatus::Started {
                        self.status = ClaudeStreamingStatus::Started;
                    }
                    Poll::Ready(Some(Ok(event)))
                }
                ClaudeStreamItem::Done => {
                    self.status = ClaudeStreamingStatus::Stopped;
                    Poll::Ready(None)
                }
            },
            Poll::Ready(None) => {
                self.status = ClaudeStreamingStatus::Interrupted;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn tool_choice_to_openai(choice: &Option<ClaudeToolChoice>) -> Option<ToolChoice> {
    match choice {
        Some(ClaudeToolChoice::Auto) => Some(ToolChoice::auto()),
        Some(ClaudeToolChoice::Any) => Some(ToolChoice::required()),
        Some(ClaudeToolChoice::None) => Some(ToolChoice::none()),
        Some(ClaudeToolChoice::Tool { name }) => Some(ToolChoice::function(name.clone())),
        None => None,
    }
}

fn claude_tools_to_tools(tools: &[ClaudeTool]) -> Vec<Tool> {
    tools
        .iter()
        .map(|tool| {
            let description = tool.description.clone().unwrap_or_default();
            crate::tools::function_tool(&tool.name, description)
                .parameters_schema(tool.input_schema.clone())
                .build()
        })
        .collect()
}

fn blocks_to_message_content(blocks: &[ClaudeContentBlock]) -> Result<Vec<MessageContent>, String> {
    let mut items = Vec::new();
    for block in blocks {
        match block {
            ClaudeContentBlock::Text { text } => {
                if !text.trim().is_empty() {
                    items.push(MessageContent::Text { text: text.clone() });
                }
            }
            ClaudeContentBlock::Image { .. } => {
                return Err("image blocks are not supported".to_string());
            }
            ClaudeContentBlock::ToolUse { .. } => {
                return Err("tool_use blocks are not valid in plain content".to_string())
            }
            ClaudeContentBlock::ToolResult { .. } => {
                return Err("tool_result blocks are not valid in plain content".to_string())
            }
        }
    }
    Ok(items)
}

fn build_message_content_type(items: Vec<MessageContent>) -> Option<MessageContentType> {
    if items.is_empty() {
        return None;
    }
    if items.len() == 1 {
        let MessageContent::Text { text } = items.into_iter().next()?;
        Some(MessageContentType::PureText(text))
    } else {
        Some(MessageContentType::Multi(items))
    }
}

fn system_to_chat_message(system: &ClaudeSystem) -> Result<ChatMessage, String> {
    let items = match system {
        ClaudeSystem::Text(text) => {
            if text.trim().is_empty() {
                Vec::new()
            } else {
                vec![MessageContent::Text { text: text.clone() }]
            }
        }
        ClaudeSystem::Blocks(blocks) => blocks_to_message_content(blocks)?,
    };

    let content = build_message_content_type(items)
        .ok_or_else(|| "system content must include at least one text block".to_string())?;

    Ok(ChatMessage {
        role: "system".to_string(),
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    })
}

fn tool_result_content_to_text(content: &ClaudeToolResultContent) -> Result<String, String> {
    match content {
        ClaudeToolResultContent::Text(text) => Ok(text.clone()),
        ClaudeToolResultContent::Blocks(blocks) => {
            let mut combined = String::new();
            for block in blocks {
                match block {
                    ClaudeContentBlock::Text { text } => {
                        if !combined.is_empty() {
                            combined.push(' ');
                        }
                        combined.push_str(text);
                    }
                    _ => {
                        return Err(
                            "only text blocks are supported inside tool_result content".to_string()
                        )
                    }
                }
            }
            Ok(combined)
        }
    }
}

fn flush_content_message(out: &mut Vec<ChatMessage>, role: &str, items: &mut Vec<MessageContent>) {
    if let Some(content) = build_message_content_type(std::mem::take(items)) {
        out.push(ChatMessage {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        });
    }
}

fn flush_tool_call_message(out: &mut Vec<ChatMessage>, calls: &mut Vec<ToolCall>) {
    if !calls.is_empty() {
        out.push(ChatMessage::assistant_tool_calls(std::mem::take(calls)));
    }
}

/// Enforce the tool_use / tool_result pairing rules before conversion:
/// tool_use only in assistant messages, tool_result only in user messages and
/// ahead of other blocks, ids non-empty and unique, and every assistant
/// tool_use answered by the immediately-following user message.
fn validate_claude_tool_result_protocol(messages: &[ClaudeMessage]) -> Result<(), String> {
    let mut known_tool_use_ids: HashSet<String> = HashSet::new();
    let mut awaiting_tool_results: Option<HashSet<String>> = None;

    for (idx, message) in messages.iter().enumerate() {
        let role = message.role.as_str();
        if role != "user" && role != "assistant" {
            return Err(format!(
                "unsupported role at messages[{idx}]: {}",
                message.role
            ));
        }
        let mut consumed_expected_results = false;

        if let Some(expected) = awaiting_tool_results.take() {
            if role != "user" {
                return Err(format!(
                    "messages[{idx}] must be a user message with tool_result blocks after assistant tool_use"
                ));
            }

            let ClaudeContent::Blocks(blocks) = &message.content else {
                return Err(format!(
                    "messages[{idx}] must provide tool_result blocks (plain text is not valid here)"
                ));
            };

            let mut provided: HashSet<String> = HashSet::new();
            let mut seen_non_tool_result = false;
            for (block_idx, block) in blocks.iter().enumerate() {
                match block {
                    ClaudeContentBlock::ToolResult { tool_use_id, .. } => {
                        if seen_non_tool_result {
                            return Err(format!(
                                "messages[{idx}].content[{block_idx}] tool_result blocks must appear before other blocks"
                            ));
                        }
                        let id = tool_use_id.trim();
                        if id.is_empty() {
                            return Err(format!(
                                "messages[{idx}].content[{block_idx}] tool_result requires non-empty tool_use_id"
                            ));
                        }
                        if !provided.insert(id.to_string()) {
                            return Err(format!(
                                "messages[{idx}] contains duplicate tool_result for tool_use_id '{}'",
                                id
                            ));
                        }
                    }
                    _ => seen_non_tool_result = true,
                }
            }

            if provided.is_empty() {
                return Err(format!(
                    "messages[{idx}] must start with tool_result blocks for pending tool_use ids"
                ));
            }

            if provided != expected {
                let mut expected_ids = expected.into_iter().collect::<Vec<_>>();
                expected_ids.sort();
                let mut provided_ids = provided.into_iter().collect::<Vec<_>>();
                provided_ids.sort();
                return Err(format!(
                    "messages[{idx}] tool_result ids do not match pending assistant tool_use ids. expected={:?}, provided={:?}",
                    expected_ids, provided_ids
                ));
            }
            consumed_expected_results = true;
        }

        let ClaudeContent::Blocks(blocks) = &message.content else {
            continue;
        };

        let mut message_tool_use_ids: HashSet<String> = HashSet::new();
        let mut has_tool_use = false;
        let mut has_tool_result = false;
        let mut seen_non_tool_result = false;

        for (block_idx, block) in blocks.iter().enumerate() {
            match block {
                ClaudeContentBlock::ToolUse { id, .. } => {
                    if role != "assistant" {
                        return Err(format!(
                            "messages[{idx}].content[{block_idx}] tool_use blocks must be in assistant messages"
                        ));
                    }
                    let call_id = id.trim();
                    if call_id.is_empty() {
                        return Err(format!(
                            "messages[{idx}].content[{block_idx}] tool_use requires non-empty id"
                        ));
                    }
                    if !known_tool_use_ids.insert(call_id.to_string()) {
                        return Err(format!(
                            "messages[{idx}] duplicates tool_use id '{}' from a prior message",
                            call_id
                        ));
                    }
                    message_tool_use_ids.insert(call_id.to_string());
                    has_tool_use = true;
                }
                ClaudeContentBlock::ToolResult { tool_use_id, .. } => {
                    if role != "user" {
                        return Err(format!(
                            "messages[{idx}].content[{block_idx}] tool_result blocks must be in user messages"
                        ));
                    }
                    if seen_non_tool_result {
                        return Err(format!(
                            "messages[{idx}].content[{block_idx}] tool_result blocks must appear before other blocks"
                        ));
                    }
                    let result_id = tool_use_id.trim();
                    if result_id.is_empty() {
                        return Err(format!(
                            "messages[{idx}].content[{block_idx}] tool_result requires non-empty tool_use_id"
                        ));
                    }
                    has_tool_result = true;
                }
                _ => {
                    if role == "user" {
                        seen_non_tool_result = true;
                    }
                }
            }
        }

        if has_tool_use {
            if !message_tool_use_ids.is_empty() {
                awaiting_tool_results = Some(message_tool_use_ids);
            }
        } else if has_tool_result && !consumed_expected_results {
            return Err(format!(
                "messages[{idx}] contains tool_result blocks without a preceding assistant tool_use message"
            ));
        }
    }

    if let Some(pending) = awaiting_tool_results {
        let mut ids = pending.into_iter().collect::<Vec<_>>();
        ids.sort();
        return Err(format!(
            "Missing tool_result response for assistant tool_use ids: {:?}",
            ids
        ));
    }

    Ok(())
}

fn convert_claude_message(message: &ClaudeMessage) -> Result<Vec<ChatMessage>, String> {
    let role = message.role.as_str();
    if role != "user" && role != "assistant" {
        return Err(format!("unsupported role: {}", message.role));
    }

    match &message.content {
        ClaudeContent::Text(text) => {
            if text.trim().is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![ChatMessage::text(role, text.clone())])
        }
        ClaudeContent::Blocks(blocks) => {
            let mut out = Vec::new();
            let mut content_items: Vec<MessageContent> = Vec::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();

            for block in blocks {
                match block {
                    ClaudeContentBlock::Text { text } => {
                        if !tool_calls.is_empty() {
                            flush_tool_call_message(&mut out, &mut tool_calls);
                        }
                        if !text.trim().is_empty() {
                            content_items.push(MessageContent::Text { text: text.clone() });
                        }
                    }
                    ClaudeContentBlock::Image { .. } => {
                        return Err("image blocks are not supported".to_string());
                    }
                    ClaudeContentBlock::ToolUse { id, name, input } => {
                        if role != "assistant" {
                            return Err("tool_use blocks must be in assistant messages".to_string());
                        }
                        flush_content_message(&mut out, role, &mut content_items);
                        // Canonical arguments stay structured; string-encoding
                        // is the OpenAI wire's concern.
                        tool_calls.push(ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: input.clone(),
                        });
                    }
                    ClaudeContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        if role != "user" {
                            return Err("tool_result blocks must be in user messages".to_string());
                        }
                        flush_content_message(&mut out, role, &mut content_items);
                        flush_tool_call_message(&mut out, &mut tool_calls);
                        let raw_text = tool_result_content_to_text(content)?;
                        let is_error = is_error.unwrap_or(false);
                        let text = if raw_text.trim().is_empty() {
                            if is_error {
                                "<tool_use_error>Tool returned an error with no message.</tool_use_error>"
                                    .to_string()
                            } else {
                                "Tool executed successfully with no textual output.".to_string()
                            }
                        } else if is_error && !raw_text.contains("<tool_use_error>") {
                            format!("<tool_use_error>{}</tool_use_error>", raw_text)
                        } else {
                            raw_text
                        };

                        out.push(ChatMessage::tool_result(tool_use_id.clone(), text));
                    }
                }
            }

            flush_content_message(&mut out, role, &mut content_items);
            flush_tool_call_message(&mut out, &mut tool_calls);
            Ok(out)
        }
    }
}

pub fn build_chat_messages(
    system: Option<&ClaudeSystem>,
    claude_messages: &[ClaudeMessage],
) -> Result<Vec<ChatMessage>, String> {
    validate_claude_tool_result_protocol(claude_messages)?;

    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(system_to_chat_message(system)?);
    }
    for message in claude_messages {
        messages.extend(convert_claude_message(message)?);
    }
    if messages.is_empty() {
        return Err("messages cannot be empty".to_string());
    }
    Ok(messages)
}

/// Canonical tool calls -> Anthropic tool_use blocks: `input` stays a
/// structured value, never a string blob.
pub fn tool_calls_to_blocks(tool_calls: &[ToolCall]) -> Vec<ClaudeContentBlockOut> {
    tool_calls
        .iter()
        .map(|call| ClaudeContentBlockOut::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        })
        .collect()
}

enum OpenBlock {
    Text { index: usize, text: String },
    ToolUse { index: usize, call_index: usize },
}

/// Nested state machine: NotStarted -> MessageOpen -> {BlockOpen <->
/// BlockClosed}* -> Closed. Content blocks are 0-indexed in emission order.
/// A tool-use block's accumulated argument text is parsed and repaired when
/// the block stops; the already-emitted deltas are an incremental preview and
/// are not retroactively corrected.
pub(crate) struct MessageStreamAssembler {
    message_id: String,
    model: String,
    input_tokens: usize,
    fix_ctx: ToolFixContext,
    tools: ToolCallAssembler,
    started: bool,
    closed: bool,
    current_block: Option<OpenBlock>,
    next_block_index: usize,
    block_for_call: HashMap<usize, usize>,
    blocks: Vec<ClaudeContentBlockOut>,
    saw_tool_use: bool,
    output_tokens: usize,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
}

impl MessageStreamAssembler {
    pub(crate) fn new(
        message_id: String,
        model: String,
        input_tokens: usize,
        fix_ctx: ToolFixContext,
    ) -> Self {
        Self {
            message_id,
            model,
            input_tokens,
            fix_ctx,
            tools: ToolCallAssembler::new(),
            started: false,
            closed: false,
            current_block: None,
            next_block_index: 0,
            block_for_call: HashMap::new(),
            blocks: Vec::new(),
            saw_tool_use: false,
            output_tokens: 0,
            stop_reason: None,
            stop_sequence: None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_started(&mut self, out: &mut Vec<ClaudeEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(ClaudeEvent::MessageStart(ClaudeMessageStartEvent {
            event_type: "message_start",
            message: ClaudeMessageResponse {
                id: self.message_id.clone(),
                response_type: "message",
                role: "assistant",
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: ClaudeUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            },
        }));
    }

    fn close_current_block(&mut self, out: &mut Vec<ClaudeEvent>) {
        match self.current_block.take() {
            None => {}
            Some(OpenBlock::Text { index, text }) => {
                out.push(ClaudeEvent::BlockStop(ClaudeContentBlockStopEvent {
                    event_type: "content_block_stop",
                    index,
                }));
                self.blocks.push(ClaudeContentBlockOut::Text { text });
            }
            Some(OpenBlock::ToolUse { index, call_index }) => {
                out.push(ClaudeEvent::BlockStop(ClaudeContentBlockStopEvent {
                    event_type: "content_block_stop",
                    index,
                }));
                if let Some(call) = self.tools.on_end(call_index, &self.fix_ctx) {
                    self.blocks.push(ClaudeContentBlockOut::ToolUse {
                        id: call.id,
                        name: call.name,
                        input: call.arguments,
                    });
                }
            }
        }
    }

    /// Render the next canonical event into zero or more protocol frames.
    pub(crate) fn on_event(&mut self, event: CanonicalEvent) -> Vec<ClaudeEvent> {
        if self.closed {
            crate::log_warn!("Ignoring engine event after message_stop");
            return Vec::new();
        }
        if matches!(event, CanonicalEvent::Error(_)) {
            return Vec::new();
        }

        let mut out = Vec::new();
        self.ensure_started(&mut out);

        match event {
            CanonicalEvent::TextDelta(text) => {
                if text.is_empty() {
                    return out;
                }
                if !matches!(self.current_block, Some(OpenBlock::Text { .. })) {
                    self.close_current_block(&mut out);
                    let index = self.next_block_index;
                    self.next_block_index += 1;
                    out.push(ClaudeEvent::BlockStart(ClaudeContentBlockStartEvent {
                        event_type: "content_block_start",
                        index,
                        content_block: ClaudeContentBlockOut::Text {
                            text: String::new(),
                        },
                    }));
                    self.current_block = Some(OpenBlock::Text {
                        index,
                        text: String::new(),
                    });
                }
                if let Some(OpenBlock::Text { index, text: buffer }) = &mut self.current_block {
                    buffer.push_str(&text);
                    out.push(ClaudeEvent::BlockDelta(ClaudeContentBlockDeltaEvent {
                        event_type: "content_block_delta",
                        index: *index,
                        delta: ClaudeContentDelta::TextDelta { text },
                    }));
                }
            }
            CanonicalEvent::ToolCallStart {
                index: call_index,
                id,
                name,
            } => {
                self.close_current_block(&mut out);
                let id = self.tools.on_start(call_index, id, &name);
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.block_for_call.insert(call_index, index);
                self.current_block = Some(OpenBlock::ToolUse { index, call_index });
                self.saw_tool_use = true;
                out.push(ClaudeEvent::BlockStart(ClaudeContentBlockStartEvent {
                    event_type: "content_block_start",
                    index,
                    content_block: ClaudeContentBlockOut::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                }));
            }
            CanonicalEvent::ToolCallArgsDelta {
                index: call_index,
                fragment,
            } => {
                self.tools.on_fragment(call_index, &fragment);
                if let Some(index) = self.block_for_call.get(&call_index) {
                    out.push(ClaudeEvent::BlockDelta(ClaudeContentBlockDeltaEvent {
                        event_type: "content_block_delta",
                        index: *index,
                        delta: ClaudeContentDelta::InputJsonDelta {
                            partial_json: fragment,
                        },
                    }));
                }
            }
            CanonicalEvent::ToolCallEnd { index: call_index } => {
                if matches!(
                    self.current_block,
                    Some(OpenBlock::ToolUse { call_index: open, .. }) if open == call_index
                ) {
                    self.close_current_block(&mut out);
                } else if let Some(index) = self.block_for_call.get(&call_index).copied() {
                    out.push(ClaudeEvent::BlockStop(ClaudeContentBlockStopEvent {
                        event_type: "content_block_stop",
                        index,
                    }));
                    if let Some(call) = self.tools.on_end(call_index, &self.fix_ctx) {
                        self.blocks.push(ClaudeContentBlockOut::ToolUse {
                            id: call.id,
                            name: call.name,
                            input: call.arguments,
                        });
                    }
                }
            }
            CanonicalEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.input_tokens = input_tokens;
                self.output_tokens = output_tokens;
            }
            CanonicalEvent::Finish {
                reason,
                stop_sequence,
            } => {
                self.close_current_block(&mut out);
                for (call_index, call) in self.tools.close_pending(&self.fix_ctx) {
                    if let Some(index) = self.block_for_call.get(&call_index).copied() {
                        out.push(ClaudeEvent::BlockStop(ClaudeContentBlockStopEvent {
                            event_type: "content_block_stop",
                            index,
                        }));
                    }
                    self.blocks.push(ClaudeContentBlockOut::ToolUse {
                        id: call.id,
                        name: call.name,
                        input: call.arguments,
                    });
                }

                let stop_reason = if self.saw_tool_use {
                    "tool_use".to_string()
                } else {
                    reason.as_claude().to_string()
                };
                self.stop_reason = Some(stop_reason.clone());
                self.stop_sequence = stop_sequence.clone();
                out.push(ClaudeEvent::MessageDelta(ClaudeMessageDeltaEvent {
                    event_type: "message_delta",
                    delta: ClaudeMessageDelta {
                        stop_reason: Some(stop_reason),
                        stop_sequence,
                    },
                    usage: ClaudeUsageDelta {
                        output_tokens: self.output_tokens,
                    },
                }));
                out.push(ClaudeEvent::MessageStop(ClaudeMessageStopEvent {
                    event_type: "message_stop",
                }));
                self.closed = true;
            }
            CanonicalEvent::Error(_) => {}
        }
        out
    }

    /// Collapse the consumed event sequence into one Messages response.
    pub(crate) fn into_response(self) -> ClaudeMessageResponse {
        ClaudeMessageResponse {
            id: self.message_id,
            response_type: "message",
            role: "assistant",
            content: self.blocks,
            model: self.model,
            stop_reason: self.stop_reason,
            stop_sequence: self.stop_sequence,
            usage: ClaudeUsage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
            },
        }
    }
}

pub async fn messages(
    State(data): State<Arc<ServerData>>,
    Json(request): Json<ClaudeMessageRequest>,
) -> ClaudeResponder {
    let logger = ChatCompletionLogger::new_claude();
    if let Some(ref l) = logger {
        l.log_raw_request(&request);
    }

    let chat_messages = match build_chat_messages(request.system.as_ref(), &request.messages) {
        Ok(messages) => messages,
        Err(err) => return invalid_request(err),
    };

    let model_id = if request.model.trim().is_empty() {
        data.engine.model_id()
    } else {
        request.model.clone()
    };
    let max_tokens = request
        .max_tokens
        .unwrap_or_else(|| data.config.default_max_tokens());

    let mut sampling = SamplingParams::new_with_max_tokens(max_tokens);
    sampling.temperature = request.temperature;
    sampling.top_p = request.top_p;
    sampling.top_k = request.top_k.map(|v| v as isize);
    if let Some(stop_sequences) = &request.stop_sequences {
        if !stop_sequences.is_empty() {
            sampling.stop_sequences = Some(stop_sequences.clone());
        }
    }

    let mut resolved_tools = claude_tools_to_tools(request.tools.as_deref().unwrap_or_default());
    let mut forced_tool_name: Option<String> = None;
    let mut tool_choice_required = false;

    match request.tool_choice.as_ref() {
        Some(ClaudeToolChoice::None) => {
            resolved_tools.clear();
        }
        Some(ClaudeToolChoice::Tool { name }) => {
            tool_choice_required = true;
            forced_tool_name = Some(name.clone());
        }
        Some(ClaudeToolChoice::Any) => {
            tool_choice_required = true;
        }
        Some(ClaudeToolChoice::Auto) | None => {}
    }

    if let Some(name) = forced_tool_name.as_deref() {
        let selected = resolved_tools
            .iter()
            .find(|tool| tool.function.name == name)
            .cloned();
        match selected {
            Some(tool) => {
                resolved_tools = vec![tool];
            }
            None => {
                return invalid_request(format!(
                    "tool_choice requires tool '{name}' but it was not provided"
                ));
            }
        }
    }

    if tool_choice_required && resolved_tools.is_empty() {
        return invalid_request(
            "tool_choice requires at least one tool but none were provided".to_string(),
        );
    }

    let fix_ctx = ToolFixContext::new(
        data.config.tool_parser_type.clone(),
        if resolved_tools.is_empty() {
            None
        } else {
            Some(resolved_tools.as_slice())
        },
    );

    let engine_request = EngineRequest {
        messages: chat_messages,
        tools: resolved_tools,
        tool_choice: tool_choice_to_openai(&request.tool_choice),
        sampling,
    };
    let use_stream = request.stream.unwrap_or(false);

    let EngineStream {
        seq_id,
        input_tokens,
        mut events,
    } = match data.engine.generate_stream(engine_request) {
        Ok(stream) => stream,
        Err(err) => {
            crate::log_error!("Stream generation failed: {err}");
            return ClaudeResponder::Upstream(err);
        }
    };

    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    let mut assembler = MessageStreamAssembler::new(message_id, model_id, input_tokens, fix_ctx);

    if use_stream {
        let (response_tx, client_rx) = flume::bounded(sse_buffer_size());
        let (disconnect_tx, mut disconnect_rx) = watch::channel(false);
        let engine: Arc<dyn GenerationEngine> = data.engine.clone();
        let stream_logger = logger.clone();
        if let Some(ref l) = stream_logger {
            l.log_start_response();
        }

        task::spawn(async move {
            let idle_timeout = stream_idle_timeout();
            'stream: loop {
                let item = tokio::select! {
                    item = events.recv() => item,
                    changed = disconnect_rx.changed() => {
                        if changed.is_err() || *disconnect_rx.borrow() {
                            crate::log_warn!("[Seq {}] SSE client disconnected", seq_id);
                            engine.cancel(seq_id);
                            break;
                        }
                        continue;
                    }
                    _ = time::sleep(idle_timeout) => {
                        crate::log_warn!(
                            "[Seq {}] Stream idle timeout reached, cancelling request",
                            seq_id
                        );
                        engine.cancel(seq_id);
                        break;
                    }
                };

                let Some(event) = item else { break };

                if let CanonicalEvent::Error(err) = &event {
                    crate::log_error!("[Seq {}] Engine stream error: {}", seq_id, err);
                    if let Some(ref l) = stream_logger {
                        l.log_error(&err.message);
                    }
                    let error = ClaudeErrorResponse {
                        response_type: "error",
                        error: ClaudeErrorBody {
                            error_type: "server_error".to_string(),
                            message: err.message.clone(),
                        },
                    };
                    if let Ok(sse) = Event::default().event("error").json_data(&error) {
                        let _ = response_tx.send_async(ClaudeStreamItem::Event(sse)).await;
                    }
                    break;
                }

                if let CanonicalEvent::TextDelta(text) = &event {
                    if let Some(ref l) = stream_logger {
                        l.log_stream_token(text);
                    }
                }

                let finished = matches!(event, CanonicalEvent::Finish { .. });
                for frame in assembler.on_event(event) {
                    match Event::default().event(frame.name()).json_data(&frame) {
                        Ok(sse) => {
                            if response_tx
                                .send_async(ClaudeStreamItem::Event(sse))
                                .await
                                .is_err()
                            {
                                crate::log_warn!("[Seq {}] SSE channel closed mid-stream", seq_id);
                                engine.cancel(seq_id);
                                break 'stream;
                            }
                        }
                        Err(err) => {
                            crate::log_error!(
                                "[Seq {}] Failed to serialize {} event: {:?}",
                                seq_id,
                                frame.name(),
                                err
                            );
                        }
                    }
                }
                if finished {
                    break;
                }
            }
            let _ = response_tx.try_send(ClaudeStreamItem::Done);
        });

        ClaudeResponder::Streamer(
            Sse::new(ClaudeStreamer::new(client_rx, Some(disconnect_tx))).keep_alive(
                KeepAlive::new()
                    .interval(keep_alive_interval())
                    .text("keep-alive"),
            ),
        )
    } else {
        while let Some(event) = events.recv().await {
            if let CanonicalEvent::Error(err) = event {
                crate::log_error!("[Seq {}] Engine stream error: {}", seq_id, err);
                return ClaudeResponder::Upstream(err);
            }
            assembler.on_event(event);
            if assembler.is_closed() {
                break;
            }
        }
        let response = assembler.into_response();
        if let Some(ref l) = logger {
            l.log_raw_response(&response);
        }
        ClaudeResponder::Message(response)
    }
}

pub async fn count_tokens(
    State(data): State<Arc<ServerData>>,
    Json(request): Json<ClaudeTokenCountRequest>,
) -> ClaudeResponder {
    let messages = match build_chat_messages(request.system.as_ref(), &request.messages) {
        Ok(messages) => messages,
        Err(err) => return invalid_request(err),
    };
    let tools = claude_tools_to_tools(request.tools.as_deref().unwrap_or_default());
    let engine_request = EngineRequest {
        messages,
        tools,
        tool_choice: None,
        sampling: SamplingParams::default(),
    };
    match data.engine.count_tokens(&engine_request) {
        Ok(input_tokens) => ClaudeResponder::TokenCount(ClaudeTokenCountResponse { input_tokens }),
        Err(err) => ClaudeResponder::Upstream(err),
    }
}
