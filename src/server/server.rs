// src/server/server.rs
//! OpenAI-shaped chat completions endpoint: request handling and the linear
//! stream assembler turning canonical engine events into protocol chunks.

use super::streaming::{ChatResponse, Streamer};
use super::{
    canonical_tool_calls_to_wire, created_timestamp, process_message_content, sse_buffer_size,
    stream_idle_timeout, wire_messages_to_canonical, AssistantMessage, ChatChoice, ChatChoiceChunk,
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatResponder, Delta,
    FunctionChunk, ServerData, ToolCallChunk, Usage,
};
use crate::core::engine::{CanonicalEvent, EngineRequest, EngineStream, GenerationEngine};
use crate::core::message::ToolCall;
use crate::server::logger::ChatCompletionLogger;
use crate::tools::assembler::ToolCallAssembler;
use crate::tools::helpers::{log_tool_calls, retain_tool_calls_forced_name};
use crate::tools::repair::ToolFixContext;
use crate::tools::{ToolChoice, ToolChoiceMode};
use crate::utils::config::SamplingParams;
use axum::{
    extract::{Json, State},
    response::{sse::KeepAlive, Sse},
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task;
use tokio::time;
use uuid::Uuid;

/// Linear state machine: Open -> Streaming -> Done. Produces protocol chunks
/// for streaming responses while tracking enough state to collapse the same
/// event sequence into a single response object.
pub(crate) struct ChatStreamAssembler {
    id: String,
    created: u64,
    model: String,
    include_usage: bool,
    fix_ctx: ToolFixContext,
    forced_tool_name: Option<String>,
    tools: ToolCallAssembler,
    emitted_tool_chunk: bool,
    text: String,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    finished_calls: Vec<ToolCall>,
    done: bool,
}

impl ChatStreamAssembler {
    pub(crate) fn new(
        model: String,
        include_usage: bool,
        fix_ctx: ToolFixContext,
        forced_tool_name: Option<String>,
    ) -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("chatcmpl-{}", &raw[..8]),
            created: created_timestamp(),
            model,
            include_usage,
            fix_ctx,
            forced_tool_name,
            tools: ToolCallAssembler::new(),
            emitted_tool_chunk: false,
            text: String::new(),
            usage: None,
            finish_reason: None,
            finished_calls: Vec::new(),
            done: false,
        }
    }

    fn chunk(&self, choices: Vec<ChatChoiceChunk>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices,
            usage,
        }
    }

    fn delta_chunk(&self, delta: Delta) -> ChatCompletionChunk {
        self.chunk(
            vec![ChatChoiceChunk {
                index: 0,
                delta,
                finish_reason: None,
            }],
            None,
        )
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Render the next canonical event. Returns the chunks to flush, in
    /// order. Events after `Finish` are ignored.
    pub(crate) fn on_event(&mut self, event: CanonicalEvent) -> Vec<ChatCompletionChunk> {
        if self.done {
            crate::log_warn!("Ignoring engine event after finish chunk");
            return Vec::new();
        }
        match event {
            CanonicalEvent::TextDelta(text) => {
                if text.is_empty() {
                    return Vec::new();
                }
                self.text.push_str(&text);
                vec![self.delta_chunk(Delta {
                    content: Some(text),
                    tool_calls: None,
                })]
            }
            CanonicalEvent::ToolCallStart { index, id, name } => {
                let id = self.tools.on_start(index, id, &name);
                self.emitted_tool_chunk = true;
                vec![self.delta_chunk(Delta {
                    content: None,
                    tool_calls: Some(vec![ToolCallChunk {
                        index,
                        id: Some(id),
                        tool_type: Some("function"),
                        function: FunctionChunk {
                            name: Some(name),
                            arguments: String::new(),
                        },
                    }]),
                })]
            }
            CanonicalEvent::ToolCallArgsDelta { index, fragment } => {
                self.tools.on_fragment(index, &fragment);
                vec![self.delta_chunk(Delta {
                    content: None,
                    tool_calls: Some(vec![ToolCallChunk {
                        index,
                        id: None,
                        tool_type: None,
                        function: FunctionChunk {
                            name: None,
                            arguments: fragment,
                        },
                    }]),
                })]
            }
            CanonicalEvent::ToolCallEnd { index } => {
                // Repair runs here, against the fully assembled text; the
                // already-flushed fragments stay as sent.
                self.tools.on_end(index, &self.fix_ctx);
                Vec::new()
            }
            CanonicalEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.usage = Some(Usage {
                    prompt_tokens: input_tokens,
                    completion_tokens: output_tokens,
                    total_tokens: input_tokens + output_tokens,
                });
                Vec::new()
            }
            CanonicalEvent::Finish { reason, .. } => {
                let mut calls = self.tools.finalize(&self.fix_ctx);
                let dropped =
                    retain_tool_calls_forced_name(&mut calls, self.forced_tool_name.as_deref());
                if dropped > 0 {
                    crate::log_warn!(
                        "Dropped {} tool call(s) that did not match forced tool_choice",
                        dropped
                    );
                }
                log_tool_calls("Assembled", &calls);

                let has_tool_calls = self.emitted_tool_chunk || !calls.is_empty();
                let finish_reason = if has_tool_calls {
                    "tool_calls".to_string()
                } else {
                    reason.as_openai().to_string()
                };
                self.finish_reason = Some(finish_reason.clone());
                self.finished_calls = calls;
                self.done = true;

                let mut out = vec![self.chunk(
                    vec![ChatChoiceChunk {
                        index: 0,
                        delta: Delta::default(),
                        finish_reason: Some(finish_reason),
                    }],
                    None,
                )];
                if self.include_usage {
                    let usage = self.usage.clone().unwrap_or(Usage {
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        total_tokens: 0,
                    });
                    out.push(self.chunk(Vec::new(), Some(usage)));
                }
                out
            }
            CanonicalEvent::Error(_) => Vec::new(),
        }
    }

    /// Collapse the consumed event sequence into a single response object.
    pub(crate) fn into_response(self, input_tokens: usize) -> ChatCompletionResponse {
        let tool_calls = if self.finished_calls.is_empty() {
            None
        } else {
            Some(canonical_tool_calls_to_wire(&self.finished_calls))
        };
        let content = if self.text.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(self.text)
        };
        let usage = self.usage.unwrap_or(Usage {
            prompt_tokens: input_tokens,
            completion_tokens: 0,
            total_tokens: input_tokens,
        });
        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion",
            created: self.created,
            model: self.model,
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                    tool_calls,
                },
                finish_reason: self.finish_reason.or_else(|| Some("stop".to_string())),
            }],
            usage,
        }
    }
}

pub async fn chat_completion(
    State(data): State<Arc<ServerData>>,
    Json(mut request): Json<ChatCompletionRequest>,
) -> ChatResponder {
    let logger = ChatCompletionLogger::new();
    if let Some(ref l) = logger {
        l.log_raw_request(&request);
    }

    process_message_content(&mut request.messages);
    let messages = match wire_messages_to_canonical(&request.messages) {
        Ok(messages) => messages,
        Err(err) => return ChatResponder::ValidationError(err),
    };
    if messages.is_empty() {
        return ChatResponder::ValidationError("messages cannot be empty".to_string());
    }

    let model_id = request
        .model
        .clone()
        .unwrap_or_else(|| data.engine.model_id());
    let max_tokens = request
        .max_tokens
        .unwrap_or_else(|| data.config.default_max_tokens());

    let mut sampling = SamplingParams::new_with_max_tokens(max_tokens);
    sampling.temperature = request.temperature;
    sampling.top_p = request.top_p;
    sampling.top_k = request.top_k;
    sampling.stop_sequences = request.stop.clone().map(|stop| stop.into_vec());

    let mut tools = request.tools.clone().unwrap_or_default();
    let mut forced_tool_name: Option<String> = None;
    match request.tool_choice.as_ref() {
        Some(ToolChoice::Mode(ToolChoiceMode::None)) => {
            tools.clear();
        }
        Some(choice @ ToolChoice::Function { .. }) => {
            let name = choice.forced_name().unwrap_or_default().to_string();
            let selected = tools
                .iter()
                .find(|tool| tool.function.name == name)
                .cloned();
            match selected {
                Some(tool) => {
                    tools = vec![tool];
                    forced_tool_name = Some(name);
                }
                None => {
                    return ChatResponder::ValidationError(format!(
                        "tool_choice requires tool '{name}' but it was not provided"
                    ));
                }
            }
        }
        Some(ToolChoice::Mode(ToolChoiceMode::Required)) if tools.is_empty() => {
            return ChatResponder::ValidationError(
                "tool_choice requires at least one tool but none were provided".to_string(),
            );
        }
        _ => {}
    }

    let fix_ctx = ToolFixContext::new(
        data.config.tool_parser_type.clone(),
        if tools.is_empty() {
            None
        } else {
            Some(tools.as_slice())
        },
    );

    let engine_request = EngineRequest {
        messages,
        tools,
        tool_choice: request.tool_choice.clone(),
        sampling,
    };

    let use_stream = request.stream.unwrap_or(false);
    let include_usage = request
        .stream_options
        .as_ref()
        .map(|opts| opts.include_usage)
        .unwrap_or(false);

    let EngineStream {
        seq_id,
        input_tokens,
        mut events,
    } = match data.engine.generate_stream(engine_request) {
        Ok(stream) => stream,
        Err(err) => {
            crate::log_error!("Stream generation failed: {err}");
            return ChatResponder::Upstream(err);
        }
    };

    let mut assembler = ChatStreamAssembler::new(model_id, include_usage, fix_ctx, forced_tool_name);

    if use_stream {
        let (response_tx, client_rx) = flume::bounded(sse_buffer_size());
        let (disconnect_tx, mut disconnect_rx) = watch::channel(false);
        let engine: Arc<dyn GenerationEngine> = data.engine.clone();
        let stream_logger = logger.clone();

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
                    let _ = response_tx
                        .send_async(ChatResponse::InternalError(err.message.clone()))
                        .await;
                    break;
                }

                if let CanonicalEvent::TextDelta(text) = &event {
                    if let Some(ref l) = stream_logger {
                        l.log_stream_token(text);
                    }
                }

                let finished = matches!(event, CanonicalEvent::Finish { .. });
                for chunk in assembler.on_event(event) {
                    if response_tx
                        .send_async(ChatResponse::Chunk(chunk))
                        .await
                        .is_err()
                    {
                        crate::log_warn!("[Seq {}] SSE channel closed mid-stream", seq_id);
                        engine.cancel(seq_id);
                        break 'stream;
                    }
                }
                if finished {
                    break;
                }
            }
            let _ = response_tx.try_send(ChatResponse::Done);
        });

        ChatResponder::Streamer(
            Sse::new(Streamer::new(client_rx, Some(disconnect_tx))).keep_alive(
                KeepAlive::new()
                    .interval(super::keep_alive_interval())
                    .text("keep-alive"),
            ),
        )
    } else {
        while let Some(event) = events.recv().await {
            if let CanonicalEvent::Error(err) = event {
                crate::log_error!("[Seq {}] Engine stream error: {}", seq_id, err);
                return ChatResponder::Upstream(err);
            }
            assembler.on_event(event);
            if assembler.is_done() {
                break;
            }
        }
        let response = assembler.into_response(input_tokens);
        if let Some(ref l) = logger {
            l.log_raw_response(&response);
        }
        ChatResponder::Completion(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::FinishReason;
    use serde_json::json;

    fn no_repair() -> ToolFixContext {
        ToolFixContext::new("", None)
    }

    fn assembler(include_usage: bool) -> ChatStreamAssembler {
        ChatStreamAssembler::new("test-model".to_string(), include_usage, no_repair(), None)
    }

    #[test]
    fn text_stream_finishes_with_engine_reason() {
        let mut asm = assembler(false);
        let chunks = asm.on_event(CanonicalEvent::TextDelta("hello".to_string()));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("hello"));

        let chunks = asm.on_event(CanonicalEvent::Finish {
            reason: FinishReason::Stop,
            stop_sequence: None,
        });
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].choices[0].finish_reason.as_deref(),
            Some("stop")
        );
        assert!(asm.is_done());
        // Events after Finish are ignored.
        assert!(asm
            .on_event(CanonicalEvent::TextDelta("late".to_string()))
            .is_empty());
    }

    #[test]
    fn tool_call_stream_yields_tool_calls_finish_reason() {
        let mut asm = assembler(false);
        let start = asm.on_event(CanonicalEvent::ToolCallStart {
            index: 0,
            id: Some("call_1".to_string()),
            name: "echo".to_string(),
        });
        let tool_chunk = &start[0].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(tool_chunk.id.as_deref(), Some("call_1"));
        assert_eq!(tool_chunk.function.name.as_deref(), Some("echo"));

        let delta = asm.on_event(CanonicalEvent::ToolCallArgsDelta {
            index: 0,
            fragment: r#"{"text":"hi"}"#.to_string(),
        });
        assert_eq!(
            delta[0].choices[0].delta.tool_calls.as_ref().unwrap()[0]
                .function
                .arguments,
            r#"{"text":"hi"}"#
        );

        assert!(asm.on_event(CanonicalEvent::ToolCallEnd { index: 0 }).is_empty());
        let finish = asm.on_event(CanonicalEvent::Finish {
            reason: FinishReason::Stop,
            stop_sequence: None,
        });
        assert_eq!(
            finish[0].choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn usage_chunk_emitted_exactly_once_when_requested() {
        let mut asm = assembler(true);
        asm.on_event(CanonicalEvent::TextDelta("x".to_string()));
        asm.on_event(CanonicalEvent::Usage {
            input_tokens: 3,
            output_tokens: 7,
        });
        let chunks = asm.on_event(CanonicalEvent::Finish {
            reason: FinishReason::Stop,
            stop_sequence: None,
        });
        assert_eq!(chunks.len(), 2);
        let usage = chunks[1].usage.as_ref().expect("usage chunk");
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 7);
        assert!(chunks[1].choices.is_empty());
    }

    #[test]
    fn collapse_string_encodes_repaired_arguments() {
        let tools = vec![crate::tools::function_tool("write_file", "")
            .parameters_schema(json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "additionalProperties": false
            }))
            .build()];
        let fix_ctx = ToolFixContext::new("minimax_m2", Some(&tools));
        let mut asm =
            ChatStreamAssembler::new("test-model".to_string(), false, fix_ctx, None);

        asm.on_event(CanonicalEvent::ToolCallStart {
            index: 0,
            id: Some("call_1".to_string()),
            name: "write_file".to_string(),
        });
        asm.on_event(CanonicalEvent::ToolCallArgsDelta {
            index: 0,
            fragment: r#"{"path": "main . js"}"#.to_string(),
        });
        asm.on_event(CanonicalEvent::ToolCallEnd { index: 0 });
        asm.on_event(CanonicalEvent::Finish {
            reason: FinishReason::Stop,
            stop_sequence: None,
        });

        let response = asm.into_response(5);
        let message = &response.choices[0].message;
        assert!(message.content.is_none());
        let calls = message.tool_calls.as_ref().unwrap();
        let encoded = calls[0].function.arguments.as_str().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(encoded).unwrap(),
            json!({"path": "main.js"})
        );
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn forced_tool_name_filters_collapsed_calls() {
        let mut asm = ChatStreamAssembler::new(
            "test-model".to_string(),
            false,
            no_repair(),
            Some("write_file".to_string()),
        );
        asm.on_event(CanonicalEvent::ToolCallStart {
            index: 0,
            id: Some("call_1".to_string()),
            name: "other".to_string(),
        });
        asm.on_event(CanonicalEvent::ToolCallEnd { index: 0 });
        asm.on_event(CanonicalEvent::Finish {
            reason: FinishReason::Stop,
            stop_sequence: None,
        });
        let response = asm.into_response(0);
        assert!(response.choices[0].message.tool_calls.is_none());
    }
}
