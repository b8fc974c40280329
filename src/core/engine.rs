// src/core/engine.rs
//! Boundary to the generation engine.
//!
//! The engine owns model loading, tokenization, chat templating, batching and
//! scheduling. The gateway only issues one canonical request per client
//! request and consumes the resulting event stream, strictly in order. Events
//! for a sequence are pulled one at a time: the adapter renders and flushes an
//! event before asking for the next one, so a slow SSE client applies
//! backpressure to the engine instead of growing an unbounded buffer.

use crate::core::message::ChatMessage;
use crate::tools::{Tool, ToolChoice};
use crate::utils::config::SamplingParams;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

pub static GLOBAL_RT: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build global tokio runtime")
});

/// Upstream failure, surfaced to the client with the engine's status and
/// body unmodified. The gateway never retries generation requests.
#[derive(Debug, Clone, Error)]
#[error("engine error ({status}): {message}")]
pub struct EngineError {
    pub status: u16,
    pub message: String,
}

impl EngineError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    StopSequence,
    ToolUse,
}

impl FinishReason {
    pub fn as_openai(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::StopSequence => "stop",
            FinishReason::ToolUse => "tool_calls",
        }
    }

    pub fn as_claude(&self) -> &'static str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::StopSequence => "stop_sequence",
            FinishReason::ToolUse => "tool_use",
        }
    }
}

/// One unit of generation output, produced in order by the engine and
/// consumed exactly once by the stream assembler serving the request.
///
/// Tool-call argument fragments are raw text; concatenated in arrival order
/// they reconstruct the argument JSON for that call index. `Usage` arrives
/// before `Finish`; `Finish` is terminal.
#[derive(Debug, Clone)]
pub enum CanonicalEvent {
    TextDelta(String),
    ToolCallStart {
        index: usize,
        /// Vendor-supplied id; the assembler generates a `call_` id when absent.
        id: Option<String>,
        name: String,
    },
    ToolCallArgsDelta {
        index: usize,
        fragment: String,
    },
    ToolCallEnd {
        index: usize,
    },
    Usage {
        input_tokens: usize,
        output_tokens: usize,
    },
    Finish {
        reason: FinishReason,
        stop_sequence: Option<String>,
    },
    Error(EngineError),
}

#[derive(Debug, Clone, Default)]
pub struct EngineRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
    pub sampling: SamplingParams,
}

/// Handle for one in-flight generation sequence.
pub struct EngineStream {
    pub seq_id: usize,
    pub input_tokens: usize,
    pub events: mpsc::Receiver<CanonicalEvent>,
}

pub trait GenerationEngine: Send + Sync {
    /// Identifier reported by `/v1/models`; the first (and only) entry is the
    /// default model.
    fn model_id(&self) -> String;

    fn generate_stream(&self, request: EngineRequest) -> Result<EngineStream, EngineError>;

    /// Stop generating for a sequence. Idempotent; called on client
    /// disconnect and on idle timeout.
    fn cancel(&self, seq_id: usize);

    fn count_tokens(&self, request: &EngineRequest) -> Result<usize, EngineError>;
}
