// src/server/logger.rs
//! Chat request/response logger.
//! Enable by setting environment variable LMBRIDGE_CHAT_LOGGER=true
//!
//! Supports both the OpenAI and the Anthropic server surface.

use crate::core::message::ToolCall;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Server type for distinguishing log entries
#[derive(Debug, Clone, Copy)]
pub enum ServerType {
    OpenAI,
    Claude,
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerType::OpenAI => write!(f, "OpenAI"),
            ServerType::Claude => write!(f, "Claude"),
        }
    }
}

/// Check if chat logging is enabled via environment variable
pub fn is_logging_enabled() -> bool {
    std::env::var("LMBRIDGE_CHAT_LOGGER")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

/// Helper struct to log requests and responses to files.
/// Each request creates a new file with timestamp in the "log" folder.
pub struct ChatCompletionLogger {
    file_path: String,
    server_type: ServerType,
}

impl ChatCompletionLogger {
    /// Create a new logger for the OpenAI surface. Returns None if logging is disabled.
    pub fn new() -> Option<Arc<Self>> {
        Self::with_server_type(ServerType::OpenAI)
    }

    /// Create a new logger for the Claude surface. Returns None if logging is disabled.
    pub fn new_claude() -> Option<Arc<Self>> {
        Self::with_server_type(ServerType::Claude)
    }

    pub fn with_server_type(server_type: ServerType) -> Option<Arc<Self>> {
        if !is_logging_enabled() {
            return None;
        }

        let log_dir = Path::new("log");
        if !log_dir.exists() {
            let _ = fs::create_dir_all(log_dir);
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let secs = now.as_secs();
        let millis = now.subsec_millis();
        let prefix = match server_type {
            ServerType::OpenAI => "openai",
            ServerType::Claude => "claude",
        };
        let file_path = format!("log/{}_{}_{:03}.log", prefix, secs, millis);

        crate::log_info!(
            "[{}] Chat logging enabled, writing to: {}",
            prefix.to_uppercase(),
            file_path
        );

        Some(Arc::new(Self {
            file_path,
            server_type,
        }))
    }

    fn write(&self, content: &str) {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
        {
            let _ = file.write_all(content.as_bytes());
        }
    }

    pub fn log_raw_request<T: serde::Serialize>(&self, request: &T) {
        if let Ok(json) = serde_json::to_string_pretty(request) {
            let content = format!("=== {} REQUEST ===\n{}\n\n", self.server_type, json);
            self.write(&content);
        }
    }

    pub fn log_start_response(&self) {
        let content = format!("=== {} MODEL RESPONSE ===\n", self.server_type);
        self.write(&content);
    }

    pub fn log_stream_token(&self, token: &str) {
        self.write(token);
    }

    /// Log assembled tool calls with a label (valid/invalid/assembled)
    pub fn log_tool_calls(&self, label: &str, tool_calls: &[ToolCall]) {
        if tool_calls.is_empty() {
            return;
        }
        if let Ok(json) = serde_json::to_string_pretty(tool_calls) {
            let content = format!(
                "\n=== {} TOOL CALLS ({}) ===\n{}\n",
                label.to_uppercase(),
                tool_calls.len(),
                json
            );
            self.write(&content);
        }
    }

    pub fn log_raw_response<T: serde::Serialize>(&self, response: &T) {
        if let Ok(json) = serde_json::to_string_pretty(response) {
            let content = format!("=== {} RESPONSE ===\n{}\n", self.server_type, json);
            self.write(&content);
        }
    }

    pub fn log_error(&self, error: &str) {
        let content = format!("\n=== ERROR ===\n{}\n", error);
        self.write(&content);
    }
}
