// src/utils/config.rs
//! Gateway configuration and per-request sampling parameters.

const DEFAULT_MAX_TOKENS: usize = 16384;

#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<isize>,
    pub stop_sequences: Option<Vec<String>>,
}

impl SamplingParams {
    pub fn new_with_max_tokens(max_tokens: usize) -> Self {
        SamplingParams {
            max_tokens,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
        }
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::new_with_max_tokens(DEFAULT_MAX_TOKENS)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identifier of the tool parser the engine runs for this model family.
    /// Selects the tool-call repair profile; unrecognized values disable
    /// repair entirely.
    pub tool_parser_type: String,
    /// Cap applied when a request does not carry `max_tokens`.
    pub max_tokens: Option<usize>,
}

impl GatewayConfig {
    pub fn new(tool_parser_type: impl Into<String>) -> Self {
        GatewayConfig {
            tool_parser_type: tool_parser_type.into(),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn default_max_tokens(&self) -> usize {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig::new("")
    }
}
