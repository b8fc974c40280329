// src/tools/assembler.rs
//! Per-stream accumulation of fragmented tool-call events.
//!
//! Argument text for one call arrives as an ordered run of fragments keyed by
//! a small call index. An entry is created on the call's start event and
//! consumed when the call is declared complete: the concatenated text is
//! parsed and, when it parses, run through the repair engine. Text that does
//! not parse as JSON is forwarded as-is; generation output is always
//! surfaced and repair stays best-effort.
//!
//! One assembler is owned by exactly one in-flight stream and dropped with it.

use super::repair::{self, ToolFixContext};
use super::{generate_tool_call_id, ToolCall};
use serde_json::Value;
use std::collections::BTreeMap;

struct PendingToolCall {
    id: String,
    name: String,
    buffer: String,
}

#[derive(Default)]
pub struct ToolCallAssembler {
    pending: BTreeMap<usize, PendingToolCall>,
    finished: Vec<ToolCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.finished.is_empty()
    }

    /// Open an entry for a call index. Returns the id under which the call
    /// will be reported (vendor-supplied, or generated when absent).
    pub fn on_start(&mut self, index: usize, id: Option<String>, name: &str) -> String {
        let id = id.unwrap_or_else(generate_tool_call_id);
        self.pending.insert(
            index,
            PendingToolCall {
                id: id.clone(),
                name: name.to_string(),
                buffer: String::new(),
            },
        );
        id
    }

    /// Append an argument fragment. Fragments for unknown indices are dropped
    /// with a warning rather than failing the stream.
    pub fn on_fragment(&mut self, index: usize, fragment: &str) {
        match self.pending.get_mut(&index) {
            Some(entry) => entry.buffer.push_str(fragment),
            None => {
                crate::log_warn!(
                    "Dropping tool-call fragment for unknown index {} ({} chars)",
                    index,
                    fragment.len()
                );
            }
        }
    }

    /// Close a call: parse + repair the accumulated text. Returns the final
    /// call, or None when no entry was open at that index.
    pub fn on_end(&mut self, index: usize, ctx: &ToolFixContext) -> Option<ToolCall> {
        let entry = self.pending.remove(&index)?;
        let call = finish_entry(entry, ctx);
        self.finished.push(call.clone());
        Some(call)
    }

    /// Close every entry still open (engine ended the stream without explicit
    /// end events), in index order. Returns only the newly closed calls with
    /// their indices.
    pub fn close_pending(&mut self, ctx: &ToolFixContext) -> Vec<(usize, ToolCall)> {
        let pending = std::mem::take(&mut self.pending);
        let mut closed = Vec::new();
        for (index, entry) in pending {
            let call = finish_entry(entry, ctx);
            self.finished.push(call.clone());
            closed.push((index, call));
        }
        closed
    }

    /// Close anything still open and drain every finished call, in
    /// completion order.
    pub fn finalize(&mut self, ctx: &ToolFixContext) -> Vec<ToolCall> {
        self.close_pending(ctx);
        std::mem::take(&mut self.finished)
    }
}

fn finish_entry(entry: PendingToolCall, ctx: &ToolFixContext) -> ToolCall {
    let raw = entry.buffer.trim();
    let text = if raw.is_empty() { "{}" } else { raw };
    match serde_json::from_str::<Value>(text) {
        Ok(arguments) => repair::apply(
            &ToolCall {
                id: entry.id,
                name: entry.name,
                arguments,
            },
            ctx,
        ),
        Err(err) => {
            crate::log_warn!(
                "Arguments for tool '{}' are not valid JSON ({}); forwarding raw text",
                entry.name,
                err
            );
            ToolCall {
                id: entry.id,
                name: entry.name,
                arguments: Value::String(entry.buffer),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_repair() -> ToolFixContext {
        ToolFixContext::new("", None)
    }

    #[test]
    fn fragments_reassemble_in_arrival_order() {
        let mut assembler = ToolCallAssembler::new();
        let id = assembler.on_start(0, Some("call_abc".into()), "echo");
        assert_eq!(id, "call_abc");
        assembler.on_fragment(0, r#"{"te"#);
        assembler.on_fragment(0, r#"xt": "#);
        assembler.on_fragment(0, r#""hi"}"#);
        let call = assembler.on_end(0, &no_repair()).expect("call");
        assert_eq!(call.arguments, json!({"text": "hi"}));
    }

    #[test]
    fn missing_id_gets_generated() {
        let mut assembler = ToolCallAssembler::new();
        let id = assembler.on_start(0, None, "echo");
        assert!(id.starts_with("call_"));
    }

    #[test]
    fn unparsable_text_is_forwarded_raw() {
        let mut assembler = ToolCallAssembler::new();
        assembler.on_start(0, Some("call_1".into()), "echo");
        assembler.on_fragment(0, r#"{"broken":"#);
        let call = assembler.on_end(0, &no_repair()).expect("call");
        assert_eq!(call.arguments, json!(r#"{"broken":"#));
    }

    #[test]
    fn empty_buffer_defaults_to_empty_object() {
        let mut assembler = ToolCallAssembler::new();
        assembler.on_start(0, Some("call_1".into()), "ping");
        let call = assembler.on_end(0, &no_repair()).expect("call");
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn interleaved_indices_stay_separate() {
        let mut assembler = ToolCallAssembler::new();
        assembler.on_start(0, Some("call_a".into()), "first");
        assembler.on_start(1, Some("call_b".into()), "second");
        assembler.on_fragment(0, r#"{"n": 0}"#);
        assembler.on_fragment(1, r#"{"n": 1}"#);
        let first = assembler.on_end(0, &no_repair()).expect("first");
        let second = assembler.on_end(1, &no_repair()).expect("second");
        assert_eq!(first.arguments, json!({"n": 0}));
        assert_eq!(second.arguments, json!({"n": 1}));
    }

    #[test]
    fn finalize_closes_open_entries_and_drains() {
        let mut assembler = ToolCallAssembler::new();
        assembler.on_start(0, Some("call_a".into()), "first");
        assembler.on_fragment(0, r#"{"done": true}"#);
        assembler.on_end(0, &no_repair());
        assembler.on_start(1, Some("call_b".into()), "second");
        assembler.on_fragment(1, r#"{"late": 1}"#);

        let calls = assembler.finalize(&no_repair());
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[1].arguments, json!({"late": 1}));
        assert!(assembler.is_empty());
    }

    #[test]
    fn repair_runs_on_assembled_text() {
        let tools = vec![crate::tools::function_tool("write_file", "")
            .parameters_schema(json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "additionalProperties": false
            }))
            .build()];
        let ctx = ToolFixContext::new("minimax_m2", Some(&tools));

        let mut assembler = ToolCallAssembler::new();
        assembler.on_start(0, Some("call_1".into()), "write_file");
        assembler.on_fragment(0, r#"{"path": "main"#);
        assembler.on_fragment(0, r#" . js", "junk": 1}"#);
        let call = assembler.on_end(0, &ctx).expect("call");
        assert_eq!(call.arguments, json!({"path": "main.js"}));
    }
}
