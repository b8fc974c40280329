// src/tools/helpers.rs
//! Helper functions for tool call processing.

use super::{Tool, ToolCall};
use serde_json::Value;
use std::collections::HashMap;

/// Build a map of tool names to their parameter schemas
pub fn build_tool_schema_map(tools: &[Tool]) -> HashMap<String, Value> {
    tools
        .iter()
        .map(|tool| (tool.function.name.clone(), tool.function.parameters.clone()))
        .collect()
}

/// Drop assembled calls that do not match a forced tool name. Returns how
/// many calls were removed.
pub fn retain_tool_calls_forced_name(
    tool_calls: &mut Vec<ToolCall>,
    forced_name: Option<&str>,
) -> usize {
    let Some(name) = forced_name else {
        return 0;
    };
    let before = tool_calls.len();
    tool_calls.retain(|call| call.name == name);
    before - tool_calls.len()
}

/// Format tool calls for logging - returns a summary string
pub fn format_tool_calls_summary(tool_calls: &[ToolCall]) -> String {
    if tool_calls.is_empty() {
        return String::new();
    }
    tool_calls
        .iter()
        .map(|call| {
            let args = serde_json::to_string(&call.arguments)
                .unwrap_or_default()
                .replace('\n', " ");
            let truncated = if args.len() > 160 {
                let snippet: String = args.chars().take(160).collect();
                format!("{}...", snippet)
            } else {
                args
            };
            format!("{}(args={})", call.name, truncated)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Log tool calls with a label (uses crate logging)
pub fn log_tool_calls(label: &str, tool_calls: &[ToolCall]) {
    if tool_calls.is_empty() {
        return;
    }
    let summary = format_tool_calls_summary(tool_calls);
    crate::log_info!("{} tool call(s): {}", label, summary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::new_tool_call;
    use serde_json::json;

    #[test]
    fn test_build_tool_schema_map() {
        let tools = vec![crate::tools::function_tool("test", "desc")
            .param("arg1", "string", "desc", true)
            .build()];
        let map = build_tool_schema_map(&tools);
        assert!(map.contains_key("test"));
    }

    #[test]
    fn forced_name_retains_only_matches() {
        let mut calls = vec![
            new_tool_call("c1", "read_file", json!({})),
            new_tool_call("c2", "write_file", json!({})),
        ];
        let dropped = retain_tool_calls_forced_name(&mut calls, Some("write_file"));
        assert_eq!(dropped, 1);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "write_file");

        let unchanged = retain_tool_calls_forced_name(&mut calls, None);
        assert_eq!(unchanged, 0);
    }

    #[test]
    fn summary_truncates_long_arguments() {
        let long = "x".repeat(300);
        let calls = vec![new_tool_call("c1", "echo", json!({ "text": long }))];
        let summary = format_tool_calls_summary(&calls);
        assert!(summary.starts_with("echo(args="));
        assert!(summary.ends_with("...)"));
    }
}
