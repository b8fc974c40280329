// src/tools/mod.rs
//! Tool calling support for lmbridge.
//!
//! Declared tools, tool-choice configuration, and the schema-aware repair
//! pipeline applied to model-emitted tool calls before they reach a client.

pub mod assembler;
pub mod helpers;
pub mod repair;
pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use crate::core::message::ToolCall;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    pub function: Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

fn default_tool_type() -> String {
    "function".to_string()
}

fn default_parameters() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// Builder for creating Tool definitions
pub struct ToolBuilder {
    name: String,
    description: String,
    parameters: Value,
    strict: Option<bool>,
}

impl ToolBuilder {
    fn new(name: String, description: String) -> Self {
        Self {
            name,
            description,
            parameters: default_parameters(),
            strict: None,
        }
    }

    /// Add a parameter to the function
    pub fn param(
        mut self,
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        if let Some(props) = self.parameters.get_mut("properties") {
            props[&name] = serde_json::json!({
                "type": param_type.into(),
                "description": description.into()
            });
        }
        if required {
            if let Some(req) = self.parameters.get_mut("required") {
                if let Some(arr) = req.as_array_mut() {
                    arr.push(Value::String(name));
                }
            }
        }
        self
    }

    /// Set custom parameters schema
    pub fn parameters_schema(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    /// Enable strict mode
    pub fn strict(mut self, value: bool) -> Self {
        self.strict = Some(value);
        self
    }

    /// Build the final Tool
    pub fn build(self) -> Tool {
        Tool {
            tool_type: "function".to_string(),
            function: Function {
                name: self.name,
                description: Some(self.description),
                parameters: self.parameters,
                strict: self.strict,
            },
        }
    }
}

/// Create a new function tool builder.
pub fn function_tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name.into(), description.into())
}

/// Tool choice configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// String modes: "auto" | "none" | "required"
    Mode(ToolChoiceMode),
    /// Force a specific tool
    Function {
        #[serde(rename = "type")]
        choice_type: ToolChoiceType,
        function: ToolChoiceFunction,
    },
}

impl ToolChoice {
    pub fn auto() -> Self {
        ToolChoice::Mode(ToolChoiceMode::Auto)
    }

    pub fn none() -> Self {
        ToolChoice::Mode(ToolChoiceMode::None)
    }

    pub fn required() -> Self {
        ToolChoice::Mode(ToolChoiceMode::Required)
    }

    pub fn function(name: impl Into<String>) -> Self {
        ToolChoice::Function {
            choice_type: ToolChoiceType::Function,
            function: ToolChoiceFunction { name: name.into() },
        }
    }

    /// Name of the forced tool, if this choice forces one.
    pub fn forced_name(&self) -> Option<&str> {
        match self {
            ToolChoice::Function { function, .. } => Some(function.name.as_str()),
            ToolChoice::Mode(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    Auto,
    None,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceType {
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

/// Build a ToolCall from name/arguments with a provided ID.
pub fn new_tool_call(
    id: impl Into<String>,
    name: impl Into<String>,
    arguments: Value,
) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        arguments,
    }
}

/// Generate a compact tool call ID with required `call_` prefix.
/// Uses 16 hex chars (64 bits) from UUIDv4 for low collision risk and shorter payloads.
pub fn generate_tool_call_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("call_{}", &raw[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_deserializes_string_modes() {
        let auto: ToolChoice = serde_json::from_str(r#""auto""#).unwrap();
        let none: ToolChoice = serde_json::from_str(r#""none""#).unwrap();
        let required: ToolChoice = serde_json::from_str(r#""required""#).unwrap();

        assert!(matches!(auto, ToolChoice::Mode(ToolChoiceMode::Auto)));
        assert!(matches!(none, ToolChoice::Mode(ToolChoiceMode::None)));
        assert!(matches!(
            required,
            ToolChoice::Mode(ToolChoiceMode::Required)
        ));
    }

    #[test]
    fn tool_choice_deserializes_function_mode() {
        let choice: ToolChoice =
            serde_json::from_str(r#"{"type":"function","function":{"name":"read_file"}}"#).unwrap();
        match choice {
            ToolChoice::Function {
                choice_type,
                function,
            } => {
                assert_eq!(choice_type, ToolChoiceType::Function);
                assert_eq!(function.name, "read_file");
            }
            _ => panic!("expected function tool choice"),
        }
        assert_eq!(
            ToolChoice::function("read_file").forced_name(),
            Some("read_file")
        );
    }

    #[test]
    fn tool_deserializes_without_parameters() {
        let tool: Tool =
            serde_json::from_str(r#"{"type":"function","function":{"name":"ping"}}"#).unwrap();
        assert_eq!(tool.function.name, "ping");
        assert_eq!(tool.function.parameters["type"], "object");
    }

    #[test]
    fn generated_ids_have_call_prefix() {
        let id = generate_tool_call_id();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), "call_".len() + 16);
    }
}
