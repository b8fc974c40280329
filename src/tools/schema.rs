// src/tools/schema.rs
//! Recursive co-walk of a JSON value against a JSON-Schema-like descriptor.
//!
//! The walker never mutates its input; it returns a new value tree. It
//! understands the schema subset callers actually declare for tool
//! parameters: `type`, `properties`, `additionalProperties`, `anyOf`/`oneOf`
//! and the free-form `format` hint. Anything else passes values through
//! unchanged.

use serde_json::{Map, Value};

/// Context handed to the string-leaf transform: the property name the value
/// sits under (None at the schema root) and the leaf's declared format hint.
pub struct LeafContext<'a> {
    pub property_name: Option<&'a str>,
    pub format: Option<&'a str>,
}

/// Walk `value` against `schema`, applying `transform` at every string leaf
/// whose runtime value is already a string. Structured values under a string
/// schema are re-encoded as JSON text instead (and never transformed).
pub fn walk<F>(value: &Value, schema: &Value, transform: &F) -> Value
where
    F: Fn(&str, &LeafContext) -> String,
{
    walk_node(value, schema, None, transform)
}

fn walk_node<F>(
    value: &Value,
    schema: &Value,
    property_name: Option<&str>,
    transform: &F,
) -> Value
where
    F: Fn(&str, &LeafContext) -> String,
{
    let Some(schema_obj) = schema.as_object() else {
        return value.clone();
    };

    if let Some(branches) = union_branches(schema_obj) {
        // First branch whose declared shape matches the runtime kind wins.
        return match branches.iter().find(|branch| branch_matches(branch, value)) {
            Some(branch) => walk_node(value, branch, property_name, transform),
            None => value.clone(),
        };
    }

    match declared_type(schema_obj) {
        Some("object") => walk_object(value, schema_obj, transform),
        Some("string") => walk_string_leaf(value, schema_obj, property_name, transform),
        _ => value.clone(),
    }
}

fn union_branches(schema: &Map<String, Value>) -> Option<&Vec<Value>> {
    schema
        .get("anyOf")
        .or_else(|| schema.get("oneOf"))
        .and_then(Value::as_array)
}

fn declared_type(schema: &Map<String, Value>) -> Option<&str> {
    if let Some(kind) = schema.get("type").and_then(Value::as_str) {
        return Some(kind);
    }
    // Schemas that declare properties without a `type` are object schemas.
    if schema.contains_key("properties") || schema.contains_key("additionalProperties") {
        return Some("object");
    }
    None
}

fn branch_matches(branch: &Value, value: &Value) -> bool {
    let Some(branch_obj) = branch.as_object() else {
        return false;
    };
    match declared_type(branch_obj) {
        Some("object") => value.is_object(),
        Some("array") => value.is_array(),
        Some("string") => value.is_string(),
        Some("null") => value.is_null(),
        Some("number") | Some("integer") => value.is_number(),
        Some("boolean") => value.is_boolean(),
        _ => false,
    }
}

fn walk_object<F>(value: &Value, schema: &Map<String, Value>, transform: &F) -> Value
where
    F: Fn(&str, &LeafContext) -> String,
{
    let Some(obj) = value.as_object() else {
        return value.clone();
    };

    let properties = schema.get("properties").and_then(Value::as_object);
    let additional = schema.get("additionalProperties");

    let mut out = Map::with_capacity(obj.len());
    for (key, item) in obj {
        if let Some(sub_schema) = properties.and_then(|props| props.get(key)) {
            out.insert(
                key.clone(),
                walk_node(item, sub_schema, Some(key), transform),
            );
            continue;
        }
        match additional {
            // Closed schema: undeclared properties are dropped.
            Some(Value::Bool(false)) => {}
            Some(extra_schema @ Value::Object(_)) => {
                out.insert(
                    key.clone(),
                    walk_node(item, extra_schema, Some(key), transform),
                );
            }
            _ => {
                out.insert(key.clone(), item.clone());
            }
        }
    }
    Value::Object(out)
}

fn walk_string_leaf<F>(
    value: &Value,
    schema: &Map<String, Value>,
    property_name: Option<&str>,
    transform: &F,
) -> Value
where
    F: Fn(&str, &LeafContext) -> String,
{
    let ctx = LeafContext {
        property_name,
        format: schema.get("format").and_then(Value::as_str),
    };
    match value {
        Value::String(text) => Value::String(transform(text.as_str(), &ctx)),
        Value::Null => Value::Null,
        // A structured value where the contract demands a string: re-encode
        // it as JSON text. serde_json's encoding is deterministic.
        other => match serde_json::to_string(other) {
            Ok(encoded) => Value::String(encoded),
            Err(_) => other.clone(),
        },
    }
}
