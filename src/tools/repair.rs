// src/tools/repair.rs
//! Schema-aware repair of model-emitted tool-call arguments.
//!
//! Some model families emit tokenizer artifacts inside otherwise-valid
//! arguments: stray spaces around hyphens in identifiers and UUIDs, spaces
//! around dots in file paths. Each family gets a fixed, ordered profile of
//! string transforms, selected by the tool parser identifier the engine runs
//! for that family. Unrecognized identifiers resolve to the empty profile so
//! well-formed output from other families is never touched.
//!
//! Repair only runs with a declared schema to validate against: no `tools`,
//! or a call name with no matching tool, means the call is returned as-is.

use super::schema::{self, LeafContext};
use super::{Tool, ToolCall};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// Per-request repair context. Built once from the request's declared tools
/// and the engine's tool parser identifier; read-only afterwards.
#[derive(Debug, Clone)]
pub struct ToolFixContext {
    pub tool_parser_type: String,
    pub tools: Option<Arc<[Tool]>>,
}

impl ToolFixContext {
    pub fn new(tool_parser_type: impl Into<String>, tools: Option<&[Tool]>) -> Self {
        Self {
            tool_parser_type: tool_parser_type.into(),
            tools: tools.map(Arc::from),
        }
    }

    fn parameters_schema(&self, name: &str) -> Option<&Value> {
        self.tools
            .as_deref()?
            .iter()
            .find(|tool| tool.function.name == name)
            .map(|tool| &tool.function.parameters)
    }
}

/// One pure string repair. Applicability is decided per leaf from the
/// property name and declared format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafFix {
    /// `"high- score"` / `"f81d4fae - 7dec"` -> `"high-score"` / `"f81d4fae-7dec"`.
    HyphenSpacing,
    /// `"main . js"` -> `"main.js"`, path-like leaves only.
    DotSpacing,
    /// `". css"` before a short alphabetic extension, path-like leaves only.
    DotExtension,
}

static HYPHEN_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\S)[ \t]*-[ \t]+(\S)").expect("hyphen spacing pattern"));
static DOT_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\S)[ \t]*\.[ \t]+(\S)").expect("dot spacing pattern"));
static DOT_EXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.[ \t]+([A-Za-z]{1,5})\b").expect("dot extension pattern"));

impl LeafFix {
    fn applies(&self, ctx: &LeafContext) -> bool {
        match self {
            LeafFix::HyphenSpacing => true,
            LeafFix::DotSpacing | LeafFix::DotExtension => is_pathlike(ctx),
        }
    }

    fn apply(&self, value: &str) -> String {
        match self {
            LeafFix::HyphenSpacing => collapse_to_fixpoint(&HYPHEN_SPACE_RE, value, "${1}-${2}"),
            LeafFix::DotSpacing => collapse_to_fixpoint(&DOT_SPACE_RE, value, "${1}.${2}"),
            LeafFix::DotExtension => DOT_EXT_RE.replace_all(value, ".${1}").into_owned(),
        }
    }
}

/// Adjacent clusters share boundary characters, so a single `replace_all`
/// pass can leave every other cluster untouched. Re-run until stable; the
/// patterns cannot oscillate.
fn collapse_to_fixpoint(re: &Regex, value: &str, replacement: &str) -> String {
    let mut current = value.to_string();
    loop {
        let next = re.replace_all(&current, replacement).into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

fn is_pathlike(ctx: &LeafContext) -> bool {
    if ctx.format == Some("filepath") {
        return true;
    }
    let Some(name) = ctx.property_name else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    name.contains("path") || name.contains("file") || name.contains("dir")
}

/// Resolve the repair profile for a tool parser identifier. Unknown
/// identifiers map to the empty profile.
pub fn profile_for(tool_parser_type: &str) -> &'static [LeafFix] {
    match tool_parser_type {
        "minimax_m2" => &[
            LeafFix::HyphenSpacing,
            LeafFix::DotSpacing,
            LeafFix::DotExtension,
        ],
        _ => &[],
    }
}

/// Apply the active repair profile to one tool call. Returns a new call;
/// identity when no profile is active or no schema is declared for the name.
pub fn apply(call: &ToolCall, ctx: &ToolFixContext) -> ToolCall {
    let profile = profile_for(&ctx.tool_parser_type);
    if profile.is_empty() || call.name.is_empty() {
        return call.clone();
    }
    let Some(parameters) = ctx.parameters_schema(&call.name) else {
        return call.clone();
    };

    let arguments = schema::walk(&call.arguments, parameters, &|text: &str,
                                                                leaf: &LeafContext| {
        let mut repaired = text.to_string();
        for fix in profile {
            if fix.applies(leaf) {
                repaired = fix.apply(&repaired);
            }
        }
        repaired
    });

    ToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments,
    }
}
