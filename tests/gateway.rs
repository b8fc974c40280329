// Integration tests driving the full router in-process with
// tower::ServiceExt::oneshot and a scripted engine behind the generation
// boundary. No sockets, no model weights.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use lmbridge::api::Gateway;
use lmbridge::core::engine::{
    CanonicalEvent, EngineError, EngineRequest, EngineStream, FinishReason, GenerationEngine,
};
use lmbridge::utils::config::GatewayConfig;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

type Script = Box<dyn Fn(&EngineRequest) -> Vec<CanonicalEvent> + Send + Sync>;

/// Engine whose event stream is scripted per request. Events are fed through
/// a bounded channel of size 1 so the adapter's pull-by-pull consumption is
/// what the tests actually exercise.
struct ScriptedEngine {
    script: Script,
    next_seq: AtomicUsize,
    cancelled: Mutex<Vec<usize>>,
}

impl ScriptedEngine {
    fn new(
        script: impl Fn(&EngineRequest) -> Vec<CanonicalEvent> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            next_seq: AtomicUsize::new(1),
            cancelled: Mutex::new(Vec::new()),
        })
    }
}

impl GenerationEngine for ScriptedEngine {
    fn model_id(&self) -> String {
        "scripted-1b".to_string()
    }

    fn generate_stream(&self, request: EngineRequest) -> Result<EngineStream, EngineError> {
        let seq_id = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let events = (self.script)(&request);
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(EngineStream {
            seq_id,
            input_tokens: 7,
            events: rx,
        })
    }

    fn cancel(&self, seq_id: usize) {
        self.cancelled.lock().unwrap().push(seq_id);
    }

    fn count_tokens(&self, request: &EngineRequest) -> Result<usize, EngineError> {
        Ok(request
            .messages
            .iter()
            .map(|m| {
                m.content
                    .as_ref()
                    .map(|c| c.joined_text().split_whitespace().count())
                    .unwrap_or(0)
            })
            .sum())
    }
}

/// Engine that always fails; for status/body passthrough tests.
struct FailingEngine;

impl GenerationEngine for FailingEngine {
    fn model_id(&self) -> String {
        "failing-1b".to_string()
    }

    fn generate_stream(&self, _request: EngineRequest) -> Result<EngineStream, EngineError> {
        Err(EngineError::new(503, "engine overloaded"))
    }

    fn cancel(&self, _seq_id: usize) {}

    fn count_tokens(&self, _request: &EngineRequest) -> Result<usize, EngineError> {
        Err(EngineError::new(503, "engine overloaded"))
    }
}

fn text_events(text: &str) -> Vec<CanonicalEvent> {
    vec![
        CanonicalEvent::TextDelta(text.to_string()),
        CanonicalEvent::Usage {
            input_tokens: 7,
            output_tokens: 2,
        },
        CanonicalEvent::Finish {
            reason: FinishReason::Stop,
            stop_sequence: None,
        },
    ]
}

fn tool_call_events() -> Vec<CanonicalEvent> {
    vec![
        CanonicalEvent::ToolCallStart {
            index: 0,
            id: Some("call_1".to_string()),
            name: "write_file".to_string(),
        },
        CanonicalEvent::ToolCallArgsDelta {
            index: 0,
            fragment: r#"{"path": "main"#.to_string(),
        },
        CanonicalEvent::ToolCallArgsDelta {
            index: 0,
            fragment: r#" . js", "junk": true}"#.to_string(),
        },
        CanonicalEvent::ToolCallEnd { index: 0 },
        CanonicalEvent::Usage {
            input_tokens: 7,
            output_tokens: 11,
        },
        CanonicalEvent::Finish {
            reason: FinishReason::Stop,
            stop_sequence: None,
        },
    ]
}

fn write_file_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "write_file",
            "parameters": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "additionalProperties": false
            }
        }
    })
}

fn gateway(engine: Arc<dyn GenerationEngine>) -> axum::Router {
    Gateway::new(engine, GatewayConfig::new("minimax_m2")).router()
}

async fn request_json(
    router: &axum::Router,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, String) {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    let request = match body {
        Some(body) => builder
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

fn sse_data_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

fn sse_event_names(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn health_returns_ok() {
    lmbridge::utils::init_tracing();
    let router = gateway(ScriptedEngine::new(|_| Vec::new()));
    let (status, body) = request_json(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!({"status": "ok"})
    );
}

#[tokio::test]
async fn models_lists_default_model_first() {
    let router = gateway(ScriptedEngine::new(|_| Vec::new()));
    let (status, body) = request_json(&router, "GET", "/v1/models", None).await;
    assert_eq!(status, StatusCode::OK);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["object"], "list");
    assert_eq!(parsed["data"][0]["id"], "scripted-1b");
}

#[tokio::test]
async fn openai_completion_returns_text() {
    let router = gateway(ScriptedEngine::new(|_| text_events("Hello!")));
    let (status, body) = request_json(
        &router,
        "POST",
        "/chat/completions",
        Some(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 32
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(parsed["choices"][0]["finish_reason"], "stop");
    assert_eq!(parsed["usage"]["prompt_tokens"], 7);
    assert_eq!(parsed["usage"]["completion_tokens"], 2);
}

#[tokio::test]
async fn openai_completion_repairs_tool_call_arguments() {
    let router = gateway(ScriptedEngine::new(|_| tool_call_events()));
    let (status, body) = request_json(
        &router,
        "POST",
        "/v1/chat/completions",
        Some(json!({
            "messages": [{"role": "user", "content": "write it"}],
            "tools": [write_file_tool()],
            "max_tokens": 32
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    let message = &parsed["choices"][0]["message"];
    assert!(message["content"].is_null());
    let arguments = message["tool_calls"][0]["function"]["arguments"]
        .as_str()
        .expect("string-encoded arguments");
    // Spacing repaired and the undeclared key dropped by the closed schema.
    assert_eq!(
        serde_json::from_str::<Value>(arguments).unwrap(),
        json!({"path": "main.js"})
    );
    assert_eq!(parsed["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn openai_stream_ends_with_done_and_single_usage_chunk() {
    let router = gateway(ScriptedEngine::new(|_| tool_call_events()));
    let (status, body) = request_json(
        &router,
        "POST",
        "/chat/completions",
        Some(json!({
            "messages": [{"role": "user", "content": "write it"}],
            "tools": [write_file_tool()],
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_tokens": 32
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let lines = sse_data_lines(&body);
    assert_eq!(lines.last().map(String::as_str), Some("[DONE]"));

    let chunks: Vec<Value> = lines
        .iter()
        .filter(|line| line.as_str() != "[DONE]")
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    // Raw fragments stream through; the receiver reassembles them.
    let fragments: String = chunks
        .iter()
        .filter_map(|chunk| {
            chunk["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"].as_str()
        })
        .collect();
    assert_eq!(fragments, r#"{"path": "main . js", "junk": true}"#);

    let finish_reasons: Vec<&str> = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["finish_reason"].as_str())
        .collect();
    assert_eq!(finish_reasons, vec!["tool_calls"]);

    let usage_chunks: Vec<&Value> = chunks
        .iter()
        .filter(|chunk| !chunk["usage"].is_null())
        .collect();
    assert_eq!(usage_chunks.len(), 1);
    assert_eq!(usage_chunks[0]["usage"]["completion_tokens"], 11);
}

#[tokio::test]
async fn claude_message_repairs_tool_use_input() {
    let router = gateway(ScriptedEngine::new(|_| tool_call_events()));
    let (status, body) = request_json(
        &router,
        "POST",
        "/v1/messages?beta=true",
        Some(json!({
            "model": "scripted-1b",
            "max_tokens": 32,
            "messages": [{"role": "user", "content": "write it"}],
            "tools": [{
                "name": "write_file",
                "input_schema": {
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "additionalProperties": false
                }
            }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["type"], "message");
    assert_eq!(parsed["stop_reason"], "tool_use");
    assert_eq!(parsed["content"][0]["type"], "tool_use");
    // Structured input, never a string blob.
    assert_eq!(parsed["content"][0]["input"], json!({"path": "main.js"}));
    assert_eq!(parsed["usage"]["output_tokens"], 11);
}

#[tokio::test]
async fn claude_stream_is_wellformed() {
    let router = gateway(ScriptedEngine::new(|_| {
        let mut events = vec![CanonicalEvent::TextDelta("Let me write that.".to_string())];
        events.extend(tool_call_events());
        events
    }));
    let (status, body) = request_json(
        &router,
        "POST",
        "/v1/messages",
        Some(json!({
            "model": "scripted-1b",
            "max_tokens": 32,
            "stream": true,
            "messages": [{"role": "user", "content": "write it"}],
            "tools": [{
                "name": "write_file",
                "input_schema": {"type": "object", "properties": {"path": {"type": "string"}}}
            }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let names = sse_event_names(&body);
    assert_eq!(names.iter().filter(|n| *n == "message_start").count(), 1);
    assert_eq!(names.iter().filter(|n| *n == "message_stop").count(), 1);
    assert_eq!(names.first().map(String::as_str), Some("message_start"));
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));
    // Blocks open and close in pairs.
    assert_eq!(
        names.iter().filter(|n| *n == "content_block_start").count(),
        names.iter().filter(|n| *n == "content_block_stop").count()
    );

    let data: Vec<Value> = sse_data_lines(&body)
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let tool_start = data.iter().find(|event| {
        event["type"] == "content_block_start" && event["content_block"]["type"] == "tool_use"
    });
    assert!(tool_start.is_some());
    let message_delta = data
        .iter()
        .find(|event| event["type"] == "message_delta")
        .expect("message_delta event");
    assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
}

#[tokio::test]
async fn claude_tool_result_without_tool_use_is_rejected() {
    let router = gateway(ScriptedEngine::new(|_| Vec::new()));
    let (status, body) = request_json(
        &router,
        "POST",
        "/v1/messages",
        Some(json!({
            "model": "scripted-1b",
            "max_tokens": 32,
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "toolu_1",
                    "content": "ok"
                }]
            }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["type"], "error");
    assert_eq!(parsed["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn engine_failure_passes_status_and_body_through() {
    let router = gateway(Arc::new(FailingEngine));

    let (status, body) = request_json(
        &router,
        "POST",
        "/chat/completions",
        Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "engine overloaded");

    let (status, body) = request_json(
        &router,
        "POST",
        "/v1/messages",
        Some(json!({
            "model": "failing-1b",
            "max_tokens": 32,
            "messages": [{"role": "user", "content": "hi"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "engine overloaded");
}

#[tokio::test]
async fn count_tokens_delegates_to_engine() {
    let router = gateway(ScriptedEngine::new(|_| Vec::new()));
    let (status, body) = request_json(
        &router,
        "POST",
        "/v1/messages/count_tokens",
        Some(json!({
            "model": "scripted-1b",
            "messages": [{"role": "user", "content": "one two three"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!({"input_tokens": 3})
    );
}

#[tokio::test]
async fn concurrent_streams_stay_isolated() {
    // Each request's stream echoes its own marker; no stream may observe
    // another's content or lose its terminal sentinel.
    let router = gateway(ScriptedEngine::new(|request| {
        let marker = request
            .messages
            .last()
            .and_then(|m| m.content.as_ref())
            .map(|c| c.joined_text())
            .unwrap_or_default();
        vec![
            CanonicalEvent::TextDelta(format!("echo:{marker}")),
            CanonicalEvent::Finish {
                reason: FinishReason::Stop,
                stop_sequence: None,
            },
        ]
    }));

    let mut handles = Vec::new();
    for i in 0..8 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            let (status, body) = request_json(
                &router,
                "POST",
                "/chat/completions",
                Some(json!({
                    "messages": [{"role": "user", "content": format!("req-{i}")}],
                    "stream": true
                })),
            )
            .await;
            (i, status, body)
        }));
    }

    for handle in handles {
        let (i, status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let lines = sse_data_lines(&body);
        assert_eq!(lines.last().map(String::as_str), Some("[DONE]"));
        let own_marker = format!("echo:req-{i}");
        let contents: String = lines
            .iter()
            .filter(|line| line.as_str() != "[DONE]")
            .filter_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|chunk| {
                    chunk["choices"][0]["delta"]["content"]
                        .as_str()
                        .map(str::to_string)
                })
            })
            .collect();
        assert_eq!(contents, own_marker);
        for other in 0..8 {
            if other != i {
                assert!(!body.contains(&format!("echo:req-{other}")));
            }
        }
    }
}
