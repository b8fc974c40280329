// src/api.rs
//! Public entry point: wire a `GenerationEngine` into an axum router and
//! serve both protocol surfaces from it.

use crate::core::engine::{GenerationEngine, GLOBAL_RT};
use crate::server::{claude_server, server, ServerData};
use crate::utils::config::GatewayConfig;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Gateway over one engine. Cheap to clone the router; all request state is
/// request-scoped, so any number of concurrent flows share it without
/// synchronization.
pub struct Gateway {
    data: Arc<ServerData>,
}

impl Gateway {
    pub fn new(engine: Arc<dyn GenerationEngine>, config: GatewayConfig) -> Self {
        Self {
            data: Arc::new(ServerData { engine, config }),
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health))
            .route("/v1/models", get(models))
            .route("/chat/completions", post(server::chat_completion))
            .route("/v1/chat/completions", post(server::chat_completion))
            .route("/v1/messages", post(claude_server::messages))
            .route(
                "/v1/messages/count_tokens",
                post(claude_server::count_tokens),
            )
            .layer(cors)
            .with_state(self.data.clone())
    }

    /// Serve until ctrl-c. Blocks on the global runtime.
    pub fn start_server(&self, port: u16) -> anyhow::Result<()> {
        let app = self.router();
        let addr = format!("0.0.0.0:{port}");
        crate::log_info!("Gateway listening on http://{addr}/");

        GLOBAL_RT.block_on(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tokio::select! {
                result = axum::serve(listener, app) => {
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {
                    crate::log_info!("Received CTRL+C, shutting down server...");
                }
            }
            Ok(())
        })
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn models(State(data): State<Arc<ServerData>>) -> Json<Value> {
    let model_id = data.engine.model_id();
    Json(json!({
        "object": "list",
        "data": [
            {
                "id": model_id,
                "object": "model",
                "created": crate::server::created_timestamp(),
                "owned_by": "lmbridge",
            }
        ]
    }))
}
