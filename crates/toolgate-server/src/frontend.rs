//! The execute front-end.
//!
//! Two wire surfaces expose the same operation: a line-delimited JSON-RPC
//! channel over stdio and an HTTP channel (`POST /execute`). Both build an
//! Execution and hand it to the supervisor; the response carries the
//! captured output and the tool-call summary.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::sync::Mutex;
use toolgate_bridge::ToolCallSummary;
use toolgate_client::protocol::{read_line, write_line, WireError, WireRequest, WireResponse};

use crate::GatewayServer;

/// One inbound execute-request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteRequest {
    /// Sandbox language ("script" or "wasm").
    pub language: String,
    /// The program text.
    pub code: String,
    /// Glob patterns over fully-qualified tool names.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Wall-clock budget in milliseconds; defaults to the configured value.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Rate-limit identity; defaults to the execution's correlation id.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Optional filesystem/network grants.
    #[serde(default)]
    pub permissions: Option<PermissionsRequest>,
}

/// Requested sandbox permissions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PermissionsRequest {
    /// Paths the sandbox may read.
    #[serde(default)]
    pub read_paths: Option<Vec<String>>,
    /// Paths the sandbox may write, or a blanket grant.
    #[serde(default)]
    pub write_paths: Option<PathsOrAll>,
    /// Hosts the sandbox may reach, or a blanket grant.
    #[serde(default)]
    pub network_hosts: Option<PathsOrAll>,
}

/// Either an explicit list or a blanket boolean grant.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PathsOrAll {
    /// Blanket grant (or explicit denial with `false`).
    All(bool),
    /// An explicit list.
    Paths(Vec<String>),
}

/// The execute-response wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    /// Terminal status: succeeded, failed, timed-out, cancelled.
    pub status: String,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall time of the execution in milliseconds.
    pub execution_time_ms: u64,
    /// Tool calls made through the bridge.
    pub tool_call_summary: ToolCallSummary,
    /// Present for every non-succeeded status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireFailure>,
}

/// A structured failure in the execute-response.
#[derive(Debug, Clone, Serialize)]
pub struct WireFailure {
    /// Error kind (taxonomy string).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// Handle one JSON-RPC request from the stdio channel.
pub(crate) async fn handle_wire_request(
    server: &Arc<GatewayServer>,
    request: WireRequest,
) -> WireResponse {
    if request.method != "execute" {
        return WireResponse {
            id: request.id,
            result: None,
            error: Some(WireError {
                message: format!("unknown method '{}'", request.method),
            }),
        };
    }

    let execute_request: ExecuteRequest = match serde_json::from_value(request.params) {
        Ok(req) => req,
        Err(e) => {
            return WireResponse {
                id: request.id,
                result: None,
                error: Some(WireError {
                    message: format!("malformed execute request: {e}"),
                }),
            };
        }
    };

    let response = server.execute(execute_request).await;
    WireResponse {
        id: request.id,
        result: serde_json::to_value(response).ok(),
        error: None,
    }
}

/// Serve the execute operation over stdio until EOF or shutdown.
///
/// Requests are handled concurrently; response lines are serialized through
/// one writer lock.
pub async fn serve_stdio(server: Arc<GatewayServer>) -> anyhow::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut cancel = server.shutdown_handle().subscribe();
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        // Reap finished request tasks so the set stays bounded.
        while tasks.try_join_next().is_some() {}

        tokio::select! {
            line = read_line::<WireRequest, _>(&mut stdin) => match line {
                Ok(Some(request)) => {
                    let server = server.clone();
                    let stdout = stdout.clone();
                    tasks.spawn(async move {
                        let response = handle_wire_request(&server, request).await;
                        let mut writer = stdout.lock().await;
                        if let Err(e) = write_line(&mut *writer, &response).await {
                            tracing::error!(error = %e, "failed to write response line");
                        }
                    });
                }
                Ok(None) => {
                    tracing::info!("stdin closed, stopping front-end");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable request line, stopping front-end");
                    break;
                }
            },
            _ = cancel.changed() => {
                tracing::info!("front-end stopping for shutdown");
                break;
            }
        }
    }

    while tasks.join_next().await.is_some() {}
    Ok(())
}

/// Build the HTTP front-end router.
pub fn router(server: Arc<GatewayServer>) -> Router {
    Router::new()
        .route("/execute", post(http_execute))
        .route("/healthz", get(http_health))
        .route("/metrics", get(http_metrics))
        .with_state(server)
}

/// Serve the HTTP front-end until shutdown. Bind failures are fatal.
pub async fn serve_http(server: Arc<GatewayServer>, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind HTTP front-end on {addr}: {e}"))?;
    serve_http_listener(server, listener).await
}

/// Serve the HTTP front-end on an already-bound listener.
pub async fn serve_http_listener(
    server: Arc<GatewayServer>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "HTTP front-end listening");
    }
    let mut cancel = server.shutdown_handle().subscribe();
    axum::serve(listener, router(server))
        .with_graceful_shutdown(async move {
            let _ = cancel.changed().await;
        })
        .await?;
    Ok(())
}

async fn http_execute(
    State(server): State<Arc<GatewayServer>>,
    Json(request): Json<ExecuteRequest>,
) -> Json<ExecuteResponse> {
    Json(server.execute(request).await)
}

async fn http_health(State(server): State<Arc<GatewayServer>>) -> Json<serde_json::Value> {
    let health: std::collections::HashMap<String, &'static str> = server
        .pool()
        .health()
        .into_iter()
        .map(|(name, state)| {
            let label = match state {
                toolgate_client::HealthState::Unknown => "unknown",
                toolgate_client::HealthState::Healthy => "healthy",
                toolgate_client::HealthState::Unhealthy => "unhealthy",
            };
            (name, label)
        })
        .collect();
    Json(serde_json::json!({
        "draining": server.shutdown_handle().is_draining(),
        "servers": health,
    }))
}

async fn http_metrics(State(server): State<Arc<GatewayServer>>) -> impl IntoResponse {
    // Bridge live gauges from the admission gate before encoding.
    let gate = server.pool().gate();
    server.metrics().downstream_in_flight.set(gate.active() as i64);
    server.metrics().queue_depth.set(gate.queued() as i64);

    let mut body = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut body, server.registry()) {
        tracing::warn!(error = %e, "metrics encoding failed");
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
