#![warn(missing_docs)]

//! # toolgate-bridge
//!
//! The per-execution tool bridge: a loopback-only HTTP endpoint through
//! which sandbox code reaches the dispatcher.
//!
//! Every request must carry `Authorization: Bearer <token>` where the token
//! is the execution's own 256-bit session token, compared in constant time.
//! A mismatch is a bare 401 with no body, no detail, and no timing signal. The
//! listener binds `127.0.0.1:0` only; it is torn down when the execution
//! ends and any in-flight request is aborted with it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolgate_audit::{AuditEvent, AuditKind, AuditLog, AuditOutcome};
use toolgate_core::descriptor::ToolDescriptor;
use toolgate_core::{auth, redact};
use toolgate_error::GatewayError;

/// A tool call arriving over the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeToolCall {
    /// Fully-qualified tool name.
    pub tool_name: String,
    /// Tool arguments.
    #[serde(default)]
    pub args: Value,
    /// Sandbox-chosen request id, used for duplicate suppression.
    pub request_id: String,
}

/// The dispatcher seam: the server side implements this per execution.
#[async_trait::async_trait]
pub trait BridgeHandler: Send + Sync {
    /// Dispatch one tool call.
    async fn tool_call(&self, call: BridgeToolCall) -> Result<Value, GatewayError>;

    /// List the tools this execution may discover.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError>;
}

/// Per-execution tool-call summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    /// Total successful tool calls.
    pub total: u64,
    /// Successful calls per fully-qualified tool name.
    pub per_tool: HashMap<String, u64>,
}

/// Per-execution authentication and accounting context.
pub struct BridgeSession {
    correlation_id: String,
    token: String,
    counters: std::sync::Mutex<HashMap<String, u64>>,
    ended: AtomicBool,
}

impl BridgeSession {
    /// Create a session with a fresh 256-bit token.
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            token: auth::generate_token(),
            counters: std::sync::Mutex::new(HashMap::new()),
            ended: AtomicBool::new(false),
        }
    }

    /// The session bearer token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The execution's correlation id.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Record one successful tool call.
    fn record_call(&self, tool_name: &str) {
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        *counters.entry(tool_name.to_string()).or_insert(0) += 1;
    }

    /// The accumulated summary.
    pub fn summary(&self) -> ToolCallSummary {
        let counters = self.counters.lock().expect("counter lock poisoned");
        ToolCallSummary {
            total: counters.values().sum(),
            per_tool: counters.clone(),
        }
    }

    /// Mark the session over; later requests are rejected.
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

struct BridgeState {
    session: Arc<BridgeSession>,
    handler: Arc<dyn BridgeHandler>,
    audit: Option<Arc<AuditLog>>,
}

/// A running bridge listener.
pub struct ToolBridge {
    addr: SocketAddr,
    session: Arc<BridgeSession>,
    task: tokio::task::JoinHandle<()>,
}

impl ToolBridge {
    /// Bind the bridge on an ephemeral loopback port and start serving.
    pub async fn start(
        session: Arc<BridgeSession>,
        handler: Arc<dyn BridgeHandler>,
        audit: Option<Arc<AuditLog>>,
    ) -> Result<Self, GatewayError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bridge bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bridge addr: {e}")))?;

        let state = Arc::new(BridgeState {
            session: session.clone(),
            handler,
            audit,
        });

        let app = Router::new()
            .route("/tool-call", post(handle_tool_call))
            .route("/list-tools", post(handle_list_tools))
            .with_state(state);

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(error = %e, "bridge listener exited with error");
            }
        });

        tracing::debug!(
            correlation_id = %session.correlation_id(),
            port = addr.port(),
            "bridge listening"
        );

        Ok(Self {
            addr,
            session,
            task,
        })
    }

    /// The bridge base URL (`http://127.0.0.1:<port>`).
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The session this bridge authenticates.
    pub fn session(&self) -> &Arc<BridgeSession> {
        &self.session
    }

    /// Tear the listener down, aborting any in-flight request.
    pub fn shutdown(self) -> ToolCallSummary {
        self.session.end();
        self.task.abort();
        self.session.summary()
    }
}

fn authorized(headers: &HeaderMap, session: &BridgeSession) -> bool {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    // Constant-time compare runs on every request, valid header or not.
    auth::token_matches(presented, session.token()) && !session.is_ended()
}

async fn audit_auth_failure(state: &BridgeState, path: &str) {
    if let Some(audit) = &state.audit {
        let event = AuditEvent::new(
            AuditKind::AuthFailure,
            AuditOutcome::Rejected,
            state.session.correlation_id(),
        )
        .with_metadata("path", serde_json::json!(path));
        if let Err(e) = audit.record(&event).await {
            tracing::error!(error = %e, "failed to audit auth failure");
        }
    }
}

async fn handle_tool_call(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    body: Result<Json<BridgeToolCall>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if !authorized(&headers, &state.session) {
        audit_auth_failure(&state, "/tool-call").await;
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Ok(Json(call)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": {"code": "bad-request", "message": "malformed tool call body"}})),
        )
            .into_response();
    };

    let tool_name = call.tool_name.clone();
    match state.handler.tool_call(call).await {
        Ok(result) => {
            state.session.record_call(&tool_name);
            (StatusCode::OK, Json(serde_json::json!({"result": result}))).into_response()
        }
        Err(e) => {
            // For a mistyped name, offer near-miss suggestions from the live
            // registry. The handler's listing is allow-list filtered, so
            // suggestions never name a tool this execution may not call.
            let known_tools: Option<Vec<String>> = match e.code() {
                "tool-not-found" | "server-not-found" => state
                    .handler
                    .list_tools()
                    .await
                    .ok()
                    .map(|tools| tools.into_iter().map(|t| t.name).collect()),
                _ => None,
            };
            let mut structured = e.to_structured_error(known_tools.as_deref());
            // Content-filter the message before it crosses into the sandbox.
            if let Some(message) = structured.get("message").and_then(Value::as_str) {
                let filtered = redact::filter_text(message);
                structured["message"] = Value::String(filtered);
            }
            (StatusCode::OK, Json(serde_json::json!({"error": structured}))).into_response()
        }
    }
}

async fn handle_list_tools(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers, &state.session) {
        audit_auth_failure(&state, "/list-tools").await;
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.handler.list_tools().await {
        Ok(tools) => (StatusCode::OK, Json(tools)).into_response(),
        Err(e) => {
            let structured = e.to_structured_error(None);
            (StatusCode::OK, Json(serde_json::json!({"error": structured}))).into_response()
        }
    }
}
