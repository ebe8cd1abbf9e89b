//! The downstream client pool.
//!
//! Owns one live transport per configured server, routes calls by server
//! name, reconnects broken transports on demand, and applies the admission
//! discipline: per-call timeout inside the server's circuit breaker, the
//! whole call under an admission permit from the concurrency gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use toolgate_core::breaker::{BreakerConfig, BreakerRegistry};
use toolgate_core::cache::SchemaSource;
use toolgate_core::descriptor::{ToolDescriptor, ToolName};
use toolgate_core::queue::{QueueConfig, WaitQueue};
use toolgate_core::ToolBroker;
use toolgate_error::GatewayError;

use crate::gate::AdmissionGate;
use crate::protocol::{WireTool, METHOD_CALL_TOOL, METHOD_LIST_TOOLS};
use crate::transport::{connect, Transport, TransportConfig};

/// Health of one downstream server as observed by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Never connected.
    Unknown,
    /// Last interaction succeeded.
    Healthy,
    /// Last connect or call broke the transport.
    Unhealthy,
}

/// Static description of one downstream server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    /// Server name (the first segment of qualified tool names).
    pub name: String,
    /// How to reach it.
    pub transport: TransportConfig,
    /// Per-call timeout override.
    pub call_timeout: Option<Duration>,
    /// Circuit breaker override.
    pub breaker: Option<BreakerConfig>,
}

/// Pool-wide configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent downstream calls.
    pub max_concurrent: usize,
    /// Overflow queue sizing.
    pub queue: QueueConfig,
    /// Default per-call timeout.
    pub call_timeout: Duration,
    /// Optional namespace prefix for qualified tool names.
    pub tool_prefix: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            queue: QueueConfig::default(),
            call_timeout: Duration::from_secs(60),
            tool_prefix: None,
        }
    }
}

struct ServerHandle {
    name: String,
    transport: TransportConfig,
    call_timeout: Duration,
    client: Mutex<Option<Arc<dyn Transport>>>,
    health: std::sync::Mutex<HealthState>,
}

/// The downstream client pool.
pub struct DownstreamPool {
    handles: HashMap<String, ServerHandle>,
    breakers: Arc<BreakerRegistry>,
    gate: Arc<AdmissionGate>,
    config: PoolConfig,
    request_seq: AtomicU64,
}

impl DownstreamPool {
    /// Build a pool from server specs. Connections are established lazily on
    /// first use and re-established on demand after a failure.
    pub fn new(specs: Vec<ServerSpec>, config: PoolConfig) -> Self {
        let mut handles = HashMap::new();
        let mut breaker_overrides = HashMap::new();

        for spec in specs {
            if let Some(breaker) = &spec.breaker {
                breaker_overrides.insert(spec.name.clone(), breaker.clone());
            }
            handles.insert(
                spec.name.clone(),
                ServerHandle {
                    name: spec.name,
                    transport: spec.transport,
                    call_timeout: spec.call_timeout.unwrap_or(config.call_timeout),
                    client: Mutex::new(None),
                    health: std::sync::Mutex::new(HealthState::Unknown),
                },
            );
        }

        let queue = Arc::new(WaitQueue::new(config.queue.clone()));
        let gate = Arc::new(AdmissionGate::new(config.max_concurrent, queue));

        Self {
            handles,
            breakers: Arc::new(BreakerRegistry::new(
                BreakerConfig::default(),
                breaker_overrides,
            )),
            gate,
            config,
            request_seq: AtomicU64::new(0),
        }
    }

    /// The admission gate (shared with metrics and shutdown).
    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    /// The breaker registry (shared with the dispatcher's fast check).
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Qualified name for a bare tool on a server.
    pub fn qualify(&self, server: &str, tool: &str) -> String {
        match &self.config.tool_prefix {
            Some(prefix) => format!("{prefix}.{server}.{tool}"),
            None => format!("{server}.{tool}"),
        }
    }

    fn handle(&self, server: &str) -> Result<&ServerHandle, GatewayError> {
        self.handles
            .get(server)
            .ok_or_else(|| GatewayError::ServerNotFound(server.to_string()))
    }

    fn set_health(&self, handle: &ServerHandle, state: HealthState) {
        *handle.health.lock().expect("health lock poisoned") = state;
    }

    /// Current health of every configured server.
    pub fn health(&self) -> HashMap<String, HealthState> {
        self.handles
            .iter()
            .map(|(name, handle)| {
                let state = *handle.health.lock().expect("health lock poisoned");
                (name.clone(), state)
            })
            .collect()
    }

    /// Get the live transport for a server, connecting or reconnecting as
    /// needed. At most one active transport exists per server.
    async fn client_for(&self, server: &str) -> Result<Arc<dyn Transport>, GatewayError> {
        let handle = self.handle(server)?;
        let mut guard = handle.client.lock().await;

        if let Some(client) = guard.as_ref() {
            if client.is_healthy() {
                return Ok(client.clone());
            }
            tracing::warn!(server = %server, "transport broken, reconnecting");
            if let Some(old) = guard.take() {
                old.shutdown().await;
            }
        }

        match connect(&handle.name, &handle.transport).await {
            Ok(client) => {
                *guard = Some(client.clone());
                self.set_health(handle, HealthState::Healthy);
                Ok(client)
            }
            Err(e) => {
                self.set_health(handle, HealthState::Unhealthy);
                Err(e)
            }
        }
    }

    /// Observe post-call transport health and drop a broken client so the
    /// next call reconnects.
    async fn note_transport_health(&self, server: &str) {
        let Ok(handle) = self.handle(server) else {
            return;
        };
        let mut guard = handle.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_healthy() {
                self.set_health(handle, HealthState::Unhealthy);
                if let Some(old) = guard.take() {
                    old.shutdown().await;
                }
            }
        }
    }

    async fn request_with_breaker(
        &self,
        server: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, GatewayError> {
        let handle = self.handle(server)?;
        let call_timeout = handle.call_timeout;

        let result = self
            .breakers
            .execute(server, async {
                let client = self.client_for(server).await?;
                match tokio::time::timeout(call_timeout, client.request(method, params)).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(GatewayError::Downstream {
                        server: server.to_string(),
                        message: format!("timeout after {}ms", call_timeout.as_millis()),
                    }),
                }
            })
            .await;

        self.note_transport_health(server).await;
        result
    }
}

#[async_trait::async_trait]
impl ToolBroker for DownstreamPool {
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: Value,
    ) -> Result<Value, GatewayError> {
        // Fail fast on unknown servers before consuming an admission slot.
        let _ = self.handle(server)?;

        let seq = self.request_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = Instant::now() + self.config.queue.default_timeout;
        let permit = self
            .gate
            .acquire(
                &format!("pool-{seq}"),
                server,
                &self.qualify(server, tool),
                deadline,
            )
            .await?;

        let result = self
            .request_with_breaker(
                server,
                METHOD_CALL_TOOL,
                serde_json::json!({"name": tool, "args": args}),
            )
            .await;

        drop(permit);
        result
    }

    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let result = self
            .request_with_breaker(server, METHOD_LIST_TOOLS, serde_json::json!({}))
            .await?;

        let tools: Vec<WireTool> = match result {
            Value::Array(items) => serde_json::from_value(Value::Array(items)),
            Value::Object(mut map) => match map.remove("tools") {
                Some(tools) => serde_json::from_value(tools),
                None => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
        .map_err(|e| GatewayError::Downstream {
            server: server.to_string(),
            message: format!("malformed listTools response: {e}"),
        })?;

        Ok(tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: self.qualify(server, &t.name),
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect())
    }

    fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl SchemaSource for DownstreamPool {
    async fn fetch_descriptor(&self, name: &ToolName) -> Result<ToolDescriptor, GatewayError> {
        let tools = self.list_tools(&name.server).await?;
        let qualified = self.qualify(&name.server, &name.tool);
        tools
            .into_iter()
            .find(|t| t.name == qualified)
            .ok_or_else(|| GatewayError::ToolNotFound {
                server: name.server.clone(),
                tool: name.tool.clone(),
            })
    }

    async fn fetch_all_descriptors(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let mut all = Vec::new();
        for server in self.server_names() {
            match self.list_tools(&server).await {
                Ok(tools) => all.extend(tools),
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "discovery failed for server");
                }
            }
        }
        Ok(all)
    }
}

impl DownstreamPool {
    /// Drain the pool: cancel queued waiters and close every transport.
    pub async fn shutdown(&self) {
        let cancelled = self.gate.cancel_waiters();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled queued downstream calls");
        }
        for handle in self.handles.values() {
            let client = handle.client.lock().await.take();
            if let Some(client) = client {
                client.shutdown().await;
            }
            self.set_health(handle, HealthState::Unknown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A sh-scripted downstream server answering every request in order with
    /// the given printf template (the `%s` is the request id).
    #[cfg(unix)]
    fn sh_spec(name: &str, template: &str) -> ServerSpec {
        let script = format!(
            "i=0; while read line; do i=$((i+1)); printf '{template}\\n' \"$i\"; done"
        );
        ServerSpec {
            name: name.to_string(),
            transport: TransportConfig::Stdio {
                command: "sh".into(),
                args: vec!["-c".into(), script],
                env: HashMap::new(),
            },
            call_timeout: None,
            breaker: None,
        }
    }

    #[cfg(unix)]
    fn ok_spec(name: &str) -> ServerSpec {
        sh_spec(name, r#"{"id":%s,"result":{"ok":true,"v":42}}"#)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn call_tool_routes_and_returns_result() {
        let pool = DownstreamPool::new(vec![ok_spec("srv-1")], PoolConfig::default());
        let result = pool
            .call_tool("srv-1", "tool-A", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result["v"], 42);
        assert_eq!(pool.health()["srv-1"], HealthState::Healthy);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unknown_server_fails_without_admission() {
        let pool = DownstreamPool::new(vec![ok_spec("srv-1")], PoolConfig::default());
        let err = pool
            .call_tool("nope", "tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ServerNotFound(_)));
        assert_eq!(pool.gate().active(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_tools_qualifies_names() {
        let spec = sh_spec(
            "files",
            r#"{"id":%s,"result":{"tools":[{"name":"search","inputSchema":{"type":"object"}}]}}"#,
        );
        let pool = DownstreamPool::new(vec![spec], PoolConfig::default());
        let tools = pool.list_tools("files").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "files.search");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_prefix_applies_to_qualified_names() {
        let spec = sh_spec(
            "files",
            r#"{"id":%s,"result":{"tools":[{"name":"search","inputSchema":{}}]}}"#,
        );
        let pool = DownstreamPool::new(
            vec![spec],
            PoolConfig {
                tool_prefix: Some("tools".into()),
                ..Default::default()
            },
        );
        let tools = pool.list_tools("files").await.unwrap();
        assert_eq!(tools[0].name, "tools.files.search");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_descriptor_finds_by_name() {
        let spec = sh_spec(
            "files",
            r#"{"id":%s,"result":{"tools":[{"name":"search","inputSchema":{"type":"object"}}]}}"#,
        );
        let pool = DownstreamPool::new(vec![spec], PoolConfig::default());

        let name = ToolName::parse("files.search", None).unwrap();
        let desc = pool.fetch_descriptor(&name).await.unwrap();
        assert_eq!(desc.name, "files.search");

        let missing = ToolName::parse("files.nope", None).unwrap();
        let err = pool.fetch_descriptor(&missing).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn downstream_error_surfaces_and_feeds_breaker() {
        let spec = ServerSpec {
            breaker: Some(BreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(30),
            }),
            ..sh_spec("bad", r#"{"id":%s,"error":{"message":"tool exploded"}}"#)
        };
        let pool = DownstreamPool::new(vec![spec], PoolConfig::default());

        for _ in 0..2 {
            let err = pool
                .call_tool("bad", "t", serde_json::json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Downstream { .. }));
        }

        // Breaker is open now: immediate circuit-open without a downstream
        // round-trip.
        let err = pool
            .call_tool("bad", "t", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn per_call_timeout_maps_to_downstream_failure() {
        // A server that never answers.
        let spec = ServerSpec {
            name: "slow".into(),
            transport: TransportConfig::Stdio {
                command: "sh".into(),
                args: vec!["-c".into(), "while read line; do :; done".into()],
                env: HashMap::new(),
            },
            call_timeout: Some(Duration::from_millis(50)),
            breaker: None,
        };
        let pool = DownstreamPool::new(vec![spec], PoolConfig::default());

        let err = pool
            .call_tool("slow", "t", serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            GatewayError::Downstream { message, .. } => {
                assert!(message.contains("timeout"), "msg: {message}");
            }
            other => panic!("expected Downstream timeout, got: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn broken_transport_reconnects_on_next_call() {
        // Answers exactly one request, then exits: second call must hit a
        // fresh child.
        let script = r#"read line; printf '{"id":1,"result":{"n":1}}\n'"#;
        let spec = ServerSpec {
            name: "oneshot".into(),
            transport: TransportConfig::Stdio {
                command: "sh".into(),
                args: vec!["-c".into(), script.into()],
                env: HashMap::new(),
            },
            call_timeout: Some(Duration::from_millis(500)),
            breaker: None,
        };
        let pool = DownstreamPool::new(vec![spec], PoolConfig::default());

        let first = pool.call_tool("oneshot", "t", serde_json::json!({})).await;
        assert!(first.is_ok());

        // Give the child time to exit and the pool to notice.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = pool.call_tool("oneshot", "t", serde_json::json!({})).await;
        assert!(
            second.is_ok(),
            "reconnect should serve the second call: {second:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrency_cap_queues_excess_calls() {
        // Server answers after a small delay so calls overlap.
        let script = r#"i=0; while read line; do i=$((i+1)); sleep 0.1; printf '{"id":%s,"result":{}}\n' "$i"; done"#;
        let spec = ServerSpec {
            name: "s".into(),
            transport: TransportConfig::Stdio {
                command: "sh".into(),
                args: vec!["-c".into(), script.into()],
                env: HashMap::new(),
            },
            call_timeout: None,
            breaker: None,
        };
        let pool = Arc::new(DownstreamPool::new(
            vec![spec],
            PoolConfig {
                max_concurrent: 1,
                queue: QueueConfig {
                    max_size: 10,
                    default_timeout: Duration::from_secs(5),
                },
                ..Default::default()
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.call_tool("s", "t", serde_json::json!({})).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.gate().active() <= 1, "cap must hold");

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(pool.gate().active(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_waiters() {
        let pool = DownstreamPool::new(Vec::new(), PoolConfig::default());
        pool.shutdown().await;
        assert_eq!(pool.gate().queued(), 0);
    }

    #[test]
    fn server_names_are_sorted() {
        let specs = ["zeta", "alpha", "mid"]
            .into_iter()
            .map(|n| ServerSpec {
                name: n.to_string(),
                transport: TransportConfig::Http {
                    url: "http://127.0.0.1:9/x".into(),
                    headers: HashMap::new(),
                },
                call_timeout: None,
                breaker: None,
            })
            .collect();
        let pool = DownstreamPool::new(specs, PoolConfig::default());
        assert_eq!(pool.server_names(), vec!["alpha", "mid", "zeta"]);
    }
}
