#![warn(missing_docs)]

//! # toolgate-server
//!
//! The orchestration layer of the toolgate gateway.
//!
//! [`GatewayServer`] owns the whole assembly: the downstream pool, schema
//! cache, rate limiter, audit log, dispatcher, sandbox supervisor, and
//! shutdown coordinator. The front-end exposes the execute operation over
//! line-delimited JSON-RPC on stdio and over HTTP.

pub mod dispatcher;
pub mod frontend;
pub mod metrics;
pub mod shutdown;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::Value;
use toolgate_audit::{AuditEvent, AuditKind, AuditLog, AuditOutcome};
use toolgate_bridge::{BridgeHandler, BridgeToolCall, ToolCallSummary};
use toolgate_client::{DownstreamPool, PoolConfig, ServerSpec, TransportConfig};
use toolgate_config::GatewayConfig;
use toolgate_core::breaker::BreakerConfig;
use toolgate_core::cache::{SchemaCache, SchemaCacheConfig};
use toolgate_core::descriptor::ToolDescriptor;
use toolgate_core::queue::QueueConfig;
use toolgate_core::ratelimit::{RateLimiter, RateLimiterConfig};
use toolgate_core::redact;
use toolgate_core::ToolAllowList;
use toolgate_error::GatewayError;
use toolgate_sandbox::{
    Engine, EngineSet, ExecutionRequest, Language, SandboxPermissions, Supervisor,
    SupervisorConfig,
};

use dispatcher::{Dispatcher, ExecutionContext};
use frontend::{ExecuteRequest, ExecuteResponse, PathsOrAll, WireFailure};
use metrics::GatewayMetrics;
use shutdown::ShutdownCoordinator;

/// Smallest accepted execution timeout.
pub const MIN_TIMEOUT_MS: u64 = 1_000;
/// Largest accepted execution timeout.
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// The assembled gateway.
pub struct GatewayServer {
    pool: Arc<DownstreamPool>,
    cache: Arc<SchemaCache>,
    limiter: Arc<RateLimiter>,
    audit: Option<Arc<AuditLog>>,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<Supervisor>,
    metrics: Arc<GatewayMetrics>,
    registry: Arc<prometheus_client::registry::Registry>,
    shutdown: ShutdownCoordinator,
    active_executions: AtomicUsize,
    default_timeout_ms: u64,
    max_code_size: usize,
    allowed_roots: Vec<std::path::PathBuf>,
    tool_prefix: Option<String>,
}

/// Per-execution adapter handing bridge traffic to the dispatcher.
struct ExecutionBridgeHandler {
    dispatcher: Arc<Dispatcher>,
    ctx: ExecutionContext,
}

#[async_trait::async_trait]
impl BridgeHandler for ExecutionBridgeHandler {
    async fn tool_call(&self, call: BridgeToolCall) -> Result<Value, GatewayError> {
        self.dispatcher.dispatch(&self.ctx, call).await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        self.dispatcher.list_tools(&self.ctx).await
    }
}

impl GatewayServer {
    /// Assemble the gateway from configuration.
    ///
    /// Fatal on an uncreatable state directory or audit log: the caller
    /// exits non-zero.
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        let state_dir = config.resolve_state_dir();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("cannot create state directory {}", state_dir.display()))?;

        let audit = if config.audit.enabled {
            Some(Arc::new(
                AuditLog::open(&state_dir, config.audit.retention_days)
                    .context("cannot open audit log")?,
            ))
        } else {
            None
        };

        let pool = Arc::new(DownstreamPool::new(
            server_specs(config),
            PoolConfig {
                max_concurrent: config.pool.max_concurrent,
                queue: QueueConfig {
                    max_size: config.pool.queue_size,
                    default_timeout: Duration::from_millis(config.pool.queue_timeout_ms),
                },
                call_timeout: Duration::from_millis(config.pool.call_timeout_ms),
                tool_prefix: config.tool_prefix.clone(),
            },
        ));

        let cache = Arc::new(SchemaCache::new(
            SchemaCacheConfig {
                max_entries: config.schema_cache.max_entries,
                ttl: Duration::from_secs(config.schema_cache.ttl_secs),
                disk_path: Some(state_dir.join("schema-cache.json")),
            },
            pool.clone(),
        ));

        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            max_requests: config.rate_limit.max_requests,
            window_ms: config.rate_limit.window_ms,
            burst: config.rate_limit.effective_burst(),
        }));

        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(GatewayMetrics::new(&mut registry));

        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            cache.clone(),
            limiter.clone(),
            pool.breakers().clone(),
            audit.clone(),
            Some(metrics.clone()),
        ));

        let wasm_ready = std::env::var(toolgate_sandbox::WASM_READY_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let engines = EngineSet::new(
            config.sandbox.script_engine.as_ref().map(to_engine),
            config.sandbox.wasm_engine.as_ref().map(to_engine),
            wasm_ready,
        );
        let supervisor = Arc::new(Supervisor::new(
            engines,
            SupervisorConfig {
                capture_cap: config.sandbox.capture_cap_bytes,
                grace: Duration::from_millis(config.sandbox.grace_ms),
            },
        ));

        Ok(Self {
            pool,
            cache,
            limiter,
            audit,
            dispatcher,
            supervisor,
            metrics,
            registry: Arc::new(registry),
            shutdown: ShutdownCoordinator::default(),
            active_executions: AtomicUsize::new(0),
            default_timeout_ms: config.sandbox.default_timeout_ms,
            max_code_size: config.sandbox.max_code_size,
            allowed_roots: config.sandbox.allowed_roots.clone(),
            tool_prefix: config.tool_prefix.clone(),
        })
    }

    /// Warm the schema cache from disk, sweep stale audit files, and start
    /// the background maintenance tasks.
    pub async fn start(&self) {
        self.cache.load().await;
        if let Some(audit) = &self.audit {
            match audit.sweep().await {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!(deleted, "audit retention sweep removed expired files");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "audit retention sweep failed"),
            }
        }
        let _ = self.limiter.start_sweep_task(Duration::from_secs(60));
        let _ = self
            .pool
            .gate()
            .queue()
            .start_cleanup_task(Duration::from_secs(1));
    }

    /// The shutdown coordinator.
    pub fn shutdown_handle(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// The downstream pool.
    pub fn pool(&self) -> &Arc<DownstreamPool> {
        &self.pool
    }

    /// The metrics registry (for the `/metrics` endpoint).
    pub fn registry(&self) -> &prometheus_client::registry::Registry {
        &self.registry
    }

    /// The gateway metrics.
    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Run one execute-request to completion.
    ///
    /// All failures fold into the response; this never errors at the
    /// transport level.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecuteResponse {
        let started = Instant::now();

        if self.shutdown.is_draining() {
            return failure_response(started, "shutdown", "server is shutting down");
        }

        let Some(language) = Language::parse(&request.language) else {
            return failure_response(
                started,
                "invalid-request",
                &format!("unknown language '{}'", request.language),
            );
        };
        if self.supervisor.engines().resolve(language).is_err() {
            return failure_response(
                started,
                "invalid-request",
                &format!("language '{}' is not available", request.language),
            );
        }

        if request.code.len() > self.max_code_size {
            return failure_response(
                started,
                "invalid-request",
                &format!(
                    "code exceeds the {} byte limit",
                    self.max_code_size
                ),
            );
        }

        let timeout_ms = request.timeout_ms.unwrap_or(self.default_timeout_ms);
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
            return failure_response(
                started,
                "invalid-request",
                &format!("timeoutMs must be within [{MIN_TIMEOUT_MS}, {MAX_TIMEOUT_MS}]"),
            );
        }

        let allowlist = match ToolAllowList::new(&request.allowed_tools) {
            Ok(list) => list,
            Err(e) => {
                return failure_response(started, "invalid-request", &e.to_string());
            }
        };

        let permissions =
            match resolve_permissions(request.permissions.as_ref(), &self.allowed_roots) {
                Ok(permissions) => permissions,
                Err(message) => return failure_response(started, "invalid-request", &message),
            };

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let timeout = Duration::from_millis(timeout_ms);
        let ctx = ExecutionContext {
            execution_id: correlation_id.clone(),
            client_id: request
                .client_id
                .clone()
                .unwrap_or_else(|| correlation_id.clone()),
            allowlist,
            deadline: Instant::now() + timeout,
            tool_prefix: self.tool_prefix.clone(),
        };
        let handler = Arc::new(ExecutionBridgeHandler {
            dispatcher: self.dispatcher.clone(),
            ctx,
        });

        let sandbox_request = ExecutionRequest {
            correlation_id: correlation_id.clone(),
            language,
            code: request.code,
            allowed_tools: request.allowed_tools,
            timeout,
            permissions,
        };

        self.active_executions.fetch_add(1, Ordering::SeqCst);
        let result = self
            .supervisor
            .run(
                sandbox_request,
                handler,
                self.audit.clone(),
                self.shutdown.subscribe(),
            )
            .await;
        self.active_executions.fetch_sub(1, Ordering::SeqCst);
        self.dispatcher.forget_execution(&correlation_id).await;

        match result {
            Ok(outcome) => {
                self.metrics.record_execution(
                    outcome.status.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                ExecuteResponse {
                    status: outcome.status.as_str().to_string(),
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    execution_time_ms: outcome.execution_time_ms,
                    tool_call_summary: outcome.tool_call_summary,
                    error: outcome.error.map(|e| WireFailure {
                        kind: e.kind,
                        message: e.message,
                    }),
                }
            }
            Err(e) => {
                self.metrics
                    .record_execution("failed", started.elapsed().as_secs_f64());
                failure_response(started, e.code(), &redact::filter_text(&e.to_string()))
            }
        }
    }

    /// Drain and stop, bounded by the hard ceiling.
    pub async fn shutdown(&self) {
        let ceiling = self.shutdown.ceiling();
        let sequence = async {
            self.shutdown.begin();

            // Give active executions a bounded window to observe the cancel
            // signal and wind down.
            let wait_until = Instant::now() + Duration::from_secs(5);
            while self.active_executions.load(Ordering::SeqCst) > 0
                && Instant::now() < wait_until
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            self.pool.shutdown().await;

            if let Some(audit) = &self.audit {
                let event =
                    AuditEvent::new(AuditKind::Shutdown, AuditOutcome::Success, "server");
                if let Err(e) = audit.record(&event).await {
                    tracing::error!(error = %e, "failed to record shutdown audit event");
                }
            }
            if let Err(e) = self.cache.persist().await {
                tracing::warn!(error = %e, "failed to persist schema cache on shutdown");
            }
            tracing::info!("shutdown complete");
        };

        if tokio::time::timeout(ceiling, sequence).await.is_err() {
            tracing::warn!(
                ceiling_ms = ceiling.as_millis() as u64,
                "shutdown ceiling reached, abandoning remaining work"
            );
        }
    }
}

fn to_engine(cmd: &toolgate_config::EngineCommand) -> Engine {
    Engine {
        command: cmd.command.clone(),
        args: cmd.args.clone(),
    }
}

fn server_specs(config: &GatewayConfig) -> Vec<ServerSpec> {
    config
        .servers
        .iter()
        .map(|(name, sc)| {
            let transport = match sc.transport.as_str() {
                "stdio" => TransportConfig::Stdio {
                    command: sc.command.clone().unwrap_or_default(),
                    args: sc.args.clone(),
                    env: sc.env.clone(),
                },
                _ => TransportConfig::Http {
                    url: sc.url.clone().unwrap_or_default(),
                    headers: sc.headers.clone(),
                },
            };
            let breaker = match (sc.failure_threshold, sc.cooldown_ms) {
                (None, None) => None,
                (threshold, cooldown) => Some(BreakerConfig {
                    failure_threshold: threshold.unwrap_or(3),
                    cooldown: Duration::from_millis(cooldown.unwrap_or(30_000)),
                }),
            };
            ServerSpec {
                name: name.clone(),
                transport,
                call_timeout: sc.call_timeout_ms.map(Duration::from_millis),
                breaker,
            }
        })
        .collect()
}

fn resolve_permissions(
    requested: Option<&frontend::PermissionsRequest>,
    allowed_roots: &[std::path::PathBuf],
) -> Result<SandboxPermissions, String> {
    let Some(requested) = requested else {
        return Ok(SandboxPermissions::default());
    };

    // Canonicalize each granted path and, when roots are configured, verify
    // containment. Rejections stay generic so out-of-set paths are not
    // echoed back.
    let resolve = |path: &str| -> Result<String, String> {
        let path = std::path::Path::new(path);
        let canonical = if allowed_roots.is_empty() {
            toolgate_core::paths::canonicalized(path)
                .map_err(|_| "a granted path is not accessible".to_string())?
        } else {
            toolgate_core::paths::ensure_contained(path, allowed_roots)
                .map_err(|_| "a granted path is outside the allowed roots".to_string())?
        };
        Ok(canonical.to_string_lossy().into_owned())
    };

    let mut permissions = SandboxPermissions::default();
    if let Some(read_paths) = &requested.read_paths {
        for path in read_paths {
            permissions.read_paths.push(resolve(path)?);
        }
    }
    match &requested.write_paths {
        Some(PathsOrAll::All(all)) => permissions.write_all = *all,
        Some(PathsOrAll::Paths(paths)) => {
            for path in paths {
                permissions.write_paths.push(resolve(path)?);
            }
        }
        None => {}
    }
    match &requested.network_hosts {
        Some(PathsOrAll::All(all)) => permissions.network_all = *all,
        Some(PathsOrAll::Paths(hosts)) => permissions.network_hosts = hosts.clone(),
        None => {}
    }
    Ok(permissions)
}

fn failure_response(started: Instant, kind: &str, message: &str) -> ExecuteResponse {
    ExecuteResponse {
        status: "failed".to_string(),
        stdout: String::new(),
        stderr: String::new(),
        execution_time_ms: started.elapsed().as_millis() as u64,
        tool_call_summary: ToolCallSummary::default(),
        error: Some(WireFailure {
            kind: kind.to_string(),
            message: message.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> GatewayConfig {
        let json = format!(
            r#"{{
                "sandbox": {{ "scriptEngine": {{ "command": "sh" }} }},
                "stateDir": "{}"
            }}"#,
            dir.display()
        );
        GatewayConfig::from_json(&json).unwrap()
    }

    #[tokio::test]
    async fn unknown_language_is_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let server = GatewayServer::from_config(&test_config(dir.path())).unwrap();

        let response = server
            .execute(ExecuteRequest {
                language: "cobol".into(),
                code: "echo hi".into(),
                allowed_tools: Vec::new(),
                timeout_ms: Some(5000),
                client_id: None,
                permissions: None,
            })
            .await;
        assert_eq!(response.status, "failed");
        let error = response.error.unwrap();
        assert_eq!(error.kind, "invalid-request");
        assert!(error.message.contains("cobol"));
    }

    #[tokio::test]
    async fn unavailable_wasm_engine_is_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let server = GatewayServer::from_config(&test_config(dir.path())).unwrap();

        let response = server
            .execute(ExecuteRequest {
                language: "wasm".into(),
                code: "x".into(),
                allowed_tools: Vec::new(),
                timeout_ms: Some(5000),
                client_id: None,
                permissions: None,
            })
            .await;
        assert_eq!(response.error.unwrap().kind, "invalid-request");
    }

    #[tokio::test]
    async fn oversized_code_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = GatewayServer::from_config(&test_config(dir.path())).unwrap();

        let response = server
            .execute(ExecuteRequest {
                language: "script".into(),
                code: "x".repeat(200 * 1024),
                allowed_tools: Vec::new(),
                timeout_ms: Some(5000),
                client_id: None,
                permissions: None,
            })
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, "invalid-request");
        assert!(error.message.contains("byte limit"));
    }

    #[tokio::test]
    async fn out_of_range_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = GatewayServer::from_config(&test_config(dir.path())).unwrap();

        for bad in [999, 600_001] {
            let response = server
                .execute(ExecuteRequest {
                    language: "script".into(),
                    code: "echo hi".into(),
                    allowed_tools: Vec::new(),
                    timeout_ms: Some(bad),
                    client_id: None,
                    permissions: None,
                })
                .await;
            assert_eq!(response.error.unwrap().kind, "invalid-request");
        }
    }

    #[tokio::test]
    async fn draining_server_refuses_intake() {
        let dir = tempfile::tempdir().unwrap();
        let server = GatewayServer::from_config(&test_config(dir.path())).unwrap();
        server.shutdown_handle().begin();

        let response = server
            .execute(ExecuteRequest {
                language: "script".into(),
                code: "echo hi".into(),
                allowed_tools: Vec::new(),
                timeout_ms: Some(5000),
                client_id: None,
                permissions: None,
            })
            .await;
        assert_eq!(response.error.unwrap().kind, "shutdown");
    }

    #[tokio::test]
    async fn permissions_outside_allowed_roots_are_rejected() {
        let state = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "x").unwrap();

        let json = format!(
            r#"{{
                "sandbox": {{
                    "scriptEngine": {{ "command": "sh" }},
                    "allowedRoots": [{root}]
                }},
                "stateDir": {state}
            }}"#,
            root = serde_json::to_string(&root.path().to_string_lossy()).unwrap(),
            state = serde_json::to_string(&state.path().to_string_lossy()).unwrap(),
        );
        let config = GatewayConfig::from_json(&json).unwrap();
        let server = GatewayServer::from_config(&config).unwrap();

        let response = server
            .execute(ExecuteRequest {
                language: "script".into(),
                code: "echo hi".into(),
                allowed_tools: Vec::new(),
                timeout_ms: Some(5000),
                client_id: None,
                permissions: Some(frontend::PermissionsRequest {
                    read_paths: Some(vec![secret.to_string_lossy().into_owned()]),
                    write_paths: None,
                    network_hosts: None,
                }),
            })
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, "invalid-request");
        assert!(
            !error.message.contains(&*outside.path().to_string_lossy()),
            "rejection must not echo the path: {}",
            error.message
        );
    }

    #[test]
    fn state_dir_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, "a file, not a dir").unwrap();

        let mut config = GatewayConfig::default();
        config.state_dir = Some(blocker.join("nested"));
        assert!(GatewayServer::from_config(&config).is_err());
    }
}
