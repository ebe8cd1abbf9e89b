//! The request dispatcher.
//!
//! Every tool call originating in a sandbox runs the same pipeline: audit
//! the attempt, consume a rate-limit token, check the execution's
//! allow-list, resolve the target server and fail fast on an open circuit,
//! obtain the schema, validate the arguments, then hand the call to the
//! downstream pool and audit the outcome.
//!
//! Duplicate calls (same `(executionId, requestId)`) are dispatched once;
//! later arrivals attach to the first outcome, shielding downstream servers
//! from sandbox-side retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use toolgate_audit::{sha256_hex, AuditEvent, AuditKind, AuditLog, AuditOutcome};
use toolgate_bridge::BridgeToolCall;
use toolgate_core::breaker::BreakerRegistry;
use toolgate_core::cache::SchemaCache;
use toolgate_core::descriptor::{ToolDescriptor, ToolName};
use toolgate_core::ratelimit::RateLimiter;
use toolgate_core::redact;
use toolgate_core::schema::{SchemaValidator, ValidateError};
use toolgate_core::{ToolAllowList, ToolBroker};
use toolgate_error::GatewayError;

use crate::metrics::GatewayMetrics;

/// Per-execution dispatch context.
pub struct ExecutionContext {
    /// The execution's correlation id.
    pub execution_id: String,
    /// Rate-limit bucket key for this caller.
    pub client_id: String,
    /// Compiled allow-list from the execute-request.
    pub allowlist: ToolAllowList,
    /// The execution's wall-clock deadline; tool calls never outlive it.
    pub deadline: Instant,
    /// The gateway-wide tool-name prefix, when configured.
    pub tool_prefix: Option<String>,
}

/// A clone-friendly snapshot of a call outcome, kept for duplicate
/// suppression.
#[derive(Debug, Clone)]
struct StoredError {
    code: String,
    message: String,
}

type StoredOutcome = Result<Value, StoredError>;

/// The tool-call pipeline.
pub struct Dispatcher {
    broker: Arc<dyn ToolBroker>,
    schemas: Arc<SchemaCache>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    validator: SchemaValidator,
    audit: Option<Arc<AuditLog>>,
    metrics: Option<Arc<GatewayMetrics>>,
    pending: Mutex<HashMap<(String, String), watch::Receiver<Option<StoredOutcome>>>>,
}

impl Dispatcher {
    /// Assemble the pipeline.
    pub fn new(
        broker: Arc<dyn ToolBroker>,
        schemas: Arc<SchemaCache>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        audit: Option<Arc<AuditLog>>,
        metrics: Option<Arc<GatewayMetrics>>,
    ) -> Self {
        Self {
            broker,
            schemas,
            limiter,
            breakers,
            validator: SchemaValidator,
            audit,
            metrics,
            pending: Mutex::new(HashMap::new()),
        }
    }

    async fn record(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record(&event).await {
                // The user-visible operation must not fail on audit failure,
                // but the failure itself must be visible.
                tracing::error!(error = %e, "audit append failed");
            }
        }
    }

    fn count(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_tool_call(outcome);
        }
    }

    /// Dispatch one tool call, deduplicating by `(executionId, requestId)`.
    pub async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        call: BridgeToolCall,
    ) -> Result<Value, GatewayError> {
        let key = (ctx.execution_id.clone(), call.request_id.clone());

        enum Role {
            Leader(watch::Sender<Option<StoredOutcome>>),
            Follower(watch::Receiver<Option<StoredOutcome>>),
        }

        let role = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    pending.insert(key, rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                tracing::debug!(
                    execution_id = %ctx.execution_id,
                    request_id = %call.request_id,
                    "duplicate tool call attached to in-flight outcome"
                );
                loop {
                    let snapshot = rx.borrow().clone();
                    if let Some(outcome) = snapshot {
                        return match outcome {
                            Ok(value) => Ok(value),
                            Err(stored) => Err(rehydrate(stored)),
                        };
                    }
                    if rx.changed().await.is_err() {
                        return Err(GatewayError::Internal(anyhow::anyhow!(
                            "duplicate leader vanished without an outcome"
                        )));
                    }
                }
            }
            Role::Leader(tx) => {
                let result = self.dispatch_inner(ctx, &call).await;
                let stored = match &result {
                    Ok(value) => Ok(value.clone()),
                    Err(e) => Err(StoredError {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    }),
                };
                let _ = tx.send(Some(stored));
                result
            }
        }
    }

    async fn dispatch_inner(
        &self,
        ctx: &ExecutionContext,
        call: &BridgeToolCall,
    ) -> Result<Value, GatewayError> {
        let started = Instant::now();
        let args_hash = sha256_hex(&call.args.to_string());

        self.record(
            AuditEvent::new(AuditKind::ToolCall, AuditOutcome::Pending, &ctx.execution_id)
                .with_tool(&call.tool_name)
                .with_metadata("argsSha256", serde_json::json!(args_hash)),
        )
        .await;

        // Rate limit.
        let decision = self.limiter.check(&ctx.client_id).await;
        if !decision.allowed {
            self.record(
                AuditEvent::new(
                    AuditKind::RateLimited,
                    AuditOutcome::Rejected,
                    &ctx.execution_id,
                )
                .with_tool(&call.tool_name)
                .with_metadata("resetInMs", serde_json::json!(decision.reset_in_ms)),
            )
            .await;
            self.count("rate-limited");
            return Err(GatewayError::RateLimited {
                reset_in_ms: decision.reset_in_ms,
            });
        }

        // Allow-list.
        if !ctx.allowlist.allows(&call.tool_name) {
            self.record(
                AuditEvent::new(
                    AuditKind::ToolCall,
                    AuditOutcome::Rejected,
                    &ctx.execution_id,
                )
                .with_tool(&call.tool_name)
                .with_error("tool not permitted by execution allow-list"),
            )
            .await;
            self.count("tool-not-permitted");
            return Err(GatewayError::ToolNotPermitted {
                tool: call.tool_name.clone(),
            });
        }

        // Resolve the target server.
        let name = ToolName::parse(&call.tool_name, ctx.tool_prefix.as_deref())?;
        if !self.broker.server_names().contains(&name.server) {
            self.record(
                AuditEvent::new(
                    AuditKind::ToolCall,
                    AuditOutcome::Failure,
                    &ctx.execution_id,
                )
                .with_tool(&call.tool_name)
                .with_error("unknown downstream server"),
            )
            .await;
            self.count("server-not-found");
            return Err(GatewayError::ServerNotFound(name.server));
        }

        // Fail fast on a quarantined server before any schema work.
        if let Err(e) = self.breakers.check(&name.server) {
            self.record(
                AuditEvent::new(
                    AuditKind::CircuitOpen,
                    AuditOutcome::Rejected,
                    &ctx.execution_id,
                )
                .with_tool(&call.tool_name),
            )
            .await;
            self.count("circuit-open");
            return Err(e);
        }

        // Schema, fail closed.
        let descriptor = match self.schemas.get_tool_schema(&name).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.record(
                    AuditEvent::new(
                        AuditKind::ToolCall,
                        AuditOutcome::Failure,
                        &ctx.execution_id,
                    )
                    .with_tool(&call.tool_name)
                    .with_error(redact::filter_text(&e.to_string())),
                )
                .await;
                self.count(e.code());
                return Err(e);
            }
        };

        // Strict argument validation.
        match self
            .validator
            .validate(&call.tool_name, &call.args, &descriptor.input_schema)
        {
            Ok(()) => {}
            Err(ValidateError::InvalidSchema(message)) => {
                self.record(
                    AuditEvent::new(
                        AuditKind::ToolCall,
                        AuditOutcome::Failure,
                        &ctx.execution_id,
                    )
                    .with_tool(&call.tool_name)
                    .with_error("tool schema did not compile"),
                )
                .await;
                self.count("schema-unavailable");
                return Err(GatewayError::SchemaUnavailable {
                    tool: call.tool_name.clone(),
                    message,
                });
            }
            Err(ValidateError::Failed(failures)) => {
                let first = failures.into_iter().next().expect("at least one failure");
                self.record(
                    AuditEvent::new(
                        AuditKind::ValidationFailed,
                        AuditOutcome::Failure,
                        &ctx.execution_id,
                    )
                    .with_tool(&call.tool_name)
                    .with_error(format!(
                        "validation failed at '{}': expected {}",
                        first.path, first.constraint
                    )),
                )
                .await;
                self.count("validation-failed");
                return Err(GatewayError::ValidationFailed {
                    path: first.path,
                    constraint: first.constraint,
                    message: first.message,
                });
            }
        }

        // Downstream call, bounded by the execution's remaining wall clock.
        let remaining = ctx.deadline.saturating_duration_since(Instant::now());
        let call_fut = self
            .broker
            .call_tool(&name.server, &name.tool, call.args.clone());
        let result = match tokio::time::timeout(remaining, call_fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(GatewayError::SandboxTimeout {
                timeout_ms: remaining.as_millis() as u64,
            }),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                self.record(
                    AuditEvent::new(
                        AuditKind::ToolCall,
                        AuditOutcome::Success,
                        &ctx.execution_id,
                    )
                    .with_tool(&call.tool_name)
                    .with_args_hash(&call.args)
                    .with_latency_ms(latency_ms),
                )
                .await;
                self.count("success");
            }
            Err(e) => {
                // Admission rejections keep their own event kinds; everything
                // else is a failed tool call.
                let (kind, outcome) = match e {
                    GatewayError::QueueFull { .. } => {
                        (AuditKind::QueueFull, AuditOutcome::Rejected)
                    }
                    GatewayError::CircuitOpen { .. } => {
                        (AuditKind::CircuitOpen, AuditOutcome::Rejected)
                    }
                    _ => (AuditKind::ToolCall, AuditOutcome::Failure),
                };
                self.record(
                    AuditEvent::new(kind, outcome, &ctx.execution_id)
                        .with_tool(&call.tool_name)
                        .with_args_hash(&call.args)
                        .with_latency_ms(latency_ms)
                        .with_error(redact::filter_text(&e.to_string())),
                )
                .await;
                self.count(e.code());
            }
        }

        result
    }

    /// List the tools this execution may see: all known descriptors,
    /// filtered through the allow-list.
    pub async fn list_tools(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let mut visible = Vec::new();
        let mut failed_servers = 0u64;
        for server in self.broker.server_names() {
            match self.broker.list_tools(&server).await {
                Ok(tools) => {
                    visible.extend(tools.into_iter().filter(|t| ctx.allowlist.allows(&t.name)));
                }
                Err(e) => {
                    failed_servers += 1;
                    tracing::warn!(server = %server, error = %e, "list-tools failed for server");
                }
            }
        }
        self.record(
            AuditEvent::new(
                AuditKind::Discovery,
                if failed_servers == 0 {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Failure
                },
                &ctx.execution_id,
            )
            .with_metadata("visibleTools", serde_json::json!(visible.len()))
            .with_metadata("failedServers", serde_json::json!(failed_servers)),
        )
        .await;
        Ok(visible)
    }

    /// Drop duplicate-suppression state for a finished execution.
    pub async fn forget_execution(&self, execution_id: &str) {
        let mut pending = self.pending.lock().await;
        pending.retain(|(exec, _), _| exec != execution_id);
    }
}

/// Rebuild a typed error from a stored duplicate outcome. Field detail is
/// best-effort; code and message survive.
fn rehydrate(stored: StoredError) -> GatewayError {
    match stored.code.as_str() {
        "rate-limited" => GatewayError::RateLimited { reset_in_ms: 0 },
        "queue-full" => GatewayError::QueueFull { max_size: 0 },
        "queue-timeout" => GatewayError::QueueTimeout { waited_ms: 0 },
        "shutdown" => GatewayError::Shutdown,
        "auth-failure" => GatewayError::AuthFailure,
        _ => GatewayError::Internal(anyhow::anyhow!("{}", stored.message)),
    }
}
