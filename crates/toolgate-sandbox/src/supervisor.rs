//! The sandbox supervisor.
//!
//! One supervisor run = one Execution: generate the session token, bind the
//! bridge, launch the engine with the program on stdin, capture its output
//! within bounds, enforce the wall clock, and tear everything down. The
//! supervisor never re-executes a sandbox; retry belongs to the client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use toolgate_audit::AuditLog;
use toolgate_bridge::{BridgeHandler, BridgeSession, ToolBridge, ToolCallSummary};
use toolgate_error::GatewayError;

use crate::capture::{capture_stream, Captured};
use crate::engine::{EngineSet, Language};

/// Environment variables handed to the sandbox engine.
pub const BRIDGE_URL_ENV: &str = "TOOLGATE_BRIDGE_URL";
/// Bearer token for the execution's bridge session.
pub const BRIDGE_TOKEN_ENV: &str = "TOOLGATE_BRIDGE_TOKEN";
/// Comma-joined allow-list patterns.
pub const ALLOWED_TOOLS_ENV: &str = "TOOLGATE_ALLOWED_TOOLS";
/// The execution wall clock, in milliseconds.
pub const EXECUTION_TIMEOUT_ENV: &str = "TOOLGATE_EXECUTION_TIMEOUT_MS";
/// Comma-joined readable paths.
pub const READ_PATHS_ENV: &str = "TOOLGATE_READ_PATHS";
/// Comma-joined writable paths, or `*`.
pub const WRITE_PATHS_ENV: &str = "TOOLGATE_WRITE_PATHS";
/// Comma-joined reachable hosts, or `*`.
pub const NETWORK_HOSTS_ENV: &str = "TOOLGATE_NETWORK_HOSTS";

/// Filesystem and network grants forwarded to the engine.
///
/// The engines enforce these; the gateway validates the paths and passes
/// them through the environment. Everything not granted here is denied by
/// the runtime-minimum policy.
#[derive(Debug, Clone, Default)]
pub struct SandboxPermissions {
    /// Readable paths.
    pub read_paths: Vec<String>,
    /// Writable paths; ignored when `write_all` is set.
    pub write_paths: Vec<String>,
    /// Grant unrestricted writes.
    pub write_all: bool,
    /// Reachable network hosts (the bridge host is always reachable);
    /// ignored when `network_all` is set.
    pub network_hosts: Vec<String>,
    /// Grant unrestricted network access.
    pub network_all: bool,
}

impl SandboxPermissions {
    fn write_env(&self) -> String {
        if self.write_all {
            "*".to_string()
        } else {
            self.write_paths.join(",")
        }
    }

    fn network_env(&self) -> String {
        if self.network_all {
            "*".to_string()
        } else {
            self.network_hosts.join(",")
        }
    }
}

/// One sandbox run request.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Correlation id shared with audit events and the bridge session.
    pub correlation_id: String,
    /// Which engine runs the program.
    pub language: Language,
    /// The user-supplied program text.
    pub code: String,
    /// Allow-list patterns, passed through to the engine environment.
    pub allowed_tools: Vec<String>,
    /// Wall-clock budget.
    pub timeout: Duration,
    /// Filesystem/network grants for the engine.
    pub permissions: SandboxPermissions,
}

/// Terminal status of an Execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Clean exit with code 0.
    Succeeded,
    /// Non-zero exit.
    Failed,
    /// Killed at the wall clock.
    TimedOut,
    /// Killed by server shutdown.
    Cancelled,
}

impl ExecutionStatus {
    /// The wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A structured execution-level error.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    /// Error kind (`sandbox-timeout`, `sandbox-crash`, `shutdown`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// The outcome of one sandbox run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Captured stdout (possibly truncated).
    pub stdout: String,
    /// Captured stderr (possibly truncated).
    pub stderr: String,
    /// Wall time from spawn to teardown.
    pub execution_time_ms: u64,
    /// Tool calls the sandbox made through the bridge.
    pub tool_call_summary: ToolCallSummary,
    /// Set for every non-succeeded status.
    pub error: Option<ExecutionFailure>,
}

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Per-stream capture cap in bytes.
    pub capture_cap: usize,
    /// Grace between the shutdown signal and the kill.
    pub grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            capture_cap: 4 * 1024 * 1024,
            grace: Duration::from_secs(2),
        }
    }
}

/// Launches and babysits one sandbox process per Execution.
pub struct Supervisor {
    engines: EngineSet,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Create a supervisor over the configured engines.
    pub fn new(engines: EngineSet, config: SupervisorConfig) -> Self {
        Self { engines, config }
    }

    /// The configured engines.
    pub fn engines(&self) -> &EngineSet {
        &self.engines
    }

    /// Run one Execution to completion.
    ///
    /// `handler` is the dispatcher seam served by the execution's bridge;
    /// `cancel` is the server-wide drain signal (flips to `true` on
    /// shutdown).
    pub async fn run(
        &self,
        request: ExecutionRequest,
        handler: Arc<dyn BridgeHandler>,
        audit: Option<Arc<AuditLog>>,
        mut cancel: tokio::sync::watch::Receiver<bool>,
    ) -> Result<ExecutionResult, GatewayError> {
        let engine = self.engines.resolve(request.language)?.clone();

        let session = Arc::new(BridgeSession::new(request.correlation_id.clone()));
        let token = session.token().to_string();
        let bridge = ToolBridge::start(session.clone(), handler, audit).await?;
        let bridge_url = bridge.url();

        tracing::info!(
            correlation_id = %request.correlation_id,
            language = request.language.as_str(),
            timeout_ms = request.timeout.as_millis() as u64,
            "starting sandbox execution"
        );

        let started = Instant::now();
        let spawn_result = tokio::process::Command::new(&engine.command)
            .args(&engine.args)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env(BRIDGE_URL_ENV, &bridge_url)
            .env(BRIDGE_TOKEN_ENV, &token)
            .env(ALLOWED_TOOLS_ENV, request.allowed_tools.join(","))
            .env(
                EXECUTION_TIMEOUT_ENV,
                request.timeout.as_millis().to_string(),
            )
            .env(READ_PATHS_ENV, request.permissions.read_paths.join(","))
            .env(WRITE_PATHS_ENV, request.permissions.write_env())
            .env(NETWORK_HOSTS_ENV, request.permissions.network_env())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                bridge.shutdown();
                return Err(GatewayError::Internal(anyhow::anyhow!(
                    "failed to spawn sandbox engine '{}': {e}",
                    engine.command
                )));
            }
        };

        // Feed the program and close stdin so the engine sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.code.as_bytes()).await {
                tracing::warn!(error = %e, "failed to write program to sandbox stdin");
            }
            let _ = stdin.shutdown().await;
        }

        let cap = self.config.capture_cap;
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(async move { capture_stream(out, cap).await }));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(async move { capture_stream(err, cap).await }));

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        enum WaitOutcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            DeadlineHit,
            Cancelled,
        }

        let outcome = tokio::select! {
            exit = child.wait() => WaitOutcome::Exited(exit),
            _ = &mut deadline => WaitOutcome::DeadlineHit,
            // A dropped sender means no coordinator; treat as "never
            // cancelled" rather than an immediate drain.
            _ = async {
                if cancel.changed().await.is_err() {
                    std::future::pending::<()>().await
                }
            } => WaitOutcome::Cancelled,
        };

        let (status, error) = match outcome {
            WaitOutcome::Exited(Ok(status)) if status.success() => {
                (ExecutionStatus::Succeeded, None)
            }
            WaitOutcome::Exited(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                (
                    ExecutionStatus::Failed,
                    Some(ExecutionFailure {
                        kind: "sandbox-crash".into(),
                        message: GatewayError::SandboxCrash { exit_code }.to_string(),
                    }),
                )
            }
            WaitOutcome::Exited(Err(e)) => (
                ExecutionStatus::Failed,
                Some(ExecutionFailure {
                    kind: "sandbox-crash".into(),
                    message: format!("failed to reap sandbox: {e}"),
                }),
            ),
            WaitOutcome::DeadlineHit => {
                let _ = child.kill().await;
                let timeout_ms = request.timeout.as_millis() as u64;
                (
                    ExecutionStatus::TimedOut,
                    Some(ExecutionFailure {
                        kind: "sandbox-timeout".into(),
                        message: GatewayError::SandboxTimeout { timeout_ms }.to_string(),
                    }),
                )
            }
            WaitOutcome::Cancelled => {
                // Deny further tool calls, give the sandbox a grace period,
                // then kill.
                session.end();
                let graceful = tokio::time::timeout(self.config.grace, child.wait()).await;
                if graceful.is_err() {
                    let _ = child.kill().await;
                }
                (
                    ExecutionStatus::Cancelled,
                    Some(ExecutionFailure {
                        kind: "shutdown".into(),
                        message: GatewayError::Shutdown.to_string(),
                    }),
                )
            }
        };

        let stdout = join_capture(stdout_task).await;
        let stderr = join_capture(stderr_task).await;
        let tool_call_summary = bridge.shutdown();
        let execution_time_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            correlation_id = %request.correlation_id,
            status = status.as_str(),
            execution_time_ms,
            tool_calls = tool_call_summary.total,
            "sandbox execution finished"
        );

        Ok(ExecutionResult {
            status,
            stdout: stdout.text,
            stderr: stderr.text,
            execution_time_ms,
            tool_call_summary,
            error,
        })
    }
}

async fn join_capture(task: Option<tokio::task::JoinHandle<Captured>>) -> Captured {
    match task {
        Some(task) => match task.await {
            Ok(captured) => captured,
            Err(_) => Captured {
                text: String::new(),
                truncated: false,
            },
        },
        None => Captured {
            text: String::new(),
            truncated: false,
        },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::capture::TRUNCATION_MARKER;
    use crate::engine::Engine;
    use serde_json::Value;
    use toolgate_core::descriptor::ToolDescriptor;

    struct NoToolsHandler;

    #[async_trait::async_trait]
    impl BridgeHandler for NoToolsHandler {
        async fn tool_call(
            &self,
            _call: toolgate_bridge::BridgeToolCall,
        ) -> Result<Value, GatewayError> {
            Ok(serde_json::json!({"ok": true}))
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
            Ok(Vec::new())
        }
    }

    /// `sh` with no args executes the program it reads on stdin, a handy
    /// stand-in for a script engine in tests.
    fn sh_supervisor() -> Supervisor {
        sh_supervisor_with(SupervisorConfig::default())
    }

    fn sh_supervisor_with(config: SupervisorConfig) -> Supervisor {
        let engines = EngineSet::new(
            Some(Engine {
                command: "sh".into(),
                args: Vec::new(),
            }),
            None,
            false,
        );
        Supervisor::new(engines, config)
    }

    fn request(code: &str, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest {
            correlation_id: "corr-test".into(),
            language: Language::Script,
            code: code.into(),
            allowed_tools: vec!["srv-1.*".into()],
            timeout,
            permissions: SandboxPermissions::default(),
        }
    }

    fn no_cancel() -> tokio::sync::watch::Receiver<bool> {
        let (tx, rx) = tokio::sync::watch::channel(false);
        // Keep the sender alive for the test's duration.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn clean_exit_succeeds_with_captured_stdout() {
        let supervisor = sh_supervisor();
        let result = supervisor
            .run(
                request("echo 42", Duration::from_secs(5)),
                Arc::new(NoToolsHandler),
                None,
                no_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.stdout, "42\n");
        assert_eq!(result.stderr, "");
        assert!(result.error.is_none());
        assert_eq!(result.tool_call_summary.total, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_sandbox_crash() {
        let supervisor = sh_supervisor();
        let result = supervisor
            .run(
                request("echo oops >&2; exit 3", Duration::from_secs(5)),
                Arc::new(NoToolsHandler),
                None,
                no_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.stderr, "oops\n");
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, "sandbox-crash");
        assert!(failure.message.contains('3'), "msg: {}", failure.message);
    }

    #[tokio::test]
    async fn wall_clock_kill_marks_timed_out() {
        let supervisor = sh_supervisor();
        let started = Instant::now();
        let result = supervisor
            .run(
                request("sleep 30", Duration::from_millis(200)),
                Arc::new(NoToolsHandler),
                None,
                no_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.execution_time_ms >= 200);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "kill must be prompt"
        );
        assert_eq!(result.error.unwrap().kind, "sandbox-timeout");
        assert_eq!(result.tool_call_summary.total, 0);
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_but_execution_succeeds() {
        let supervisor = sh_supervisor_with(SupervisorConfig {
            capture_cap: 1000,
            grace: Duration::from_secs(2),
        });
        let result = supervisor
            .run(
                // ~100 KB of output against a 1 KB cap.
                request(
                    "i=0; while [ $i -lt 2000 ]; do echo xxxxxxxxxxxxxxxxxxxxxxxxx; i=$((i+1)); done",
                    Duration::from_secs(10),
                ),
                Arc::new(NoToolsHandler),
                None,
                no_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
        assert!(result.stdout.len() <= 1000 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn engine_env_carries_bridge_credentials() {
        let supervisor = sh_supervisor();
        let result = supervisor
            .run(
                request(
                    r#"printf '%s' "$TOOLGATE_BRIDGE_TOKEN" | wc -c; printf '%s' "$TOOLGATE_ALLOWED_TOOLS""#,
                    Duration::from_secs(5),
                ),
                Arc::new(NoToolsHandler),
                None,
                no_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Succeeded);
        // 64 hex chars of token, then the allow-list.
        assert!(result.stdout.contains("64"), "stdout: {}", result.stdout);
        assert!(result.stdout.contains("srv-1.*"), "stdout: {}", result.stdout);
    }

    #[tokio::test]
    async fn engine_env_is_scrubbed() {
        std::env::set_var("TOOLGATE_TEST_LEAK", "should-not-appear");
        let supervisor = sh_supervisor();
        let result = supervisor
            .run(
                request(
                    r#"printf '%s' "${TOOLGATE_TEST_LEAK:-clean}""#,
                    Duration::from_secs(5),
                ),
                Arc::new(NoToolsHandler),
                None,
                no_cancel(),
            )
            .await
            .unwrap();
        std::env::remove_var("TOOLGATE_TEST_LEAK");

        assert_eq!(result.stdout, "clean", "parent env must not leak");
    }

    #[tokio::test]
    async fn shutdown_cancel_kills_sandbox() {
        let supervisor = sh_supervisor_with(SupervisorConfig {
            capture_cap: 1024,
            grace: Duration::from_millis(100),
        });
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let run = tokio::spawn({
            let handler: Arc<dyn BridgeHandler> = Arc::new(NoToolsHandler);
            async move {
                supervisor
                    .run(
                        request("sleep 30", Duration::from_secs(30)),
                        handler,
                        None,
                        cancel_rx,
                    )
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancel must terminate the run promptly")
            .unwrap()
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.error.unwrap().kind, "shutdown");
    }

    #[tokio::test]
    async fn unconfigured_engine_fails_before_spawn() {
        let supervisor = Supervisor::new(EngineSet::default(), SupervisorConfig::default());
        let err = supervisor
            .run(
                request("echo hi", Duration::from_secs(1)),
                Arc::new(NoToolsHandler),
                None,
                no_cancel(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
