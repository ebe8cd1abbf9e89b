#![warn(missing_docs)]

//! # toolgate-error
//!
//! Typed error taxonomy for the toolgate orchestration gateway.
//!
//! Provides [`GatewayError`] — the canonical error type returned by every
//! stage of the tool-call pipeline (rate limiter, allow-list, circuit
//! breaker, schema cache, validator, downstream pool) and by the sandbox
//! supervisor. Errors are classified by kind, not by transport.

use thiserror::Error;

/// Canonical error type for toolgate operations.
///
/// All variants are `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// Tool arguments did not match the tool's input schema.
    #[error("validation failed at '{path}': expected {constraint}")]
    ValidationFailed {
        /// JSON-Pointer path to the offending fragment.
        path: String,
        /// The violated constraint (e.g. "integer", "required property 'x'").
        constraint: String,
        /// Human-readable validator message.
        message: String,
    },

    /// The tool name did not match the execution's allow-list.
    #[error("tool not permitted: '{tool}'")]
    ToolNotPermitted {
        /// The fully-qualified tool name that was rejected.
        tool: String,
    },

    /// No schema could be obtained for the tool, not even stale.
    #[error("schema unavailable for tool '{tool}': {message}")]
    SchemaUnavailable {
        /// The fully-qualified tool name.
        tool: String,
        /// Why the fetch failed.
        message: String,
    },

    /// The per-client rate limit was exceeded.
    #[error("rate limit exceeded, resets in {reset_in_ms}ms")]
    RateLimited {
        /// Milliseconds until at least one token is available again.
        reset_in_ms: u64,
    },

    /// The admission queue is full; the call was rejected immediately.
    #[error("admission queue full ({max_size} waiting)")]
    QueueFull {
        /// The configured queue capacity.
        max_size: usize,
    },

    /// The call waited in the admission queue past its deadline.
    #[error("timed out after {waited_ms}ms waiting for admission")]
    QueueTimeout {
        /// How long the call waited before expiring.
        waited_ms: u64,
    },

    /// The circuit breaker for the target server is open.
    #[error("circuit breaker open for server '{server}', recovery in {retry_in_ms}ms")]
    CircuitOpen {
        /// The quarantined server.
        server: String,
        /// Milliseconds until the next half-open probe is allowed.
        retry_in_ms: u64,
    },

    /// The requested server does not exist in the pool.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// The requested tool does not exist on the resolved server.
    #[error("tool not found: '{tool}' on server '{server}'")]
    ToolNotFound {
        /// The server that was queried.
        server: String,
        /// The bare tool name that was not found.
        tool: String,
    },

    /// A downstream server returned an error or its transport broke.
    #[error("downstream failure from '{server}': {message}")]
    Downstream {
        /// The server that failed.
        server: String,
        /// Sanitized error message from the downstream server.
        message: String,
    },

    /// The sandbox exceeded its wall-clock deadline.
    #[error("sandbox timed out after {timeout_ms}ms")]
    SandboxTimeout {
        /// The execution's wall-clock budget in milliseconds.
        timeout_ms: u64,
    },

    /// The sandbox exited non-zero without a structured error.
    #[error("sandbox crashed with exit code {exit_code}")]
    SandboxCrash {
        /// The sandbox process exit code.
        exit_code: i32,
    },

    /// Bridge bearer token mismatch.
    #[error("authentication failed")]
    AuthFailure,

    /// The operation was aborted because the server is draining.
    #[error("server is shutting down")]
    Shutdown,

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Returns the stable kind string for programmatic matching and audit.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation-failed",
            Self::ToolNotPermitted { .. } => "tool-not-permitted",
            Self::SchemaUnavailable { .. } => "schema-unavailable",
            Self::RateLimited { .. } => "rate-limited",
            Self::QueueFull { .. } => "queue-full",
            Self::QueueTimeout { .. } => "queue-timeout",
            Self::CircuitOpen { .. } => "circuit-open",
            Self::ServerNotFound(_) => "server-not-found",
            Self::ToolNotFound { .. } => "tool-not-found",
            Self::Downstream { .. } => "downstream-failure",
            Self::SandboxTimeout { .. } => "sandbox-timeout",
            Self::SandboxCrash { .. } => "sandbox-crash",
            Self::AuthFailure => "auth-failure",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal-error",
        }
    }

    /// Returns whether the operation that produced this error may succeed if
    /// retried by the caller.
    pub fn retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::QueueFull { .. }
            | Self::QueueTimeout { .. }
            | Self::CircuitOpen { .. }
            | Self::SchemaUnavailable { .. }
            | Self::Downstream { .. } => true,
            Self::ValidationFailed { .. }
            | Self::ToolNotPermitted { .. }
            | Self::ServerNotFound(_)
            | Self::ToolNotFound { .. }
            | Self::SandboxTimeout { .. }
            | Self::SandboxCrash { .. }
            | Self::AuthFailure
            | Self::Shutdown
            | Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error for the sandbox program.
    ///
    /// Returns an object with `error`, `code`, `message`, `retryable`, kind-
    /// specific fields (`path`/`constraint` for validation failures,
    /// `resetInMs` for rate limits), and optionally `suggested_fix`.
    ///
    /// # Arguments
    /// * `known_tools` - Fully-qualified tool names (`server.tool`) the
    ///   caller may see, as reported by discovery. When provided, name-miss
    ///   errors (`ToolNotFound`/`ServerNotFound`) get a near-miss
    ///   suggestion.
    pub fn to_structured_error(&self, known_tools: Option<&[String]>) -> serde_json::Value {
        let suggested_fix = match self {
            Self::ToolNotFound { server, tool } => {
                known_tools.and_then(|known| suggest_tool(server, tool, known))
            }
            Self::ServerNotFound(name) => {
                known_tools.and_then(|known| suggest_server(name, known))
            }
            Self::CircuitOpen { .. } => Some("Retry after a delay".to_string()),
            Self::RateLimited { .. } => Some("Reduce request frequency".to_string()),
            Self::QueueFull { .. } | Self::QueueTimeout { .. } => {
                Some("Retry when the gateway is less busy".to_string())
            }
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        match self {
            Self::ValidationFailed {
                path, constraint, ..
            } => {
                obj["path"] = serde_json::Value::String(path.clone());
                obj["constraint"] = serde_json::Value::String(constraint.clone());
            }
            Self::RateLimited { reset_in_ms } => {
                obj["resetInMs"] = serde_json::json!(reset_in_ms);
            }
            Self::CircuitOpen { retry_in_ms, .. } => {
                obj["retryInMs"] = serde_json::json!(retry_in_ms);
            }
            _ => {}
        }

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Suggest the closest known qualified name for a mistyped tool.
fn suggest_tool(server: &str, tool: &str, known: &[String]) -> Option<String> {
    let wanted = format!("{server}.{tool}");
    nearest(&wanted, known.iter().map(String::as_str))
        .map(|name| format!("did you mean '{name}'?"))
}

/// Suggest a server, matching against the server segment of every known
/// qualified name.
fn suggest_server(server: &str, known: &[String]) -> Option<String> {
    let mut servers: Vec<&str> = known
        .iter()
        .filter_map(|name| name.split('.').next())
        .collect();
    servers.sort_unstable();
    servers.dedup();
    nearest(server, servers.into_iter()).map(|name| format!("did you mean server '{name}'?"))
}

/// Pick the candidate with the smallest Levenshtein distance to `target`,
/// within [`edit_budget`]. Ties go to the earliest candidate.
fn nearest<'a>(target: &str, candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let budget = edit_budget(target);
    candidates
        .map(|candidate| (strsim::levenshtein(target, candidate), candidate))
        .filter(|(distance, _)| *distance <= budget)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate)
}

/// Edit-distance budget scaled to the name length, so short names only
/// match near-identical candidates.
fn edit_budget(target: &str) -> usize {
    (target.len() / 4).clamp(1, 4)
}

// Compile-time assertion: GatewayError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<GatewayError>();
};
