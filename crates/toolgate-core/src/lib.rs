#![warn(missing_docs)]

//! # toolgate-core
//!
//! Brokering primitives for the toolgate orchestration gateway.
//!
//! Everything between the sandbox and the downstream transport lives here:
//! the per-client rate limiter, the strict JSON-Schema argument validator,
//! the TTL + LRU schema cache with single-flight fetches, the per-server
//! circuit breaker registry, the bounded admission queue, tool-name
//! allow-lists, error-message redaction, and bearer-token helpers.
//!
//! Each primitive is an owned object with its own lock discipline; there is
//! no ambient global state.

pub mod allowlist;
pub mod auth;
pub mod breaker;
pub mod cache;
pub mod descriptor;
pub mod paths;
pub mod queue;
pub mod ratelimit;
pub mod redact;
pub mod schema;

pub use allowlist::ToolAllowList;
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState};
pub use cache::{SchemaCache, SchemaCacheConfig, SchemaSource};
pub use descriptor::{ToolDescriptor, ToolName};
pub use queue::{AdmissionOutcome, QueueConfig, WaitQueue};
pub use ratelimit::{RateDecision, RateLimiter, RateLimiterConfig};
pub use schema::SchemaValidator;

use toolgate_error::GatewayError;

/// Trait for routing tool calls to downstream servers.
///
/// Implemented by the downstream pool. Sandbox code never sees connection
/// handles, credentials, or transport state; it calls through the
/// dispatcher, which routes here.
#[async_trait::async_trait]
pub trait ToolBroker: Send + Sync {
    /// Call a tool on a downstream server.
    ///
    /// - `server`: the downstream server name (e.g. "files")
    /// - `tool`: the bare tool identifier (e.g. "search")
    /// - `args`: the tool arguments as a JSON value
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError>;

    /// List the tools exposed by one downstream server.
    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, GatewayError>;

    /// The configured server names, sorted.
    fn server_names(&self) -> Vec<String>;
}
