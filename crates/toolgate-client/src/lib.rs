#![warn(missing_docs)]

//! # toolgate-client
//!
//! Downstream connections for the toolgate orchestration gateway.
//!
//! Provides the two transports (line-delimited subprocess, streaming HTTP)
//! that speak the gateway's downstream protocol, and [`DownstreamPool`],
//! which owns one connection per configured server and routes tool calls to
//! the right one under the admission and circuit-breaker discipline.

pub mod connection;
pub mod gate;
pub mod pool;
pub mod protocol;
pub mod transport;

pub use gate::{AdmissionGate, AdmissionPermit};
pub use pool::{DownstreamPool, HealthState, PoolConfig, ServerSpec};
pub use transport::{Transport, TransportConfig};
