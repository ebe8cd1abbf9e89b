#![warn(missing_docs)]

//! # toolgate-sandbox
//!
//! Sandbox process supervision for the toolgate gateway.
//!
//! Executions run user programs in one of two external prebuilt engines (a
//! script VM and a WebAssembly VM). The supervisor owns the whole lifecycle:
//! session token, bridge listener, engine process, bounded output capture,
//! wall-clock enforcement, and teardown. The engines themselves are opaque;
//! the only contract is that they read the program from stdin, honor the
//! `TOOLGATE_*` environment, and reach tools exclusively through the bridge.

pub mod capture;
pub mod engine;
pub mod supervisor;

pub use capture::{capture_stream, Captured, TRUNCATION_MARKER};
pub use engine::{Engine, EngineSet, Language, WASM_READY_ENV};
pub use supervisor::{
    ExecutionFailure, ExecutionRequest, ExecutionResult, ExecutionStatus, SandboxPermissions,
    Supervisor, SupervisorConfig,
};
