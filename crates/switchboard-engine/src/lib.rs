//! Per-request orchestration: session resolution, tool and memory scoping,
//! configuration isolation, delegation monitoring and event translation.

pub mod error;
pub mod isolation;
pub mod memory_scope;
pub mod monitor;
pub mod naming;
pub mod orchestrator;
pub mod session;
pub mod toolset;
pub mod translator;

pub use error::{IsolationError, OrchestrationError, StreamParseError};
pub use isolation::{BaselineStore, ConfigurationIsolator, ExecutionLease};
pub use orchestrator::{ChatRequest, Orchestrator, OrchestratorConfig, RunHandle};
