//! Shared types for the orchestration layer: identifiers, modes, tool
//! descriptors, runtime configuration, event shapes and the traits that
//! describe the external collaborators (execution engine, summarizer).

pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod ids;
pub mod memory;
pub mod mode;
pub mod session;
pub mod summarizer;
pub mod tools;
pub mod usage;

pub use mode::Mode;
