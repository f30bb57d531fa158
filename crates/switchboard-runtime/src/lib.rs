//! Adapters for the external collaborators: the remote execution engine,
//! the title summarizer, a shared ambient runtime and a scripted engine for
//! tests.

pub mod ambient;
pub mod http;
pub mod mock;
pub mod sse;
pub mod summarizer;

pub use ambient::SharedRuntime;
pub use http::HttpEngine;
pub use mock::{ScriptedEngine, ScriptedResponse};
pub use summarizer::HttpSummarizer;
