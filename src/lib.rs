//! # Proofread Pipeline
//!
//! Role pipelines for Chinese text proofreading.
//!
//! A request names a pipeline of roles (`basic`, `rules`, `reviewer`, ...).
//! The [`PipelineExecutor`] runs them in order over the same immutable
//! text and yields a stream of stage events; the server turns that stream
//! into SSE frames or a single JSON body, and [`CheckClient`] consumes it
//! with retries.
//!
//! ## Core Concepts
//!
//! - **[`Role`](role::Role)**: one pipeline stage. Runs once per requested
//!   run and either resolves to a result or streams chunks then a final.
//! - **[`RoleRegistry`]**: roles by id, filled at startup by
//!   [`register_builtin_roles`].
//! - **[`PipelineExecutor`]**: sequencing, per-stage failure isolation and
//!   cancellation.
//! - **[`merge()`]**: dedup and overlap resolution into a conflict-free set.
//! - **[`apply_error_items`]**: display patch of the original text.
//! - **[`CheckClient`]**: retrying, idle-aware consumer of `/api/check`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use proofread_pipeline::{
//!     register_builtin_roles, BuiltinDeps, CancelSignal, ExecCtx, PipelineExecutor,
//!     PipelineRequest, RoleRegistry,
//! };
//! use proofread_pipeline::types::PipelineEntry;
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Arc::new(ExecCtx::builder("https://api.openai.com").openai_with_key("sk-...").build()?);
//!     let mut registry = RoleRegistry::new();
//!     register_builtin_roles(&mut registry, &BuiltinDeps::new(ctx, "gpt-4o-mini"))?;
//!
//!     let executor = PipelineExecutor::new(Arc::new(registry));
//!     let request = PipelineRequest::new(
//!         vec![PipelineEntry::new("basic"), PipelineEntry::new("reviewer")],
//!         "我今天很高行。",
//!         CancelSignal::new(),
//!     );
//!     let mut events = executor.run_pipeline(request);
//!     while let Some(event) = events.next().await {
//!         println!("{:?}", event?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod backend;
pub mod backoff;
pub mod cancel;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod executor;
pub mod merge;
pub mod outcome;
pub mod patch;
pub mod producer;
pub mod prompt;
pub mod registry;
pub mod role;
pub mod server;
pub mod sse;
pub mod text;
pub mod types;

pub use agent::LlmAgent;
pub use backend::{LlmConfig, MockBackend, OpenAiBackend};
pub use backoff::BackoffConfig;
pub use cancel::{CancelReason, CancelSignal};
pub use client::{CheckClient, CheckOutcome, RetryPolicy, TerminalReport};
pub use config::Config;
pub use diagnostics::ParseDiagnostics;
pub use error::{PipelineError, Result};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use executor::{PipelineExecutor, PipelineRequest, StageEvent, StageKind};
pub use merge::{merge, MergeConfig};
pub use outcome::{CheckMeta, CheckResult, OutcomeBuilder};
pub use patch::{apply_error_items, PatchOutcome};
pub use registry::{register_builtin_roles, BuiltinDeps, RoleRegistry};
pub use role::{BoxFut, Role, RoleOutput};
pub use types::{ErrorItem, ErrorType, PipelineEntry};
