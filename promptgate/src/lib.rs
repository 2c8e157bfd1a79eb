//! Request governance for a rate-capped CLI text-generation tool.
//!
//! This crate wraps an external tool that enforces a hard hourly call cap
//! behind a governed pipeline that:
//! - Tracks executed calls in a durable sliding-window ledger
//! - Rejects calls that would exceed the configured budget, with a wait hint
//! - Serves repeated prompts from a TTL response cache without spending budget
//! - Retries transient tool failures with exponential backoff
//! - Runs prompts in the background through a job queue and worker pool
//! - Exposes the whole thing over a small HTTP API
//!
//! # Example
//! ```ignore
//! use promptgate::{CliToolClient, PromptClient, PromptOptions};
//!
//! let response = client.prompt("summarize this", &PromptOptions::default(), true).await?;
//! if response.from_cache {
//!     println!("served from cache, no budget spent");
//! }
//! ```

pub mod admission;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod ledger;
pub mod queue;
pub mod tool;
pub mod types;

// Re-export commonly used types
pub use admission::{Admission, AdmissionController};
pub use cache::{cache_key, MemoryCache, ResponseCache};
pub use client::{Pipeline, PromptClient};
pub use config::{Args, Config};
pub use error::{Error, Result};
pub use executor::{Executor, RetryPolicy};
pub use ledger::UsageLedger;
pub use queue::{JobQueue, WorkerConfig, WorkerPool};
pub use tool::{CliToolClient, MockToolClient, ToolClient, ToolError, ToolOutput};
pub use types::*;
