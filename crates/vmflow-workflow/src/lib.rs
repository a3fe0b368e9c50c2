//! vmflow workflow engine
//!
//! This crate provides the step/rollback orchestration primitive that
//! the provisioning and migration workflows are built on. A workflow is
//! an ordered list of steps executed strictly in sequence; each step
//! may register undo actions in a ledger, and any step failure replays
//! the ledger in reverse before a single wrapped error is returned.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              WorkflowEngine                      │
//! │  ┌─────────────────────────────────────────┐    │
//! │  │  Step 1 → Step 2 → ... → Step N          │    │
//! │  │  progress reported after each step       │    │
//! │  └─────────────────────────────────────────┘    │
//! │                      │ on failure               │
//! │                      ▼                          │
//! │  ┌─────────────────────────────────────────┐    │
//! │  │  UndoLedger: replay N-1 .. 1 (LIFO)      │    │
//! │  └─────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use vmflow_workflow::{WorkflowEngine, NoopReporter};
//! use std::sync::Arc;
//!
//! let engine = WorkflowEngine::new(Arc::new(NoopReporter));
//! engine.run("spawn", steps, &mut state).await?;
//! ```

pub mod engine;
pub mod error;
pub mod ledger;
pub mod progress;
pub mod step;

pub use engine::*;
pub use error::*;
pub use ledger::*;
pub use progress::*;
pub use step::*;
