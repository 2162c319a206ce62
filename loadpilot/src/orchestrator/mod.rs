//! Workflow orchestration
//!
//! The engine drives runs through the propose → audit → gate state
//! machine; workflow specs carry the per-workflow policy; the commit
//! store applies the terminal side effect.

pub mod commit;
pub mod engine;
pub mod workflow;

pub use commit::{CommitStore, LoggingCommitStore};
pub use engine::{Engine, EngineError};
pub use workflow::{builtin_workflows, load_workflows, WorkflowError, WorkflowSpec};
