//! Workflow definitions
//!
//! A workflow names the decision being automated and carries the
//! policy knobs for it: how many candidates may be tried, how patient
//! each agent call is, and the gate thresholds. The step sequence
//! itself (propose, audit, gate) is fixed; workflows vary policy, not
//! shape.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::CallPolicy;
use crate::gate::GatePolicy;

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Unique identifier for this workflow
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Maximum candidates to try before failing the run
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Deadline in seconds for a single agent call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Extra attempts per agent call after the first failure
    #[serde(default = "default_call_retries")]
    pub call_retries: u32,

    /// Gate thresholds for this workflow
    #[serde(default = "GatePolicy::approve_all")]
    pub gate: GatePolicy,

    /// Label recorded on the terminal commit marker
    #[serde(default = "default_commit_kind")]
    pub commit_kind: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_call_retries() -> u32 {
    2
}

fn default_commit_kind() -> String {
    "decision".to_string()
}

impl WorkflowSpec {
    /// Create a new workflow with default policy
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            max_attempts: default_max_attempts(),
            call_timeout_secs: default_call_timeout_secs(),
            call_retries: default_call_retries(),
            gate: GatePolicy::approve_all(),
            commit_kind: default_commit_kind(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Set the candidate retry budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the gate policy
    pub fn with_gate(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    /// Set the commit marker label
    pub fn with_commit_kind(mut self, kind: impl Into<String>) -> Self {
        self.commit_kind = kind.into();
        self
    }

    /// Call-level retry settings for this workflow's agent calls
    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(self.call_timeout_secs),
            retries: self.call_retries,
            ..CallPolicy::default()
        }
    }

    /// Load workflow from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, WorkflowError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| WorkflowError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load workflow from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, WorkflowError> {
        toml::from_str(toml_str).map_err(|e| WorkflowError::ParseError(e.to_string()))
    }
}

/// Errors that can occur with workflows
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Workflow not found: {0}")]
    NotFound(String),
}

/// Collection of built-in workflows
pub fn builtin_workflows() -> HashMap<String, WorkflowSpec> {
    let mut workflows = HashMap::new();

    // Cover a load: find a driver, audit compliance, gate on margin
    workflows.insert(
        "assign-driver".to_string(),
        WorkflowSpec::new("assign-driver")
            .with_description("Propose, audit, and approve a driver assignment for a load")
            .with_max_attempts(3)
            .with_gate(GatePolicy::margin_floor(10.0, Some(15.0)))
            .with_commit_kind("assignment"),
    );

    // Schedule a pickup window; cheap decision, no human in the loop
    workflows.insert(
        "schedule-load".to_string(),
        WorkflowSpec::new("schedule-load")
            .with_description("Pick and confirm a pickup window for a tendered load")
            .with_max_attempts(2)
            .with_gate(GatePolicy::margin_floor(5.0, None))
            .with_commit_kind("schedule"),
    );

    workflows
}

/// Load custom workflows from a directory
///
/// Malformed files are skipped with a warning rather than failing the
/// whole load.
pub fn load_custom_workflows(dir: &Path) -> Result<HashMap<String, WorkflowSpec>, WorkflowError> {
    let mut workflows = HashMap::new();

    if !dir.exists() {
        return Ok(workflows);
    }

    let entries = std::fs::read_dir(dir).map_err(|e| WorkflowError::IoError(e.to_string()))?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            match WorkflowSpec::from_toml_file(&path) {
                Ok(workflow) => {
                    workflows.insert(workflow.name.clone(), workflow);
                }
                Err(e) => {
                    tracing::warn!("Failed to load workflow from {:?}: {}", path, e);
                }
            }
        }
    }

    Ok(workflows)
}

/// Built-in workflows plus any custom directory, custom names winning
pub fn load_workflows(
    custom_dir: Option<&Path>,
) -> Result<HashMap<String, WorkflowSpec>, WorkflowError> {
    let mut workflows = builtin_workflows();
    if let Some(dir) = custom_dir {
        workflows.extend(load_custom_workflows(dir)?);
    }
    Ok(workflows)
}
