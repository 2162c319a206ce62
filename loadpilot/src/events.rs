//! Stream events for real-time workflow visibility
//!
//! This module defines the events a run emits while it executes.
//! Events are appended to the durable per-run log before they are
//! broadcast, so observers can replay a run's history at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentRole;

/// What kind of sub-decision an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Free-form reasoning from an agent while it works
    Thinking,
    /// An agent invoked an external tool or provider
    ToolCall,
    /// An agent or the gate reached a decision
    Decision,
    /// A candidate or threshold was rejected
    Rejection,
    /// A terminal outcome for the run
    Result,
    /// Something went wrong
    Error,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Thinking => write!(f, "thinking"),
            EventKind::ToolCall => write!(f, "tool_call"),
            EventKind::Decision => write!(f, "decision"),
            EventKind::Rejection => write!(f, "rejection"),
            EventKind::Result => write!(f, "result"),
            EventKind::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "thinking" => Ok(EventKind::Thinking),
            "tool_call" => Ok(EventKind::ToolCall),
            "decision" => Ok(EventKind::Decision),
            "rejection" => Ok(EventKind::Rejection),
            "result" => Ok(EventKind::Result),
            "error" => Ok(EventKind::Error),
            _ => Err(anyhow::anyhow!("Unknown event kind: {}", s)),
        }
    }
}

/// How an observer should render an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Success => write!(f, "success"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "success" => Ok(Severity::Success),
            _ => Err(anyhow::anyhow!("Unknown severity: {}", s)),
        }
    }
}

/// A single broadcastable event within a run
///
/// `seq` is monotonic per run and assigned by the stream at publish
/// time. Consumers can detect gaps and request a replay from the last
/// sequence number they acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub run_id: String,
    pub seq: u64,
    pub kind: EventKind,
    /// Which agent role emitted the event, if any (gate and run-level
    /// transitions carry no role)
    pub role: Option<AgentRole>,
    pub message: String,
    /// Human-readable reasoning behind the decision, if any
    pub reasoning: Option<String>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// An event before the stream has assigned it a sequence number
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub role: Option<AgentRole>,
    pub message: String,
    pub reasoning: Option<String>,
    pub severity: Severity,
}

impl EventDraft {
    pub fn new(kind: EventKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            role: None,
            message: message.into(),
            reasoning: None,
            severity,
        }
    }

    /// Attribute the event to an agent role
    pub fn from_role(mut self, role: AgentRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Attach reasoning text
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn thinking(role: AgentRole, message: impl Into<String>) -> Self {
        Self::new(EventKind::Thinking, Severity::Info, message).from_role(role)
    }

    pub fn decision(role: AgentRole, message: impl Into<String>) -> Self {
        Self::new(EventKind::Decision, Severity::Info, message).from_role(role)
    }

    pub fn rejection(role: AgentRole, message: impl Into<String>) -> Self {
        Self::new(EventKind::Rejection, Severity::Warning, message).from_role(role)
    }

    pub fn result(message: impl Into<String>) -> Self {
        Self::new(EventKind::Result, Severity::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, Severity::Error, message)
    }
}
