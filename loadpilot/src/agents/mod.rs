//! Agent contract
//!
//! An agent is a capability unit: given a typed request it produces a
//! proposal, an audit verdict, or a score, plus human-readable
//! reasoning. Agents never write to the business store — every durable
//! side effect happens in the orchestrator after a run reaches a
//! terminal approved state, which is what keeps the system auditable.

pub mod llm;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The three roles in the canonical propose → audit → gate workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Proposer,
    Auditor,
    Gatekeeper,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Proposer => write!(f, "proposer"),
            AgentRole::Auditor => write!(f, "auditor"),
            AgentRole::Gatekeeper => write!(f, "gatekeeper"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "proposer" => Ok(AgentRole::Proposer),
            "auditor" => Ok(AgentRole::Auditor),
            "gatekeeper" => Ok(AgentRole::Gatekeeper),
            _ => Err(anyhow::anyhow!("Unknown agent role: {}", s)),
        }
    }
}

/// The proposed action or target under evaluation in one attempt
///
/// The payload is opaque to the core; only the identity matters for
/// exclusion tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub payload: serde_json::Value,
}

impl Candidate {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Opaque token accounting, recorded but never interpreted by the core
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// What the orchestrator hands an agent
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub run_id: String,
    pub tenant_id: String,
    /// The caller-supplied workflow input (e.g. the load to cover)
    pub input: serde_json::Value,
    /// Candidate identities already rejected in this run
    pub excluded: Vec<String>,
}

/// Result of a propose call
#[derive(Debug, Clone)]
pub enum Proposal {
    Candidate {
        candidate: Candidate,
        reasoning: String,
        usage: Option<TokenUsage>,
    },
    /// A semantically valid "nothing eligible" answer — not an error
    NoCandidate { reason: String },
}

/// Result of an audit call
#[derive(Debug, Clone)]
pub struct AuditVerdict {
    pub accepted: bool,
    pub reasons: Vec<String>,
    pub reasoning: String,
    pub usage: Option<TokenUsage>,
}

/// Result of a score call
#[derive(Debug, Clone)]
pub struct Score {
    pub value: f64,
    pub reasoning: String,
    pub usage: Option<TokenUsage>,
}

/// Infrastructure failures at the agent boundary
///
/// Business outcomes (rejection, no candidate) are not errors; this
/// type covers only timeouts and provider unavailability so the engine
/// can keep "the provider was down" distinct from "the answer was no".
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("agent call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider error: {0}")]
    Provider(String),
}

/// Proposes a candidate, excluding any the run has already rejected
#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose(&self, ctx: &AgentContext) -> Result<Proposal, AgentError>;
}

/// Audits a proposed candidate for compliance
#[async_trait]
pub trait Auditor: Send + Sync {
    async fn audit(&self, ctx: &AgentContext, candidate: &Candidate)
        -> Result<AuditVerdict, AgentError>;
}

/// Scores an accepted candidate for the approval gate
#[async_trait]
pub trait Gatekeeper: Send + Sync {
    async fn score(&self, ctx: &AgentContext, candidate: &Candidate)
        -> Result<Score, AgentError>;
}

/// One agent per role, resolved once when the workflow is loaded
///
/// Closed dispatch: the engine never looks an agent up by role string
/// at call time, so the retry/backoff wrapper below is reusable across
/// all three roles without dynamic lookup.
#[derive(Clone)]
pub struct AgentSet {
    pub proposer: std::sync::Arc<dyn Proposer>,
    pub auditor: std::sync::Arc<dyn Auditor>,
    pub gatekeeper: std::sync::Arc<dyn Gatekeeper>,
}

/// Call-level retry settings, distinct from candidate retries
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    /// Deadline for a single agent call
    pub timeout: Duration,
    /// Extra attempts after the first failure
    pub retries: u32,
    /// Base delay for exponential backoff
    pub backoff_base: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 2,
            backoff_base: Duration::from_millis(250),
        }
    }
}

/// Run an agent call under a deadline, retrying infrastructure
/// failures with exponential backoff
///
/// The factory is invoked fresh for each attempt. Returns the last
/// error once retries are exhausted; the engine maps that to a
/// terminal "agent unavailable" failure.
pub async fn call_with_retry<T, F, Fut>(
    role: AgentRole,
    policy: &CallPolicy,
    mut call: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut last_err = AgentError::Provider("no attempts made".to_string());

    for attempt in 0..=policy.retries {
        if attempt > 0 {
            let delay = policy.backoff_base * 2u32.saturating_pow(attempt - 1);
            tracing::debug!(%role, attempt, ?delay, "Retrying agent call after backoff");
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(%role, attempt, error = %e, "Agent call failed");
                last_err = e;
            }
            Err(_) => {
                tracing::warn!(%role, attempt, timeout = ?policy.timeout, "Agent call timed out");
                last_err = AgentError::Timeout(policy.timeout);
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = CallPolicy {
            timeout: Duration::from_secs(1),
            retries: 3,
            backoff_base: Duration::from_millis(1),
        };

        let counter = Arc::clone(&attempts);
        let result = call_with_retry(AgentRole::Proposer, &policy, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AgentError::Provider("flaky".to_string()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_error() {
        let policy = CallPolicy {
            timeout: Duration::from_secs(1),
            retries: 2,
            backoff_base: Duration::from_millis(1),
        };

        let result: Result<(), _> =
            call_with_retry(AgentRole::Auditor, &policy, || async {
                Err(AgentError::Provider("down".to_string()))
            })
            .await;

        match result {
            Err(AgentError::Provider(msg)) => assert_eq!(msg, "down"),
            other => panic!("Expected provider error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let policy = CallPolicy {
            timeout: Duration::from_millis(10),
            retries: 0,
            backoff_base: Duration::from_millis(1),
        };

        let result: Result<(), _> =
            call_with_retry(AgentRole::Gatekeeper, &policy, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(AgentError::Timeout(_))));
    }

    #[test]
    fn test_role_roundtrip() {
        for role in [AgentRole::Proposer, AgentRole::Auditor, AgentRole::Gatekeeper] {
            let parsed: AgentRole = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
    }
}
