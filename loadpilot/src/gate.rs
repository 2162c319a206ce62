//! Approval gate: deterministic threshold policy
//!
//! The gate is a pure function from a metric and a policy to an
//! outcome. No state, no I/O — identical inputs always produce the
//! identical outcome, which is what lets the engine's workflow logic
//! be unit tested without real agents.

use serde::{Deserialize, Serialize};

/// What the gate decided for a scored candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    /// Proceed autonomously
    Approve,
    /// Reject this candidate and retry with another
    RejectRetry,
    /// Suspend the run and ask a human
    Escalate,
}

impl std::fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateOutcome::Approve => write!(f, "approve"),
            GateOutcome::RejectRetry => write!(f, "reject_retry"),
            GateOutcome::Escalate => write!(f, "escalate"),
        }
    }
}

/// Urgency tier attached to an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyTier {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for UrgencyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrgencyTier::Low => write!(f, "low"),
            UrgencyTier::Medium => write!(f, "medium"),
            UrgencyTier::High => write!(f, "high"),
            UrgencyTier::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for UrgencyTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(UrgencyTier::Low),
            "medium" => Ok(UrgencyTier::Medium),
            "high" => Ok(UrgencyTier::High),
            "critical" => Ok(UrgencyTier::Critical),
            _ => Err(anyhow::anyhow!("Unknown urgency tier: {}", s)),
        }
    }
}

/// One threshold rule: metrics strictly below `below` get `outcome`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRule {
    pub below: f64,
    pub outcome: GateOutcome,
}

/// An ordered set of threshold rules plus a default
///
/// Rules are evaluated in priority order; the first rule whose
/// threshold the metric falls under wins. A metric matching no rule
/// gets the default outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePolicy {
    pub rules: Vec<GateRule>,
    #[serde(default = "default_outcome")]
    pub default: GateOutcome,
    /// Urgency attached to any escalation this policy produces
    #[serde(default = "default_urgency")]
    pub urgency: UrgencyTier,
}

fn default_outcome() -> GateOutcome {
    GateOutcome::Approve
}

fn default_urgency() -> UrgencyTier {
    UrgencyTier::Medium
}

impl GatePolicy {
    /// Approve everything — useful as a workflow default
    pub fn approve_all() -> Self {
        Self {
            rules: Vec::new(),
            default: GateOutcome::Approve,
            urgency: UrgencyTier::Medium,
        }
    }

    /// A two-band margin policy: below `reject_floor` retry, below
    /// `escalate_floor` escalate, otherwise approve
    pub fn margin_floor(reject_floor: f64, escalate_floor: Option<f64>) -> Self {
        let mut rules = vec![GateRule {
            below: reject_floor,
            outcome: GateOutcome::RejectRetry,
        }];
        if let Some(floor) = escalate_floor {
            rules.push(GateRule {
                below: floor,
                outcome: GateOutcome::Escalate,
            });
        }
        Self {
            rules,
            default: GateOutcome::Approve,
            urgency: UrgencyTier::Medium,
        }
    }
}

/// Evaluate a metric against a policy
pub fn decide(metric: f64, policy: &GatePolicy) -> GateOutcome {
    for rule in &policy.rules {
        if metric < rule.below {
            return rule.outcome;
        }
    }
    policy.default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin_floor_bands() {
        // reject below 10%, escalate in the 10-15% band, approve above
        let policy = GatePolicy::margin_floor(10.0, Some(15.0));

        assert_eq!(decide(8.0, &policy), GateOutcome::RejectRetry);
        assert_eq!(decide(12.0, &policy), GateOutcome::Escalate);
        assert_eq!(decide(16.0, &policy), GateOutcome::Approve);
    }

    #[test]
    fn test_boundary_is_exclusive() {
        let policy = GatePolicy::margin_floor(10.0, Some(15.0));

        // A metric exactly at a floor is not below it
        assert_eq!(decide(10.0, &policy), GateOutcome::Escalate);
        assert_eq!(decide(15.0, &policy), GateOutcome::Approve);
    }

    #[test]
    fn test_reject_only_policy() {
        let policy = GatePolicy::margin_floor(10.0, None);

        assert_eq!(decide(8.0, &policy), GateOutcome::RejectRetry);
        assert_eq!(decide(10.0, &policy), GateOutcome::Approve);
    }

    #[test]
    fn test_determinism() {
        let policy = GatePolicy::margin_floor(10.0, Some(15.0));
        for _ in 0..100 {
            assert_eq!(decide(12.5, &policy), GateOutcome::Escalate);
        }
    }

    #[test]
    fn test_rules_evaluated_in_order() {
        // A deliberately shadowing rule set: the first match wins
        let policy = GatePolicy {
            rules: vec![
                GateRule {
                    below: 20.0,
                    outcome: GateOutcome::Escalate,
                },
                GateRule {
                    below: 10.0,
                    outcome: GateOutcome::RejectRetry,
                },
            ],
            default: GateOutcome::Approve,
            urgency: UrgencyTier::Medium,
        };

        assert_eq!(decide(5.0, &policy), GateOutcome::Escalate);
    }

    #[test]
    fn test_policy_toml() {
        let toml = r#"
            urgency = "high"
            default = "approve"

            [[rules]]
            below = 10.0
            outcome = "reject_retry"

            [[rules]]
            below = 15.0
            outcome = "escalate"
        "#;

        let policy: GatePolicy = toml::from_str(toml).unwrap();
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.urgency, UrgencyTier::High);
        assert_eq!(decide(9.0, &policy), GateOutcome::RejectRetry);
    }
}
