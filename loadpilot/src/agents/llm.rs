//! LLM-backed agent
//!
//! One generic agent implements all three roles by rendering a role
//! prompt and parsing a strict JSON object out of the model's reply.
//! Domain logic (how a best candidate is chosen, how a margin is
//! computed) lives entirely in the prompt; the core only sees the
//! structured result.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    AgentContext, AgentError, AuditVerdict, Auditor, Candidate, Gatekeeper, Proposal, Proposer,
    Score,
};
use crate::llm::ProviderChain;

const PROPOSE_PROMPT: &str = r#"You are a dispatch proposer. Given the request below, propose the
single best candidate, or report that none is eligible. Never propose a
candidate whose id appears in the excluded list.

Respond with exactly one JSON object, no prose around it:
  {"candidate": {"id": "...", "payload": {...}}, "reasoning": "..."}
or
  {"no_candidate": true, "reason": "..."}
"#;

const AUDIT_PROMPT: &str = r#"You are a compliance auditor. Review the proposed candidate against
the request and list every compliance problem you find.

Respond with exactly one JSON object, no prose around it:
  {"accepted": true|false, "reasons": ["..."], "reasoning": "..."}
"#;

const SCORE_PROMPT: &str = r#"You are a financial gatekeeper. Compute the decision metric (for
example a margin percentage) for the candidate below.

Respond with exactly one JSON object, no prose around it:
  {"value": <number>, "reasoning": "..."}
"#;

/// Agent that delegates every role to the provider chain
pub struct LlmAgent {
    chain: ProviderChain,
    deadline: Duration,
}

impl LlmAgent {
    pub fn new(chain: ProviderChain, deadline: Duration) -> Self {
        Self { chain, deadline }
    }

    fn render(&self, header: &str, ctx: &AgentContext, candidate: Option<&Candidate>) -> String {
        let mut prompt = String::from(header);
        prompt.push_str("\nRequest:\n");
        prompt.push_str(&ctx.input.to_string());
        if !ctx.excluded.is_empty() {
            prompt.push_str("\nExcluded candidate ids: ");
            prompt.push_str(&ctx.excluded.join(", "));
        }
        if let Some(c) = candidate {
            prompt.push_str("\nCandidate:\n");
            prompt.push_str(&serde_json::json!({"id": c.id, "payload": c.payload}).to_string());
        }
        prompt
    }

    async fn ask<T: for<'de> Deserialize<'de>>(&self, prompt: &str) -> Result<T, AgentError> {
        let reply = self.chain.complete(prompt, self.deadline).await?;
        parse_json_object(&reply)
    }
}

/// Extract and parse the first top-level JSON object in a model reply
///
/// Models occasionally wrap the object in prose or a code fence; a
/// reply with no parseable object is a provider fault, not a business
/// outcome.
fn parse_json_object<T: for<'de> Deserialize<'de>>(reply: &str) -> Result<T, AgentError> {
    let start = reply
        .find('{')
        .ok_or_else(|| AgentError::Provider("reply contained no JSON object".to_string()))?;
    let end = reply
        .rfind('}')
        .ok_or_else(|| AgentError::Provider("reply contained no JSON object".to_string()))?;

    serde_json::from_str(&reply[start..=end])
        .map_err(|e| AgentError::Provider(format!("malformed agent reply: {}", e)))
}

#[derive(Debug, Deserialize)]
struct ProposeReply {
    #[serde(default)]
    candidate: Option<Candidate>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    no_candidate: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuditReply {
    accepted: bool,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
    value: f64,
    #[serde(default)]
    reasoning: String,
}

#[async_trait]
impl Proposer for LlmAgent {
    async fn propose(&self, ctx: &AgentContext) -> Result<Proposal, AgentError> {
        let prompt = self.render(PROPOSE_PROMPT, ctx, None);
        let reply: ProposeReply = self.ask(&prompt).await?;

        if let Some(candidate) = reply.candidate {
            Ok(Proposal::Candidate {
                candidate,
                reasoning: reply.reasoning,
                usage: None,
            })
        } else if reply.no_candidate {
            Ok(Proposal::NoCandidate {
                reason: reply
                    .reason
                    .unwrap_or_else(|| "no eligible candidate".to_string()),
            })
        } else {
            Err(AgentError::Provider(
                "proposer reply had neither candidate nor no_candidate".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Auditor for LlmAgent {
    async fn audit(
        &self,
        ctx: &AgentContext,
        candidate: &Candidate,
    ) -> Result<AuditVerdict, AgentError> {
        let prompt = self.render(AUDIT_PROMPT, ctx, Some(candidate));
        let reply: AuditReply = self.ask(&prompt).await?;

        Ok(AuditVerdict {
            accepted: reply.accepted,
            reasons: reply.reasons,
            reasoning: reply.reasoning,
            usage: None,
        })
    }
}

#[async_trait]
impl Gatekeeper for LlmAgent {
    async fn score(&self, ctx: &AgentContext, candidate: &Candidate) -> Result<Score, AgentError> {
        let prompt = self.render(SCORE_PROMPT, ctx, Some(candidate));
        let reply: ScoreReply = self.ask(&prompt).await?;

        Ok(Score {
            value: reply.value,
            reasoning: reply.reasoning,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_object() {
        let reply: ScoreReply =
            parse_json_object(r#"{"value": 12.5, "reasoning": "thin margin"}"#).unwrap();
        assert!((reply.value - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_object_in_code_fence() {
        let text = "Here you go:\n```json\n{\"accepted\": false, \"reasons\": [\"hos\"]}\n```";
        let reply: AuditReply = parse_json_object(text).unwrap();
        assert!(!reply.accepted);
        assert_eq!(reply.reasons, vec!["hos".to_string()]);
    }

    #[test]
    fn test_parse_no_object_is_provider_error() {
        let result: Result<ScoreReply, _> = parse_json_object("I cannot answer that.");
        assert!(matches!(result, Err(AgentError::Provider(_))));
    }

    #[test]
    fn test_propose_reply_shapes() {
        let with_candidate: ProposeReply = parse_json_object(
            r#"{"candidate": {"id": "drv-7", "payload": {"name": "J"}}, "reasoning": "closest"}"#,
        )
        .unwrap();
        assert_eq!(with_candidate.candidate.unwrap().id, "drv-7");

        let without: ProposeReply =
            parse_json_object(r#"{"no_candidate": true, "reason": "all excluded"}"#).unwrap();
        assert!(without.no_candidate);
    }
}
