//! LLM provider abstraction
//!
//! The orchestrator treats inference as an opaque function call with a
//! declared deadline. Multiple providers form an ordered fallback
//! chain: the chain advances only on infrastructure error, never on a
//! semantically valid answer.

mod ollama;

pub use ollama::OllamaProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::agents::AgentError;

/// A single inference backend
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt within the deadline
    async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String, AgentError>;

    /// Provider name for logging and step attribution
    fn name(&self) -> &str;
}

/// Ordered provider list with fallback on infrastructure error
///
/// The chain is per-run state passed in at run creation: two
/// concurrent runs may use different chains without contention.
#[derive(Clone)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self { providers }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Try each provider in order; return the first success or the
    /// last infrastructure error
    pub async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String, AgentError> {
        let mut last_err = AgentError::Provider("no providers configured".to_string());

        for provider in &self.providers {
            match provider.complete(prompt, deadline).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "Provider failed, advancing");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider {
        name: String,
        reply: Result<String, String>,
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        async fn complete(&self, _prompt: &str, _deadline: Duration) -> Result<String, AgentError> {
            self.reply
                .clone()
                .map_err(AgentError::Provider)
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn test_chain_falls_through_on_error() {
        let chain = ProviderChain::new(vec![
            Arc::new(FixedProvider {
                name: "primary".to_string(),
                reply: Err("unreachable".to_string()),
            }),
            Arc::new(FixedProvider {
                name: "fallback".to_string(),
                reply: Ok("answer".to_string()),
            }),
        ]);

        let reply = chain.complete("q", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "answer");
    }

    #[tokio::test]
    async fn test_chain_reports_last_error_when_exhausted() {
        let chain = ProviderChain::new(vec![Arc::new(FixedProvider {
            name: "only".to_string(),
            reply: Err("down".to_string()),
        })]);

        let err = chain.complete("q", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(msg) if msg == "down"));
    }

    #[tokio::test]
    async fn test_empty_chain_errors() {
        let chain = ProviderChain::new(vec![]);
        assert!(chain.complete("q", Duration::from_secs(1)).await.is_err());
    }
}
