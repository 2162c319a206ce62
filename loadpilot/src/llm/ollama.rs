//! Ollama-compatible HTTP provider

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::LlmProvider;
use crate::agents::AgentError;

/// A non-streaming chat completion against an Ollama-style API
pub struct OllamaProvider {
    name: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OllamaProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String, AgentError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });

        let request = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(deadline)
            .json(&body);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(deadline)
            } else {
                AgentError::Provider(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(format!(
                "{} returned {}: {}",
                self.name, status, text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("invalid response body: {}", e)))?;

        Ok(parsed.message.content)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
