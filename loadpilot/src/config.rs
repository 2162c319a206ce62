//! Configuration loading from .loadpilot.toml
//!
//! Every field has a default so the server runs with no config file at
//! all. The file is discovered at an explicit path, the working
//! directory, or the user's home directory, in that order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::llm::LlmAgent;
use crate::agents::AgentSet;
use crate::llm::{LlmProvider, OllamaProvider, ProviderChain};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    pub workflows: WorkflowsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Database location; the default lives under ~/.loadpilot
    pub db_path: Option<PathBuf>,
    pub default_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            default_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub call_timeout_secs: u64,
    pub call_retries: u32,
    /// Ordered fallback list; the first provider that answers wins
    pub providers: Vec<ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 60,
            call_retries: 2,
            providers: vec![ProviderConfig {
                name: "ollama".to_string(),
                url: "http://localhost:11434".to_string(),
                model: "llama3.2".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WorkflowsConfig {
    /// Directory of custom workflow TOML files
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration, falling back to defaults when no file exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        for candidate in Self::default_paths() {
            if candidate.exists() {
                tracing::info!("Loading config from {:?}", candidate);
                return Self::from_file(&candidate);
            }
        }
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config at {:?}", path))
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".loadpilot.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".loadpilot").join("config.toml"));
        }
        paths
    }

    /// Build the agent set from the configured provider chain
    ///
    /// One LLM-backed agent serves all three roles.
    pub fn agent_set(&self) -> AgentSet {
        let providers: Vec<Arc<dyn LlmProvider>> = self
            .llm
            .providers
            .iter()
            .map(|p| {
                Arc::new(OllamaProvider::new(&p.name, &p.url, &p.model)) as Arc<dyn LlmProvider>
            })
            .collect();
        let chain = ProviderChain::new(providers);
        let agent = Arc::new(LlmAgent::new(
            chain,
            Duration::from_secs(self.llm.call_timeout_secs),
        ));

        AgentSet {
            proposer: agent.clone(),
            auditor: agent.clone(),
            gatekeeper: agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.default_max_attempts, 3);
        assert_eq!(config.llm.providers.len(), 1);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            port = 9090

            [engine]
            db_path = "/tmp/loadpilot.db"
            default_max_attempts = 5

            [llm]
            call_timeout_secs = 30
            call_retries = 1

            [[llm.providers]]
            name = "primary"
            url = "http://gpu-box:11434"
            model = "llama3.2"

            [[llm.providers]]
            name = "fallback"
            url = "http://localhost:11434"
            model = "llama3.2"

            [workflows]
            dir = "workflows"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.llm.providers.len(), 2);
        assert_eq!(config.llm.providers[0].name, "primary");
        assert_eq!(config.workflows.dir.as_deref(), Some(Path::new("workflows")));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[server]\nport = 7000\n").unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.llm.call_timeout_secs, 60);
    }
}
