//! `foundry.toml`: settings shared by the coordinator, workers and supervisor.
//!
//! Every key is optional. A missing file means all defaults. API keys never
//! live in the file; each provider names the environment variable to read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use foundry_sdk::protocol::Role;
use serde::{Deserialize, Serialize};

use crate::llm::{
    AnthropicGenerator, DEFAULT_MAX_TOKENS, FallbackChain, GenerateRequest, Generator,
    OpenAiCompatible,
};

/// Default broker address.
pub const DEFAULT_BROKER_URL: &str = "http://127.0.0.1:7860";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundryConfig {
    pub broker_url: String,
    /// What the generated project should be.
    pub target: String,
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub generation: GenerationConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for FoundryConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            target: String::new(),
            coordinator: CoordinatorConfig::default(),
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
            generation: GenerationConfig::default(),
            providers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Hard ceiling on in-flight `(file, role)` entries.
    pub max_concurrent_tasks: usize,
    /// Slack added to the done count when computing the dispatch target.
    pub desired_buffer: usize,
    /// Cycle interval while anything is in flight.
    pub active_interval_secs: u64,
    /// Cycle interval while nothing is in flight.
    pub idle_interval_secs: u64,
    /// Give up waiting for a project structure after this long.
    pub structure_timeout_secs: u64,
    /// Mark a dispatched subtask `error_processing` after this long.
    pub task_timeout_secs: Option<u64>,
    /// Per-request broker timeout.
    pub request_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            desired_buffer: 10,
            active_interval_secs: 10,
            idle_interval_secs: 15,
            structure_timeout_secs: 300,
            task_timeout_secs: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pause after an empty pull.
    pub idle_interval_secs: u64,
    pub report_attempts: u32,
    pub report_retry_secs: u64,
    /// System prompt overrides keyed by role name. `{filename}` is substituted.
    pub system_prompts: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 5,
            report_attempts: 3,
            report_retry_secs: 1,
            system_prompts: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub interval_secs: u64,
    /// A role idle with work queued for this long gets a remediation request.
    pub stall_after_secs: u64,
    /// Log file tailed for `ERROR`/`CRITICAL` lines.
    pub log_file: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stall_after_secs: 120,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Provider tried first. Defaults to the first `[[providers]]` entry.
    pub primary: Option<String>,
    /// Providers tried, in order, after the primary fails.
    pub fallbacks: Vec<String>,
    /// Per-role primary provider, keyed by role name (or `planner`).
    pub role_providers: HashMap<String, String>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            primary: None,
            fallbacks: Vec::new(),
            role_providers: HashMap::new(),
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
        }
    }
}

impl GenerationConfig {
    /// A request carrying the configured model, token budget and temperature.
    pub fn request(&self, system: impl Into<String>, prompt: impl Into<String>) -> GenerateRequest {
        GenerateRequest {
            model: self.model.clone(),
            max_tokens: Some(self.max_tokens),
            temperature: self.temperature,
            ..GenerateRequest::new(system, prompt)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    /// Build the backend, or `None` if its API key variable is unset.
    fn build(&self) -> Option<Arc<dyn Generator>> {
        let api_key = match &self.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Some(key),
                _ => {
                    tracing::warn!("Provider {} skipped: {var} is not set", self.name);
                    return None;
                }
            },
            None => None,
        };
        let generator: Arc<dyn Generator> = match self.kind {
            ProviderKind::Anthropic => {
                let mut g = AnthropicGenerator::new(api_key.unwrap_or_default())
                    .with_name(&self.name)
                    .with_model(&self.model);
                if let Some(url) = &self.base_url {
                    g = g.with_base_url(url);
                }
                Arc::new(g)
            }
            ProviderKind::Openai => {
                let url = self.base_url.as_deref().unwrap_or("https://api.openai.com/v1");
                Arc::new(OpenAiCompatible::new(&self.name, url, &self.model).with_api_key(api_key))
            }
        };
        Some(generator)
    }
}

impl FoundryConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Provider names in the order they are tried for `role` (`None` = planner).
    pub fn provider_order(&self, role: Option<Role>) -> Vec<String> {
        let key = role.map_or("planner", |r| r.as_str());
        let primary = self
            .generation
            .role_providers
            .get(key)
            .or(self.generation.primary.as_ref())
            .cloned()
            .or_else(|| self.providers.first().map(|p| p.name.clone()));

        let mut order: Vec<String> = Vec::new();
        for name in primary.into_iter().chain(self.generation.fallbacks.iter().cloned()) {
            if !order.contains(&name) {
                order.push(name);
            }
        }
        order
    }

    /// The fallback chain for `role` (`None` = planner).
    pub fn generator_for(&self, role: Option<Role>) -> Result<FallbackChain> {
        let mut generators = Vec::new();
        for name in self.provider_order(role) {
            let provider = self
                .providers
                .iter()
                .find(|p| p.name == name)
                .with_context(|| format!("Unknown provider '{name}' in [generation]"))?;
            if let Some(generator) = provider.build() {
                generators.push(generator);
            }
        }
        Ok(FallbackChain::new(generators))
    }
}
