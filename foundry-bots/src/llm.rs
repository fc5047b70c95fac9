//! Text generation backends.
//!
//! Every backend implements [`Generator`]. Workers and the supervisor only see
//! a [`FallbackChain`], which tries its generators in order until one succeeds.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

/// Default completion budget when neither the request nor the config sets one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One single-turn generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    pub system: String,
    pub prompt: String,
    /// Overrides the backend's configured model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerateRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("{backend} request failed: {source}")]
    Transport {
        backend: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{backend} API error {status}: {body}")]
    Api {
        backend: String,
        status: u16,
        body: String,
    },
    #[error("{backend} returned no text")]
    Empty { backend: String },
    #[error("all generators failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

/// A text-generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Short backend name used in logs and error messages.
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<String, GenerateError>;
}

// ── Anthropic ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Anthropic Messages API.
pub struct AnthropicGenerator {
    name: String,
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl AnthropicGenerator {
    pub fn new(api_key: String) -> Self {
        Self {
            name: "anthropic".to_string(),
            api_key,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: ANTHROPIC_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Generator for AnthropicGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, GenerateError> {
        let mut body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "system": request.system,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        let resp = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|source| self.transport(source))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerateError::Api {
                backend: self.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = resp.json().await.map_err(|source| self.transport(source))?;
        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();
        non_empty(&self.name, text)
    }
}

impl AnthropicGenerator {
    fn transport(&self, source: reqwest::Error) -> GenerateError {
        GenerateError::Transport {
            backend: self.name.clone(),
            source,
        }
    }
}

// ── OpenAI-compatible ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Any `/chat/completions` endpoint: OpenAI, Groq, OpenRouter, Together,
/// Ollama or a local server.
pub struct OpenAiCompatible {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

impl OpenAiCompatible {
    pub fn new(name: &str, base_url: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            model: model.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Local servers usually need no key.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }
}

#[async_trait]
impl Generator for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, GenerateError> {
        let mut body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let transport = |source: reqwest::Error| GenerateError::Transport {
            backend: self.name.clone(),
            source,
        };
        let resp = req.send().await.map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerateError::Api {
                backend: self.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(transport)?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        non_empty(&self.name, text)
    }
}

fn non_empty(backend: &str, text: String) -> Result<String, GenerateError> {
    if text.trim().is_empty() {
        Err(GenerateError::Empty {
            backend: backend.to_string(),
        })
    } else {
        Ok(text)
    }
}

// ── Fallback chain ─────────────────────────────────────────────────────

/// Ordered list of generators tried in sequence.
#[derive(Clone)]
pub struct FallbackChain {
    generators: Vec<Arc<dyn Generator>>,
}

impl FallbackChain {
    /// Primary first, then fallbacks. Later duplicates (by name) are dropped.
    pub fn new(generators: impl IntoIterator<Item = Arc<dyn Generator>>) -> Self {
        let mut kept: Vec<Arc<dyn Generator>> = Vec::new();
        for generator in generators {
            if kept.iter().any(|g| g.name() == generator.name()) {
                continue;
            }
            kept.push(generator);
        }
        Self { generators: kept }
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.generators.iter().map(|g| g.name()).collect()
    }
}

#[async_trait]
impl Generator for FallbackChain {
    fn name(&self) -> &str {
        "fallback-chain"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, GenerateError> {
        let mut failures = Vec::new();
        for generator in &self.generators {
            match generator.generate(request).await {
                Ok(text) => {
                    if !failures.is_empty() {
                        tracing::info!("Generated with fallback {}", generator.name());
                    }
                    return Ok(text);
                }
                Err(e) => {
                    tracing::warn!("Generator {} failed: {e}", generator.name());
                    failures.push(e.to_string());
                }
            }
        }
        if failures.is_empty() {
            failures.push("no generators configured".to_string());
        }
        Err(GenerateError::Exhausted(failures))
    }
}

/// Remove a markdown fence wrapped around generated file content.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return text.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.join("\n")
}
