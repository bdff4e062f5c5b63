//! Text-generation client abstraction and implementations.
//!
//! [`GenerationClient::call`] is the only asynchronous boundary the
//! scheduler knows about. Concrete clients:
//! - **[`DisabledClient`]**: always errors; used when generation is not configured.
//! - **[`OpenAIClient`]**: `POST /v1/chat/completions` with retry and backoff.
//! - **[`OllamaClient`]**: `POST /api/generate` on a local Ollama instance.
//!
//! # Retry Strategy
//!
//! Both HTTP clients retry transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;

/// Token accounting reported by the service, when available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOutcome {
    pub content: String,
    pub usage: Option<Usage>,
}

impl GenerationOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }
}

/// An external text-generation service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Short identifier for logs (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`.
    async fn call(&self, prompt: &str, config: &GenerationConfig) -> Result<GenerationOutcome>;
}

/// Build the client named by `config.provider`.
pub fn create_client(config: &GenerationConfig) -> Result<Arc<dyn GenerationClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledClient)),
        "openai" => Ok(Arc::new(OpenAIClient::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaClient::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ Disabled Client ============

/// A client that always fails. Rules still run; each produces an error artifact.
pub struct DisabledClient;

#[async_trait]
impl GenerationClient for DisabledClient {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn call(&self, _prompt: &str, _config: &GenerationConfig) -> Result<GenerationOutcome> {
        bail!("Generation provider is disabled")
    }
}

// ============ OpenAI Client ============

/// Chat completions against the OpenAI API (or a compatible endpoint set
/// through `generation.url`).
pub struct OpenAIClient {
    http: reqwest::Client,
}

impl OpenAIClient {
    /// # Errors
    ///
    /// Returns an error if the API key variable named by `api_key_env` is
    /// not set, or the HTTP client cannot be built.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        if std::env::var(&config.api_key_env).is_err() {
            bail!("{} environment variable not set", config.api_key_env);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl GenerationClient for OpenAIClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn call(&self, prompt: &str, config: &GenerationConfig) -> Result<GenerationOutcome> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} not set", config.api_key_env))?;
        let model = config
            .model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("generation.model required"))?;
        let base = config.url.as_deref().unwrap_or("https://api.openai.com");

        let mut body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(t) = config.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let json = post_with_retry(
            &self.http,
            &format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            Some(&api_key),
            &body,
            config.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Extract `choices[0].message.content` and `usage`.
fn parse_openai_response(json: &serde_json::Value) -> Result<GenerationOutcome> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))?;

    let usage = json.get("usage").map(|u| {
        let field = |k: &str| u.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
        Usage {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        }
    });

    Ok(GenerationOutcome {
        content: content.to_string(),
        usage,
    })
}

// ============ Ollama Client ============

/// Non-streaming generation on a local Ollama instance
/// (default `http://localhost:11434`).
pub struct OllamaClient {
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl GenerationClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn call(&self, prompt: &str, config: &GenerationConfig) -> Result<GenerationOutcome> {
        let model = config
            .model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("generation.model required"))?;
        let base = config.url.as_deref().unwrap_or("http://localhost:11434");

        let mut body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(t) = config.temperature {
            body["options"] = serde_json::json!({ "temperature": t });
        }

        let json = post_with_retry(
            &self.http,
            &format!("{}/api/generate", base.trim_end_matches('/')),
            None,
            &body,
            config.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<GenerationOutcome> {
    let content = json
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response"))?;

    let prompt_tokens = json.get("prompt_eval_count").and_then(|v| v.as_u64());
    let completion_tokens = json.get("eval_count").and_then(|v| v.as_u64());
    let usage = match (prompt_tokens, completion_tokens) {
        (None, None) => None,
        (p, c) => {
            let (p, c) = (p.unwrap_or(0), c.unwrap_or(0));
            Some(Usage {
                prompt_tokens: p,
                completion_tokens: c,
                total_tokens: p + c,
            })
        }
    };

    Ok(GenerationOutcome {
        content: content.to_string(),
        usage,
    })
}

// ============ Shared HTTP ============

/// POST `body` as JSON, retrying transient failures.
async fn post_with_retry(
    http: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = http
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        service,
                        status,
                        body_text
                    ));
                    continue;
                }

                // Client error (not 429), don't retry
                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", service, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", service, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} generation failed after retries", service)))
}
