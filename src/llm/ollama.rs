//! Ollama backend
//!
//! Non-streaming client for `/api/generate` and `/api/tags`. Errors are reported as
//! human-readable messages; the gateway's retry policy reads them.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::{Config, QuillError, Result};
use crate::llm::traits::{GenerationParams, TextGenerator};

/// Ollama API client
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

/// Ollama generate request
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: OllamaOptions,
    stream: bool,
}

/// Ollama generation options
#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

/// Ollama generate response (non-streaming)
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

/// `/api/tags` body
#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Whether `wanted` names one of `installed`; a missing tag matches any tag
fn model_matches(installed: &[String], wanted: &str) -> bool {
    let family = |name: &str| name.split(':').next().unwrap_or(name).to_string();
    installed.iter().any(|name| {
        name == wanted || (!wanted.contains(':') && family(name) == family(wanted))
    })
}

impl OllamaClient {
    /// Client for the server named in `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::build(
            config.ollama_url(),
            Duration::from_secs(config.ollama.timeout_secs),
        )
    }

    /// Client for an explicit server URL
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Self::build(base_url.into(), Duration::from_secs(120))
    }

    fn build(base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QuillError::ollama(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    fn to_options(params: &GenerationParams) -> OllamaOptions {
        OllamaOptions {
            temperature: params.temperature,
            num_predict: params.max_tokens,
            top_p: params.top_p,
            stop: params.stop.clone(),
        }
    }

    /// Transport failures as readable messages; timeouts keep "timed out"
    fn map_send_error(&self, e: reqwest::Error) -> QuillError {
        if e.is_connect() {
            QuillError::ollama(format!(
                "Cannot connect to Ollama at {}. Is it running?",
                self.base_url
            ))
        } else if e.is_timeout() {
            QuillError::ollama(format!("Request to {} timed out", self.base_url))
        } else {
            QuillError::from(e)
        }
    }

    /// Turn a non-2xx answer into an error naming the model when it is missing
    async fn check_status(
        response: reqwest::Response,
        model: Option<&str>,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match model {
            Some(model) if status.as_u16() == 404 && body.contains("not found") => {
                Err(QuillError::ollama(format!(
                    "Model '{}' not available. Run: ollama pull {}",
                    model, model
                )))
            }
            _ => Err(QuillError::ollama(format!("HTTP {}: {}", status, body.trim()))),
        }
    }

    /// Names of the locally pulled models
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.endpoint("tags"))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response, None).await?;

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Whether `model` has been pulled
    pub async fn is_model_available(&self, model: &str) -> Result<bool> {
        let installed = self.list_models().await?;
        Ok(model_matches(&installed, model))
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let request = GenerateRequest {
            model: &params.model,
            prompt,
            options: Self::to_options(params),
            stream: false,
        };

        tracing::debug!(model = %params.model, temperature = params.temperature, "ollama generate");

        let response = self
            .client
            .post(self.endpoint("generate"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response, Some(&params.model)).await?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| QuillError::ollama(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = body.error {
            return Err(QuillError::ollama(error));
        }

        Ok(body.response)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
