//! Model gateway
//!
//! Wraps a `TextGenerator` with template rendering, a bounded wait per
//! call and retry with exponential backoff. Retries are decided from the
//! backend's error text: messages mentioning a loading model or a timeout
//! are transient, everything else is fatal.
//!
//! `generate` never returns an error. Exhausted or fatal failures come back
//! as `GenerationOutcome::Failed`, which callers treat as a degraded answer.

use std::sync::Arc;
use std::time::Duration;

use crate::core::{Config, QuillError, Result};
use crate::llm::template::{TemplateStore, Variables};
use crate::llm::traits::{GenerationParams, TextGenerator};

const TRANSIENT_MARKERS: &[&str] = &["loading", "timed out"];

/// Whether a backend error message describes a transient condition
pub fn is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Attempt budget and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.retry.max_attempts,
            Duration::from_millis(config.retry.base_delay_ms),
        )
    }

    /// Delay after failed attempt `n` (1-based): base, 2×base, 4×base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Result of a single backend call
#[derive(Debug)]
enum Attempt {
    Success(String),
    Retryable(String),
    Fatal(String),
}

/// Result of `ModelGateway::generate`
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Success(String),
    /// Sentinel for a generation that did not produce text
    Failed { last_error: String, attempts: u32 },
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationOutcome::Success(_))
    }

    /// Text on success, `ModelGeneration` otherwise
    pub fn into_result(self) -> Result<String> {
        match self {
            GenerationOutcome::Success(text) => Ok(text),
            GenerationOutcome::Failed {
                last_error,
                attempts,
            } => Err(QuillError::ModelGeneration {
                attempts,
                message: last_error,
            }),
        }
    }
}

/// Template rendering plus resilient generation over one backend
#[derive(Clone)]
pub struct ModelGateway {
    generator: Arc<dyn TextGenerator>,
    templates: Arc<TemplateStore>,
    retry: RetryPolicy,
    timeout: Duration,
    defaults: GenerationParams,
}

impl ModelGateway {
    pub fn new(generator: Arc<dyn TextGenerator>, templates: TemplateStore, config: &Config) -> Self {
        let mut defaults = GenerationParams::new(config.models.default.clone(), 0.0);
        defaults.max_tokens = Some(config.models.max_tokens);
        defaults.top_p = Some(config.models.top_p);

        Self {
            generator,
            templates: Arc::new(templates),
            retry: RetryPolicy::from_config(config),
            timeout: config.generate_timeout(),
            defaults,
        }
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Configured model parameters at `temperature`
    pub fn params(&self, temperature: f32) -> GenerationParams {
        self.defaults.with_temperature(temperature)
    }

    /// Render a template by id
    pub fn render(&self, template_id: &str, variables: &Variables) -> Result<String> {
        self.templates.render(template_id, variables)
    }

    /// Generate text, retrying transient failures with exponential backoff
    pub async fn generate(&self, prompt: &str, params: &GenerationParams) -> GenerationOutcome {
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::debug!(attempt, backend = self.generator.name(), "generate");

            match self.attempt(prompt, params).await {
                Attempt::Success(text) => return GenerationOutcome::Success(text),
                Attempt::Fatal(message) => {
                    tracing::warn!(attempt, error = %message, "generation failed");
                    return GenerationOutcome::Failed {
                        last_error: message,
                        attempts: attempt,
                    };
                }
                Attempt::Retryable(message) => {
                    if attempt >= self.retry.max_attempts {
                        tracing::warn!(attempt, error = %message, "generation retries exhausted");
                        return GenerationOutcome::Failed {
                            last_error: message,
                            attempts: attempt,
                        };
                    }

                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient generation error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Render then generate
    pub async fn generate_with_template(
        &self,
        template_id: &str,
        variables: &Variables,
        params: &GenerationParams,
    ) -> Result<GenerationOutcome> {
        let prompt = self.render(template_id, variables)?;
        Ok(self.generate(&prompt, params).await)
    }

    async fn attempt(&self, prompt: &str, params: &GenerationParams) -> Attempt {
        match tokio::time::timeout(self.timeout, self.generator.generate(prompt, params)).await {
            Ok(Ok(text)) => Attempt::Success(text),
            Ok(Err(e)) => {
                let message = e.to_string();
                if is_transient(&message) {
                    Attempt::Retryable(message)
                } else {
                    Attempt::Fatal(message)
                }
            }
            Err(_) => Attempt::Retryable(format!(
                "generate timed out after {}s",
                self.timeout.as_secs()
            )),
        }
    }
}
