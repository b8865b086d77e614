//! Text generation backend trait
//!
//! The language model is an opaque service: a rendered prompt and sampling
//! parameters go in, text or a human-readable error comes out.

use async_trait::async_trait;

use crate::core::Result;

/// Options for a single generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Model to run
    pub model: String,
    /// Temperature for sampling (0.0 = deterministic decoding)
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Nucleus sampling
    pub top_p: Option<f32>,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
}

impl GenerationParams {
    /// Parameters for `model` at `temperature`
    pub fn new(model: impl Into<String>, temperature: f32) -> Self {
        Self {
            model: model.into(),
            temperature,
            max_tokens: None,
            top_p: None,
            stop: None,
        }
    }

    /// Same parameters at a different temperature
    pub fn with_temperature(&self, temperature: f32) -> Self {
        Self {
            temperature,
            ..self.clone()
        }
    }
}

/// Trait for text generation backends
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for a prompt
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Get the backend name
    fn name(&self) -> &str;
}
