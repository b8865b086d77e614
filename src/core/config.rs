//! Configuration management for Quill
//!
//! Supports environment variables, config files, and runtime overrides.
//! Every knob the engine consumes (retries, backoff, temperatures, review
//! threshold, session TTL and cache size) lives here and is handed to the
//! engine at construction time.
//!
//! Config file location: ~/.config/quill/config.toml

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{QuillError, Result};
use crate::core::types::Mode;

/// Main configuration for Quill
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ollama configuration
    pub ollama: OllamaConfig,
    /// Model configuration
    pub models: ModelConfig,
    /// Retry and timeout policy around generation
    #[serde(default)]
    pub retry: RetryConfig,
    /// Sampling temperatures per agent and mode
    #[serde(default)]
    pub temperatures: TemperatureConfig,
    /// Review gate
    #[serde(default)]
    pub review: ReviewConfig,
    /// Session lifetime and storage
    #[serde(default)]
    pub session: SessionConfig,
    /// Engine scheduling
    #[serde(default)]
    pub engine: EngineConfig,
    /// Prompt template overrides
    #[serde(default)]
    pub templates: TemplateConfig,
    /// Whether to emit debug logging
    #[serde(default)]
    pub debug: bool,
}

/// Ollama server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Host address (default: localhost)
    pub host: String,
    /// Port number (default: 11434)
    pub port: u16,
    /// HTTP request timeout in seconds
    pub timeout_secs: u64,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model used by every agent
    /// Default: gemma3:27b
    pub default: String,
    /// Maximum tokens per generation
    pub max_tokens: u32,
    /// Nucleus sampling
    pub top_p: f32,
}

/// Retry/backoff policy for the model gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per generate call, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles after each failure
    pub base_delay_ms: u64,
    /// Bounded wait for a single generate call before it counts as a timeout
    pub generate_timeout_secs: u64,
}

/// Temperatures per agent role and per mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureConfig {
    pub planner: f32,
    pub creative: f32,
    pub coding: f32,
    pub research: f32,
    pub reviewer: f32,
    pub director: f32,
}

/// Review gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Scores strictly below this trigger one improvement round
    pub threshold: f64,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Time-to-live of a session in seconds
    pub ttl_secs: u64,
    /// Active sessions kept in memory per owner
    pub max_active_per_user: usize,
    /// Directory for durable session snapshots (None = memory only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
}

/// Engine scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Subtasks allowed in flight at once within a session
    pub max_parallel_subtasks: usize,
}

/// Template configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Directory of `{component}/{name}.txt` templates layered over the built-ins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| v == "true" || v == "1")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env_parse("OLLAMA_PORT").unwrap_or(11434),
            timeout_secs: 300,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default: env::var("QUILL_MODEL").unwrap_or_else(|_| "gemma3:27b".to_string()),
            max_tokens: 2000,
            top_p: 0.9,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: env_parse("QUILL_MAX_ATTEMPTS").unwrap_or(3),
            base_delay_ms: env_parse("QUILL_BASE_DELAY_MS").unwrap_or(2000),
            generate_timeout_secs: env_parse("QUILL_GENERATE_TIMEOUT").unwrap_or(60),
        }
    }
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            planner: 0.0,
            creative: 0.8,
            coding: 0.3,
            research: 0.5,
            reviewer: 0.3,
            director: 0.5,
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            threshold: env_parse("QUILL_REVIEW_THRESHOLD").unwrap_or(0.7),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: env_parse("QUILL_SESSION_TTL").unwrap_or(60 * 60 * 24),
            max_active_per_user: env_parse("QUILL_MAX_SESSIONS").unwrap_or(10),
            storage_dir: env::var("QUILL_SESSION_DIR").ok().map(PathBuf::from),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_subtasks: env_parse("QUILL_PARALLEL_SUBTASKS").unwrap_or(1),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quill")
    }

    /// Get the config file path
    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from file, environment, and defaults
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = Self::load_from_file().unwrap_or_default();
        if let Some(debug) = env_flag("QUILL_DEBUG") {
            config.debug = debug;
        }
        config
    }

    /// Load configuration from file only
    pub fn load_from_file() -> Result<Self> {
        let config_path = Self::config_file();

        if !config_path.exists() {
            return Err(QuillError::config("Config file not found"));
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| QuillError::config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| QuillError::config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file and return the path
    pub fn save(&self) -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_file();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .map_err(|e| QuillError::config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| QuillError::config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&config_path, content)
            .map_err(|e| QuillError::config(format!("Failed to write config: {}", e)))?;

        Ok(config_path)
    }

    /// Generate a default config file content for display
    pub fn default_config_toml() -> String {
        toml::to_string_pretty(&Config::default())
            .unwrap_or_else(|_| String::from("# Error generating config"))
    }

    /// Get the full Ollama API URL
    pub fn ollama_url(&self) -> String {
        format!("http://{}:{}", self.ollama.host, self.ollama.port)
    }

    /// Worker temperature for a mode: open-ended generation runs hotter
    pub fn worker_temperature(&self, mode: Mode) -> f32 {
        match mode {
            Mode::Creative => self.temperatures.creative,
            Mode::Coding => self.temperatures.coding,
            Mode::Research => self.temperatures.research,
        }
    }

    /// Bounded wait for one generate call
    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.retry.generate_timeout_secs)
    }

    /// Session time-to-live
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ollama.port, 11434);
        assert_eq!(config.temperatures.planner, 0.0);
        assert_eq!(config.session.max_active_per_user, 10);
        assert_eq!(config.session.ttl_secs, 86_400);
        assert_eq!(config.engine.max_parallel_subtasks, 1);
    }

    #[test]
    fn test_ollama_url() {
        let mut config = Config::default();
        config.ollama.host = "localhost".into();
        config.ollama.port = 11434;
        assert_eq!(config.ollama_url(), "http://localhost:11434");
    }

    #[test]
    fn test_worker_temperature_by_mode() {
        let config = Config::default();
        assert!(config.worker_temperature(Mode::Creative) > config.worker_temperature(Mode::Coding));
        assert_eq!(config.worker_temperature(Mode::Research), 0.5);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let text = r#"
            [ollama]
            host = "gpu-box"
            port = 11500
            timeout_secs = 30

            [models]
            default = "llama3:8b"
            max_tokens = 512
            top_p = 0.8

            [review]
            threshold = 0.5
        "#;
        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.ollama_url(), "http://gpu-box:11500");
        assert_eq!(config.review.threshold, 0.5);
        assert_eq!(config.temperatures.creative, 0.8);
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = Config::default_config_toml();
        assert!(toml_str.contains("threshold"));
        assert!(toml_str.contains("max_attempts"));
    }

    #[test]
    fn test_config_dir() {
        let dir = Config::config_dir();
        assert!(dir.to_string_lossy().contains("quill"));
    }
}
