//! LLM module - language model access
//!
//! Backend abstraction with Ollama as the primary implementation, prompt
//! templates, and the gateway that adds retry/backoff on top.

pub mod gateway;
pub mod mock;
pub mod ollama;
pub mod parse;
pub mod template;
pub mod traits;

pub use gateway::{GenerationOutcome, ModelGateway, RetryPolicy};
pub use mock::{MockGenerator, MockReply};
pub use ollama::OllamaClient;
pub use parse::extract_json;
pub use template::{PromptTemplate, TemplateStore, Variables};
pub use traits::{GenerationParams, TextGenerator};
