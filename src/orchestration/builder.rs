//! Engine construction
//!
//! Every collaborator can be supplied explicitly; anything left out is
//! derived from the configuration (Ollama backend, built-in templates plus
//! the configured template directory, file-backed sessions when a storage
//! directory is set).

use std::sync::Arc;

use crate::agent::{Agent, Director, Planner, Reviewer, Worker};
use crate::core::{Config, Result};
use crate::llm::{ModelGateway, OllamaClient, TemplateStore, TextGenerator};
use crate::orchestration::dispatcher::CommandDispatcher;
use crate::orchestration::engine::Engine;
use crate::session::{FileBackend, SessionStore};

/// Builder for creating an `Engine`
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<Config>,
    generator: Option<Arc<dyn TextGenerator>>,
    templates: Option<TemplateStore>,
    sessions: Option<Arc<SessionStore>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the text generation backend
    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Set the prompt templates
    pub fn templates(mut self, templates: TemplateStore) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Share a session store (e.g. between engines)
    pub fn sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Build the Engine
    pub fn build(self) -> Result<Engine> {
        let config = Arc::new(self.config.unwrap_or_default());

        let generator: Arc<dyn TextGenerator> = match self.generator {
            Some(generator) => generator,
            None => Arc::new(OllamaClient::from_config(&config)?),
        };

        let templates = match self.templates {
            Some(templates) => templates,
            None => {
                let mut templates = TemplateStore::builtin();
                if let Some(ref dir) = config.templates.dir {
                    templates.load_dir(dir)?;
                }
                templates
            }
        };

        let sessions = match self.sessions {
            Some(sessions) => sessions,
            None => {
                let store = SessionStore::from_config(&config);
                let store = match config.session.storage_dir {
                    Some(ref dir) => store.with_backend(Arc::new(FileBackend::new(dir.clone()))),
                    None => store,
                };
                Arc::new(store)
            }
        };

        tracing::debug!(
            backend = generator.name(),
            templates = templates.ids().len(),
            "building engine"
        );

        let gateway = ModelGateway::new(generator, templates, &config);
        let dispatcher = CommandDispatcher::new([
            Agent::Director(Director::new(gateway.clone(), config.clone())),
            Agent::Planner(Planner::new(gateway.clone(), config.clone())),
            Agent::Worker(Worker::new(gateway.clone(), config.clone())),
            Agent::Reviewer(Reviewer::new(gateway, config.clone())),
        ]);

        Ok(Engine::new(config, sessions, Arc::new(dispatcher)))
    }
}

impl Engine {
    /// Create a builder for more control
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Engine wired entirely from configuration
    pub fn from_config(config: Config) -> Result<Self> {
        EngineBuilder::new().config(config).build()
    }
}
