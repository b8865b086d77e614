//! Quill - multi-agent long-form writing on local models
//!
//! Main entry point for the CLI application.

use std::path::PathBuf;

use clap::Parser;
use quill::core::{Mode, RunStatus, Task};
use quill::llm::OllamaClient;
use quill::orchestration::RunRequest;
use quill::{Config, Engine};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Quill - multi-agent long-form writing on local models
#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Theme or task to write about
    #[arg(long, short = 'p')]
    prompt: Option<String>,

    /// Requirement the result must satisfy (repeatable)
    #[arg(long = "requirement", short = 'r')]
    requirements: Vec<String>,

    /// Session id to continue (a new one is generated otherwise)
    #[arg(long, short = 's')]
    session: Option<String>,

    /// Generation mode: creative, coding or research
    #[arg(long, short = 'm')]
    mode: Option<Mode>,

    /// Model used by every agent
    #[arg(long)]
    model: Option<String>,

    /// Directory of prompt templates layered over the built-ins
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug output
    #[arg(long, short = 'd')]
    debug: bool,

    /// Check that Ollama is reachable and the model is pulled, then exit
    #[arg(long)]
    check: bool,

    /// Write the effective configuration to the config file, then exit
    #[arg(long)]
    save_config: bool,
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("quill=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quill=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn check_backend(config: &Config) -> anyhow::Result<()> {
    let client = OllamaClient::from_config(config)?;
    let models = client.list_models().await?;
    println!("Ollama at {} ({} models)", client.base_url(), models.len());

    if client.is_model_available(&config.models.default).await? {
        println!("  ✓ {}", config.models.default);
        Ok(())
    } else {
        anyhow::bail!(
            "model '{}' not found. Run: ollama pull {}",
            config.models.default,
            config.models.default
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Build configuration
    let mut config = Config::load();

    // Apply CLI overrides
    if let Some(ref model) = args.model {
        config.models.default = model.clone();
    }

    if let Some(ref dir) = args.templates {
        config.templates.dir = Some(dir.clone());
    }

    if args.debug {
        config.debug = true;
    }

    init_tracing(config.debug);

    if args.save_config {
        let path = config.save()?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    if args.check {
        return check_backend(&config).await;
    }

    let Some(prompt) = args.prompt else {
        anyhow::bail!("nothing to do: pass --prompt \"<theme>\" (see --help)");
    };

    let engine = Engine::from_config(config)?;

    // task ids are unique within a session
    let task_id = format!("task-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let task = Task::new(task_id, prompt.clone(), prompt).with_requirements(args.requirements);
    let mut request = RunRequest::new(task);
    if let Some(session) = args.session {
        request = request.in_session(session);
    }
    if let Some(mode) = args.mode {
        request = request.mode(mode);
    }

    // Ctrl-C stops dispatching new subtasks
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = engine.run_with_cancel(request, cancel).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        if let Some(ref content) = result.content {
            println!("{}", content);
        }
        eprintln!(
            "\n[{}] session {} - {}/{} subtasks completed",
            result.status,
            result.session_id,
            result.completed_count(),
            result.subtasks.len()
        );
        for outcome in result.subtasks.iter().filter(|s| s.error.is_some()) {
            eprintln!(
                "  ✗ {} ({}): {}",
                outcome.title,
                outcome.task_id,
                outcome.error.as_deref().unwrap_or_default()
            );
        }
        if let Some(ref error) = result.error {
            eprintln!("  {}", error);
        }
    }

    if matches!(result.status, RunStatus::Failed) {
        std::process::exit(1);
    }
    Ok(())
}
