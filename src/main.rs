mod cli;
mod collaborators;
mod config;
mod logging;
mod models;
mod ollama;
mod openai;
mod paths;
mod pipeline;
mod prompts;
mod server;

use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::models::ModelManager;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::prompts::PromptStore;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "codestream", version)]
#[command(about = "Streams model-generated web app code as structured progress events", long_about = None)]
struct Cli {
    /// Port for the server
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server (default)
    Serve,
    /// Run one generation and print its event frames to stdout
    Generate {
        /// What to build or change
        prompt: String,

        /// Provider-prefixed model id, e.g. "ollama/qwen3-coder"
        #[arg(long)]
        model: Option<String>,

        /// Edit an existing project instead of generating from scratch
        #[arg(long, default_value_t = false)]
        edit: bool,

        /// JSON file with the request context (files, structure, conversation)
        #[arg(long)]
        context: Option<std::path::PathBuf>,
    },
    /// Validate configuration and probe providers
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_path) = Config::load_with_path().unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config, using defaults: {e}");
        (Config::default(), None)
    });

    let cli = Cli::parse();

    if let Some(Command::Check) = &cli.cmd {
        return cli::check::run(&config, config_path.as_deref()).await;
    }

    config.validate()?;

    let suppress_stdout = matches!(cli.cmd, Some(Command::Generate { .. }));
    let log_dir = logging::setup_tracing_with_settings(logging::LoggingSettings {
        level: config.logging.level.as_deref(),
        directory: config.logging.directory.as_deref(),
        retention_days: config.logging.retention_days,
        suppress_stdout,
    });
    if let Some(dir) = &log_dir {
        info!("Logging to {}", dir.display());
    }
    match &config_path {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let pipeline = build_pipeline(&config);

    match cli.cmd {
        Some(Command::Generate {
            prompt,
            model,
            edit,
            context,
        }) => {
            let args = cli::generate::GenerateArgs {
                prompt,
                model,
                is_edit: edit,
                context_file: context.as_deref(),
            };
            cli::generate::run(pipeline, args, config.server.event_buffer).await
        }
        Some(Command::Check) | Some(Command::Serve) | None => {
            let port = cli.port.unwrap_or(config.server.port);
            let state = Arc::new(server::ServerState::new(pipeline, &config));
            server::start_server(state, &config.server.host, port).await
        }
    }
}

fn build_pipeline(config: &Config) -> Pipeline {
    let manager = ModelManager::new(config.providers.clone());
    let providers: Vec<&str> = manager.list_providers().iter().map(|p| p.id.as_str()).collect();
    info!("Providers: {}", providers.join(", "));

    Pipeline {
        generator: Arc::new(manager),
        prompts: Arc::new(PromptStore::load(Some(&PromptStore::default_override_dir()))),
        collaborators: Collaborators::from_config(&config.collaborators),
        settings: PipelineSettings::from_config(config),
    }
}
