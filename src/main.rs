//! llamachat - chat with a local language model
//!
#![doc = "llamachat - chat with a local language model"]
#![doc = "Main entry point for the llamachat application."]

use anyhow::Result;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use llamachat::cli::{Cli, Commands};
use llamachat::commands;
use llamachat::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose, cli.json_logs);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Chat { model, .. } => {
            tracing::info!("Starting chat (backend: {})", config.engine.backend);
            if let Some(path) = &model {
                tracing::debug!("Loading model on startup: {}", path.display());
            }
            commands::chat::run_chat(config, model).await?;
            Ok(())
        }
        Commands::Bench { model, .. } => {
            tracing::info!("Starting benchmark");
            commands::bench::run_bench(config, model).await?;
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr so they do not interleave with streamed replies.
fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "llamachat=debug"
    } else {
        "llamachat=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
