//! Command-line interface definition for llamachat
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for interactive chat and one-shot benchmarking.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// llamachat - chat with a local language model
///
/// Loads a GGUF model into an inference context and streams replies
/// token by token.
#[derive(Parser, Debug, Clone)]
#[command(name = "llamachat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "LLAMACHAT_CONFIG", default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for llamachat
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start an interactive chat
    Chat {
        /// Model file to load on startup
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Override the number of layers offloaded to the GPU
        #[arg(long)]
        n_gpu_layers: Option<u32>,
    },

    /// Load a model, benchmark it and print the result table
    Bench {
        /// Model file to benchmark
        #[arg(short, long)]
        model: PathBuf,

        /// Override the number of layers offloaded to the GPU
        #[arg(long)]
        n_gpu_layers: Option<u32>,
    },
}

impl Commands {
    /// GPU layer override given on the command line, if any
    pub fn n_gpu_layers(&self) -> Option<u32> {
        match self {
            Commands::Chat { n_gpu_layers, .. } | Commands::Bench { n_gpu_layers, .. } => {
                *n_gpu_layers
            }
        }
    }
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            json_logs: false,
            command: Commands::Chat {
                model: None,
                n_gpu_layers: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_chat() {
        let cli = Cli::try_parse_from(["llamachat", "chat"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Chat {
                model: None,
                n_gpu_layers: None
            }
        ));
        assert_eq!(cli.config.as_deref(), Some("config/config.yaml"));
    }

    #[test]
    fn test_cli_parse_chat_with_model() {
        let cli = Cli::try_parse_from([
            "llamachat",
            "chat",
            "--model",
            "/models/tiny.gguf",
            "--n-gpu-layers",
            "0",
        ])
        .unwrap();
        match cli.command {
            Commands::Chat {
                model,
                n_gpu_layers,
            } => {
                assert_eq!(model, Some(PathBuf::from("/models/tiny.gguf")));
                assert_eq!(n_gpu_layers, Some(0));
            }
            _ => panic!("Expected Chat command"),
        }
    }

    #[test]
    fn test_cli_parse_bench_requires_model() {
        assert!(Cli::try_parse_from(["llamachat", "bench"]).is_err());

        let cli = Cli::try_parse_from(["llamachat", "bench", "-m", "a.gguf"]).unwrap();
        assert!(matches!(cli.command, Commands::Bench { .. }));
        assert_eq!(cli.command.n_gpu_layers(), None);
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from([
            "llamachat",
            "-v",
            "--json-logs",
            "--config",
            "custom.yaml",
            "chat",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(cli.json_logs);
        assert_eq!(cli.config.as_deref(), Some("custom.yaml"));
    }

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Commands::Chat { .. }));
    }
}
