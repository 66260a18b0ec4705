//! Configuration management for llamachat
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::engine::ContextParams;
use crate::error::{LlamaChatError, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the persisted KV-cache session
pub const SESSION_FILE_NAME: &str = "llama-session.bin";

/// Main configuration structure for llamachat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Inference engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Completion request settings
    #[serde(default)]
    pub completion: CompletionConfig,
    /// Session file settings
    #[serde(default)]
    pub session: SessionConfig,
    /// `/bench` settings
    #[serde(default)]
    pub bench: BenchConfig,
    /// Model import settings
    #[serde(default)]
    pub models: ModelsConfig,
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Backend to use (`llama-server` or `scripted`)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// `llama-server` executable
    #[serde(default = "default_server_binary")]
    pub server_binary: PathBuf,

    /// Attach to an already running server instead of spawning one
    ///
    /// Useful for sharing one server between runs, and for tests that point
    /// the engine at a mock.
    #[serde(default)]
    pub server_url: Option<String>,

    /// Interface spawned servers listen on
    #[serde(default = "default_host")]
    pub host: String,

    /// How long to wait for a spawned server to load its model
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,

    /// How long a server gets to exit after SIGTERM before it is killed
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Extra arguments appended to the server command line
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Layers offloaded to the GPU
    #[serde(default = "default_n_gpu_layers")]
    pub n_gpu_layers: u32,

    /// Lock model memory
    #[serde(default = "default_use_mlock")]
    pub use_mlock: bool,
}

fn default_backend() -> String {
    "llama-server".to_string()
}

fn default_server_binary() -> PathBuf {
    PathBuf::from("llama-server")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_n_gpu_layers() -> u32 {
    100
}

fn default_use_mlock() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            server_binary: default_server_binary(),
            server_url: None,
            host: default_host(),
            startup_timeout_seconds: default_startup_timeout(),
            shutdown_grace_seconds: default_shutdown_grace(),
            extra_args: Vec::new(),
            n_gpu_layers: default_n_gpu_layers(),
            use_mlock: default_use_mlock(),
        }
    }
}

impl EngineConfig {
    /// Hardware options for new contexts
    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            use_mlock: self.use_mlock,
            n_gpu_layers: self.n_gpu_layers,
        }
    }
}

/// Completion request configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Constrain replies to the function-call JSON schema
    #[serde(default)]
    pub use_json_schema: bool,
}

/// Session file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session file path (defaults to the documents directory)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// `/bench` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Warm-up runs slower than this abort the benchmark
    #[serde(default = "default_warmup_limit_ms")]
    pub warmup_limit_ms: u64,
}

fn default_warmup_limit_ms() -> u64 {
    10_000
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            warmup_limit_ms: default_warmup_limit_ms(),
        }
    }
}

/// Model import configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Copy picked models into the cache directory before loading
    #[serde(default)]
    pub copy_to_cache: bool,

    /// Cache directory (defaults to the platform cache directory)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LlamaChatError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| LlamaChatError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(backend) = std::env::var("LLAMACHAT_ENGINE_BACKEND") {
            self.engine.backend = backend;
        }

        if let Ok(binary) = std::env::var("LLAMACHAT_SERVER_BINARY") {
            self.engine.server_binary = PathBuf::from(binary);
        }

        if let Ok(url) = std::env::var("LLAMACHAT_SERVER_URL") {
            self.engine.server_url = Some(url);
        }

        if let Ok(layers) = std::env::var("LLAMACHAT_N_GPU_LAYERS") {
            if let Ok(value) = layers.parse() {
                self.engine.n_gpu_layers = value;
            } else {
                tracing::warn!("Invalid LLAMACHAT_N_GPU_LAYERS: {}", layers);
            }
        }

        if let Ok(mlock) = std::env::var("LLAMACHAT_USE_MLOCK") {
            if let Ok(value) = mlock.parse() {
                self.engine.use_mlock = value;
            } else {
                tracing::warn!("Invalid LLAMACHAT_USE_MLOCK: {}", mlock);
            }
        }

        if let Ok(path) = std::env::var("LLAMACHAT_SESSION_PATH") {
            self.session.path = Some(PathBuf::from(path));
        }

        if let Ok(limit) = std::env::var("LLAMACHAT_WARMUP_LIMIT_MS") {
            if let Ok(value) = limit.parse() {
                self.bench.warmup_limit_ms = value;
            } else {
                tracing::warn!("Invalid LLAMACHAT_WARMUP_LIMIT_MS: {}", limit);
            }
        }

        if let Ok(copy) = std::env::var("LLAMACHAT_COPY_TO_CACHE") {
            if let Ok(value) = copy.parse() {
                self.models.copy_to_cache = value;
            } else {
                tracing::warn!("Invalid LLAMACHAT_COPY_TO_CACHE: {}", copy);
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }

        if let Some(layers) = cli.command.n_gpu_layers() {
            self.engine.n_gpu_layers = layers;
        }
    }

    /// Where `/save-session` and `/load-session` read and write
    pub fn session_path(&self) -> PathBuf {
        if let Some(path) = &self.session.path {
            return path.clone();
        }
        let dir = UserDirs::new()
            .and_then(|dirs| dirs.document_dir().map(Path::to_path_buf))
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));
        dir.join(SESSION_FILE_NAME)
    }

    /// Directory containing the session file
    pub fn session_dir(&self) -> PathBuf {
        self.session_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Directory imported models are copied under
    pub fn model_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.models.cache_dir {
            return dir.clone();
        }
        project_dirs()
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let valid_backends = ["llama-server", "scripted"];
        if !valid_backends.contains(&self.engine.backend.as_str()) {
            return Err(LlamaChatError::Config(format!(
                "Invalid engine backend: {}. Must be one of: {}",
                self.engine.backend,
                valid_backends.join(", ")
            ))
            .into());
        }

        if let Some(url) = &self.engine.server_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(LlamaChatError::Config(format!(
                    "engine.server_url must be an http(s) URL, got {}",
                    url
                ))
                .into());
            }
        } else if self.engine.server_binary.as_os_str().is_empty() {
            return Err(LlamaChatError::Config(
                "engine.server_binary cannot be empty".to_string(),
            )
            .into());
        }

        if self.engine.host.is_empty() {
            return Err(LlamaChatError::Config("engine.host cannot be empty".to_string()).into());
        }

        if self.engine.startup_timeout_seconds == 0 {
            return Err(LlamaChatError::Config(
                "engine.startup_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.bench.warmup_limit_ms == 0 {
            return Err(LlamaChatError::Config(
                "bench.warmup_limit_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if let Some(path) = &self.session.path {
            if path.file_name().is_none() {
                return Err(LlamaChatError::Config(format!(
                    "session.path must name a file, got {}",
                    path.display()
                ))
                .into());
            }
        }

        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "llamachat", "llamachat")
}
