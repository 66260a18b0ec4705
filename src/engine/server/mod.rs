//! `llama-server` engine backend
//!
//! Every context is a dedicated `llama-server` process from llama.cpp
//! serving one model over HTTP on a loopback port. Releasing the context
//! stops the process. When `engine.server_url` is configured the engine
//! attaches to an already running server instead of spawning one.

pub mod client;
pub mod process;

pub use client::{LlamaServerClient, ModelInfo, RunThroughput, SseDecoder};
pub use process::ServerProcess;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::engine::base::{
    BenchResult, CompletionParams, CompletionResult, ContextParams, InferenceContext,
    InferenceEngine, SessionLoadResult, TokenSink, TokenizeResult,
};
use crate::error::{LlamaChatError, Result};
use crate::message::ContextId;

const BENCH_TOKEN_TEXT: &str = " the";

/// Engine that runs models through `llama-server`
#[derive(Debug)]
pub struct LlamaServerEngine {
    config: EngineConfig,
    session_dir: PathBuf,
    next_id: AtomicU64,
}

impl LlamaServerEngine {
    /// Create an engine
    ///
    /// # Arguments
    ///
    /// * `config` - Server binary, network and startup settings
    /// * `session_dir` - Directory the server may read and write session files in
    pub fn new(config: EngineConfig, session_dir: PathBuf) -> Self {
        Self {
            config,
            session_dir,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_context_id(&self) -> ContextId {
        ContextId::new(format!("ctx{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn server_args(&self, model_path: &Path, port: u16, params: &ContextParams) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            model_path.display().to_string(),
            "--host".to_string(),
            self.config.host.clone(),
            "--port".to_string(),
            port.to_string(),
            "-ngl".to_string(),
            params.n_gpu_layers.to_string(),
            "--slot-save-path".to_string(),
            self.session_dir.display().to_string(),
        ];
        if params.use_mlock {
            args.push("--mlock".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl InferenceEngine for LlamaServerEngine {
    async fn initialize(
        &self,
        model_path: &Path,
        params: &ContextParams,
    ) -> Result<Arc<dyn InferenceContext>> {
        let id = self.next_context_id();

        if let Some(url) = &self.config.server_url {
            tracing::info!("Attaching context {} to llama-server at {}", id, url);
            let client = LlamaServerClient::new(url.clone())?;
            if !client.health().await {
                return Err(LlamaChatError::ContextInit(format!(
                    "llama-server at {} is not ready",
                    url
                ))
                .into());
            }
            return Ok(Arc::new(LlamaServerContext::attach(
                id,
                client,
                params,
                self.session_dir.clone(),
            )));
        }

        if !model_path.is_file() {
            return Err(LlamaChatError::ContextInit(format!(
                "model file not found: {}",
                model_path.display()
            ))
            .into());
        }
        std::fs::create_dir_all(&self.session_dir)?;

        let port = process::free_port(&self.config.host)?;
        let args = self.server_args(model_path, port, params);
        let mut server = ServerProcess::spawn(&self.config.server_binary, &args)?;
        let client = LlamaServerClient::new(format!("http://{}:{}", self.config.host, port))?;

        server
            .wait_ready(
                &client,
                Duration::from_secs(self.config.startup_timeout_seconds),
            )
            .await?;

        tracing::info!(
            "Context {} serving {} on port {}",
            id,
            model_path.display(),
            port
        );

        let mut context = LlamaServerContext::attach(id, client, params, self.session_dir.clone());
        context.process = tokio::sync::Mutex::new(Some(server));
        context.shutdown_grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        Ok(Arc::new(context))
    }
}

/// A context backed by one `llama-server`
#[derive(Debug)]
pub struct LlamaServerContext {
    id: ContextId,
    client: LlamaServerClient,
    n_gpu_layers: u32,
    session_dir: PathBuf,
    process: tokio::sync::Mutex<Option<ServerProcess>>,
    shutdown_grace: Duration,
    in_flight: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl LlamaServerContext {
    /// Wrap a server that is already running
    ///
    /// Releasing an attached context leaves the server running.
    pub fn attach(
        id: ContextId,
        client: LlamaServerClient,
        params: &ContextParams,
        session_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            client,
            n_gpu_layers: params.n_gpu_layers,
            session_dir,
            process: tokio::sync::Mutex::new(None),
            shutdown_grace: Duration::from_secs(5),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Register a new in-flight completion, returning its generation
    fn begin_completion(&self, token: CancellationToken) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = Some((generation, token));
        generation
    }

    /// Clear the in-flight slot unless a newer completion already took it
    fn end_completion(&self, generation: u64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(in_flight.as_ref(), Some((current, _)) if *current == generation) {
            *in_flight = None;
        }
    }

    /// File name of `path` relative to the session directory
    fn session_file_name(&self, path: &Path) -> Result<String> {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        if parent != self.session_dir {
            return Err(LlamaChatError::Session(format!(
                "session file must live in {}",
                self.session_dir.display()
            ))
            .into());
        }
        path.file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                LlamaChatError::Session(format!("invalid session path: {}", path.display())).into()
            })
    }
}

#[async_trait]
impl InferenceContext for LlamaServerContext {
    fn id(&self) -> &ContextId {
        &self.id
    }

    fn gpu_enabled(&self) -> bool {
        self.n_gpu_layers > 0
    }

    fn gpu_disabled_reason(&self) -> Option<String> {
        (self.n_gpu_layers == 0).then(|| "n_gpu_layers is 0".to_string())
    }

    async fn release(&self) -> Result<()> {
        if let Some((_, token)) = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }

        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(server) => {
                server
                    .terminate(self.shutdown_grace)
                    .await
                    .map_err(|e| LlamaChatError::ContextRelease(e.to_string()))?;
                *process = None;
                tracing::debug!("Context {} server stopped", self.id);
            }
            None => tracing::debug!("Context {} has no server process to stop", self.id),
        }
        Ok(())
    }

    async fn completion(
        &self,
        params: CompletionParams,
        on_token: TokenSink,
    ) -> Result<CompletionResult> {
        let cancel = CancellationToken::new();
        let generation = self.begin_completion(cancel.clone());
        let result = self.client.completion(&params, on_token, cancel).await;
        self.end_completion(generation);
        result
    }

    async fn stop_completion(&self) -> Result<()> {
        if let Some((_, token)) = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            token.cancel();
        }
        Ok(())
    }

    async fn tokenize(&self, text: &str) -> Result<TokenizeResult> {
        Ok(TokenizeResult {
            tokens: self.client.tokenize(text).await?,
        })
    }

    async fn bench(&self, pp: u32, tg: u32, pl: u32, nr: u32) -> Result<BenchResult> {
        if pl > 1 {
            tracing::debug!("bench: {} parallel sequences requested, running sequentially", pl);
        }

        let info = self.client.model_info().await?;
        let token = self
            .client
            .tokenize(BENCH_TOKEN_TEXT)
            .await?
            .first()
            .copied()
            .unwrap_or(0);

        let runs = nr.max(1);
        let mut pp_rates = Vec::with_capacity(runs as usize);
        let mut tg_rates = Vec::with_capacity(runs as usize);
        for run in 0..runs {
            let throughput = self
                .client
                .bench_run(token, pp, tg)
                .await
                .map_err(|e| LlamaChatError::Bench(e.to_string()))?;
            tracing::debug!(
                "bench run {}/{}: pp {:.2} t/s, tg {:.2} t/s",
                run + 1,
                runs,
                throughput.prompt_per_second,
                throughput.predicted_per_second
            );
            pp_rates.push(throughput.prompt_per_second);
            tg_rates.push(throughput.predicted_per_second);
        }

        let (pp_avg, pp_std) = mean_and_std(&pp_rates);
        let (tg_avg, tg_std) = mean_and_std(&tg_rates);
        Ok(BenchResult {
            model_desc: info.desc,
            model_size: info.size,
            model_n_params: info.n_params,
            pp_avg,
            pp_std,
            tg_avg,
            tg_std,
        })
    }

    async fn save_session(&self, path: &Path) -> Result<usize> {
        let filename = self.session_file_name(path)?;
        self.client.save_slot(&filename).await
    }

    async fn load_session(&self, path: &Path) -> Result<SessionLoadResult> {
        let filename = self.session_file_name(path)?;
        if !path.exists() {
            return Err(
                LlamaChatError::Session(format!("{} does not exist", path.display())).into(),
            );
        }
        Ok(SessionLoadResult {
            tokens_loaded: self.client.restore_slot(&filename).await?,
        })
    }
}

/// Mean and sample standard deviation
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(session_dir: &str) -> LlamaServerEngine {
        LlamaServerEngine::new(EngineConfig::default(), PathBuf::from(session_dir))
    }

    #[test]
    fn test_server_args() {
        let engine = engine("/tmp/sessions");
        let args = engine.server_args(
            Path::new("/models/a.gguf"),
            8081,
            &ContextParams {
                use_mlock: true,
                n_gpu_layers: 99,
            },
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-m /models/a.gguf --host 127.0.0.1 --port 8081 -ngl 99"));
        assert!(joined.contains("--slot-save-path /tmp/sessions"));
        assert!(args.contains(&"--mlock".to_string()));
    }

    #[test]
    fn test_server_args_without_mlock() {
        let args = engine("/s").server_args(
            Path::new("m.gguf"),
            1,
            &ContextParams {
                use_mlock: false,
                n_gpu_layers: 0,
            },
        );
        assert!(!args.contains(&"--mlock".to_string()));
    }

    #[test]
    fn test_context_ids_increment() {
        let engine = engine("/s");
        assert_eq!(engine.next_context_id().as_str(), "ctx1");
        assert_eq!(engine.next_context_id().as_str(), "ctx2");
    }

    #[test]
    fn test_mean_and_std() {
        assert_eq!(mean_and_std(&[]), (0.0, 0.0));
        assert_eq!(mean_and_std(&[4.0]), (4.0, 0.0));
        let (mean, std) = mean_and_std(&[2.0, 4.0, 6.0]);
        assert_eq!(mean, 4.0);
        assert!((std - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_gpu_flag_follows_layers() {
        let client = LlamaServerClient::new("http://127.0.0.1:1").unwrap();
        let cpu = LlamaServerContext::attach(
            ContextId::new("ctx1"),
            client.clone(),
            &ContextParams {
                use_mlock: false,
                n_gpu_layers: 0,
            },
            PathBuf::from("/s"),
        );
        assert!(!cpu.gpu_enabled());
        assert_eq!(cpu.gpu_disabled_reason().as_deref(), Some("n_gpu_layers is 0"));

        let gpu = LlamaServerContext::attach(
            ContextId::new("ctx2"),
            client,
            &ContextParams::default(),
            PathBuf::from("/s"),
        );
        assert!(gpu.gpu_enabled());
        assert!(gpu.gpu_disabled_reason().is_none());
    }

    #[test]
    fn test_session_file_must_be_in_session_dir() {
        let client = LlamaServerClient::new("http://127.0.0.1:1").unwrap();
        let ctx = LlamaServerContext::attach(
            ContextId::new("ctx1"),
            client,
            &ContextParams::default(),
            PathBuf::from("/data/sessions"),
        );
        assert_eq!(
            ctx.session_file_name(Path::new("/data/sessions/llama-session.bin"))
                .unwrap(),
            "llama-session.bin"
        );
        assert!(ctx
            .session_file_name(Path::new("/elsewhere/llama-session.bin"))
            .is_err());
    }

    #[tokio::test]
    async fn test_initialize_missing_model_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path().to_str().unwrap());
        let result = engine
            .initialize(Path::new("/nonexistent/model.gguf"), &ContextParams::default())
            .await;
        let err = result.err().unwrap().to_string();
        assert!(err.contains("model file not found"), "unexpected: {err}");
    }
}
