//! In-process scripted engine for tests
//!
//! [`ScriptedEngine`] implements [`InferenceEngine`] without loading any
//! model. Its behavior comes from a [`Script`] (tokens to stream, delays,
//! injected failures) and every call it receives is appended to a shared
//! [`EngineCall`] log, so tests can assert on ordering, for example that a
//! release always happens before the next initialize.
//!
//! Delays use `tokio::time::sleep`, which makes the engine usable with a
//! paused tokio clock.
//!
//! # Example
//!
//! ```
//! use llamachat::engine::fake::{Script, ScriptedEngine};
//! use llamachat::engine::{ContextParams, InferenceEngine};
//! use std::path::Path;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let engine = ScriptedEngine::new(Script::default());
//! let ctx = engine
//!     .initialize(Path::new("model.gguf"), &ContextParams::default())
//!     .await
//!     .unwrap();
//! assert_eq!(ctx.id().as_str(), "ctx1");
//! assert_eq!(engine.live_contexts(), 1);
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::base::{
    BenchResult, CompletionParams, CompletionResult, CompletionTimings, ContextParams,
    InferenceContext, InferenceEngine, SessionLoadResult, TokenData, TokenSink, TokenizeResult,
};
use crate::error::{LlamaChatError, Result};
use crate::message::ContextId;

/// Behavior of a [`ScriptedEngine`] and the contexts it creates
#[derive(Debug, Clone)]
pub struct Script {
    /// Tokens streamed by every completion
    pub tokens: Vec<String>,
    /// Delay before each token
    pub token_delay: Duration,
    /// Keep the completion open after the last token until stopped
    pub hold_until_stopped: bool,
    /// Fail the completion with this message after all tokens were sent
    pub completion_error: Option<String>,
    /// Timings returned by a successful completion
    pub timings: CompletionTimings,
    /// Fail context initialization with this message
    pub init_error: Option<String>,
    /// Fail context release with this message
    pub release_error: Option<String>,
    /// Fail session save and load with this message
    pub session_error: Option<String>,
    /// Tokens reported by session save and load
    pub session_tokens: usize,
    /// Result returned by every bench call
    pub bench: BenchResult,
    /// Duration of the warm-up bench (`pp <= 8`)
    pub warmup_delay: Duration,
    /// Duration of a full bench run
    pub bench_delay: Duration,
    /// Fail bench with this message
    pub bench_error: Option<String>,
    /// Whether contexts report GPU acceleration
    pub gpu: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            tokens: vec![" Hello".to_string(), "!".to_string()],
            token_delay: Duration::ZERO,
            hold_until_stopped: false,
            completion_error: None,
            timings: CompletionTimings {
                predicted_n: 2,
                predicted_per_token_ms: 25.0,
                predicted_per_second: 40.0,
                ..CompletionTimings::default()
            },
            init_error: None,
            release_error: None,
            session_error: None,
            session_tokens: 42,
            bench: BenchResult {
                model_desc: "llama 1B Q4_0".to_string(),
                model_size: 700 * 1024 * 1024,
                model_n_params: 1_100_000_000,
                pp_avg: 512.0,
                pp_std: 3.0,
                tg_avg: 40.0,
                tg_std: 0.5,
            },
            warmup_delay: Duration::from_millis(200),
            bench_delay: Duration::from_secs(2),
            bench_error: None,
            gpu: true,
        }
    }
}

/// A call observed by the scripted engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    /// `initialize` with the model path
    Initialize(PathBuf),
    /// `release` on a context
    Release(ContextId),
    /// `completion` on a context
    Completion {
        /// Context the completion ran on
        context: ContextId,
        /// Prompt text
        prompt: String,
        /// Response schema sent with the request
        json_schema: Option<serde_json::Value>,
    },
    /// `stop_completion` on a context
    Stop(ContextId),
    /// `tokenize` on a context
    Tokenize(ContextId),
    /// `bench` on a context
    Bench {
        /// Prompt tokens
        pp: u32,
        /// Generated tokens
        tg: u32,
        /// Parallel sequences
        pl: u32,
        /// Repetitions
        nr: u32,
    },
    /// `save_session` with the target path
    SaveSession(PathBuf),
    /// `load_session` with the source path
    LoadSession(PathBuf),
}

type CallLog = Arc<Mutex<Vec<EngineCall>>>;

fn record(log: &CallLog, call: EngineCall) {
    log.lock().unwrap_or_else(|e| e.into_inner()).push(call);
}

/// Scripted engine for tests
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    script: Arc<Script>,
    calls: CallLog,
    next_id: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    /// Create an engine following `script`
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Snapshot of every call received so far
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Contexts created and not yet released
    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live contexts ever observed
    pub fn max_live_contexts(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn initialize(
        &self,
        model_path: &Path,
        params: &ContextParams,
    ) -> Result<Arc<dyn InferenceContext>> {
        record(&self.calls, EngineCall::Initialize(model_path.to_path_buf()));

        if let Some(message) = &self.script.init_error {
            return Err(LlamaChatError::ContextInit(message.clone()).into());
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Arc::new(ScriptedContext {
            id: ContextId::new(format!("ctx{}", n)),
            gpu: self.script.gpu && params.n_gpu_layers > 0,
            script: Arc::clone(&self.script),
            calls: Arc::clone(&self.calls),
            live: Arc::clone(&self.live),
            stop: Mutex::new(None),
            generation: AtomicU64::new(0),
        }))
    }
}

struct ScriptedContext {
    id: ContextId,
    gpu: bool,
    script: Arc<Script>,
    calls: CallLog,
    live: Arc<AtomicUsize>,
    stop: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl ScriptedContext {
    fn begin(&self, token: CancellationToken) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = Some((generation, token));
        generation
    }

    fn end(&self, generation: u64) {
        let mut stop = self.stop.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(stop.as_ref(), Some((current, _)) if *current == generation) {
            *stop = None;
        }
    }
}

#[async_trait]
impl InferenceContext for ScriptedContext {
    fn id(&self) -> &ContextId {
        &self.id
    }

    fn gpu_enabled(&self) -> bool {
        self.gpu
    }

    fn gpu_disabled_reason(&self) -> Option<String> {
        (!self.gpu).then(|| "scripted engine runs without GPU".to_string())
    }

    async fn release(&self) -> Result<()> {
        record(&self.calls, EngineCall::Release(self.id.clone()));
        if let Some(message) = &self.script.release_error {
            return Err(LlamaChatError::ContextRelease(message.clone()).into());
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn completion(
        &self,
        params: CompletionParams,
        mut on_token: TokenSink,
    ) -> Result<CompletionResult> {
        record(
            &self.calls,
            EngineCall::Completion {
                context: self.id.clone(),
                prompt: params.prompt.clone(),
                json_schema: params.json_schema.clone(),
            },
        );

        let stop = CancellationToken::new();
        let generation = self.begin(stop.clone());

        let mut text = String::new();
        let mut interrupted = false;
        for token in &self.script.tokens {
            if !self.script.token_delay.is_zero() {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(self.script.token_delay) => {}
                }
            }
            if stop.is_cancelled() {
                interrupted = true;
                break;
            }
            text.push_str(token);
            on_token(TokenData {
                token: token.clone(),
            });
        }

        if !interrupted && self.script.hold_until_stopped {
            stop.cancelled().await;
            interrupted = true;
        }
        self.end(generation);

        if let Some(message) = &self.script.completion_error {
            return Err(LlamaChatError::Completion(message.clone()).into());
        }

        Ok(CompletionResult {
            text,
            timings: Some(self.script.timings),
            interrupted,
        })
    }

    async fn stop_completion(&self) -> Result<()> {
        record(&self.calls, EngineCall::Stop(self.id.clone()));
        if let Some((_, token)) = self.stop.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            token.cancel();
        }
        Ok(())
    }

    async fn tokenize(&self, text: &str) -> Result<TokenizeResult> {
        record(&self.calls, EngineCall::Tokenize(self.id.clone()));
        Ok(TokenizeResult {
            tokens: (0..text.split_whitespace().count() as i32).collect(),
        })
    }

    async fn bench(&self, pp: u32, tg: u32, pl: u32, nr: u32) -> Result<BenchResult> {
        record(&self.calls, EngineCall::Bench { pp, tg, pl, nr });
        let delay = if pp <= 8 {
            self.script.warmup_delay
        } else {
            self.script.bench_delay
        };
        tokio::time::sleep(delay).await;
        if let Some(message) = &self.script.bench_error {
            return Err(LlamaChatError::Bench(message.clone()).into());
        }
        Ok(self.script.bench.clone())
    }

    async fn save_session(&self, path: &Path) -> Result<usize> {
        record(&self.calls, EngineCall::SaveSession(path.to_path_buf()));
        if let Some(message) = &self.script.session_error {
            return Err(LlamaChatError::Session(message.clone()).into());
        }
        Ok(self.script.session_tokens)
    }

    async fn load_session(&self, path: &Path) -> Result<SessionLoadResult> {
        record(&self.calls, EngineCall::LoadSession(path.to_path_buf()));
        if let Some(message) = &self.script.session_error {
            return Err(LlamaChatError::Session(message.clone()).into());
        }
        Ok(SessionLoadResult {
            tokens_loaded: self.script.session_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_assigns_sequential_ids() {
        let engine = ScriptedEngine::new(Script::default());
        let params = ContextParams::default();
        let a = engine.initialize(Path::new("a.gguf"), &params).await.unwrap();
        let b = engine.initialize(Path::new("b.gguf"), &params).await.unwrap();
        assert_eq!(a.id().as_str(), "ctx1");
        assert_eq!(b.id().as_str(), "ctx2");
        assert_eq!(engine.max_live_contexts(), 2);
    }

    #[tokio::test]
    async fn test_initialize_error() {
        let engine = ScriptedEngine::new(Script {
            init_error: Some("unsupported model".to_string()),
            ..Script::default()
        });
        let result = engine
            .initialize(Path::new("bad.gguf"), &ContextParams::default())
            .await;
        assert!(result.is_err());
        assert_eq!(engine.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_completion_streams_tokens_in_order() {
        let engine = ScriptedEngine::new(Script {
            tokens: vec!["a".into(), "b".into(), "c".into()],
            ..Script::default()
        });
        let ctx = engine
            .initialize(Path::new("m.gguf"), &ContextParams::default())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let result = ctx
            .completion(
                CompletionParams::chat_defaults("p"),
                Box::new(move |t| sink_seen.lock().unwrap().push(t.token)),
            )
            .await
            .unwrap();

        assert_eq!(result.text, "abc");
        assert!(!result.interrupted);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stop_interrupts_held_completion() {
        let engine = ScriptedEngine::new(Script {
            hold_until_stopped: true,
            ..Script::default()
        });
        let ctx = engine
            .initialize(Path::new("m.gguf"), &ContextParams::default())
            .await
            .unwrap();

        let worker = Arc::clone(&ctx);
        let handle = tokio::spawn(async move {
            worker
                .completion(CompletionParams::chat_defaults("p"), Box::new(|_| {}))
                .await
        });

        tokio::task::yield_now().await;
        while !engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Completion { .. }))
        {
            tokio::task::yield_now().await;
        }
        ctx.stop_completion().await.unwrap();

        let result = handle.await.unwrap().unwrap();
        assert!(result.interrupted);
    }

    #[tokio::test]
    async fn test_release_decrements_live_count() {
        let engine = ScriptedEngine::new(Script::default());
        let ctx = engine
            .initialize(Path::new("m.gguf"), &ContextParams::default())
            .await
            .unwrap();
        ctx.release().await.unwrap();
        assert_eq!(engine.live_contexts(), 0);
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Initialize(PathBuf::from("m.gguf")),
                EngineCall::Release(ContextId::new("ctx1")),
            ]
        );
    }
}
