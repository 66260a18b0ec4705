//! Inference engine contract and common types
//!
//! This module defines the [`InferenceEngine`] and [`InferenceContext`]
//! traits every backend implements, along with the request and response
//! types exchanged with a context. The chat layer only ever talks to an
//! engine through these traits.

use crate::error::Result;
use crate::message::ContextId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Hardware options used when creating a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Lock model memory so it is never swapped out
    pub use_mlock: bool,
    /// Number of layers to offload to the GPU (0 keeps everything on the CPU)
    pub n_gpu_layers: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            use_mlock: true,
            n_gpu_layers: 100,
        }
    }
}

/// Sampling configuration and prompt for one completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    /// Full prompt text
    pub prompt: String,
    /// Maximum number of tokens to generate
    pub n_predict: i32,
    /// Sampling temperature
    pub temperature: f32,
    /// Top-k sampling (<= 0 uses the vocabulary size)
    pub top_k: i32,
    /// Top-p sampling (1.0 disables)
    pub top_p: f32,
    /// Tail free sampling (1.0 disables)
    pub tfs_z: f32,
    /// Locally typical sampling (1.0 disables)
    pub typical_p: f32,
    /// Tokens considered for repetition penalties (0 disables, -1 uses context size)
    pub penalty_last_n: i32,
    /// Repetition penalty (1.0 disables)
    pub penalty_repeat: f32,
    /// Frequency penalty (0.0 disables)
    pub penalty_freq: f32,
    /// Presence penalty (0.0 disables)
    pub penalty_present: f32,
    /// Mirostat mode (0, 1 or 2)
    pub mirostat: u8,
    /// Mirostat target entropy
    pub mirostat_tau: f32,
    /// Mirostat learning rate
    pub mirostat_eta: f32,
    /// Penalize newline tokens
    pub penalize_nl: bool,
    /// Random seed
    pub seed: i64,
    /// Number of token probabilities to report per token
    pub n_probs: u32,
    /// Stop strings
    pub stop: Vec<String>,
    /// Grammar constraining the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
    /// JSON schema the engine converts to a grammar itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
}

impl CompletionParams {
    /// Fixed sampling configuration used for chat replies
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::engine::CompletionParams;
    ///
    /// let params = CompletionParams::chat_defaults("User: Hi\nllama:");
    /// assert_eq!(params.n_predict, 400);
    /// assert_eq!(params.stop, vec!["</s>", "llama:", "User:"]);
    /// assert!(params.grammar.is_none());
    /// ```
    pub fn chat_defaults(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            n_predict: 400,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.5,
            tfs_z: 1.0,
            typical_p: 1.0,
            penalty_last_n: 256,
            penalty_repeat: 1.18,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_nl: true,
            seed: 1234,
            n_probs: 0,
            stop: vec!["</s>".to_string(), "llama:".to_string(), "User:".to_string()],
            grammar: None,
            json_schema: None,
        }
    }
}

/// One generated token delivered while a completion streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenData {
    /// Token text
    pub token: String,
}

/// Per-token callback handed to [`InferenceContext::completion`]
///
/// Called in generation order, never concurrently.
pub type TokenSink = Box<dyn FnMut(TokenData) + Send>;

/// Performance statistics reported at the end of a completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionTimings {
    /// Prompt tokens evaluated
    pub prompt_n: u64,
    /// Time spent on the prompt
    pub prompt_ms: f64,
    /// Average prompt time per token
    pub prompt_per_token_ms: f64,
    /// Prompt throughput
    pub prompt_per_second: f64,
    /// Tokens generated
    pub predicted_n: u64,
    /// Time spent generating
    pub predicted_ms: f64,
    /// Average generation time per token
    pub predicted_per_token_ms: f64,
    /// Generation throughput
    pub predicted_per_second: f64,
}

impl CompletionTimings {
    /// Human readable summary stamped onto the reply
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::engine::CompletionTimings;
    ///
    /// let timings = CompletionTimings {
    ///     predicted_per_token_ms: 42.4,
    ///     predicted_per_second: 23.584,
    ///     ..Default::default()
    /// };
    /// assert_eq!(timings.summary(), "42ms per token, 23.58 tokens per second");
    /// ```
    pub fn summary(&self) -> String {
        format!(
            "{}ms per token, {:.2} tokens per second",
            self.predicted_per_token_ms.round() as i64,
            self.predicted_per_second
        )
    }
}

/// Final result of a completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResult {
    /// Full generated text
    pub text: String,
    /// Aggregate timing statistics, when the engine reported them
    pub timings: Option<CompletionTimings>,
    /// Whether generation ended because of a stop request
    pub interrupted: bool,
}

/// Tokenization result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizeResult {
    /// Token ids
    pub tokens: Vec<i32>,
}

/// Benchmark result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    /// Model description
    pub model_desc: String,
    /// Model size in bytes
    pub model_size: u64,
    /// Number of model parameters
    pub model_n_params: u64,
    /// Prompt processing throughput, mean (tokens/s)
    pub pp_avg: f64,
    /// Prompt processing throughput, standard deviation
    pub pp_std: f64,
    /// Text generation throughput, mean (tokens/s)
    pub tg_avg: f64,
    /// Text generation throughput, standard deviation
    pub tg_std: f64,
}

/// Session load result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLoadResult {
    /// Number of tokens restored into the KV cache
    pub tokens_loaded: usize,
}

/// Inference engine trait
///
/// An engine creates contexts. It holds no per-model state itself.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load a model and create a context for it
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded.
    async fn initialize(
        &self,
        model_path: &Path,
        params: &ContextParams,
    ) -> Result<Arc<dyn InferenceContext>>;
}

/// A live inference context bound to one loaded model
#[async_trait]
pub trait InferenceContext: Send + Sync {
    /// Context identity
    fn id(&self) -> &ContextId;

    /// Whether generation runs on the GPU
    fn gpu_enabled(&self) -> bool;

    /// Why GPU acceleration is unavailable, if it is
    fn gpu_disabled_reason(&self) -> Option<String>;

    /// Free the context's resources
    async fn release(&self) -> Result<()>;

    /// Generate a completion, calling `on_token` for every produced token
    async fn completion(
        &self,
        params: CompletionParams,
        on_token: TokenSink,
    ) -> Result<CompletionResult>;

    /// Ask an in-flight completion to stop
    ///
    /// Best effort: tokens already produced may still be delivered.
    async fn stop_completion(&self) -> Result<()>;

    /// Tokenize text with the model's vocabulary
    async fn tokenize(&self, text: &str) -> Result<TokenizeResult>;

    /// Run a throughput benchmark
    ///
    /// * `pp` - prompt tokens per run
    /// * `tg` - generated tokens per run
    /// * `pl` - parallel sequences
    /// * `nr` - repetitions
    async fn bench(&self, pp: u32, tg: u32, pl: u32, nr: u32) -> Result<BenchResult>;

    /// Persist the KV cache to `path`, returning the number of tokens saved
    async fn save_session(&self, path: &Path) -> Result<usize>;

    /// Restore the KV cache from `path`
    async fn load_session(&self, path: &Path) -> Result<SessionLoadResult>;
}
