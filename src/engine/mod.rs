//! Inference engines
//!
//! This module contains the engine abstraction and its backends: the
//! `llama-server` supervisor used in production and a scripted in-process
//! engine for tests and dry runs.

pub mod base;
pub mod fake;
pub mod server;

pub use base::{
    BenchResult, CompletionParams, CompletionResult, CompletionTimings, ContextParams,
    InferenceContext, InferenceEngine, SessionLoadResult, TokenData, TokenSink, TokenizeResult,
};
pub use fake::{Script, ScriptedEngine};
pub use server::LlamaServerEngine;

use std::sync::Arc;

use crate::config::Config;
use crate::error::{LlamaChatError, Result};

/// Create an engine based on configuration
///
/// # Arguments
///
/// * `config` - Full configuration; `engine.backend` selects the backend
///   (`"llama-server"` or `"scripted"`)
///
/// # Errors
///
/// Returns error if the backend name is unknown
pub fn create_engine(config: &Config) -> Result<Arc<dyn InferenceEngine>> {
    match config.engine.backend.as_str() {
        "llama-server" => Ok(Arc::new(LlamaServerEngine::new(
            config.engine.clone(),
            config.session_dir(),
        ))),
        "scripted" => Ok(Arc::new(ScriptedEngine::new(Script::default()))),
        other => Err(
            LlamaChatError::Config(format!("Unknown engine backend: {}", other)).into(),
        ),
    }
}
