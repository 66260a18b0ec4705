//! Error types for llamachat
//!
//! This module defines all error types used throughout the application,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for llamachat operations
///
/// Every failure is local to the operation that triggered it. Callers in the
/// chat loop turn these into system notices instead of terminating.
#[derive(Error, Debug)]
pub enum LlamaChatError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inference engine errors that do not belong to a more specific variant
    #[error("Engine error: {0}")]
    Engine(String),

    /// The engine could not create a context for the given model
    #[error("{0}")]
    ContextInit(String),

    /// The held context could not free its resources
    #[error("{0}")]
    ContextRelease(String),

    /// Token generation failed
    #[error("{0}")]
    Completion(String),

    /// Session (KV cache) save or load failed
    #[error("{0}")]
    Session(String),

    /// Benchmark run failed
    #[error("{0}")]
    Bench(String),

    /// An operation needed a held context but none is loaded
    #[error("No model loaded. Pick a model first")]
    NoContext,

    /// A completion was requested while another one is streaming
    #[error("A completion is already in progress")]
    AlreadyInferencing,

    /// Model picking or importing failed
    #[error("Model pick error: {0}")]
    ModelPick(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for llamachat operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
