//! llamachat - chat with a local language model
//!
//! This library provides the pieces of a terminal chat on top of a llama.cpp
//! inference engine: model loading and release, prompt construction,
//! streamed completions, reserved chat commands and configuration.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `engine`: Inference engine contract, the `llama-server` backend and a scripted engine
//! - `session`: Holder of the single live inference context
//! - `completion`: Streaming completion state machine
//! - `conversation` and `message`: The message log and its entries
//! - `prompt`: Transcript prompt construction
//! - `commands`: Reserved chat commands and the CLI command handlers
//! - `app`: Chat application tying the above together
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//!
//! # Example
//!
//! ```no_run
//! use llamachat::{ChatApp, Config};
//! use llamachat::engine::create_engine;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let mut app = ChatApp::new(create_engine(&config)?, config);
//!     app.load_model(Path::new("models/tiny.gguf")).await;
//!     app.send("Hello").await;
//!     app.run_until_idle().await;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod cli;
pub mod commands;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod grammar;
pub mod message;
pub mod metrics;
pub mod picker;
pub mod prompt;
pub mod session;

// Re-export commonly used types
pub use app::{ChatApp, SendOutcome};
pub use config::Config;
pub use error::{LlamaChatError, Result};
pub use message::{Author, Message};
