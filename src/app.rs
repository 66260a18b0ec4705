//! Chat application state and event loop
//!
//! [`ChatApp`] is the single owner of the conversation store, the session
//! manager and the completion controller. User input goes through
//! [`ChatApp::send`]; engine output comes back as [`CompletionEvent`]s that
//! the caller feeds to [`ChatApp::handle_event`]. Nothing else writes to the
//! store, so the order of messages is the order of events.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::commands::dispatcher::{release_with_notices, ChatState, CommandDispatcher};
use crate::commands::special_commands::ChatCommand;
use crate::completion::{CompletionController, CompletionEvent, RequestId};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::engine::{CompletionParams, InferenceEngine};
use crate::error::Result;
use crate::grammar::demo_function_call_schema;
use crate::message::Message;
use crate::picker::{plan_import, ModelPicker, PickOutcome};
use crate::prompt::{build_prompt, with_assistant_cue};
use crate::session::{ContextSummary, SessionManager};

/// Notice shown when a message is sent with no model loaded
pub const NO_MODEL_NOTICE: &str = "No model loaded. Pick a model before chatting.";

/// What [`ChatApp::send`] did with the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The input was a reserved command and has run
    Command(ChatCommand),
    /// The message was appended and a completion started
    Started(RequestId),
    /// The message was appended while another completion streams
    Appended,
    /// The message was appended but no completion could start
    Rejected,
}

/// Interactive chat session
pub struct ChatApp {
    config: Config,
    store: ConversationStore,
    sessions: SessionManager,
    controller: CompletionController,
    dispatcher: CommandDispatcher,
    events: mpsc::UnboundedReceiver<CompletionEvent>,
}

impl ChatApp {
    /// Create a chat with nothing loaded
    pub fn new(engine: Arc<dyn InferenceEngine>, config: Config) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            dispatcher: CommandDispatcher::from_config(&config),
            store: ConversationStore::new(),
            sessions: SessionManager::new(engine),
            controller: CompletionController::new(tx),
            config,
            events,
        }
    }

    /// Message log
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Session manager
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Completion controller
    pub fn controller(&self) -> &CompletionController {
        &self.controller
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether a completion is streaming
    pub fn is_inferencing(&self) -> bool {
        self.controller.is_inferencing()
    }

    /// Load the model at `path`, replacing any loaded one
    ///
    /// Progress and the result are reported as notices. Returns whether a
    /// context is now held.
    pub async fn load_model(&mut self, path: &Path) -> bool {
        release_with_notices(ChatState {
            store: &mut self.store,
            sessions: &mut self.sessions,
            controller: &mut self.controller,
        })
        .await;

        self.store.insert(Message::notice("Initializing context..."));
        let params = self.config.engine.context_params();
        match self.sessions.initialize(path, &params).await {
            Ok(summary) => {
                self.store
                    .insert(Message::notice(context_initialized_notice(&summary)));
                true
            }
            Err(e) => {
                self.store.insert(Message::notice(format!(
                    "Context initialization failed: {}",
                    e
                )));
                false
            }
        }
    }

    /// Ask `picker` for a model and load it
    ///
    /// With `models.copy_to_cache` on, the file is imported into the cache
    /// first. A cancelled pick changes nothing.
    ///
    /// # Errors
    ///
    /// Returns the picker's error when it cannot ask at all.
    pub async fn pick_and_load(&mut self, picker: &mut dyn ModelPicker) -> Result<bool> {
        let path = match picker.pick().await? {
            PickOutcome::Picked(path) => path,
            PickOutcome::Cancelled => return Ok(false),
        };

        if !self.config.models.copy_to_cache {
            return Ok(self.load_model(&path).await);
        }

        let cache_dir = self.config.model_cache_dir();
        let import = match plan_import(&path, &cache_dir).await {
            Ok(import) => import,
            Err(e) => {
                tracing::warn!("Model import failed: {}", e);
                self.store
                    .insert(Message::notice(format!("Model import failed: {}", e)));
                return Ok(false);
            }
        };

        let copying = import.needs_copy();
        if copying {
            self.store
                .insert(Message::notice("Copying model to internal storage..."));
        }
        match import.run().await {
            Ok(target) => {
                if copying {
                    self.store.insert(Message::notice("Model copied!"));
                }
                Ok(self.load_model(&target).await)
            }
            Err(e) => {
                tracing::warn!("Model copy failed: {}", e);
                self.store
                    .insert(Message::notice(format!("Model import failed: {}", e)));
                Ok(false)
            }
        }
    }

    /// Handle one line of user input
    ///
    /// Reserved commands run and never reach the store as user messages.
    /// Anything else is appended as a user message stamped with the held
    /// context, and a completion starts unless one is already streaming.
    pub async fn send(&mut self, text: &str) -> SendOutcome {
        if let Some(command) = ChatCommand::parse(text) {
            self.dispatcher
                .execute(
                    command,
                    ChatState {
                        store: &mut self.store,
                        sessions: &mut self.sessions,
                        controller: &mut self.controller,
                    },
                )
                .await;
            return SendOutcome::Command(command);
        }

        let context = self.sessions.context();
        let conversation_id = self.store.conversation_id().clone();
        self.store.insert(Message::user(
            text,
            context.as_ref().map(|c| c.id().clone()),
            conversation_id.clone(),
        ));

        let Some(context) = context else {
            self.store.insert(Message::notice(NO_MODEL_NOTICE));
            return SendOutcome::Rejected;
        };
        if self.controller.is_inferencing() {
            tracing::debug!("Completion in progress, message appended only");
            return SendOutcome::Appended;
        }

        let prompt = with_assistant_cue(build_prompt(
            Some(context.id()),
            &conversation_id,
            self.store.messages(),
        ));
        match context.tokenize(&prompt).await {
            Ok(tokenized) => tracing::debug!("Prompt is {} tokens", tokenized.tokens.len()),
            Err(e) => tracing::warn!("Prompt tokenization failed: {}", e),
        }

        let mut params = CompletionParams::chat_defaults(prompt);
        if self.config.completion.use_json_schema {
            params.json_schema = Some(demo_function_call_schema());
        }

        match self.controller.start(context, params, conversation_id) {
            Ok(request) => SendOutcome::Started(request),
            Err(e) => {
                self.store
                    .insert(Message::notice(format!("Completion failed: {}", e)));
                SendOutcome::Rejected
            }
        }
    }

    /// Apply an event from a completion task
    pub fn handle_event(&mut self, event: CompletionEvent) {
        match event {
            CompletionEvent::Token { request, token } => {
                self.controller.on_token(&mut self.store, request, &token)
            }
            CompletionEvent::Settled { request, outcome } => {
                self.controller.finish(&mut self.store, request, outcome)
            }
        }
    }

    /// Wait for the next completion event
    pub async fn next_event(&mut self) -> Option<CompletionEvent> {
        self.events.recv().await
    }

    /// Apply every event that is already queued
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    /// Apply events until no completion is streaming
    pub async fn run_until_idle(&mut self) {
        while self.controller.is_inferencing() {
            match self.events.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    /// Stop the streaming completion, if any
    pub async fn stop(&mut self) -> bool {
        self.controller.stop().await
    }

    /// Stop streaming and release the held context
    pub async fn shutdown(&mut self) {
        if self.controller.is_inferencing() {
            self.controller.stop().await;
        }
        self.sessions.shutdown().await;
    }
}

/// Text of the notice shown after a context is created
///
/// # Examples
///
/// ```
/// use llamachat::app::context_initialized_notice;
/// use llamachat::message::ContextId;
/// use llamachat::session::ContextSummary;
///
/// let notice = context_initialized_notice(&ContextSummary {
///     id: ContextId::new("ctx1"),
///     gpu_enabled: false,
///     gpu_disabled_reason: Some("n_gpu_layers is 0".to_string()),
/// });
/// assert!(notice.starts_with("Context initialized! \n\nGPU: NO (n_gpu_layers is 0)\n\n"));
/// ```
pub fn context_initialized_notice(summary: &ContextSummary) -> String {
    let gpu = match (summary.gpu_enabled, &summary.gpu_disabled_reason) {
        (true, _) => "YES".to_string(),
        (false, Some(reason)) => format!("NO ({})", reason),
        (false, None) => "NO".to_string(),
    };
    let commands = [
        ChatCommand::Bench,
        ChatCommand::Release,
        ChatCommand::Stop,
        ChatCommand::Reset,
    ]
    .iter()
    .map(|cmd| format!("- {}: {}", cmd, cmd.description()))
    .collect::<Vec<_>>()
    .join("\n");
    format!(
        "Context initialized! \n\nGPU: {}\n\nYou can use the following commands:\n\n{}",
        gpu, commands
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{EngineCall, Script, ScriptedEngine};
    use crate::message::{Author, ContextId};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn app(script: Script) -> (ChatApp, ScriptedEngine) {
        let engine = ScriptedEngine::new(script);
        (
            ChatApp::new(Arc::new(engine.clone()), Config::default()),
            engine,
        )
    }

    fn texts(app: &ChatApp) -> Vec<String> {
        app.store()
            .messages()
            .iter()
            .map(|m| m.text().to_string())
            .collect()
    }

    struct FixedPicker(PickOutcome);

    #[async_trait]
    impl ModelPicker for FixedPicker {
        async fn pick(&mut self) -> Result<PickOutcome> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_context_initialized_notice_exact() {
        let notice = context_initialized_notice(&ContextSummary {
            id: ContextId::new("ctx1"),
            gpu_enabled: true,
            gpu_disabled_reason: None,
        });
        assert_eq!(
            notice,
            "Context initialized! \n\nGPU: YES\n\nYou can use the following commands:\n\n\
             - /bench: to benchmark the model\n\
             - /release: release the context\n\
             - /stop: stop the current completion\n\
             - /reset: reset the conversation"
        );
    }

    #[tokio::test]
    async fn test_load_model_notices() {
        let (mut app, _engine) = app(Script::default());
        assert!(app.load_model(Path::new("m.gguf")).await);
        let texts = texts(&app);
        assert_eq!(texts[0], "Initializing context...");
        assert!(texts[1].starts_with("Context initialized!"));
        assert!(app.sessions().is_loaded());
    }

    #[tokio::test]
    async fn test_load_failure_notice() {
        let (mut app, _engine) = app(Script {
            init_error: Some("unsupported model".to_string()),
            ..Script::default()
        });
        assert!(!app.load_model(Path::new("m.gguf")).await);
        assert_eq!(
            texts(&app),
            vec![
                "Initializing context...",
                "Context initialization failed: unsupported model"
            ]
        );
        assert!(!app.sessions().is_loaded());
    }

    #[tokio::test]
    async fn test_send_without_model_is_rejected() {
        let (mut app, engine) = app(Script::default());
        assert_eq!(app.send("hello").await, SendOutcome::Rejected);
        let messages = app.store().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].author(), Author::User);
        assert_eq!(messages[0].metadata().context_id, None);
        assert_eq!(messages[1].text(), NO_MODEL_NOTICE);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_send_streams_reply() {
        let (mut app, engine) = app(Script::default());
        app.load_model(Path::new("m.gguf")).await;
        let outcome = app.send("Hi").await;
        assert!(matches!(outcome, SendOutcome::Started(_)));
        app.run_until_idle().await;

        let reply = app.store().latest().unwrap();
        assert_eq!(reply.text(), "Hello!");
        assert_eq!(reply.author(), Author::System);
        assert!(!reply.is_notice());

        let prompt = engine
            .calls()
            .into_iter()
            .find_map(|c| match c {
                EngineCall::Completion { prompt, .. } => Some(prompt),
                _ => None,
            })
            .unwrap();
        assert!(prompt.ends_with("User: Hi\nllama:"));
        assert!(engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Tokenize(_))));
    }

    #[tokio::test]
    async fn test_send_while_streaming_appends_only() {
        let (mut app, engine) = app(Script {
            hold_until_stopped: true,
            ..Script::default()
        });
        app.load_model(Path::new("m.gguf")).await;
        assert!(matches!(app.send("first").await, SendOutcome::Started(_)));
        assert_eq!(app.send("second").await, SendOutcome::Appended);

        let completions = engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Completion { .. }))
            .count();
        assert!(completions <= 1);
        assert_eq!(app.send("/stop").await, SendOutcome::Command(ChatCommand::Stop));
        assert!(!app.is_inferencing());
    }

    #[tokio::test]
    async fn test_commands_are_not_messages() {
        let (mut app, _engine) = app(Script::default());
        assert_eq!(
            app.send("/reset").await,
            SendOutcome::Command(ChatCommand::Reset)
        );
        assert_eq!(texts(&app), vec!["Conversation reset!"]);
    }

    #[tokio::test]
    async fn test_pick_cancelled_changes_nothing() {
        let (mut app, engine) = app(Script::default());
        let loaded = app
            .pick_and_load(&mut FixedPicker(PickOutcome::Cancelled))
            .await
            .unwrap();
        assert!(!loaded);
        assert!(app.store().is_empty());
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pick_with_copy_to_cache() {
        let src = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let model = src.path().join("tiny.gguf");
        std::fs::write(&model, b"GGUF").unwrap();

        let engine = ScriptedEngine::new(Script::default());
        let mut config = Config::default();
        config.models.copy_to_cache = true;
        config.models.cache_dir = Some(cache.path().to_path_buf());
        let mut app = ChatApp::new(Arc::new(engine.clone()), config);

        assert!(app
            .pick_and_load(&mut FixedPicker(PickOutcome::Picked(model.clone())))
            .await
            .unwrap());
        let texts = texts(&app);
        assert_eq!(texts[0], "Copying model to internal storage...");
        assert_eq!(texts[1], "Model copied!");
        assert_eq!(texts[2], "Initializing context...");

        let copied: PathBuf = cache.path().join("models").join("tiny.gguf");
        assert!(engine.calls().contains(&EngineCall::Initialize(copied)));
    }

    fn sent_schemas(engine: &ScriptedEngine) -> Vec<Option<serde_json::Value>> {
        engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Completion { json_schema, .. } => Some(json_schema),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_json_schema_attached_when_enabled() {
        let engine = ScriptedEngine::new(Script::default());
        let mut config = Config::default();
        config.completion.use_json_schema = true;
        let mut app = ChatApp::new(Arc::new(engine.clone()), config);
        app.load_model(Path::new("m.gguf")).await;
        assert!(matches!(app.send("Hi").await, SendOutcome::Started(_)));
        app.run_until_idle().await;

        assert_eq!(app.store().latest().unwrap().text(), "Hello!");
        assert_eq!(
            sent_schemas(&engine),
            vec![Some(demo_function_call_schema())]
        );
    }

    #[tokio::test]
    async fn test_json_schema_absent_by_default() {
        let (mut app, engine) = app(Script::default());
        app.load_model(Path::new("m.gguf")).await;
        app.send("Hi").await;
        app.run_until_idle().await;

        assert_eq!(sent_schemas(&engine), vec![None]);
    }

    #[tokio::test]
    async fn test_shutdown_releases_context() {
        let (mut app, engine) = app(Script::default());
        app.load_model(Path::new("m.gguf")).await;
        app.shutdown().await;
        assert!(!app.sessions().is_loaded());
        assert_eq!(engine.live_contexts(), 0);
    }
}
