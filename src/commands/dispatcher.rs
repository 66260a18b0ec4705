//! Execution of reserved chat commands
//!
//! Each command reports progress and results as system notices in the
//! conversation store. Failures never propagate out of [`CommandDispatcher::execute`];
//! they become notices too.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::commands::special_commands::ChatCommand;
use crate::completion::CompletionController;
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::engine::BenchResult;
use crate::message::Message;
use crate::session::{ReleaseOutcome, SessionManager};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Mutable chat state a command operates on
pub struct ChatState<'a> {
    /// Message log notices are written to
    pub store: &'a mut ConversationStore,
    /// Holder of the inference context
    pub sessions: &'a mut SessionManager,
    /// Streaming completion state
    pub controller: &'a mut CompletionController,
}

/// Runs reserved commands against the chat state
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    session_path: PathBuf,
    warmup_limit: Duration,
}

impl CommandDispatcher {
    /// Create a dispatcher
    ///
    /// # Arguments
    ///
    /// * `session_path` - File `/save-session` and `/load-session` use
    /// * `warmup_limit` - Warm-up duration above which `/bench` gives up
    pub fn new(session_path: PathBuf, warmup_limit: Duration) -> Self {
        Self {
            session_path,
            warmup_limit,
        }
    }

    /// Create a dispatcher from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.session_path(),
            Duration::from_millis(config.bench.warmup_limit_ms),
        )
    }

    /// Session file path
    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    /// Execute `command`
    pub async fn execute(&self, command: ChatCommand, state: ChatState<'_>) {
        tracing::debug!("Executing {}", command);
        match command {
            ChatCommand::Bench => self.bench(state).await,
            ChatCommand::Release => release_with_notices(state).await,
            ChatCommand::Stop => {
                if state.controller.is_inferencing() {
                    state.controller.stop().await;
                }
            }
            ChatCommand::Reset => {
                let id = state.store.reset_conversation();
                tracing::info!("Conversation reset to {}", id);
                state.store.insert(Message::notice("Conversation reset!"));
            }
            ChatCommand::SaveSession => {
                let notice = match state.sessions.save_session(&self.session_path).await {
                    Ok(tokens) => {
                        tracing::info!("Session tokens saved: {}", tokens);
                        format!("Session saved! {} tokens saved.", tokens)
                    }
                    Err(e) => {
                        tracing::warn!("Session save failed: {}", e);
                        format!("Session save failed: {}", e)
                    }
                };
                state.store.insert(Message::notice(notice));
            }
            ChatCommand::LoadSession => {
                let notice = match state.sessions.load_session(&self.session_path).await {
                    Ok(details) => {
                        tracing::info!("Session loaded: {:?}", details);
                        format!("Session loaded! {} tokens loaded.", details.tokens_loaded)
                    }
                    Err(e) => {
                        tracing::warn!("Session load failed: {}", e);
                        format!("Session load failed: {}", e)
                    }
                };
                state.store.insert(Message::notice(notice));
            }
        }
    }

    async fn bench(&self, state: ChatState<'_>) {
        let context = match state.sessions.require() {
            Ok(context) => context,
            Err(e) => {
                state
                    .store
                    .insert(Message::notice(format!("Benchmark failed: {}", e)));
                return;
            }
        };

        state.store.insert(Message::notice("Heating up the model..."));
        let started = tokio::time::Instant::now();
        if let Err(e) = context.bench(8, 4, 1, 1).await {
            state
                .store
                .insert(Message::notice(format!("Benchmark failed: {}", e)));
            return;
        }
        let heat = started.elapsed();
        if heat > self.warmup_limit {
            tracing::info!("Warm-up took {}ms, skipping benchmark", heat.as_millis());
            state.store.insert(Message::notice(
                "Heat up time is too long, please try again.",
            ));
            return;
        }
        state.store.insert(Message::notice(format!(
            "Heat up time: {}ms",
            heat.as_millis()
        )));

        state.store.insert(Message::notice("Benchmarking the model..."));
        match context.bench(512, 128, 1, 3).await {
            Ok(result) => {
                state
                    .store
                    .insert(Message::notice_with(render_bench_table(&result), true));
            }
            Err(e) => {
                tracing::warn!("Benchmark failed: {}", e);
                state
                    .store
                    .insert(Message::notice(format!("Benchmark failed: {}", e)));
            }
        }
    }
}

/// Release the held context, narrating it with notices
///
/// Does nothing when no context is held. A streaming completion is stopped
/// first.
pub async fn release_with_notices(state: ChatState<'_>) {
    if !state.sessions.is_loaded() {
        return;
    }
    if state.controller.is_inferencing() {
        state.controller.stop().await;
    }

    state.store.insert(Message::notice("Releasing context..."));
    match state.sessions.release().await {
        Ok(ReleaseOutcome::Released(_)) | Ok(ReleaseOutcome::NotHeld) => {
            state.store.insert(Message::notice("Context released!"));
        }
        Err(e) => {
            state
                .store
                .insert(Message::notice(format!("Context release failed: {}", e)));
        }
    }
}

/// Render a benchmark result as the markdown table shown to the user
///
/// # Examples
///
/// ```
/// use llamachat::commands::dispatcher::render_bench_table;
/// use llamachat::engine::BenchResult;
///
/// let table = render_bench_table(&BenchResult {
///     model_desc: "tiny".to_string(),
///     model_size: 1024 * 1024 * 1024,
///     model_n_params: 1_500_000_000,
///     pp_avg: 100.0,
///     pp_std: 1.5,
///     tg_avg: 20.0,
///     tg_std: 0.25,
/// });
/// assert!(table.ends_with("| tiny | 1.00 GiB | 1.50B | tg 128 | 20.00 ± 0.25"));
/// ```
pub fn render_bench_table(result: &BenchResult) -> String {
    let size = format!("{:.2} GiB", result.model_size as f64 / GIB);
    let params = format!("{:.2}B", result.model_n_params as f64 / 1e9);
    format!(
        "| model | size | params | test | t/s |\n\
         | --- | --- | --- | --- | --- |\n\
         | {desc} | {size} | {params} | pp 512 | {pp_avg:.2} ± {pp_std:.2} |\n\
         | {desc} | {size} | {params} | tg 128 | {tg_avg:.2} ± {tg_std:.2}",
        desc = result.model_desc,
        size = size,
        params = params,
        pp_avg = result.pp_avg,
        pp_std = result.pp_std,
        tg_avg = result.tg_avg,
        tg_std = result.tg_std,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionEvent;
    use crate::engine::fake::{EngineCall, Script, ScriptedEngine};
    use crate::engine::ContextParams;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Harness {
        store: ConversationStore,
        sessions: SessionManager,
        controller: CompletionController,
        engine: ScriptedEngine,
        _rx: mpsc::UnboundedReceiver<CompletionEvent>,
    }

    impl Harness {
        fn new(script: Script) -> Self {
            let engine = ScriptedEngine::new(script);
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                store: ConversationStore::new(),
                sessions: SessionManager::new(Arc::new(engine.clone())),
                controller: CompletionController::new(tx),
                engine,
                _rx: rx,
            }
        }

        async fn load(&mut self) {
            self.sessions
                .initialize(Path::new("m.gguf"), &ContextParams::default())
                .await
                .unwrap();
        }

        async fn run(&mut self, command: ChatCommand) {
            let dispatcher = CommandDispatcher::new(
                PathBuf::from("/tmp/llama-session.bin"),
                Duration::from_millis(10_000),
            );
            dispatcher
                .execute(
                    command,
                    ChatState {
                        store: &mut self.store,
                        sessions: &mut self.sessions,
                        controller: &mut self.controller,
                    },
                )
                .await;
        }

        fn notices(&self) -> Vec<String> {
            self.store
                .messages()
                .iter()
                .map(|m| m.text().to_string())
                .collect()
        }
    }

    #[test]
    fn test_render_bench_table() {
        let table = render_bench_table(&BenchResult {
            model_desc: "llama 7B Q4_0".to_string(),
            model_size: 3_825_065_984,
            model_n_params: 6_738_415_616,
            pp_avg: 152.123,
            pp_std: 2.5,
            tg_avg: 12.345,
            tg_std: 0.1,
        });
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "| model | size | params | test | t/s |");
        assert_eq!(lines[1], "| --- | --- | --- | --- | --- |");
        assert_eq!(
            lines[2],
            "| llama 7B Q4_0 | 3.56 GiB | 6.74B | pp 512 | 152.12 ± 2.50 |"
        );
        assert_eq!(
            lines[3],
            "| llama 7B Q4_0 | 3.56 GiB | 6.74B | tg 128 | 12.35 ± 0.10"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bench_runs_warmup_then_full_pass() {
        let mut h = Harness::new(Script::default());
        h.load().await;
        h.run(ChatCommand::Bench).await;

        let notices = h.notices();
        assert_eq!(notices[0], "Heating up the model...");
        assert_eq!(notices[1], "Heat up time: 200ms");
        assert_eq!(notices[2], "Benchmarking the model...");
        assert!(notices[3].starts_with("| model | size |"));
        assert!(h.store.latest().unwrap().metadata().copyable);

        let benches: Vec<EngineCall> = h
            .engine
            .calls()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::Bench { .. }))
            .collect();
        assert_eq!(
            benches,
            vec![
                EngineCall::Bench {
                    pp: 8,
                    tg: 4,
                    pl: 1,
                    nr: 1
                },
                EngineCall::Bench {
                    pp: 512,
                    tg: 128,
                    pl: 1,
                    nr: 3
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bench_slow_warmup_aborts() {
        let mut h = Harness::new(Script {
            warmup_delay: Duration::from_millis(11_000),
            ..Script::default()
        });
        h.load().await;
        h.run(ChatCommand::Bench).await;

        assert_eq!(
            h.notices(),
            vec![
                "Heating up the model...",
                "Heat up time is too long, please try again."
            ]
        );
        let bench_calls = h
            .engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Bench { .. }))
            .count();
        assert_eq!(bench_calls, 1);
    }

    #[tokio::test]
    async fn test_bench_without_context() {
        let mut h = Harness::new(Script::default());
        h.run(ChatCommand::Bench).await;
        assert_eq!(
            h.notices(),
            vec!["Benchmark failed: No model loaded. Pick a model first"]
        );
    }

    #[tokio::test]
    async fn test_bench_failure_is_reported() {
        let mut h = Harness::new(Script {
            bench_error: Some("out of memory".to_string()),
            warmup_delay: Duration::ZERO,
            ..Script::default()
        });
        h.load().await;
        h.run(ChatCommand::Bench).await;
        assert_eq!(
            h.notices(),
            vec!["Heating up the model...", "Benchmark failed: out of memory"]
        );
    }

    #[tokio::test]
    async fn test_release_notices() {
        let mut h = Harness::new(Script::default());
        h.load().await;
        h.run(ChatCommand::Release).await;
        assert_eq!(h.notices(), vec!["Releasing context...", "Context released!"]);
        assert!(!h.sessions.is_loaded());
    }

    #[tokio::test]
    async fn test_release_failure_notice() {
        let mut h = Harness::new(Script {
            release_error: Some("device busy".to_string()),
            ..Script::default()
        });
        h.load().await;
        h.run(ChatCommand::Release).await;
        assert_eq!(
            h.notices(),
            vec!["Releasing context...", "Context release failed: device busy"]
        );
        assert!(!h.sessions.is_loaded());
    }

    #[tokio::test]
    async fn test_release_without_context_is_silent() {
        let mut h = Harness::new(Script::default());
        h.run(ChatCommand::Release).await;
        assert!(h.store.is_empty());
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let mut h = Harness::new(Script::default());
        h.load().await;
        h.run(ChatCommand::Stop).await;
        assert!(h.store.is_empty());
        assert!(!h
            .engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Stop(_))));
    }

    #[tokio::test]
    async fn test_reset_rotates_conversation() {
        let mut h = Harness::new(Script::default());
        let before = h.store.conversation_id().clone();
        h.run(ChatCommand::Reset).await;
        assert_ne!(h.store.conversation_id(), &before);
        assert_eq!(h.notices(), vec!["Conversation reset!"]);
    }

    #[tokio::test]
    async fn test_session_commands() {
        let mut h = Harness::new(Script {
            session_tokens: 17,
            ..Script::default()
        });
        h.load().await;
        h.run(ChatCommand::SaveSession).await;
        h.run(ChatCommand::LoadSession).await;
        assert_eq!(
            h.notices(),
            vec![
                "Session saved! 17 tokens saved.",
                "Session loaded! 17 tokens loaded."
            ]
        );
        assert!(h
            .engine
            .calls()
            .contains(&EngineCall::SaveSession(PathBuf::from(
                "/tmp/llama-session.bin"
            ))));
    }

    #[tokio::test]
    async fn test_session_failure_notices() {
        let mut h = Harness::new(Script {
            session_error: Some("file not found".to_string()),
            ..Script::default()
        });
        h.load().await;
        h.run(ChatCommand::SaveSession).await;
        h.run(ChatCommand::LoadSession).await;
        assert_eq!(
            h.notices(),
            vec![
                "Session save failed: file not found",
                "Session load failed: file not found"
            ]
        );
    }
}
