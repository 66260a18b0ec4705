//! Streaming completion controller
//!
//! Drives one completion at a time through
//! `Idle -> Requested -> Streaming -> {Completed | Failed | Cancelled}`.
//!
//! The engine call runs on a spawned task. That task never touches the
//! conversation store: it sends [`CompletionEvent`]s over the chat loop's
//! channel and the loop applies them with [`CompletionController::on_token`]
//! and [`CompletionController::finish`]. Tokens of one request arrive in
//! generation order, followed by exactly one settlement.
//!
//! Every request remembers its own reply message id, so late tokens of a
//! stopped request still land in that request's message and never in a
//! newer one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conversation::ConversationStore;
use crate::engine::{
    CompletionParams, CompletionResult, CompletionTimings, InferenceContext, TokenData, TokenSink,
};
use crate::error::{LlamaChatError, Result};
use crate::message::{new_message_id, Author, ContextId, ConversationId, Message, MessageMetadata};
use crate::metrics::CompletionMetrics;

/// How long a stopped request may keep running before its task gives up on it
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Identifies one completion request
pub type RequestId = u64;

/// Lifecycle state of the most recent request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// No request has been made yet
    Idle,
    /// The engine was called, no token yet
    Requested,
    /// At least one token arrived
    Streaming,
    /// The engine finished normally
    Completed,
    /// The engine reported an error
    Failed,
    /// The request was stopped by the user
    Cancelled,
}

/// How a request's task ended
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// The engine returned a result
    Finished(CompletionResult),
    /// The engine returned an error
    Failed(String),
    /// The request was stopped and the engine did not return within the grace period
    Abandoned,
}

/// Event sent from a request task to the chat loop
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    /// A generated token
    Token {
        /// Originating request
        request: RequestId,
        /// Token text
        token: String,
    },
    /// The request's task ended
    Settled {
        /// Originating request
        request: RequestId,
        /// How it ended
        outcome: SettleOutcome,
    },
}

/// Where a request's output goes
#[derive(Debug)]
struct ReplyTarget {
    message_id: String,
    created_at: DateTime<Utc>,
    context_id: ContextId,
    conversation_id: ConversationId,
    inserted: bool,
    stopped: bool,
    metrics: CompletionMetrics,
}

struct ActiveRequest {
    id: RequestId,
    context: Arc<dyn InferenceContext>,
    cancel: CancellationToken,
}

/// Per-chat completion state machine
pub struct CompletionController {
    events: mpsc::UnboundedSender<CompletionEvent>,
    next_request: RequestId,
    state: CompletionState,
    active: Option<ActiveRequest>,
    targets: HashMap<RequestId, ReplyTarget>,
    stop_grace: Duration,
}

impl CompletionController {
    /// Create a controller that reports to `events`
    pub fn new(events: mpsc::UnboundedSender<CompletionEvent>) -> Self {
        Self {
            events,
            next_request: 1,
            state: CompletionState::Idle,
            active: None,
            targets: HashMap::new(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Override the stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Whether a request is `Requested` or `Streaming`
    pub fn is_inferencing(&self) -> bool {
        self.active.is_some()
    }

    /// State of the most recent request
    pub fn state(&self) -> CompletionState {
        self.state
    }

    /// Id of the in-flight request
    pub fn active_request(&self) -> Option<RequestId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Reply message id reserved for `request`, while it is unsettled
    pub fn reply_id(&self, request: RequestId) -> Option<&str> {
        self.targets.get(&request).map(|t| t.message_id.as_str())
    }

    /// Start a completion on `context`
    ///
    /// The reply message id and timestamp are fixed now; the message itself
    /// is inserted with the first token.
    ///
    /// # Errors
    ///
    /// Returns [`LlamaChatError::AlreadyInferencing`] while another request is
    /// in flight.
    pub fn start(
        &mut self,
        context: Arc<dyn InferenceContext>,
        params: CompletionParams,
        conversation_id: ConversationId,
    ) -> Result<RequestId> {
        if self.is_inferencing() {
            return Err(LlamaChatError::AlreadyInferencing.into());
        }

        let request = self.next_request;
        self.next_request += 1;

        let context_id = context.id().clone();
        self.targets.insert(
            request,
            ReplyTarget {
                message_id: new_message_id(),
                created_at: Utc::now(),
                metrics: CompletionMetrics::new(context_id.as_str()),
                context_id,
                conversation_id,
                inserted: false,
                stopped: false,
            },
        );

        let cancel = CancellationToken::new();
        self.active = Some(ActiveRequest {
            id: request,
            context: Arc::clone(&context),
            cancel: cancel.clone(),
        });
        self.state = CompletionState::Requested;
        tracing::debug!("Completion request {} started on {}", request, context.id());

        let events = self.events.clone();
        let grace = self.stop_grace;
        tokio::spawn(async move {
            let token_events = events.clone();
            let on_token: TokenSink = Box::new(move |data: TokenData| {
                let _ = token_events.send(CompletionEvent::Token {
                    request,
                    token: data.token,
                });
            });

            let outcome = tokio::select! {
                biased;
                result = context.completion(params, on_token) => match result {
                    Ok(result) => SettleOutcome::Finished(result),
                    Err(e) => SettleOutcome::Failed(e.to_string()),
                },
                _ = abandon_after(cancel, grace) => SettleOutcome::Abandoned,
            };

            if events
                .send(CompletionEvent::Settled { request, outcome })
                .is_err()
            {
                tracing::debug!("Chat loop gone before request {} settled", request);
            }
        });

        Ok(request)
    }

    /// Merge a token into the request's reply message
    ///
    /// The first token inserts the message, later tokens are appended. Leading
    /// whitespace is stripped after every merge.
    pub fn on_token(&mut self, store: &mut ConversationStore, request: RequestId, token: &str) {
        let Some(target) = self.targets.get_mut(&request) else {
            tracing::debug!("Dropping token for settled request {}", request);
            return;
        };

        if self.active.as_ref().map(|a| a.id) == Some(request)
            && self.state == CompletionState::Requested
        {
            self.state = CompletionState::Streaming;
        }
        target.metrics.record_token();

        if !target.inserted {
            store.insert(Message::with_id(
                target.message_id.clone(),
                Author::System,
                target.created_at,
                "",
                MessageMetadata {
                    context_id: Some(target.context_id.clone()),
                    conversation_id: Some(target.conversation_id.clone()),
                    ..MessageMetadata::default()
                },
            ));
            target.inserted = true;
        }
        store.append_token(&target.message_id, token);
    }

    /// Apply a request's settlement
    ///
    /// Success stamps the timings summary on the reply when the engine
    /// reported timings. Failure of a request that was not stopped adds a
    /// `Completion failed` notice; partial output stays. The inferencing flag
    /// clears only when `request` is the one in flight.
    pub fn finish(
        &mut self,
        store: &mut ConversationStore,
        request: RequestId,
        outcome: SettleOutcome,
    ) {
        let Some(target) = self.targets.remove(&request) else {
            tracing::debug!("Ignoring duplicate settlement of request {}", request);
            return;
        };
        let is_active = self.active.as_ref().map(|a| a.id) == Some(request);

        let (state, status) = match outcome {
            SettleOutcome::Finished(result) => {
                let summary = result.timings.as_ref().map(CompletionTimings::summary);
                if let (true, Some(summary)) = (target.inserted, &summary) {
                    store.set_timings(&target.message_id, summary.as_str());
                }
                let status = status_of(&target, result.interrupted);
                target.metrics.record_completion(
                    status,
                    result.timings.as_ref().map(|t| t.predicted_per_second),
                );
                tracing::debug!(
                    "Completion request {} finished: {}",
                    request,
                    summary.as_deref().unwrap_or("no timings")
                );
                if status == "cancelled" {
                    (CompletionState::Cancelled, status)
                } else {
                    (CompletionState::Completed, status)
                }
            }
            SettleOutcome::Failed(message) => {
                if target.stopped {
                    tracing::debug!("Stopped request {} ended with: {}", request, message);
                    target.metrics.record_completion("cancelled", None);
                    (CompletionState::Cancelled, "cancelled")
                } else {
                    tracing::error!("Completion failed: {}", message);
                    store.insert(Message::notice(format!("Completion failed: {}", message)));
                    target.metrics.record_completion("failed", None);
                    (CompletionState::Failed, "failed")
                }
            }
            SettleOutcome::Abandoned => {
                tracing::warn!("Request {} did not stop within the grace period", request);
                target.metrics.record_completion("cancelled", None);
                (CompletionState::Cancelled, "cancelled")
            }
        };

        if is_active {
            self.active = None;
            self.state = state;
        }
        tracing::debug!("Completion request {} settled as {}", request, status);
    }

    /// Stop the in-flight request
    ///
    /// Asks the engine to stop, arms the request's abandonment timer and
    /// clears the inferencing flag right away. Returns `false` when nothing is
    /// streaming.
    pub async fn stop(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        if let Some(target) = self.targets.get_mut(&active.id) {
            target.stopped = true;
        }
        self.state = CompletionState::Cancelled;
        tracing::info!("Stopping completion request {}", active.id);

        if let Err(e) = active.context.stop_completion().await {
            tracing::warn!("Engine stop request failed: {}", e);
        }
        active.cancel.cancel();
        true
    }
}

fn status_of(target: &ReplyTarget, interrupted: bool) -> &'static str {
    if target.stopped || interrupted {
        "cancelled"
    } else {
        "completed"
    }
}

async fn abandon_after(cancel: CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{EngineCall, Script, ScriptedEngine};
    use crate::engine::{ContextParams, InferenceEngine};
    use std::path::Path;

    async fn setup(
        script: Script,
    ) -> (
        CompletionController,
        mpsc::UnboundedReceiver<CompletionEvent>,
        Arc<dyn InferenceContext>,
        ScriptedEngine,
    ) {
        let engine = ScriptedEngine::new(script);
        let context = engine
            .initialize(Path::new("m.gguf"), &ContextParams::default())
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (CompletionController::new(tx), rx, context, engine)
    }

    /// Apply events until `request` settles
    async fn run_until_settled(
        controller: &mut CompletionController,
        rx: &mut mpsc::UnboundedReceiver<CompletionEvent>,
        store: &mut ConversationStore,
        request: RequestId,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                CompletionEvent::Token { request: r, token } => {
                    controller.on_token(store, r, &token)
                }
                CompletionEvent::Settled { request: r, outcome } => {
                    controller.finish(store, r, outcome);
                    if r == request {
                        return;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_completion_streams_and_stamps_timings() {
        let (mut controller, mut rx, context, _engine) = setup(Script {
            tokens: vec![" Hel".into(), "lo".into(), "!".into()],
            ..Script::default()
        })
        .await;
        let mut store = ConversationStore::new();

        let request = controller
            .start(
                Arc::clone(&context),
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap();
        assert!(controller.is_inferencing());
        assert_eq!(controller.state(), CompletionState::Requested);

        run_until_settled(&mut controller, &mut rx, &mut store, request).await;

        assert!(!controller.is_inferencing());
        assert_eq!(controller.state(), CompletionState::Completed);
        assert_eq!(store.len(), 1);
        let reply = store.latest().unwrap();
        assert_eq!(reply.text(), "Hello!");
        assert_eq!(reply.author(), Author::System);
        assert_eq!(reply.metadata().context_id.as_ref(), Some(context.id()));
        assert_eq!(
            reply.metadata().timings.as_deref(),
            Some("25ms per token, 40.00 tokens per second")
        );
    }

    #[tokio::test]
    async fn test_start_refused_while_inferencing() {
        let (mut controller, _rx, context, _engine) = setup(Script {
            hold_until_stopped: true,
            ..Script::default()
        })
        .await;

        controller
            .start(
                Arc::clone(&context),
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap();
        let err = controller
            .start(
                context,
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LlamaChatError>(),
            Some(LlamaChatError::AlreadyInferencing)
        ));
    }

    #[tokio::test]
    async fn test_failure_emits_notice_and_keeps_partial() {
        let (mut controller, mut rx, context, _engine) = setup(Script {
            tokens: vec!["partial".into()],
            completion_error: Some("context full".into()),
            ..Script::default()
        })
        .await;
        let mut store = ConversationStore::new();

        let request = controller
            .start(
                context,
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap();
        run_until_settled(&mut controller, &mut rx, &mut store, request).await;

        assert_eq!(controller.state(), CompletionState::Failed);
        assert!(!controller.is_inferencing());
        let texts: Vec<&str> = store.messages().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["partial", "Completion failed: context full"]);
        assert!(store.latest().unwrap().is_notice());
    }

    #[tokio::test]
    async fn test_stop_clears_flag_immediately() {
        let (mut controller, mut rx, context, engine) = setup(Script {
            hold_until_stopped: true,
            ..Script::default()
        })
        .await;
        let mut store = ConversationStore::new();

        let request = controller
            .start(
                Arc::clone(&context),
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap();

        // wait for both tokens so the engine is parked on the stop signal
        for _ in 0..2 {
            if let Some(CompletionEvent::Token { request: r, token }) = rx.recv().await {
                controller.on_token(&mut store, r, &token);
            }
        }
        assert_eq!(controller.state(), CompletionState::Streaming);

        assert!(controller.stop().await);
        assert!(!controller.is_inferencing());
        assert_eq!(controller.state(), CompletionState::Cancelled);
        assert!(engine
            .calls()
            .contains(&EngineCall::Stop(context.id().clone())));

        run_until_settled(&mut controller, &mut rx, &mut store, request).await;
        assert_eq!(controller.state(), CompletionState::Cancelled);
        assert_eq!(store.len(), 1);
        assert!(!store.messages().iter().any(|m| m.is_notice()));
    }

    #[tokio::test]
    async fn test_stopped_reply_without_timings_is_not_stamped() {
        let (mut controller, mut rx, context, _engine) = setup(Script {
            hold_until_stopped: true,
            ..Script::default()
        })
        .await;
        let mut store = ConversationStore::new();

        let request = controller
            .start(
                context,
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap();
        for _ in 0..2 {
            if let Some(CompletionEvent::Token { request: r, token }) = rx.recv().await {
                controller.on_token(&mut store, r, &token);
            }
        }
        controller.stop().await;

        controller.finish(
            &mut store,
            request,
            SettleOutcome::Finished(CompletionResult {
                text: "Hello!".into(),
                timings: None,
                interrupted: true,
            }),
        );
        assert_eq!(controller.state(), CompletionState::Cancelled);
        let reply = store.latest().unwrap();
        assert_eq!(reply.text(), "Hello!");
        assert!(reply.metadata().timings.is_none());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (mut controller, _rx, _context, engine) = setup(Script::default()).await;
        assert!(!controller.stop().await);
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Stop(_))));
    }

    #[tokio::test]
    async fn test_late_settlement_does_not_clear_newer_request() {
        let (mut controller, mut rx, context, engine) = setup(Script {
            hold_until_stopped: true,
            tokens: vec![],
            ..Script::default()
        })
        .await;
        let mut store = ConversationStore::new();

        let first = controller
            .start(
                Arc::clone(&context),
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap();
        while !engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Completion { .. }))
        {
            tokio::task::yield_now().await;
        }
        controller.stop().await;

        let second = controller
            .start(
                Arc::clone(&context),
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap();
        assert_ne!(first, second);

        run_until_settled(&mut controller, &mut rx, &mut store, first).await;
        assert!(controller.is_inferencing());
        assert_eq!(controller.active_request(), Some(second));
        assert_eq!(controller.state(), CompletionState::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_ignoring_stop_is_abandoned() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut controller = CompletionController::new(tx).with_stop_grace(Duration::from_secs(1));
        let context: Arc<dyn InferenceContext> = Arc::new(DeafContext {
            id: ContextId::new("deaf"),
        });
        let mut store = ConversationStore::new();

        let request = controller
            .start(
                context,
                CompletionParams::chat_defaults("p"),
                ConversationId::default(),
            )
            .unwrap();
        controller.stop().await;

        let event = rx.recv().await.unwrap();
        match event {
            CompletionEvent::Settled { request: r, outcome } => {
                assert_eq!(r, request);
                assert!(matches!(outcome, SettleOutcome::Abandoned));
                controller.finish(&mut store, r, outcome);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(store.is_empty());
    }

    /// Context whose completion never returns and ignores stop requests
    struct DeafContext {
        id: ContextId,
    }

    #[async_trait::async_trait]
    impl InferenceContext for DeafContext {
        fn id(&self) -> &ContextId {
            &self.id
        }
        fn gpu_enabled(&self) -> bool {
            false
        }
        fn gpu_disabled_reason(&self) -> Option<String> {
            None
        }
        async fn release(&self) -> Result<()> {
            Ok(())
        }
        async fn completion(
            &self,
            _params: CompletionParams,
            _on_token: TokenSink,
        ) -> Result<CompletionResult> {
            std::future::pending().await
        }
        async fn stop_completion(&self) -> Result<()> {
            Ok(())
        }
        async fn tokenize(&self, _text: &str) -> Result<crate::engine::TokenizeResult> {
            Ok(Default::default())
        }
        async fn bench(
            &self,
            _pp: u32,
            _tg: u32,
            _pl: u32,
            _nr: u32,
        ) -> Result<crate::engine::BenchResult> {
            Ok(Default::default())
        }
        async fn save_session(&self, _path: &Path) -> Result<usize> {
            Ok(0)
        }
        async fn load_session(&self, _path: &Path) -> Result<crate::engine::SessionLoadResult> {
            Ok(Default::default())
        }
    }
}
