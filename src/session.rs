//! Inference session manager
//!
//! Owns at most one live [`InferenceContext`]. Loading a new model always
//! releases the current context first, so two contexts never coexist. The
//! manager is owned by the chat loop and every lifecycle operation takes
//! `&mut self`, which serializes initialize and release.

use std::path::Path;
use std::sync::Arc;

use crate::engine::{ContextParams, InferenceContext, InferenceEngine, SessionLoadResult};
use crate::error::{LlamaChatError, Result};
use crate::message::ContextId;
use crate::metrics;

/// What a successful initialization reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSummary {
    /// Identity of the new context
    pub id: ContextId,
    /// Whether generation runs on the GPU
    pub gpu_enabled: bool,
    /// Why it does not, when it does not
    pub gpu_disabled_reason: Option<String>,
}

impl ContextSummary {
    fn of(context: &dyn InferenceContext) -> Self {
        Self {
            id: context.id().clone(),
            gpu_enabled: context.gpu_enabled(),
            gpu_disabled_reason: context.gpu_disabled_reason(),
        }
    }
}

/// Result of [`SessionManager::release`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Nothing was held
    NotHeld,
    /// The context with this id was released
    Released(ContextId),
}

/// Holder of the single live inference context
pub struct SessionManager {
    engine: Arc<dyn InferenceEngine>,
    context: Option<Arc<dyn InferenceContext>>,
}

impl SessionManager {
    /// Create a manager that holds nothing yet
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            context: None,
        }
    }

    /// Load a model, replacing any held context
    ///
    /// A held context is released first and its release has settled before
    /// the engine is asked for the new one. A failed release is logged and
    /// does not block the replacement. On failure nothing is held.
    ///
    /// # Errors
    ///
    /// Returns the engine's initialization error.
    pub async fn initialize(
        &mut self,
        model_path: &Path,
        params: &ContextParams,
    ) -> Result<ContextSummary> {
        if let Err(e) = self.release().await {
            tracing::warn!("Releasing previous context failed: {}", e);
        }

        tracing::info!(
            "Initializing context for {} (n_gpu_layers={}, use_mlock={})",
            model_path.display(),
            params.n_gpu_layers,
            params.use_mlock
        );

        match self.engine.initialize(model_path, params).await {
            Ok(context) => {
                let summary = ContextSummary::of(context.as_ref());
                tracing::info!(
                    "Context {} initialized (gpu: {})",
                    summary.id,
                    summary.gpu_enabled
                );
                metrics::record_context_init("success");
                self.context = Some(context);
                Ok(summary)
            }
            Err(e) => {
                metrics::record_context_init("error");
                tracing::error!("Context initialization failed: {}", e);
                Err(e)
            }
        }
    }

    /// Release the held context, if any
    ///
    /// The reference is dropped before the engine is asked to release it, so
    /// even a failed release leaves nothing held.
    ///
    /// # Errors
    ///
    /// Returns [`LlamaChatError::ContextRelease`] carrying the engine's message.
    pub async fn release(&mut self) -> Result<ReleaseOutcome> {
        let Some(context) = self.context.take() else {
            return Ok(ReleaseOutcome::NotHeld);
        };
        let id = context.id().clone();
        tracing::info!("Releasing context {}", id);

        match context.release().await {
            Ok(()) => {
                metrics::record_context_release("success");
                Ok(ReleaseOutcome::Released(id))
            }
            Err(e) => {
                metrics::record_context_release("error");
                Err(LlamaChatError::ContextRelease(e.to_string()).into())
            }
        }
    }

    /// The held context
    pub fn context(&self) -> Option<Arc<dyn InferenceContext>> {
        self.context.clone()
    }

    /// Identity of the held context
    pub fn context_id(&self) -> Option<&ContextId> {
        self.context.as_ref().map(|c| c.id())
    }

    /// Whether a context is held
    pub fn is_loaded(&self) -> bool {
        self.context.is_some()
    }

    /// The held context, or [`LlamaChatError::NoContext`]
    pub fn require(&self) -> Result<Arc<dyn InferenceContext>> {
        self.context
            .clone()
            .ok_or_else(|| LlamaChatError::NoContext.into())
    }

    /// Persist the held context's KV cache
    ///
    /// Returns the number of tokens saved.
    pub async fn save_session(&self, path: &Path) -> Result<usize> {
        let context = self.require()?;
        tracing::debug!("Saving session of {} to {}", context.id(), path.display());
        context.save_session(path).await
    }

    /// Restore the held context's KV cache
    pub async fn load_session(&self, path: &Path) -> Result<SessionLoadResult> {
        let context = self.require()?;
        tracing::debug!(
            "Loading session into {} from {}",
            context.id(),
            path.display()
        );
        context.load_session(path).await
    }

    /// Release the held context on the way out
    pub async fn shutdown(&mut self) {
        match self.release().await {
            Ok(ReleaseOutcome::Released(id)) => tracing::debug!("Released {} on shutdown", id),
            Ok(ReleaseOutcome::NotHeld) => {}
            Err(e) => tracing::warn!("Release on shutdown failed: {}", e),
        }
    }
}
