//! Inference metrics
//!
//! Counters and histograms for context lifecycle and completions, emitted
//! through the `metrics` facade. Nothing is exported unless the embedding
//! binary installs a recorder.
//!
//! # Metrics
//!
//! - `llamachat_context_inits_total`: context initializations by status
//! - `llamachat_context_releases_total`: context releases by status
//! - `llamachat_completions_total`: completions by status
//! - `llamachat_completion_duration_seconds`: wall time per completion
//! - `llamachat_tokens_streamed`: tokens delivered per completion
//! - `llamachat_tokens_per_second`: engine-reported generation speed
//! - `llamachat_completions_active`: gauge of in-flight completions
//!
//! # Examples
//!
//! ```
//! use llamachat::metrics::CompletionMetrics;
//!
//! let metrics = CompletionMetrics::new("ctx1");
//! metrics.record_token();
//! metrics.record_completion("completed", Some(42.0));
//! assert_eq!(metrics.tokens(), 1);
//! ```

use ::metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::cell::Cell;
use std::time::Instant;

/// Metrics for a single completion request
///
/// Uses `Cell` so recording works through shared references. The value
/// lives with the request record on the chat loop, never across threads.
#[derive(Debug)]
pub struct CompletionMetrics {
    context: String,
    start: Instant,
    tokens: Cell<u64>,
    recorded: Cell<bool>,
}

impl CompletionMetrics {
    /// Start tracking a completion on `context`
    pub fn new(context: impl Into<String>) -> Self {
        let context = context.into();
        increment_gauge!("llamachat_completions_active", 1.0);
        Self {
            context,
            start: Instant::now(),
            tokens: Cell::new(0),
            recorded: Cell::new(false),
        }
    }

    /// Count one streamed token
    pub fn record_token(&self) {
        self.tokens.set(self.tokens.get() + 1);
    }

    /// Tokens counted so far
    pub fn tokens(&self) -> u64 {
        self.tokens.get()
    }

    /// Record how the completion ended
    ///
    /// Only the first call has an effect.
    ///
    /// # Arguments
    ///
    /// * `status` - `"completed"`, `"failed"` or `"cancelled"`
    /// * `tokens_per_second` - Engine-reported speed, when known
    pub fn record_completion(&self, status: &str, tokens_per_second: Option<f64>) {
        if self.recorded.get() {
            return;
        }
        self.recorded.set(true);

        histogram!(
            "llamachat_completion_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "status" => status.to_string()
        );
        histogram!(
            "llamachat_tokens_streamed",
            self.tokens.get() as f64,
            "context" => self.context.clone()
        );
        if let Some(tps) = tokens_per_second {
            histogram!("llamachat_tokens_per_second", tps);
        }
        increment_counter!("llamachat_completions_total", "status" => status.to_string());
        decrement_gauge!("llamachat_completions_active", 1.0);
    }
}

impl Drop for CompletionMetrics {
    fn drop(&mut self) {
        if !self.recorded.get() {
            decrement_gauge!("llamachat_completions_active", 1.0);
        }
    }
}

/// Count a context initialization attempt
pub fn record_context_init(status: &str) {
    increment_counter!("llamachat_context_inits_total", "status" => status.to_string());
}

/// Count a context release attempt
pub fn record_context_release(status: &str) {
    increment_counter!("llamachat_context_releases_total", "status" => status.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_counting() {
        let metrics = CompletionMetrics::new("ctx1");
        metrics.record_token();
        metrics.record_token();
        assert_eq!(metrics.tokens(), 2);
    }

    #[test]
    fn test_record_completion_once() {
        let metrics = CompletionMetrics::new("ctx1");
        metrics.record_completion("completed", Some(10.0));
        assert!(metrics.recorded.get());
        metrics.record_completion("failed", None);
        assert!(metrics.recorded.get());
    }

    #[test]
    fn test_drop_without_recording() {
        let _metrics = CompletionMetrics::new("ctx1");
    }

    #[test]
    fn test_lifecycle_counters_do_not_panic() {
        record_context_init("success");
        record_context_release("error");
    }
}
