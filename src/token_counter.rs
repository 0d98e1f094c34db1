//! Context-window occupancy tracking.
//!
//! The counter estimates how full the model's context window is from the
//! usage report of the most recent call: input tokens (including both
//! cache classes) plus output tokens approximate the context occupied
//! after the response. The compactor triggers off [`TokenCounter::usage_percent`].

use serde::Serialize;

use crate::usage::UsageInfo;

/// Context-window sizes per model, in tokens.
const MODEL_CONTEXT_WINDOWS: &[(&str, u64)] = &[
    ("claude-sonnet-4-20250514", 200_000),
    ("claude-haiku-4-20250514", 200_000),
    ("claude-opus-4-20250514", 200_000),
];

/// Fallback window for unknown models.
const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Looks up the context window for a model.
pub fn context_window_for(model: &str) -> u64 {
    MODEL_CONTEXT_WINDOWS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Tracks the conversation's estimated context-window occupancy.
#[derive(Debug, Clone)]
pub struct TokenCounter {
    context_window: u64,
    last_input_tokens: u64,
    last_output_tokens: u64,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW)
    }
}

impl TokenCounter {
    /// Creates a counter for the given window size.
    pub fn new(context_window: u64) -> Self {
        Self {
            context_window,
            last_input_tokens: 0,
            last_output_tokens: 0,
        }
    }

    /// Creates a counter sized for the given model.
    pub fn for_model(model: &str) -> Self {
        Self::new(context_window_for(model))
    }

    /// The configured window size.
    pub fn context_window(&self) -> u64 {
        self.context_window
    }

    /// Estimated tokens currently occupying the context window: the last
    /// call's total input (cache included) plus its output.
    pub fn current_context_tokens(&self) -> u64 {
        self.last_input_tokens + self.last_output_tokens
    }

    /// Occupancy as a percentage in `0.0..`. Zero-sized windows report 0.
    pub fn usage_percent(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        self.current_context_tokens() as f64 / self.context_window as f64 * 100.0
    }

    /// Updates from a provider usage report.
    pub fn update_from_usage(&mut self, usage: &UsageInfo) {
        self.last_input_tokens = usage.input_tokens
            + usage.cache_creation_input_tokens
            + usage.cache_read_input_tokens;
        self.last_output_tokens = usage.output_tokens;

        log::debug!(
            "token counter updated: {}/{} ({:.2}%)",
            self.current_context_tokens(),
            self.context_window,
            self.usage_percent(),
        );
    }

    /// Updates from an exact pre-flight `count_tokens` result. Only input
    /// exists at that point, so output resets to zero.
    pub fn update_from_count(&mut self, input_tokens: u64) {
        self.last_input_tokens = input_tokens;
        self.last_output_tokens = 0;
    }

    /// Restores the last counts from persisted state.
    pub fn set_last_tokens(&mut self, input_tokens: u64, output_tokens: u64) {
        self.last_input_tokens = input_tokens;
        self.last_output_tokens = output_tokens;
    }

    /// Snapshot for the usage endpoint.
    pub fn status(&self) -> ContextStatus {
        ContextStatus {
            current_tokens: self.current_context_tokens(),
            context_window: self.context_window,
            usage_percent: self.usage_percent(),
        }
    }
}

/// Serializable context-occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContextStatus {
    pub current_tokens: u64,
    pub context_window: u64,
    pub usage_percent: f64,
}
