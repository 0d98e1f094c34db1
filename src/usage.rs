//! Per-call token and cost accounting.
//!
//! Every provider response reports a [`UsageInfo`]; the [`UsageMonitor`]
//! turns those into timestamped [`UsageRecord`]s and aggregates them into a
//! [`UsageSummary`] with a USD cost estimate from the per-model pricing
//! table. Records serialize to JSON so session backends can persist them
//! and restore the monitor across process restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token usage reported by a single provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    /// Uncached input tokens.
    pub input_tokens: u64,
    /// Generated output tokens.
    pub output_tokens: u64,
    /// Input tokens written to the prompt cache.
    pub cache_creation_input_tokens: u64,
    /// Input tokens served from the prompt cache.
    pub cache_read_input_tokens: u64,
}

/// A timestamped usage record for one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
    /// Uncached input tokens.
    pub input_tokens: u64,
    /// Generated output tokens.
    pub output_tokens: u64,
    /// Input tokens written to the prompt cache.
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    /// Input tokens served from the prompt cache.
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl UsageRecord {
    /// Builds a record from a usage report, stamped now.
    pub fn from_usage(usage: &UsageInfo) -> Self {
        Self {
            timestamp: Utc::now(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
        }
    }

    /// Total input tokens including both cache classes.
    pub fn total_input_tokens(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }

    /// Fraction of input served from cache, in `0.0..=1.0`. Zero when the
    /// record carries no input at all.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.total_input_tokens();
        if total == 0 {
            return 0.0;
        }
        self.cache_read_input_tokens as f64 / total as f64
    }
}

// ============================================================================
// PRICING
// ============================================================================

/// USD prices per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

/// Per-model pricing table (USD per MTok).
const MODEL_PRICING: &[(&str, ModelPricing)] = &[
    (
        "claude-sonnet-4-20250514",
        ModelPricing {
            input: 3.0,
            output: 15.0,
            cache_write: 3.75,
            cache_read: 0.30,
        },
    ),
    (
        "claude-haiku-4-20250514",
        ModelPricing {
            input: 0.80,
            output: 4.0,
            cache_write: 1.0,
            cache_read: 0.08,
        },
    ),
    (
        "claude-opus-4-20250514",
        ModelPricing {
            input: 15.0,
            output: 75.0,
            cache_write: 18.75,
            cache_read: 1.50,
        },
    ),
];

/// Fallback pricing for unknown models.
const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input: 3.0,
    output: 15.0,
    cache_write: 3.75,
    cache_read: 0.30,
};

/// Looks up pricing for a model, falling back to Sonnet-class prices.
pub fn pricing_for(model: &str) -> ModelPricing {
    MODEL_PRICING
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_PRICING)
}

// ============================================================================
// SUMMARY
// ============================================================================

/// Aggregate token counts across all records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
    pub total_input: u64,
}

/// Cache effectiveness across all records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Overall cache hit rate as a percentage.
    pub hit_rate_percent: f64,
    pub requests_with_cache_hit: usize,
    pub requests_with_cache_write: usize,
}

/// Cost estimate in USD, broken down by token class.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostEstimate {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
    pub total: f64,
    /// What the same traffic would have cost without caching, minus `total`.
    pub saved_by_cache: f64,
}

/// Aggregated usage statistics for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub total_requests: usize,
    pub tokens: TokenTotals,
    pub cache: CacheStats,
    pub cost_estimate_usd: CostEstimate,
    /// The five most recent records, oldest first.
    pub recent_records: Vec<UsageRecord>,
}

// ============================================================================
// MONITOR
// ============================================================================

/// API usage monitor: one instance per session, mutated only by the
/// owning turn.
#[derive(Debug, Clone)]
pub struct UsageMonitor {
    /// Model name used for pricing.
    model: String,
    records: Vec<UsageRecord>,
    enabled: bool,
}

impl Default for UsageMonitor {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MODEL)
    }
}

impl UsageMonitor {
    /// Creates an enabled monitor pricing against the given model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            records: Vec::new(),
            enabled: true,
        }
    }

    /// Disables recording; `record` becomes a no-op.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Records one provider call. Returns the stored record, or `None`
    /// when monitoring is disabled.
    pub fn record(&mut self, usage: &UsageInfo) -> Option<&UsageRecord> {
        if !self.enabled {
            return None;
        }

        let record = UsageRecord::from_usage(usage);
        log::info!(
            "usage recorded: input={} output={} cache_creation={} cache_read={}",
            record.input_tokens,
            record.output_tokens,
            record.cache_creation_input_tokens,
            record.cache_read_input_tokens,
        );
        self.records.push(record);
        self.records.last()
    }

    /// All records, oldest first.
    pub fn records(&self) -> &[UsageRecord] {
        &self.records
    }

    /// The most recent record, if any.
    pub fn last_record(&self) -> Option<&UsageRecord> {
        self.records.last()
    }

    /// Restores records loaded from a session backend.
    pub fn load_records(&mut self, records: Vec<UsageRecord>) {
        self.records = records;
    }

    /// Drops all records.
    pub fn reset(&mut self) {
        self.records.clear();
    }

    /// Aggregates every record into a [`UsageSummary`].
    pub fn summary(&self) -> UsageSummary {
        if self.records.is_empty() {
            return UsageSummary::default();
        }

        let total_input: u64 = self.records.iter().map(|r| r.input_tokens).sum();
        let total_output: u64 = self.records.iter().map(|r| r.output_tokens).sum();
        let total_cache_creation: u64 = self
            .records
            .iter()
            .map(|r| r.cache_creation_input_tokens)
            .sum();
        let total_cache_read: u64 = self.records.iter().map(|r| r.cache_read_input_tokens).sum();
        let total_all_input: u64 = self.records.iter().map(|r| r.total_input_tokens()).sum();

        let hit_rate = if total_all_input > 0 {
            total_cache_read as f64 / total_all_input as f64
        } else {
            0.0
        };

        let pricing = pricing_for(&self.model);
        const MTOK: f64 = 1_000_000.0;
        let cost_input = total_input as f64 * pricing.input / MTOK;
        let cost_output = total_output as f64 * pricing.output / MTOK;
        let cost_cache_write = total_cache_creation as f64 * pricing.cache_write / MTOK;
        let cost_cache_read = total_cache_read as f64 * pricing.cache_read / MTOK;
        let total_cost = cost_input + cost_output + cost_cache_write + cost_cache_read;

        // What the same input volume would cost if nothing were cached.
        let cost_without_cache =
            (total_all_input as f64 * pricing.input + total_output as f64 * pricing.output) / MTOK;

        let recent_start = self.records.len().saturating_sub(5);

        UsageSummary {
            total_requests: self.records.len(),
            tokens: TokenTotals {
                input: total_input,
                output: total_output,
                cache_creation: total_cache_creation,
                cache_read: total_cache_read,
                total_input: total_all_input,
            },
            cache: CacheStats {
                hit_rate_percent: hit_rate * 100.0,
                requests_with_cache_hit: self
                    .records
                    .iter()
                    .filter(|r| r.cache_read_input_tokens > 0)
                    .count(),
                requests_with_cache_write: self
                    .records
                    .iter()
                    .filter(|r| r.cache_creation_input_tokens > 0)
                    .count(),
            },
            cost_estimate_usd: CostEstimate {
                input: cost_input,
                output: cost_output,
                cache_write: cost_cache_write,
                cache_read: cost_cache_read,
                total: total_cost,
                saved_by_cache: cost_without_cache - total_cost,
            },
            recent_records: self.records[recent_start..].to_vec(),
        }
    }
}
