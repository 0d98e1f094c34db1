//! # Agent Core
//!
//! The execution core of a conversational coding agent: a long-lived
//! orchestrator that accepts a user turn, drives a streaming dialog with an
//! LLM provider, executes requested tools against a sandboxed workspace,
//! persists transcripts across restarts, and keeps the dialog under a
//! bounded token budget through context compaction.
//!
//! ## Overview
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent_core::{Agent, AgentConfig, AnthropicProvider, KeyedLocks, Tool, ToolRegistry};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> agent_core::Result<()> {
//!     let config = AgentConfig::default();
//!     let provider = Arc::new(AnthropicProvider::new(config.provider.clone())?);
//!
//!     let mut tools = ToolRegistry::with_lock_provider(Arc::new(KeyedLocks::new()));
//!     tools.register(
//!         Tool::new(
//!             "read_file",
//!             "Read a file from the workspace",
//!             serde_json::json!({
//!                 "type": "object",
//!                 "properties": {"path": {"type": "string"}},
//!                 "required": ["path"],
//!             }),
//!             |args| async move {
//!                 let path = args["path"].as_str().unwrap_or_default();
//!                 Ok(serde_json::json!({"content": std::fs::read_to_string(path).unwrap_or_default()}))
//!             },
//!         )
//!         .with_file_param("path"),
//!     )?;
//!
//!     let mut agent = Agent::new(config, provider).with_tools(Arc::new(tools));
//!
//!     let stream = agent.stream_message("What's in Cargo.toml?", &[])?;
//!     futures::pin_mut!(stream);
//!     while let Some(item) = stream.next().await {
//!         println!("{:?}", item?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **types**: content blocks, messages, stop reasons and turn items
//! - **error**: the crate-wide error enum and retryability classification
//! - **config**: provider and agent configuration with builders
//! - **provider** / **anthropic**: the LLM seam and its Messages-API
//!   implementation (streaming, prompt-cache markers, retries)
//! - **retry**: exponential backoff with injectable sleep
//! - **tools**: tool registry with per-resource locking
//! - **skills**: two-phase system-prompt composition
//! - **compact**: tool-result truncation and conversation summarization
//! - **session**: transcript and usage persistence (memory, SQLite)
//! - **event_store**: append-only event log for resumable streams
//! - **multimodal**: attachment validation and content assembly
//! - **agent**: the orchestrating tool loop

mod agent;
mod anthropic;
mod config;
mod error;
mod event_store;
mod multimodal;
mod provider;
mod session;
mod skills;
mod token_counter;
mod tools;
mod types;
mod usage;

/// Context compaction: truncation and summarization. Public as a module
/// so embedders can drive compaction outside the agent loop.
pub mod compact;

/// Retry utilities with exponential backoff. Public as a module so
/// embedders can reuse the policy for their own provider calls.
pub mod retry;

// --- Agent ---

pub use agent::Agent;

// --- Configuration ---

pub use config::{
    AgentConfig, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT, ProviderConfig, ProviderConfigBuilder,
};

// --- Errors ---

pub use error::{Error, Result};

// --- Provider ---

pub use anthropic::AnthropicProvider;
pub use provider::{FinalMessage, ModelProvider, ProviderStream, StreamHandle, StreamItem};

// --- Tools ---

pub use tools::{
    KeyedLocks, LockGuard, LockProvider, Tool, ToolDefinition, ToolHandler, ToolRegistry,
    ToolSource, render_tool_output,
};

// --- Skills ---

pub use skills::{Skill, SkillRegistry};

// --- Sessions ---

pub use session::{
    MemorySessionBackend, SessionBackend, SessionSummary, SqliteSessionBackend,
    generate_session_id,
};

// --- Event store ---

pub use event_store::{EventStore, MemoryEventStore, StreamEvent, StreamState, StreamStatus};

// --- Multimodal ---

pub use multimodal::{
    Attachment, MAX_DOCUMENT_SIZE, MAX_IMAGE_SIZE, SUPPORTED_DOCUMENT_TYPES,
    SUPPORTED_IMAGE_TYPES, build_content, validate_attachment,
};

// --- Accounting ---

pub use token_counter::{ContextStatus, TokenCounter, context_window_for};
pub use usage::{
    CacheStats, CostEstimate, ModelPricing, TokenTotals, UsageInfo, UsageMonitor, UsageRecord,
    UsageSummary, pricing_for,
};

// --- Core types ---

pub use types::{
    AgentItem, ContentBlock, DocumentBlock, ImageBlock, MediaSource, Message, MessageContent,
    Role, StopReason, TextBlock, ToolCallStatus, ToolResultBlock, ToolUseBlock,
};

/// Convenience module re-exporting the most commonly used items.
pub mod prelude {
    pub use crate::{
        Agent, AgentConfig, AgentItem, AnthropicProvider, Attachment, ContentBlock, Error,
        Message, ModelProvider, ProviderConfig, Result, Skill, SkillRegistry, StopReason,
        StreamHandle, TextBlock, Tool, ToolRegistry, ToolUseBlock,
    };
}
