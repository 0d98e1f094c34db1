//! Context compaction: keep the conversation under the token budget.
//!
//! Compaction runs after a turn whose token usage reaches
//! [`COMPACT_THRESHOLD_PERCENT`] of the context window, in two phases:
//!
//! - **Phase 1** replaces old tool-result contents with a short sentinel.
//!   No API call; the most recent rounds are preserved. A pass that
//!   truncated anything returns immediately on the assumption it freed
//!   enough space; the next over-threshold turn re-enters.
//! - **Phase 2** summarizes the early conversation through the provider's
//!   non-streaming call and replaces the prefix with a two-message
//!   summary exchange. It only runs when Phase 1 had nothing left to
//!   truncate.
//!
//! The split point for Phase 2 never lands between a `tool_use` and its
//! `tool_result`, so the suffix the model continues from is always
//! well-formed. The provider call happens before any mutation; a failed
//! summarization leaves the conversation byte-identical.

use crate::provider::ModelProvider;
use crate::token_counter::TokenCounter;
use crate::types::{ContentBlock, Message, MessageContent, Role};
use crate::Result;

/// Context-window usage (percent) at which compaction triggers.
pub const COMPACT_THRESHOLD_PERCENT: f64 = 80.0;

/// Sentinel that replaces truncated tool-result content.
pub const TRUNCATED_MARKER: &str = "[compacted tool result]";

/// System prompt for the summarization call.
const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a conversation summarization assistant. \
Condense the following conversation into a concise summary that preserves all important \
context, decisions and conclusions.";

/// Per-response budget for the summary itself.
const SUMMARY_MAX_TOKENS: u32 = 2048;

/// Messages kept verbatim at the tail when summarizing.
const DEFAULT_KEEP_LAST_N: usize = 4;

/// Tool-result rounds kept untruncated by Phase 1.
const DEFAULT_PRESERVE_ROUNDS: usize = 1;

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactOutcome {
    /// Tool-result blocks truncated by Phase 1.
    pub truncated: usize,
    /// Whether Phase 2 replaced the prefix with a summary.
    pub summarized: bool,
    /// The summary text when Phase 2 ran.
    pub summary: Option<String>,
}

/// Indices of user messages containing any tool result.
fn tool_result_rounds(conversation: &[Message]) -> Vec<usize> {
    conversation
        .iter()
        .enumerate()
        .filter(|(_, msg)| msg.has_tool_result())
        .map(|(i, _)| i)
        .collect()
}

/// Phase 1: replace old tool-result contents with [`TRUNCATED_MARKER`].
///
/// The last `preserve_last_n_rounds` tool-result rounds are left intact;
/// already-truncated blocks are skipped, which makes a second pass a
/// no-op. Returns the number of blocks truncated.
pub fn truncate_tool_results(
    conversation: &mut [Message],
    preserve_last_n_rounds: usize,
) -> usize {
    let rounds = tool_result_rounds(conversation);
    if rounds.is_empty() {
        return 0;
    }

    let truncate_until = rounds.len().saturating_sub(preserve_last_n_rounds);
    let mut truncated = 0;

    for &idx in &rounds[..truncate_until] {
        if let MessageContent::Blocks(blocks) = &mut conversation[idx].content {
            for block in blocks {
                if let ContentBlock::ToolResult(result) = block {
                    if result.content == TRUNCATED_MARKER {
                        continue;
                    }
                    result.content = TRUNCATED_MARKER.to_string();
                    truncated += 1;
                }
            }
        }
    }

    if truncated > 0 {
        log::info!("compaction phase 1 truncated {truncated} tool results");
    }
    truncated
}

/// Finds the summarization split point.
///
/// Starts `keep_last_n` from the end and walks backwards while the
/// message at the split is part of a tool exchange, so the cut never
/// separates a `tool_use` from its `tool_result`.
fn find_safe_split_point(conversation: &[Message], keep_last_n: usize) -> usize {
    if conversation.len() <= keep_last_n {
        return 0;
    }

    let mut split = conversation.len() - keep_last_n;
    while split > 0 {
        let msg = &conversation[split];
        if msg.has_tool_result() || msg.has_tool_use() {
            split -= 1;
            continue;
        }
        break;
    }
    split
}

fn format_block(block: &ContentBlock, parts: &mut Vec<String>) {
    match block {
        ContentBlock::Text(text) => parts.push(text.text.clone()),
        ContentBlock::ToolUse(tool_use) => {
            parts.push(format!("[invoked tool: {}]", tool_use.name));
        }
        ContentBlock::ToolResult(result) => {
            if result.content == TRUNCATED_MARKER {
                parts.push(TRUNCATED_MARKER.to_string());
            } else {
                let preview: String = result.content.chars().take(200).collect();
                parts.push(format!("[tool result: {preview}...]"));
            }
        }
        ContentBlock::Image(_) => parts.push("[image]".to_string()),
        ContentBlock::Document(_) => parts.push("[document]".to_string()),
    }
}

/// Renders messages as role-tagged plain text for the summary request.
fn format_messages_for_summary(messages: &[Message]) -> String {
    let mut lines = Vec::with_capacity(messages.len());
    for msg in messages {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let rendered = match &msg.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    format_block(block, &mut parts);
                }
                parts.join(" ")
            }
        };
        lines.push(format!("{role}: {rendered}"));
    }
    lines.join("\n")
}

/// Phase 2: summarize the early conversation through the provider.
///
/// Replaces the prefix before the safe split point with a synthetic
/// summary exchange, keeping the last `keep_last_n` messages (adjusted
/// for tool pairing) unchanged. Returns the summary, or `None` when the
/// conversation is too short to summarize.
///
/// # Errors
///
/// A failed provider call surfaces without mutating the conversation.
pub async fn summarize_conversation(
    conversation: &mut Vec<Message>,
    provider: &dyn ModelProvider,
    keep_last_n: usize,
) -> Result<Option<String>> {
    let split = find_safe_split_point(conversation, keep_last_n);
    if split < 2 {
        return Ok(None);
    }

    let request = vec![Message::user(format!(
        "Summarize the following conversation, preserving the important context:\n\n{}",
        format_messages_for_summary(&conversation[..split])
    ))];

    let result = provider
        .create(&request, SUMMARIZE_SYSTEM_PROMPT, SUMMARY_MAX_TOKENS)
        .await?;

    let summary: String = result
        .content
        .iter()
        .filter_map(ContentBlock::as_text)
        .collect();

    let mut replacement = vec![
        Message::user(format!(
            "Here is a summary of the prior conversation: {summary}"
        )),
        Message::assistant(vec![ContentBlock::text(
            "OK, I understand the prior conversation.",
        )]),
    ];
    replacement.extend(conversation.drain(split..));
    *conversation = replacement;

    log::info!(
        "compaction phase 2 summarized {split} messages, kept {}",
        conversation.len() - 2
    );
    Ok(Some(summary))
}

/// Full compaction pass: threshold check, Phase 1, then Phase 2 only when
/// Phase 1 truncated nothing.
pub async fn compact_conversation(
    conversation: &mut Vec<Message>,
    provider: &dyn ModelProvider,
    token_counter: &TokenCounter,
) -> Result<CompactOutcome> {
    let mut outcome = CompactOutcome::default();

    if token_counter.usage_percent() < COMPACT_THRESHOLD_PERCENT {
        return Ok(outcome);
    }

    log::info!(
        "starting compaction at {:.2}% context usage",
        token_counter.usage_percent()
    );

    outcome.truncated = truncate_tool_results(conversation, DEFAULT_PRESERVE_ROUNDS);
    if outcome.truncated > 0 {
        // Assume truncation freed enough; the next over-threshold turn
        // re-enters and reaches Phase 2 if it did not.
        return Ok(outcome);
    }

    if let Some(summary) =
        summarize_conversation(conversation, provider, DEFAULT_KEEP_LAST_N).await?
    {
        outcome.summarized = true;
        outcome.summary = Some(summary);
    }

    Ok(outcome)
}
