//! The agent loop: the orchestrator tying provider, tools, skills,
//! sessions and compaction together.
//!
//! One call to [`Agent::stream_message`] runs one turn: append the user
//! message, stream the model's response while executing any requested
//! tools, persist the transcript, and compact when the token budget is
//! tight. The returned stream yields [`AgentItem`]s in the order a client
//! renders them: text tokens, then `preamble_end` when a tool step
//! follows, `tool_call` lifecycle events (all `started` before any
//! `completed`/`failed`), re-emitted tool side-channel events, and a
//! `compacted` notice when compaction ran.
//!
//! # Transcript invariants
//!
//! After a successful turn every assistant `tool_use` block is answered
//! by a `tool_result` with the same id in the immediately following user
//! message. After a failed turn the conversation either equals its
//! pre-turn state or extends it by exactly one well-formed
//! `(user, assistant)` pair holding whatever partial text was streamed;
//! a dangling `tool_use` never persists.
//!
//! Cancellation is cooperative: dropping the turn stream aborts the
//! in-flight provider call and any pending tool tasks at their next
//! suspension point, and file locks release through their RAII guards.
//! Nothing is persisted for a dropped turn, since the session save runs
//! after the loop completes.

use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use futures::future::join_all;
use serde_json::Value;

use crate::compact::{COMPACT_THRESHOLD_PERCENT, compact_conversation};
use crate::config::AgentConfig;
use crate::multimodal::{Attachment, build_content};
use crate::provider::ModelProvider;
use crate::session::SessionBackend;
use crate::skills::SkillRegistry;
use crate::token_counter::TokenCounter;
use crate::tools::{ToolRegistry, render_tool_output};
use crate::types::{
    AgentItem, ContentBlock, Message, MessageContent, Role, StopReason, ToolCallStatus,
    ToolResultBlock, ToolUseBlock,
};
use crate::usage::UsageMonitor;
use crate::{Error, Result};

struct SessionHandle {
    backend: Arc<dyn SessionBackend>,
    session_id: String,
}

/// Conversational agent owning one conversation.
///
/// The agent exclusively owns its conversation during a turn; the session
/// backend owns the persisted copy between turns.
pub struct Agent {
    config: AgentConfig,
    provider: Arc<dyn ModelProvider>,
    conversation: Vec<Message>,
    tools: Option<Arc<ToolRegistry>>,
    skills: Option<SkillRegistry>,
    usage_monitor: UsageMonitor,
    token_counter: TokenCounter,
    session: Option<SessionHandle>,
}

impl Agent {
    /// Creates an agent over the given provider with no tools, skills or
    /// session attached.
    pub fn new(config: AgentConfig, provider: Arc<dyn ModelProvider>) -> Self {
        let model = config.provider.model.clone();
        log::info!("agent initialized: model={model}");
        Self {
            provider,
            conversation: Vec::new(),
            tools: None,
            skills: None,
            usage_monitor: UsageMonitor::new(&model),
            token_counter: TokenCounter::for_model(&model),
            session: None,
            config,
        }
    }

    /// Attaches a tool registry.
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Attaches a skill registry.
    pub fn with_skills(mut self, skills: SkillRegistry) -> Self {
        self.skills = Some(skills);
        self
    }

    /// Attaches a session backend; the turn persists the conversation and
    /// usage under `session_id` after each successful loop.
    pub fn with_session(
        mut self,
        backend: Arc<dyn SessionBackend>,
        session_id: impl Into<String>,
    ) -> Self {
        self.session = Some(SessionHandle {
            backend,
            session_id: session_id.into(),
        });
        self
    }

    /// Loads the persisted conversation and usage for the attached
    /// session, restoring the token counter from the last usage record.
    pub async fn restore_session(&mut self) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };

        self.conversation = session.backend.load(&session.session_id).await?;
        let records = session.backend.load_usage(&session.session_id).await?;
        if let Some(last) = records.last() {
            self.token_counter
                .set_last_tokens(last.total_input_tokens(), last.output_tokens);
        }
        self.usage_monitor.load_records(records);
        log::debug!(
            "session restored: {} messages",
            self.conversation.len()
        );
        Ok(())
    }

    /// The conversation transcript.
    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    /// Replaces the conversation (e.g. when adopting a transcript loaded
    /// elsewhere). Callers must not do this mid-turn.
    pub fn set_conversation(&mut self, conversation: Vec<Message>) {
        self.conversation = conversation;
    }

    /// Clears the conversation.
    pub fn reset_conversation(&mut self) {
        self.conversation.clear();
    }

    /// The usage monitor.
    pub fn usage_monitor(&self) -> &UsageMonitor {
        &self.usage_monitor
    }

    /// The token counter.
    pub fn token_counter(&self) -> &TokenCounter {
        &self.token_counter
    }

    /// Mutable access to the skill registry, when attached.
    pub fn skills_mut(&mut self) -> Option<&mut SkillRegistry> {
        self.skills.as_mut()
    }

    /// Measures the current conversation exactly through the provider's
    /// token-counting endpoint and updates the token counter.
    pub async fn measure_context(&mut self) -> Result<u64> {
        let system = match &self.skills {
            Some(skills) => skills.compose(&self.config.system_prompt),
            None => self.config.system_prompt.clone(),
        };
        let tools = self
            .tools
            .as_ref()
            .map(|r| r.definitions())
            .unwrap_or_default();

        let count = self
            .provider
            .count_tokens(
                &self.conversation,
                &system,
                &tools,
                self.config.provider.max_tokens,
            )
            .await?;
        self.token_counter.update_from_count(count);
        Ok(count)
    }

    /// Runs one turn, returning the item stream for the caller to drain.
    ///
    /// The user message is appended before the stream is returned;
    /// failure paths inside the stream roll the conversation back per the
    /// transcript invariants above.
    ///
    /// # Errors
    ///
    /// Returns eagerly on blank input or invalid attachments, leaving the
    /// conversation untouched.
    pub fn stream_message<'a>(
        &'a mut self,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<impl Stream<Item = Result<AgentItem>> + 'a> {
        let text = content.trim();
        if text.is_empty() {
            return Err(Error::invalid_input(
                "message must not be blank; enter some content",
            ));
        }

        let user_content = build_content(text, attachments)?;
        let turn_start = self.conversation.len();
        let user_message = Message {
            role: Role::User,
            content: user_content,
        };
        self.conversation.push(user_message.clone());
        log::debug!("user message appended ({} chars)", text.len());

        Ok(self.run_turn(turn_start, user_message))
    }

    /// The streaming tool loop for one turn.
    fn run_turn(
        &mut self,
        turn_start: usize,
        user_message: Message,
    ) -> impl Stream<Item = Result<AgentItem>> + '_ {
        try_stream! {
            let mut response_parts: Vec<String> = Vec::new();

            loop {
                let system = match &self.skills {
                    Some(skills) => skills.compose(&self.config.system_prompt),
                    None => self.config.system_prompt.clone(),
                };
                let tools = self
                    .tools
                    .as_ref()
                    .map(|r| r.definitions())
                    .unwrap_or_default();

                let opened = self
                    .provider
                    .stream(
                        &self.conversation,
                        &system,
                        &tools,
                        self.config.provider.max_tokens,
                    )
                    .await;
                let mut handle =
                    self.recover_turn(opened, turn_start, &user_message, &response_parts)?;

                loop {
                    match handle.next_text().await {
                        Some(Ok(fragment)) => {
                            response_parts.push(fragment.clone());
                            yield AgentItem::token(fragment);
                        }
                        Some(Err(e)) => {
                            self.recover_turn::<()>(
                                Err(e),
                                turn_start,
                                &user_message,
                                &response_parts,
                            )?;
                        }
                        None => break,
                    }
                }

                let finished = handle.final_result().await;
                let final_message =
                    self.recover_turn(finished, turn_start, &user_message, &response_parts)?;

                if let Some(usage) = &final_message.usage {
                    self.usage_monitor.record(usage);
                    self.token_counter.update_from_usage(usage);
                }

                self.conversation.push(Message {
                    role: Role::Assistant,
                    content: MessageContent::Blocks(final_message.content.clone()),
                });

                let no_tools = self.tools.as_ref().map(|r| r.is_empty()).unwrap_or(true);
                if final_message.stop_reason != StopReason::ToolUse || no_tools {
                    log::debug!(
                        "turn complete ({} chars streamed this round)",
                        response_parts.iter().map(String::len).sum::<usize>()
                    );
                    break;
                }

                if !response_parts.is_empty() {
                    yield AgentItem::PreambleEnd;
                    response_parts.clear();
                }

                let tool_uses: Vec<ToolUseBlock> = final_message
                    .content
                    .iter()
                    .filter_map(|b| b.as_tool_use().cloned())
                    .collect();

                // All started events go out before anything executes.
                for block in &tool_uses {
                    log::info!("executing tool: {} (id={})", block.name, block.id);
                    yield AgentItem::ToolCall {
                        name: block.name.clone(),
                        status: ToolCallStatus::Started,
                        error: None,
                    };
                }

                // One concurrent task per call; join preserves input order
                // regardless of completion order.
                let Some(registry) = self.tools.clone() else {
                    break;
                };
                let results = join_all(
                    tool_uses
                        .iter()
                        .map(|b| registry.execute(&b.name, b.input.clone())),
                )
                .await;

                let mut result_blocks = Vec::with_capacity(tool_uses.len());
                for (block, result) in tool_uses.iter().zip(results) {
                    match result {
                        Ok(value) => {
                            result_blocks.push(ContentBlock::ToolResult(ToolResultBlock::new(
                                &block.id,
                                render_tool_output(&value),
                            )));
                            yield AgentItem::ToolCall {
                                name: block.name.clone(),
                                status: ToolCallStatus::Completed,
                                error: None,
                            };
                        }
                        Err(e) => {
                            let message = e.to_string();
                            log::warn!("tool failed: {} ({message})", block.name);
                            result_blocks.push(ContentBlock::ToolResult(ToolResultBlock::error(
                                &block.id,
                                &message,
                            )));
                            yield AgentItem::ToolCall {
                                name: block.name.clone(),
                                status: ToolCallStatus::Failed,
                                error: Some(message),
                            };
                        }
                    }
                }

                self.conversation.push(Message::user_blocks(result_blocks));
            }

            // Re-emit events tools embedded in this turn's results.
            for (event, data) in extract_tool_events(&self.conversation[turn_start..]) {
                yield AgentItem::ToolEvent { event, data };
            }

            if let Some(session) = &self.session {
                session
                    .backend
                    .save(&session.session_id, &self.conversation)
                    .await?;
                session
                    .backend
                    .save_usage(&session.session_id, self.usage_monitor.records())
                    .await?;
            }

            if self.token_counter.usage_percent() >= COMPACT_THRESHOLD_PERCENT {
                let compacted = compact_conversation(
                    &mut self.conversation,
                    self.provider.as_ref(),
                    &self.token_counter,
                )
                .await;
                match compacted {
                    Ok(outcome) if outcome.truncated > 0 || outcome.summarized => {
                        if let Some(session) = &self.session {
                            session
                                .backend
                                .save(&session.session_id, &self.conversation)
                                .await?;
                        }
                        yield AgentItem::Compacted {
                            truncated: outcome.truncated,
                            summarized: outcome.summarized,
                        };
                    }
                    Ok(_) => {}
                    // Summarization failure leaves the conversation
                    // unchanged and is not surfaced to the caller.
                    Err(e) => log::warn!("compaction failed, conversation unchanged: {e}"),
                }
            }
        }
    }

    /// Applies the failure policy to a provider result.
    ///
    /// On `Auth`, and on any error without streamed text, the turn rolls
    /// back to its pre-turn state. On `Connection`/`Timeout` with partial
    /// text, the rollback re-appends the user message plus an assistant
    /// message holding the partial, so the transcript gains exactly one
    /// well-formed pair. The error always propagates.
    fn recover_turn<T>(
        &mut self,
        result: Result<T>,
        turn_start: usize,
        user_message: &Message,
        response_parts: &[String],
    ) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match &err {
            Error::Connection(_) | Error::Timeout if !response_parts.is_empty() => {
                let partial = response_parts.concat();
                self.conversation.truncate(turn_start);
                self.conversation.push(user_message.clone());
                self.conversation.push(Message::assistant_text(partial));
                log::warn!("stream interrupted; partial response kept ({err})");
            }
            _ => {
                self.conversation.truncate(turn_start);
                log::warn!("turn rolled back ({err})");
            }
        }
        Err(err)
    }
}

/// Extracts `sse_events` entries embedded in tool-result JSON payloads.
///
/// Tools push UI events (`file_open`, `file_change`) through this side
/// channel; entries without a `type` field are skipped.
fn extract_tool_events(messages: &[Message]) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    for msg in messages {
        if msg.role != Role::User {
            continue;
        }
        for block in msg.content.blocks() {
            let Some(result) = block.as_tool_result() else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<Value>(&result.content) else {
                continue;
            };
            let Some(entries) = parsed.get("sse_events").and_then(Value::as_array) else {
                continue;
            };
            for entry in entries {
                if let Some(event_type) = entry.get("type").and_then(Value::as_str) {
                    events.push((
                        event_type.to_string(),
                        entry.get("data").cloned().unwrap_or(Value::Null),
                    ));
                }
            }
        }
    }
    events
}
