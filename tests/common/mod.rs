//! Shared test fixtures: a scripted provider standing in for the LLM
//! backend.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use agent_core::{
    ContentBlock, Error, FinalMessage, Message, ModelProvider, Result, StopReason, StreamHandle,
    StreamItem, ToolDefinition, ToolUseBlock, UsageInfo,
};

/// One scripted provider response.
pub enum ScriptedTurn {
    /// A healthy stream: fragments, then the final message.
    Stream {
        fragments: Vec<&'static str>,
        final_message: FinalMessage,
    },
    /// The stream opens, yields some fragments, then errors out.
    StreamThenError {
        fragments: Vec<&'static str>,
        error: Error,
    },
    /// Opening the stream fails outright.
    Fail(Error),
}

/// Provider that replays scripted turns in order.
pub struct MockProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    create_result: Mutex<Option<Result<FinalMessage>>>,
    create_calls: Mutex<Vec<(Vec<Message>, String)>>,
}

impl MockProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            create_result: Mutex::new(None),
            create_calls: Mutex::new(Vec::new()),
        }
    }

    /// Scripts the next `create` response (the summarizer path).
    pub fn set_create_result(&self, result: Result<FinalMessage>) {
        *self.create_result.lock().unwrap() = Some(result);
    }

    /// Arguments of every `create` call so far.
    pub fn create_calls(&self) -> Vec<(Vec<Message>, String)> {
        self.create_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn stream(
        &self,
        _messages: &[Message],
        _system: &str,
        _tools: &[ToolDefinition],
        _max_tokens: u32,
    ) -> Result<StreamHandle> {
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::api("mock provider has no scripted turn left"))?;

        match turn {
            ScriptedTurn::Stream {
                fragments,
                final_message,
            } => Ok(StreamHandle::from_parts(
                fragments.into_iter().map(String::from).collect(),
                final_message,
            )),
            ScriptedTurn::StreamThenError { fragments, error } => {
                let items: Vec<Result<StreamItem>> = fragments
                    .into_iter()
                    .map(|f| Ok(StreamItem::Text(f.to_string())))
                    .chain(std::iter::once(Err(error)))
                    .collect();
                Ok(StreamHandle::new(Box::pin(futures::stream::iter(items))))
            }
            ScriptedTurn::Fail(error) => Err(error),
        }
    }

    async fn create(
        &self,
        messages: &[Message],
        system: &str,
        _max_tokens: u32,
    ) -> Result<FinalMessage> {
        self.create_calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), system.to_string()));

        match self.create_result.lock().unwrap().take() {
            Some(result) => result,
            None => Ok(text_final("a concise summary", StopReason::EndTurn, 10, 5)),
        }
    }

    async fn count_tokens(
        &self,
        _messages: &[Message],
        _system: &str,
        _tools: &[ToolDefinition],
        _max_tokens: u32,
    ) -> Result<u64> {
        Ok(0)
    }
}

/// A text-only final message with the given usage.
pub fn text_final(text: &str, stop: StopReason, input: u64, output: u64) -> FinalMessage {
    FinalMessage {
        content: vec![ContentBlock::text(text)],
        stop_reason: stop,
        usage: Some(UsageInfo {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }),
    }
}

/// A tool-use final message: preamble text plus one `tool_use` per
/// `(id, name, path)` entry.
pub fn tool_use_final(preamble: &str, calls: &[(&str, &str, &str)]) -> FinalMessage {
    let mut content = vec![ContentBlock::text(preamble)];
    for (id, name, path) in calls {
        content.push(ContentBlock::ToolUse(ToolUseBlock::new(
            *id,
            *name,
            json!({"path": path}),
        )));
    }
    FinalMessage {
        content,
        stop_reason: StopReason::ToolUse,
        usage: Some(UsageInfo {
            input_tokens: 30,
            output_tokens: 12,
            ..Default::default()
        }),
    }
}
