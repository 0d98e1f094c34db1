//! Provider abstraction: the seam between the agent loop and a concrete
//! LLM backend.
//!
//! [`ModelProvider`] exposes three operations: a streaming call used by
//! the tool loop, a non-streaming call used by the summarizer, and exact
//! pre-flight token counting. Implementations map their transport errors
//! into the crate's [`Error`](crate::Error) classification and handle
//! retries internally, so the caller can treat every returned error as
//! final.
//!
//! [`StreamHandle`] is the contract for a streaming session: a lazy finite
//! sequence of text fragments consumed through [`StreamHandle::next_text`],
//! then a one-shot [`StreamHandle::final_result`] returning the assembled
//! message with stop reason and usage. Callers must not commit state
//! (append to the conversation, persist the session) until `final_result`
//! succeeds; that discipline is what makes provider-side retries safe.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};

use crate::tools::ToolDefinition;
use crate::types::{ContentBlock, Message, StopReason};
use crate::usage::UsageInfo;
use crate::{Error, Result};

/// The assembled result of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalMessage {
    /// Content blocks in provider order.
    pub content: Vec<ContentBlock>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token accounting for this call, when the provider reports it.
    pub usage: Option<UsageInfo>,
}

/// One element of the underlying provider stream.
#[derive(Debug)]
pub enum StreamItem {
    /// An incremental text fragment.
    Text(String),
    /// The assembled final message; always the last item of a healthy
    /// stream.
    Final(FinalMessage),
}

/// Boxed stream of provider items.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamItem>> + Send>>;

/// Handle over one streaming session.
pub struct StreamHandle {
    inner: ProviderStream,
    final_message: Option<FinalMessage>,
}

impl StreamHandle {
    /// Wraps a raw provider stream.
    pub fn new(inner: ProviderStream) -> Self {
        Self {
            inner,
            final_message: None,
        }
    }

    /// Builds a handle from literal fragments and a final message.
    ///
    /// Providers under test (and any backend that buffers whole
    /// responses) construct handles this way.
    pub fn from_parts(fragments: Vec<String>, final_message: FinalMessage) -> Self {
        let items = fragments
            .into_iter()
            .map(|f| Ok(StreamItem::Text(f)))
            .chain(std::iter::once(Ok(StreamItem::Final(final_message))));
        Self::new(Box::pin(futures::stream::iter(items)))
    }

    /// Yields the next text fragment, in provider order.
    ///
    /// Returns `None` once the stream's final message has been observed
    /// (retrieve it with [`StreamHandle::final_result`]) or the stream is
    /// exhausted. Errors surface once and terminate the stream.
    pub async fn next_text(&mut self) -> Option<Result<String>> {
        if self.final_message.is_some() {
            return None;
        }

        loop {
            match self.inner.next().await {
                Some(Ok(StreamItem::Text(text))) => return Some(Ok(text)),
                Some(Ok(StreamItem::Final(message))) => {
                    self.final_message = Some(message);
                    return None;
                }
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }

    /// Consumes the handle and returns the final message.
    ///
    /// Drains any fragments the caller did not read. Fails when the
    /// stream ended (or errored) without producing a final message.
    pub async fn final_result(mut self) -> Result<FinalMessage> {
        if let Some(message) = self.final_message.take() {
            return Ok(message);
        }

        while let Some(item) = self.inner.next().await {
            match item {
                Ok(StreamItem::Text(_)) => continue,
                Ok(StreamItem::Final(message)) => return Ok(message),
                Err(e) => return Err(e),
            }
        }

        Err(Error::stream("stream ended without a final message"))
    }
}

/// The LLM backend seam.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Opens a streaming session over the conversation.
    async fn stream(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        max_tokens: u32,
    ) -> Result<StreamHandle>;

    /// Non-streaming call; used for short responses such as compaction
    /// summaries.
    async fn create(
        &self,
        messages: &[Message],
        system: &str,
        max_tokens: u32,
    ) -> Result<FinalMessage>;

    /// Exact input-token count for the given request shape.
    async fn count_tokens(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        max_tokens: u32,
    ) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn final_message(stop: StopReason) -> FinalMessage {
        FinalMessage {
            content: vec![ContentBlock::text("Hello")],
            stop_reason: stop,
            usage: Some(UsageInfo {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_fragments_then_final() {
        let mut handle = StreamHandle::from_parts(
            vec!["He".into(), "llo".into()],
            final_message(StopReason::EndTurn),
        );

        let mut collected = String::new();
        while let Some(fragment) = handle.next_text().await {
            collected.push_str(&fragment.unwrap());
        }
        assert_eq!(collected, "Hello");

        let result = handle.final_result().await.unwrap();
        assert_eq!(result.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_final_result_drains_unread_fragments() {
        let handle = StreamHandle::from_parts(
            vec!["unread".into()],
            final_message(StopReason::ToolUse),
        );
        let result = handle.final_result().await.unwrap();
        assert_eq!(result.stop_reason, StopReason::ToolUse);
    }

    #[tokio::test]
    async fn test_missing_final_is_an_error() {
        let items: Vec<Result<StreamItem>> = vec![Ok(StreamItem::Text("hi".into()))];
        let handle = StreamHandle::new(Box::pin(futures::stream::iter(items)));
        let result = handle.final_result().await;
        assert!(matches!(result, Err(Error::Stream(_))));
    }

    #[tokio::test]
    async fn test_stream_error_surfaces_through_next_text() {
        let items: Vec<Result<StreamItem>> = vec![
            Ok(StreamItem::Text("ok".into())),
            Err(Error::connection("dropped")),
        ];
        let mut handle = StreamHandle::new(Box::pin(futures::stream::iter(items)));

        assert_eq!(handle.next_text().await.unwrap().unwrap(), "ok");
        assert!(matches!(
            handle.next_text().await,
            Some(Err(Error::Connection(_)))
        ));
    }
}
