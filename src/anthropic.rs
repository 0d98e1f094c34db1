//! Anthropic Messages-API provider.
//!
//! Wraps the HTTP transport behind [`ModelProvider`]: request building
//! with positional prompt-cache markers, SSE stream decoding, error
//! classification, and retry with exponential backoff.
//!
//! # Prompt-cache markers
//!
//! When caching is enabled the request is rewritten *as it is sent*; the
//! caller's messages are never touched. Three positional markers are
//! injected: the system prompt becomes a one-element block array with
//! `cache_control`, the last tool definition is marked, and the last
//! message's last content block is marked (plain-string content is first
//! promoted to a one-element text-block array). Cache hits then depend
//! entirely on the preceding tokens staying bit-identical across turns,
//! which is why the prompt assembler keeps system text and tool ordering
//! stable.
//!
//! # Streaming wire format
//!
//! The endpoint emits SSE `data:` lines carrying JSON events
//! (`message_start`, `content_block_start`, `content_block_delta`,
//! `content_block_stop`, `message_delta`, `message_stop`). Lines can split
//! at arbitrary byte positions across TCP chunks, so the decoder carries a
//! remainder buffer forward and only parses complete lines. Text deltas
//! are forwarded as fragments immediately; everything else accumulates
//! into the [`FinalMessage`] emitted at `message_stop`.

use futures::StreamExt;
use serde_json::{Value, json};

use crate::config::ProviderConfig;
use crate::provider::{FinalMessage, ModelProvider, StreamHandle, StreamItem};
use crate::retry::{RetryObserver, RetryPolicy, retry_with_backoff};
use crate::tools::ToolDefinition;
use crate::types::{ContentBlock, Message, StopReason, TextBlock, ToolUseBlock};
use crate::usage::UsageInfo;
use crate::{Error, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic LLM provider.
pub struct AnthropicProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    on_retry: Option<RetryObserver>,
}

impl AnthropicProvider {
    /// Creates a provider from configuration.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            on_retry: None,
        })
    }

    /// Installs a retry observer, invoked before each backoff sleep.
    pub fn with_retry_observer(mut self, observer: RetryObserver) -> Self {
        self.on_retry = Some(observer);
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, self.config.retry_initial_delay)
    }

    fn api_key(&self) -> Result<String> {
        self.config.resolve_api_key().ok_or_else(|| {
            Error::auth(format!(
                "no API key configured and {} is not set",
                crate::config::API_KEY_ENV
            ))
        })
    }

    /// Builds the request body without mutating any caller data.
    fn build_request_body(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        max_tokens: u32,
        stream: bool,
    ) -> Result<Value> {
        let caching = self.config.enable_prompt_caching;

        let mut encoded_messages = serde_json::to_value(messages)?;
        if caching {
            mark_last_message_block(&mut encoded_messages);
        }

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "messages": encoded_messages,
            "stream": stream,
        });

        body["system"] = if caching {
            json!([{
                "type": "text",
                "text": system,
                "cache_control": {"type": "ephemeral"},
            }])
        } else {
            json!(system)
        };

        if !tools.is_empty() {
            let mut encoded_tools = serde_json::to_value(tools)?;
            if caching {
                if let Some(last) = encoded_tools.as_array_mut().and_then(|a| a.last_mut()) {
                    last["cache_control"] = json!({"type": "ephemeral"});
                }
            }
            body["tools"] = encoded_tools;
        }

        Ok(body)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let key = self.api_key()?;
        let response = self
            .client
            .post(format!("{}{path}", self.config.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        Ok(response)
    }
}

/// Maps an HTTP status into the crate's error classification.
fn classify_status(status: u16, body: &str) -> Error {
    match status {
        401 | 403 => Error::auth(format!("API key rejected ({status}): {body}")),
        429 => Error::rate_limited(body.to_string()),
        500..=599 => Error::server_transient(format!("{status}: {body}")),
        _ => Error::api(format!("{status}: {body}")),
    }
}

/// Marks the last content block of the last message as cacheable,
/// promoting string content to a block array first.
fn mark_last_message_block(messages: &mut Value) {
    let Some(last) = messages.as_array_mut().and_then(|a| a.last_mut()) else {
        return;
    };
    let content = &mut last["content"];

    if let Some(text) = content.as_str() {
        *content = json!([{
            "type": "text",
            "text": text,
            "cache_control": {"type": "ephemeral"},
        }]);
    } else if let Some(blocks) = content.as_array_mut() {
        if let Some(last_block) = blocks.last_mut() {
            last_block["cache_control"] = json!({"type": "ephemeral"});
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for AnthropicProvider {
    async fn stream(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        max_tokens: u32,
    ) -> Result<StreamHandle> {
        let body = self.build_request_body(messages, system, tools, max_tokens, true)?;

        // Retry wraps opening the stream; once bytes are flowing, a broken
        // stream surfaces to the caller, which must not have committed any
        // state before final_result().
        let response = retry_with_backoff(
            self.retry_policy(),
            self.on_retry.as_ref(),
            tokio::time::sleep,
            || self.post("/v1/messages", &body),
        )
        .await?;

        let stream = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let items = match chunk {
                    Ok(bytes) => decoder.feed(&bytes),
                    Err(e) if e.is_timeout() => vec![Err(Error::Timeout)],
                    Err(e) => vec![Err(Error::connection(e.to_string()))],
                };
                futures::future::ready(Some(items))
            })
            .flat_map(futures::stream::iter);

        Ok(StreamHandle::new(Box::pin(stream)))
    }

    async fn create(
        &self,
        messages: &[Message],
        system: &str,
        max_tokens: u32,
    ) -> Result<FinalMessage> {
        let body = self.build_request_body(messages, system, &[], max_tokens, false)?;

        let response = retry_with_backoff(
            self.retry_policy(),
            self.on_retry.as_ref(),
            tokio::time::sleep,
            || self.post("/v1/messages", &body),
        )
        .await?;

        let payload: Value = response.json().await?;
        parse_complete_message(&payload)
    }

    async fn count_tokens(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        _max_tokens: u32,
    ) -> Result<u64> {
        let mut body = self.build_request_body(messages, system, tools, 1, false)?;
        // The count endpoint takes the same shape minus generation params.
        if let Some(obj) = body.as_object_mut() {
            obj.remove("max_tokens");
            obj.remove("stream");
        }

        let response = retry_with_backoff(
            self.retry_policy(),
            self.on_retry.as_ref(),
            tokio::time::sleep,
            || self.post("/v1/messages/count_tokens", &body),
        )
        .await?;

        let payload: Value = response.json().await?;
        payload["input_tokens"]
            .as_u64()
            .ok_or_else(|| Error::api("count_tokens response missing input_tokens"))
    }
}

/// Parses a non-streaming message response.
fn parse_complete_message(payload: &Value) -> Result<FinalMessage> {
    let content: Vec<ContentBlock> = serde_json::from_value(payload["content"].clone())?;
    let stop_reason = payload["stop_reason"]
        .as_str()
        .map(StopReason::from_wire)
        .unwrap_or(StopReason::EndTurn);
    let usage = parse_usage(&payload["usage"]);

    Ok(FinalMessage {
        content,
        stop_reason,
        usage: Some(usage),
    })
}

fn parse_usage(value: &Value) -> UsageInfo {
    UsageInfo {
        input_tokens: value["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: value["output_tokens"].as_u64().unwrap_or(0),
        cache_creation_input_tokens: value["cache_creation_input_tokens"].as_u64().unwrap_or(0),
        cache_read_input_tokens: value["cache_read_input_tokens"].as_u64().unwrap_or(0),
    }
}

// ============================================================================
// SSE DECODING
// ============================================================================

/// A content block being assembled from streaming deltas.
enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

/// Decodes SSE bytes into stream items, carrying partial lines and the
/// message state across chunks.
struct SseDecoder {
    buffer: String,
    blocks: Vec<PartialBlock>,
    usage: UsageInfo,
    stop_reason: StopReason,
    finished: bool,
}

impl SseDecoder {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            blocks: Vec::new(),
            usage: UsageInfo::default(),
            stop_reason: StopReason::EndTurn,
            finished: false,
        }
    }

    /// Feeds one chunk of bytes; returns the items it completes.
    fn feed(&mut self, bytes: &[u8]) -> Vec<Result<StreamItem>> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut items = Vec::new();
        // Only complete lines are parsed; the tail stays buffered.
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end();

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            let event: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    items.push(Err(Error::stream(format!("malformed SSE payload: {e}"))));
                    continue;
                }
            };

            self.handle_event(&event, &mut items);
        }
        items
    }

    fn handle_event(&mut self, event: &Value, items: &mut Vec<Result<StreamItem>>) {
        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                let usage = parse_usage(&event["message"]["usage"]);
                self.usage.input_tokens = usage.input_tokens;
                self.usage.cache_creation_input_tokens = usage.cache_creation_input_tokens;
                self.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
            }
            "content_block_start" => {
                let block = &event["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "tool_use" => self.blocks.push(PartialBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input_json: String::new(),
                    }),
                    _ => self.blocks.push(PartialBlock::Text(
                        block["text"].as_str().unwrap_or_default().to_string(),
                    )),
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if let Some(PartialBlock::Text(buffer)) = self.blocks.last_mut() {
                            buffer.push_str(text);
                        }
                        items.push(Ok(StreamItem::Text(text.to_string())));
                    }
                    "input_json_delta" => {
                        if let Some(PartialBlock::ToolUse { input_json, .. }) =
                            self.blocks.last_mut()
                        {
                            input_json.push_str(delta["partial_json"].as_str().unwrap_or(""));
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = StopReason::from_wire(reason);
                }
                if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = output;
                }
            }
            "message_stop" => {
                if !self.finished {
                    self.finished = true;
                    items.push(self.finalize());
                }
            }
            "error" => {
                let message = event["error"]["message"].as_str().unwrap_or("unknown");
                items.push(Err(Error::api(format!("provider error event: {message}"))));
            }
            // ping, content_block_stop and unknown event types carry no
            // state we track.
            _ => {}
        }
    }

    fn finalize(&mut self) -> Result<StreamItem> {
        let mut content = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.drain(..) {
            match block {
                PartialBlock::Text(text) => content.push(ContentBlock::Text(TextBlock::new(text))),
                PartialBlock::ToolUse {
                    id,
                    name,
                    input_json,
                } => {
                    let input: Value = if input_json.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&input_json).map_err(|e| {
                            Error::stream(format!("malformed tool input JSON: {e}"))
                        })?
                    };
                    content.push(ContentBlock::ToolUse(ToolUseBlock::new(id, name, input)));
                }
            }
        }

        Ok(StreamItem::Final(FinalMessage {
            content,
            stop_reason: self.stop_reason,
            usage: Some(self.usage),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(caching: bool) -> AnthropicProvider {
        let config = ProviderConfig::builder()
            .api_key("sk-test")
            .enable_prompt_caching(caching)
            .build()
            .unwrap();
        AnthropicProvider::new(config).unwrap()
    }

    #[test]
    fn test_cache_markers_placed_positionally() {
        let provider = provider(true);
        let messages = vec![Message::user("Hi")];
        let tools = vec![
            ToolDefinition {
                name: "read_file".into(),
                description: "reads".into(),
                input_schema: json!({"type": "object"}),
            },
            ToolDefinition {
                name: "list_files".into(),
                description: "lists".into(),
                input_schema: json!({"type": "object"}),
            },
        ];

        let body = provider
            .build_request_body(&messages, "base prompt", &tools, 1024, true)
            .unwrap();

        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert!(body["tools"][0].get("cache_control").is_none());
        assert_eq!(body["tools"][1]["cache_control"]["type"], "ephemeral");

        // String content is promoted to a marked text block.
        let last_content = &body["messages"][0]["content"];
        assert_eq!(last_content[0]["text"], "Hi");
        assert_eq!(last_content[0]["cache_control"]["type"], "ephemeral");

        // The caller's message is untouched.
        assert_eq!(messages[0].content, crate::types::MessageContent::Text("Hi".into()));
    }

    #[test]
    fn test_no_markers_when_caching_disabled() {
        let provider = provider(false);
        let body = provider
            .build_request_body(&[Message::user("Hi")], "base", &[], 1024, true)
            .unwrap();

        assert_eq!(body["system"], "base");
        assert_eq!(body["messages"][0]["content"], "Hi");
    }

    #[test]
    fn test_marker_lands_on_last_block_of_block_content() {
        let provider = provider(true);
        let messages = vec![Message::user_blocks(vec![
            ContentBlock::text("first"),
            ContentBlock::text("second"),
        ])];
        let body = provider
            .build_request_body(&messages, "base", &[], 1024, true)
            .unwrap();

        let content = &body["messages"][0]["content"];
        assert!(content[0].get("cache_control").is_none());
        assert_eq!(content[1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(401, ""), Error::Auth(_)));
        assert!(matches!(classify_status(403, ""), Error::Auth(_)));
        assert!(matches!(classify_status(429, ""), Error::RateLimited(_)));
        assert!(matches!(
            classify_status(500, ""),
            Error::ServerTransient(_)
        ));
        assert!(matches!(
            classify_status(503, ""),
            Error::ServerTransient(_)
        ));
        assert!(matches!(classify_status(400, ""), Error::Api(_)));
        assert!(matches!(classify_status(404, ""), Error::Api(_)));
    }

    fn feed_all(decoder: &mut SseDecoder, raw: &str) -> Vec<Result<StreamItem>> {
        decoder.feed(raw.as_bytes())
    }

    const TEXT_STREAM: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12,\"cache_read_input_tokens\":4}}}\n",
        "\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"He\"}}\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"llo\"}}\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}\n",
        "data: {\"type\":\"message_stop\"}\n",
    );

    #[test]
    fn test_decoder_text_stream() {
        let mut decoder = SseDecoder::new();
        let items = feed_all(&mut decoder, TEXT_STREAM);

        let mut texts = Vec::new();
        let mut final_message = None;
        for item in items {
            match item.unwrap() {
                StreamItem::Text(t) => texts.push(t),
                StreamItem::Final(m) => final_message = Some(m),
            }
        }

        assert_eq!(texts, vec!["He", "llo"]);
        let message = final_message.unwrap();
        assert_eq!(message.stop_reason, StopReason::EndTurn);
        assert_eq!(message.content, vec![ContentBlock::text("Hello")]);
        let usage = message.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.cache_read_input_tokens, 4);
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::new();
        let mut items = Vec::new();
        // Split mid-line and mid-UTF8-safe boundary; the decoder must
        // reassemble before parsing.
        for chunk in TEXT_STREAM.as_bytes().chunks(7) {
            items.extend(decoder.feed(chunk));
        }

        let texts: Vec<String> = items
            .iter()
            .filter_map(|i| match i {
                Ok(StreamItem::Text(t)) => Some(t.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts.concat(), "Hello");
        assert!(
            items
                .iter()
                .any(|i| matches!(i, Ok(StreamItem::Final(_))))
        );
    }

    #[test]
    fn test_decoder_tool_use_stream() {
        let raw = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":30}}}\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Reading\"}}\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n",
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"read_file\"}}\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"path\\\":\"}}\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"a\\\"}\"}}\n",
            "data: {\"type\":\"content_block_stop\",\"index\":1}\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":9}}\n",
            "data: {\"type\":\"message_stop\"}\n",
        );

        let mut decoder = SseDecoder::new();
        let items = feed_all(&mut decoder, raw);
        let final_message = items
            .into_iter()
            .find_map(|i| match i.unwrap() {
                StreamItem::Final(m) => Some(m),
                _ => None,
            })
            .unwrap();

        assert_eq!(final_message.stop_reason, StopReason::ToolUse);
        assert_eq!(final_message.content.len(), 2);
        let tool_use = final_message.content[1].as_tool_use().unwrap();
        assert_eq!(tool_use.id, "t1");
        assert_eq!(tool_use.name, "read_file");
        assert_eq!(tool_use.input, json!({"path": "a"}));
    }

    #[test]
    fn test_decoder_error_event() {
        let raw = "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"overloaded\"}}\n";
        let mut decoder = SseDecoder::new();
        let items = feed_all(&mut decoder, raw);
        assert!(matches!(&items[0], Err(Error::Api(_))));
    }

    #[test]
    fn test_parse_complete_message() {
        let payload = json!({
            "content": [{"type": "text", "text": "summary text"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 7, "output_tokens": 3},
        });
        let message = parse_complete_message(&payload).unwrap();
        assert_eq!(message.content, vec![ContentBlock::text("summary text")]);
        assert_eq!(message.stop_reason, StopReason::EndTurn);
        assert_eq!(message.usage.unwrap().input_tokens, 7);
    }
}
