//! Core type definitions for the agent core.
//!
//! The type system is organized into three main categories:
//!
//! # Content Model
//!
//! Messages carry either plain text or an ordered sequence of content
//! blocks. The block set is a closed tagged union:
//!
//! - [`TextBlock`]: plain text
//! - [`ToolUseBlock`]: a model request to execute a tool
//! - [`ToolResultBlock`]: the result of a tool execution
//! - [`ImageBlock`] / [`DocumentBlock`]: multimodal attachments
//!
//! # Serialization
//!
//! Blocks use serde's internally tagged format with a `"type"` field:
//!
//! ```json
//! {"type": "text", "text": "Hello"}
//! {"type": "tool_use", "id": "t1", "name": "read_file", "input": {...}}
//! {"type": "tool_result", "tool_use_id": "t1", "content": "...", "is_error": true}
//! {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "..."}}
//! ```
//!
//! Decoding an unknown `"type"` tag is a hard error. A silently passed
//! through block could break tool-use/tool-result pairing downstream, so
//! the decoder rejects rather than skips.
//!
//! # Turn Output
//!
//! [`AgentItem`] is what a streaming turn yields to its caller: text
//! tokens interleaved with tool-call lifecycle events, the preamble
//! boundary, re-emitted tool side-channel events, and compaction notices.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONTENT BLOCKS
// ============================================================================

/// Plain text content in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// The text content.
    pub text: String,
}

impl TextBlock {
    /// Creates a new text block from any string-like type.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Tool use request emitted by the model.
///
/// The `id` correlates this request with the [`ToolResultBlock`] that must
/// appear in the immediately following user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Unique identifier for this tool call within the conversation.
    pub id: String,

    /// Name of the tool to execute.
    pub name: String,

    /// JSON arguments matching the tool's input schema.
    pub input: serde_json::Value,
}

impl ToolUseBlock {
    /// Creates a new tool use block.
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Tool execution result sent back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// ID of the tool use request this result answers.
    pub tool_use_id: String,

    /// Result content. Structured handler output is JSON-encoded; plain
    /// strings pass through unchanged; failures carry the error text.
    pub content: String,

    /// Set to `true` when the tool handler failed. Omitted on the wire
    /// for successful results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResultBlock {
    /// Creates a successful tool result block.
    pub fn new(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: None,
        }
    }

    /// Creates a failed tool result block carrying the error text.
    pub fn error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: Some(true),
        }
    }

    /// Whether this result represents a failed execution.
    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

/// Source of an image or document payload: inline base64 or a URL the
/// provider fetches itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaSource {
    /// Inline base64-encoded payload with its MIME type.
    Base64 { media_type: String, data: String },
    /// Remote payload fetched by the provider.
    Url { url: String },
}

/// Image content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    /// Where the image bytes come from.
    pub source: MediaSource,
}

/// Document (PDF) content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBlock {
    /// Where the document bytes come from.
    pub source: MediaSource,
}

/// A single element of a message's content.
///
/// Closed union: decoding rejects unknown `"type"` tags instead of passing
/// them through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content.
    Text(TextBlock),

    /// Tool use request from the model.
    ToolUse(ToolUseBlock),

    /// Tool execution result.
    ToolResult(ToolResultBlock),

    /// Image attachment.
    Image(ImageBlock),

    /// Document attachment.
    Document(DocumentBlock),
}

impl ContentBlock {
    /// Convenience constructor for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextBlock::new(text))
    }

    /// Returns the inner text for text blocks.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(t) => Some(&t.text),
            _ => None,
        }
    }

    /// Returns the inner tool use for tool-use blocks.
    pub fn as_tool_use(&self) -> Option<&ToolUseBlock> {
        match self {
            ContentBlock::ToolUse(t) => Some(t),
            _ => None,
        }
    }

    /// Returns the inner tool result for tool-result blocks.
    pub fn as_tool_result(&self) -> Option<&ToolResultBlock> {
        match self {
            ContentBlock::ToolResult(t) => Some(t),
            _ => None,
        }
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// The sender of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input from the human or from synthesized tool results.
    User,
    /// Response from the model.
    Assistant,
}

/// Message content: a bare string or an ordered block sequence.
///
/// Plain user turns stay strings; everything involving tools or
/// attachments uses blocks. Both forms round-trip through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Ordered content-block sequence.
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Iterates the content blocks; empty for plain-text content.
    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// Whether any block in this content satisfies the predicate.
    pub fn has_block(&self, pred: impl Fn(&ContentBlock) -> bool) -> bool {
        self.blocks().iter().any(pred)
    }

    /// Concatenated text of every text block (the plain string itself for
    /// text content). `None` when there is no text at all.
    pub fn text(&self) -> Option<String> {
        match self {
            MessageContent::Text(s) => Some(s.clone()),
            MessageContent::Blocks(blocks) => {
                let parts: Vec<&str> = blocks.iter().filter_map(|b| b.as_text()).collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.concat())
                }
            }
        }
    }
}

/// A complete message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent the message.
    pub role: Role,

    /// The message payload.
    pub content: MessageContent,
}

impl Message {
    /// Creates a plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Creates a user message from content blocks (tool results,
    /// attachments).
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Creates an assistant message from content blocks.
    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Creates a plain-text assistant message.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Whether this is a user message containing any tool result.
    pub fn has_tool_result(&self) -> bool {
        self.role == Role::User
            && self
                .content
                .has_block(|b| matches!(b, ContentBlock::ToolResult(_)))
    }

    /// Whether this is an assistant message containing any tool use.
    pub fn has_tool_use(&self) -> bool {
        self.role == Role::Assistant
            && self
                .content
                .has_block(|b| matches!(b, ContentBlock::ToolUse(_)))
    }
}

// ============================================================================
// STOP REASONS
// ============================================================================

/// Terminal label on a model response, driving loop control.
///
/// Unlike content-block tags, unrecognized stop reasons fold into
/// [`StopReason::Other`] instead of failing the decode; the loop only
/// branches on [`StopReason::ToolUse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural completion.
    EndTurn,
    /// The model requested tool execution.
    ToolUse,
    /// Hit the per-response token ceiling.
    MaxTokens,
    /// A stop sequence fired.
    StopSequence,
    /// Any other provider-specific reason.
    Other,
}

impl StopReason {
    /// Parses a wire value, folding unknown reasons into `Other`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::Other,
        }
    }
}

impl<'de> Deserialize<'de> for StopReason {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(StopReason::from_wire(&value))
    }
}

// ============================================================================
// TURN OUTPUT
// ============================================================================

/// Lifecycle status of a single tool call within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    /// Execution is about to begin. Emitted for every call in a step
    /// before any call completes.
    Started,
    /// The handler returned successfully.
    Completed,
    /// The handler failed; the error is fed back to the model.
    Failed,
}

/// One item of a streaming turn, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentItem {
    /// A text fragment from the model.
    Token { text: String },

    /// Marks the end of preamble text preceding a tool-use step.
    PreambleEnd,

    /// Tool call lifecycle notification.
    ToolCall {
        name: String,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// An event a tool embedded in its result payload (`sse_events` side
    /// channel), re-emitted to the caller after the tool loop.
    ToolEvent {
        event: String,
        data: serde_json::Value,
    },

    /// The conversation was compacted after this turn.
    Compacted { truncated: usize, summarized: bool },
}

impl AgentItem {
    /// Convenience constructor for a token item.
    pub fn token(text: impl Into<String>) -> Self {
        AgentItem::Token { text: text.into() }
    }
}
