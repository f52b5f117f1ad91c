//! Completion service contract.
//!
//! The language-model call itself lives outside this crate. The engine only
//! depends on the [`CompletionService`] trait: given conversation history,
//! return the next assistant turn — plain text, or one or more requested
//! tool calls. A streaming variant delivers text incrementally; the
//! tool-call aggregation is identical in both modes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::CompletionError;

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One requested tool call from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique id for correlating the call with its result message.
    pub call_id: String,
    /// Plugin (namespace) the function belongs to.
    pub plugin: String,
    /// Function name within the plugin.
    pub function: String,
    /// JSON arguments as produced by the model.
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    /// `plugin.function`, the form used for policy lookups and logging.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.plugin, self.function)
    }
}

/// Message content as a closed sum with an explicit discriminator.
///
/// Persisted conversation snapshots round-trip through this type, so the
/// serde tags are part of the storage format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text.
    Text { text: String },
    /// The assistant requesting one or more tool calls.
    ToolCalls { calls: Vec<ToolCallRequest> },
    /// The result of a single executed tool call.
    ToolResult {
        call_id: String,
        function: String,
        result: String,
    },
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text { text: text.into() },
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text { text: text.into() },
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text { text: text.into() },
        }
    }

    /// Assistant message carrying tool-call requests.
    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCalls { calls },
        }
    }

    /// Tool-role message carrying one call's result.
    pub fn tool_result(
        call_id: impl Into<String>,
        function: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                call_id: call_id.into(),
                function: function.into(),
                result: result.into(),
            },
        }
    }

    /// The text payload, if this is a plain-text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Settings forwarded to the completion service with each call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionSettings {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f32>,
}

/// One event from a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An incremental chunk of the assistant's text reply.
    TextDelta(String),
    /// A batch of requested tool calls (emitted once, when known).
    ToolCalls(Vec<ToolCallRequest>),
    /// The stream is complete.
    Done,
}

/// Boxed stream of completion events.
pub type CompletionStream = BoxStream<'static, Result<StreamEvent, CompletionError>>;

/// External collaborator: produces the next assistant turn.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Return the next assistant turn as a batch of messages. Each message
    /// is either plain text or a set of tool-call requests.
    async fn complete(
        &self,
        history: &[ChatMessage],
        settings: &CompletionSettings,
    ) -> Result<Vec<ChatMessage>, CompletionError>;

    /// Streaming variant. Text arrives as [`StreamEvent::TextDelta`] chunks;
    /// tool calls arrive aggregated. The stream ends with
    /// [`StreamEvent::Done`] or an error.
    async fn complete_stream(
        &self,
        history: &[ChatMessage],
        settings: &CompletionSettings,
    ) -> Result<CompletionStream, CompletionError>;
}
