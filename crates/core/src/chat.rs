//! ChatClient trait — the abstraction over streaming LLM backends.
//!
//! A ChatClient sends a conversation plus the advertised tool list and
//! streams the model's turn back as events. Implementations differ in how
//! tool calls travel on the wire (structured deltas vs. text markers);
//! the engine only ever sees [`StreamEvent`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::message::Message;
use crate::tool::ToolCallRequest;

/// One model request: the conversation so far plus sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The model to use (e.g., "gpt-4o", "qwen2.5-coder:32b")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Nucleus sampling cutoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Tools the model may call this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition as the model sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// An event in a streamed model turn.
///
/// Delta events arrive in generation order. The stream ends with exactly
/// one terminal item: `Completed` carrying the assembled turn, or an
/// error. A channel that closes without either is a transport fault.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Visible answer text, in arrival order
    TextDelta(String),

    /// Reasoning text, kept separate from the answer
    ReasoningDelta(String),

    /// The fully assembled turn; always the last event
    Completed(ChatTurn),
}

/// A completed model turn, assembled from the stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatTurn {
    /// The full visible text
    pub text: String,

    /// Accumulated reasoning text, if the model emitted any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Tool calls with finalized, parseable arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatTurn {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// The core ChatClient trait.
///
/// The engine loop calls `stream()` without knowing which backend or
/// tool-call framing is behind it — pure polymorphism.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// A human-readable name for this client (e.g., "openai-compat").
    fn name(&self) -> &str;

    /// Send a request and stream the model's turn back.
    async fn stream(
        &self,
        request: ChatRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamEvent, ChatError>>,
        ChatError,
    >;
}
