//! OpenAI-compatible wire types, shared by both client implementations.
//!
//! Serialization types cover the request side (messages, tool
//! definitions); deserialization types cover the SSE stream frames,
//! including the `reasoning_content` extension some endpoints emit.

use capstan_core::chat::{ChatRequest, ToolSpec};
use capstan_core::message::{Message, Role};
use serde::{Deserialize, Serialize};

// --- Request types ---

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ApiMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ApiToolCall {
    pub id: String,
    pub r#type: String,
    pub function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ApiFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ApiToolDefinition {
    pub r#type: String,
    pub function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ApiToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Convert domain messages to OpenAI API format.
pub(crate) fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: match m.role {
                Role::User => "user".into(),
                Role::Assistant => "assistant".into(),
                Role::System => "system".into(),
                Role::Tool => "tool".into(),
            },
            content: Some(m.content.clone()),
            tool_calls: if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect(),
                )
            },
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect()
}

/// Convert tool specs to OpenAI API format.
pub(crate) fn to_api_tools(tools: &[ToolSpec]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

/// Build the streaming request body. Marker-framed clients pass
/// `include_tools = false` and advertise tools through the prompt instead.
pub(crate) fn build_stream_body(request: &ChatRequest, include_tools: bool) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": request.model,
        "messages": to_api_messages(&request.messages),
        "temperature": request.temperature,
        "stream": true,
    });

    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }

    if let Some(top_p) = request.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }

    if include_tools && !request.tools.is_empty() {
        body["tools"] = serde_json::json!(to_api_tools(&request.tools));
    }

    body
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` frame from a streaming response.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamResponse {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChoice {
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across frames.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}
