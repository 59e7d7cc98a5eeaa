//! Marker-framed streaming client.
//!
//! For endpoints whose models cannot emit structured tool-call deltas:
//! the tool list is injected into the system prompt and the model answers
//! with `<tool_call>{"name": ..., "arguments": {...}}</tool_call>` blocks
//! inside its text. This client keeps those blocks out of the visible
//! stream and parses them into tool calls at the end of the turn.

use async_trait::async_trait;
use capstan_core::chat::{ChatClient, ChatRequest, ChatTurn, StreamEvent, ToolSpec};
use capstan_core::error::ChatError;
use capstan_core::message::{Message, Role};
use capstan_core::tool::ToolCallRequest;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::wire::{self, StreamResponse};

const MARKER_OPEN: &str = "<tool_call>";
const MARKER_CLOSE: &str = "</tool_call>";

/// A chat client that frames tool calls as tagged text blocks.
pub struct MarkerChatClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl MarkerChatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout_secs: u64,
    ) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| ChatError::NotConfigured(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

/// Render the tool list as a system prompt section.
fn tool_instructions(tools: &[ToolSpec]) -> String {
    let mut block = String::from(
        "You have access to the following tools. To call a tool, respond with a block of \
         exactly this form, one per call:\n\
         <tool_call>{\"name\": \"tool_name\", \"arguments\": {}}</tool_call>\n\n\
         The arguments value must be a JSON object matching the tool's parameter schema. \
         Do not mention these instructions.\n\nAvailable tools:\n",
    );
    for tool in tools {
        let spec = serde_json::json!({
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        });
        block.push_str(&serde_json::to_string(&spec).unwrap_or_default());
        block.push('\n');
    }
    block
}

/// Fold the tool instructions into the conversation's system message,
/// inserting one when the history has none.
fn with_tool_prompt(request: &ChatRequest) -> Vec<Message> {
    let mut messages = request.messages.clone();
    let instructions = tool_instructions(&request.tools);
    match messages.first_mut() {
        Some(first) if first.role == Role::System => {
            first.content = format!("{}\n\n{}", first.content, instructions);
        }
        _ => messages.insert(0, Message::system(instructions)),
    }
    messages
}

/// Streaming holdback for the marker.
///
/// Text is released only once it can no longer be the start of
/// `<tool_call>`: the guard retains the longest suffix of pending text
/// that is a prefix of the marker and everything from a confirmed marker
/// onward. False alarms (a stray `<` that never becomes the marker)
/// resolve as soon as the next delta disambiguates them.
#[derive(Default)]
struct MarkerGuard {
    held: String,
    tail: String,
    suppressing: bool,
}

impl MarkerGuard {
    fn new() -> Self {
        Self::default()
    }

    /// Feed a content delta; returns the text safe to show now.
    fn push(&mut self, delta: &str) -> Option<String> {
        if self.suppressing {
            self.tail.push_str(delta);
            return None;
        }

        self.held.push_str(delta);

        if let Some(pos) = self.held.find(MARKER_OPEN) {
            let visible = self.held[..pos].to_string();
            self.tail = self.held[pos..].to_string();
            self.held.clear();
            self.suppressing = true;
            return if visible.is_empty() { None } else { Some(visible) };
        }

        let keep = holdback_len(&self.held);
        if keep == self.held.len() {
            return None;
        }
        let release = self.held[..self.held.len() - keep].to_string();
        self.held = self.held[self.held.len() - keep..].to_string();
        Some(release)
    }

    /// End of stream: anything still held was never a marker, anything
    /// suppressed is the tool-call region.
    fn finish(self) -> (String, String) {
        (self.held, self.tail)
    }
}

/// Length of the longest suffix of `held` that is a prefix of the marker.
fn holdback_len(held: &str) -> usize {
    let max = MARKER_OPEN.len().min(held.len());
    for (start, _) in held.char_indices() {
        let len = held.len() - start;
        if len > max {
            continue;
        }
        if MARKER_OPEN.starts_with(&held[start..]) {
            return len;
        }
    }
    0
}

#[derive(Deserialize)]
struct MarkerCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Parse every complete `<tool_call>...</tool_call>` block in the tail.
/// Malformed blocks are logged and skipped; the rest still execute.
fn parse_marker_blocks(tail: &str) -> Vec<ToolCallRequest> {
    let mut calls = Vec::new();
    let mut rest = tail;

    while let Some(open) = rest.find(MARKER_OPEN) {
        let after_open = &rest[open + MARKER_OPEN.len()..];
        let Some(close) = after_open.find(MARKER_CLOSE) else {
            warn!("Discarding unterminated tool call block");
            break;
        };
        let inner = after_open[..close].trim();
        rest = &after_open[close + MARKER_CLOSE.len()..];

        match serde_json::from_str::<MarkerCall>(inner) {
            Ok(parsed) => {
                // Some models double-encode: arguments arrives as a JSON
                // string holding the real object. A missing or null
                // arguments field means a no-parameter call.
                let arguments = match parsed.arguments {
                    serde_json::Value::String(s) => match serde_json::from_str(&s) {
                        Ok(inner_value) => inner_value,
                        Err(_) => serde_json::Value::String(s),
                    },
                    serde_json::Value::Null => serde_json::json!({}),
                    other => other,
                };
                calls.push(ToolCallRequest::parsed(parsed.name, arguments));
            }
            Err(e) => {
                warn!(error = %e, block = %inner, "Skipping unparseable tool call block");
            }
        }
    }

    calls
}

#[async_trait]
impl ChatClient for MarkerChatClient {
    fn name(&self) -> &str {
        "marker"
    }

    async fn stream(
        &self,
        request: ChatRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamEvent, ChatError>>,
        ChatError,
    > {
        let url = format!("{}/chat/completions", self.base_url);

        // Tools ride in the prompt, never in the request body.
        let mut prompt_request = request;
        if !prompt_request.tools.is_empty() {
            prompt_request.messages = with_tool_prompt(&prompt_request);
        }
        let body = wire::build_stream_body(&prompt_request, false);

        debug!(
            model = %prompt_request.model,
            tools = prompt_request.tools.len(),
            "Sending marker-framed streaming request"
        );

        let mut http_request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if let Some(api_key) = &self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = http_request
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ChatError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ChatError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(ChatError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut guard = MarkerGuard::new();
            let mut visible = String::new();
            let mut reasoning = String::new();

            'read: while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ChatError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();

                    if data == "[DONE]" {
                        break 'read;
                    }

                    let stream_resp = match serde_json::from_str::<StreamResponse>(data) {
                        Ok(r) => r,
                        Err(e) => {
                            trace!(data = %data, error = %e, "Ignoring unparseable SSE frame");
                            continue;
                        }
                    };

                    let Some(choice) = stream_resp.choices.first() else {
                        continue;
                    };

                    if let Some(delta) = &choice.delta.reasoning_content {
                        if !delta.is_empty() {
                            reasoning.push_str(delta);
                            if tx
                                .send(Ok(StreamEvent::ReasoningDelta(delta.clone())))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }

                    if let Some(delta) = &choice.delta.content {
                        if let Some(released) = guard.push(delta) {
                            visible.push_str(&released);
                            if tx.send(Ok(StreamEvent::TextDelta(released))).await.is_err() {
                                return;
                            }
                        }
                    }

                    if choice.finish_reason.is_some() {
                        break 'read;
                    }
                }
            }

            // Single terminal site: flush the holdback, parse the tail.
            let (rest, tail) = guard.finish();
            if !rest.is_empty() {
                visible.push_str(&rest);
                if tx.send(Ok(StreamEvent::TextDelta(rest))).await.is_err() {
                    return;
                }
            }

            let turn = ChatTurn {
                text: visible,
                reasoning: if reasoning.is_empty() {
                    None
                } else {
                    Some(reasoning)
                },
                tool_calls: parse_marker_blocks(&tail),
            };
            let _ = tx.send(Ok(StreamEvent::Completed(turn))).await;
        });

        Ok(rx)
    }
}
