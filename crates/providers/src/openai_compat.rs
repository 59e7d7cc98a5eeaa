//! OpenAI-compatible streaming client with native tool-call framing.
//!
//! Works with OpenAI, OpenRouter, vLLM, Ollama, and any endpoint that
//! speaks `/v1/chat/completions` with structured `tool_calls` deltas in
//! the SSE stream.

use async_trait::async_trait;
use capstan_core::chat::{ChatClient, ChatRequest, StreamEvent};
use capstan_core::error::ChatError;
use futures::StreamExt;
use tracing::{debug, trace, warn};

use crate::assemble::StreamAssembler;
use crate::wire::{self, StreamResponse};

/// A chat client for OpenAI-compatible endpoints.
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Create a new client. `request_timeout_secs` bounds the whole
    /// streaming call, not individual frames.
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

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn stream(
        &self,
        request: ChatRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamEvent, ChatError>>,
        ChatError,
    > {
        let url = format!("{}/chat/completions", self.base_url);
        let body = wire::build_stream_body(&request, true);

        debug!(model = %request.model, tools = request.tools.len(), "Sending streaming request");

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

        // Read the SSE byte stream, forward deltas as they arrive, and
        // emit exactly one terminal event.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut assembler = StreamAssembler::new();

            while let Some(chunk_result) = byte_stream.next().await {
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

                // Process complete lines; a frame split across reads waits
                // in the buffer for its remainder.
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    // Skip empty lines and SSE comments
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();

                    // "[DONE]" signals end of stream
                    if data == "[DONE]" {
                        let _ = tx.send(Ok(StreamEvent::Completed(assembler.finish()))).await;
                        return;
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

                    if let Some(tc_deltas) = &choice.delta.tool_calls {
                        for tc_delta in tc_deltas {
                            assembler.tool_call_delta(tc_delta);
                        }
                    }

                    if let Some(reasoning) = &choice.delta.reasoning_content {
                        if !reasoning.is_empty() {
                            assembler.reasoning_delta(reasoning);
                            if tx
                                .send(Ok(StreamEvent::ReasoningDelta(reasoning.clone())))
                                .await
                                .is_err()
                            {
                                return; // receiver dropped
                            }
                        }
                    }

                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            assembler.text_delta(content);
                            if tx
                                .send(Ok(StreamEvent::TextDelta(content.clone())))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }

                    // A finish_reason frame is terminal even without [DONE]
                    if choice.finish_reason.is_some() {
                        let _ = tx.send(Ok(StreamEvent::Completed(assembler.finish()))).await;
                        return;
                    }
                }
            }

            // Stream ended without an explicit terminal frame; assemble
            // from whatever arrived.
            let _ = tx.send(Ok(StreamEvent::Completed(assembler.finish()))).await;
        });

        Ok(rx)
    }
}
