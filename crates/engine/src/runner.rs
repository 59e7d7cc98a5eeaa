//! Turn orchestration: the model/tool round-trip loop.
//!
//! One call to [`TurnRunner::run`] drives a full turn: stream a model
//! response, execute any tool calls it requested, feed the results back,
//! and repeat until the model answers in plain text or the iteration
//! ceiling is reached. The runner owns conversation history shape: every
//! executed call leaves an assistant entry carrying the call and a tool
//! entry carrying the result, so a replayed conversation reads the same
//! way the providers expect it on the wire.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use capstan_core::chat::{ChatClient, ChatRequest, ChatTurn, StreamEvent, ToolSpec};
use capstan_core::error::{ChatError, Error, Result, ToolError};
use capstan_core::host::{HostBridge, HostEvent};
use capstan_core::message::{Conversation, Message, Role};
use capstan_core::schema::SchemaValidator;
use capstan_core::tool::{ToolCallRequest, ToolCatalog, ToolExecutionResult};

use crate::router::ToolRouter;

/// Ceiling on model round-trips per turn unless configured otherwise.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Drives one conversation turn to completion.
///
/// The runner is cheap to construct per turn; the expensive collaborators
/// (client, router, host bridge) are shared behind [`Arc`]s.
pub struct TurnRunner {
    client: Arc<dyn ChatClient>,
    router: ToolRouter,
    host: Arc<HostBridge>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    system_prompt: Option<String>,
    context_blocks: Vec<String>,
    max_iterations: u32,
}

impl TurnRunner {
    pub fn new(
        client: Arc<dyn ChatClient>,
        router: ToolRouter,
        host: Arc<HostBridge>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            router,
            host,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            top_p: None,
            system_prompt: None,
            context_blocks: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Extra system-message sections appended after the prompt, one per
    /// block (rendered context files, workspace notes).
    pub fn with_context_blocks(mut self, blocks: Vec<String>) -> Self {
        self.context_blocks = blocks;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Run the loop until the model stops requesting tools or the
    /// iteration ceiling is hit. Returns the final answer text.
    ///
    /// The caller has already pushed the user message; this method appends
    /// every assistant and tool entry the turn produces. On cancellation
    /// the history keeps whatever completed before the stop, and no
    /// fabricated results are appended.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        catalog: &ToolCatalog,
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!(
            conversation_id = %conversation.id,
            model = %self.model,
            tools = catalog.len(),
            "Starting turn"
        );

        self.ensure_system_message(conversation);
        let specs = catalog.specs();

        let mut round: u32 = 0;
        let mut tool_calls_made: usize = 0;

        loop {
            round += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!(conversation_id = %conversation.id, round, "Requesting model response");

            let turn = self.stream_round(conversation, &specs, cancel).await?;

            if !turn.has_tool_calls() {
                conversation.push(assistant_entry(&turn.text, turn.reasoning.as_deref()));
                self.finish(conversation, round, tool_calls_made);
                return Ok(turn.text);
            }

            // The no-tool-calls check runs first, so a turn may use the
            // full budget of round-trips and still land normally. Only a
            // response that wants yet another round gets cut off here.
            if round >= self.max_iterations {
                warn!(
                    conversation_id = %conversation.id,
                    round,
                    dropped_calls = turn.tool_calls.len(),
                    "Iteration limit reached with tool calls still pending"
                );
                let text = format!("{}{}", turn.text, truncation_notice(self.max_iterations));
                conversation.push(assistant_entry(&text, turn.reasoning.as_deref()));
                self.finish(conversation, round, tool_calls_made);
                return Ok(text);
            }

            let calls = dedup_calls(turn.tool_calls);
            if calls.is_empty() {
                // Every requested call was malformed or a duplicate. Keep
                // the round's text so it is not lost, then ask again.
                if !turn.text.is_empty() || turn.reasoning.is_some() {
                    conversation.push(assistant_entry(&turn.text, turn.reasoning.as_deref()));
                }
                continue;
            }

            for (index, call) in calls.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                // dedup_calls only keeps calls with parsed parameters
                let parameters = match call.parameters.clone() {
                    Some(value) => value,
                    None => continue,
                };

                // The first entry of the round carries the model's
                // interleaved text; the rest are bare call records.
                let start = if index == 0 {
                    assistant_entry(&turn.text, turn.reasoning.as_deref())
                } else {
                    Message::assistant("")
                };
                conversation.push(start.with_tool_calls(vec![call.clone()]));

                self.host.notify(HostEvent::ToolCallStarted {
                    id: call.id.clone(),
                    tool_name: call.name.clone(),
                    parameters: parameters.clone(),
                });

                let result = match catalog.resolve(&call.name) {
                    Err(e) => {
                        warn!(tool_name = %call.name, "Rejecting tool call: {e}");
                        ToolExecutionResult::failed(e.to_string(), 0)
                    }
                    Ok(definition) => {
                        match SchemaValidator::validate(&definition.parameters_schema, &parameters)
                        {
                            Err(reason) => {
                                let err = ToolError::InvalidArguments {
                                    tool_name: call.name.clone(),
                                    reason,
                                };
                                warn!(tool_name = %call.name, "Rejecting tool call: {err}");
                                ToolExecutionResult::failed(err.to_string(), 0)
                            }
                            Ok(()) => {
                                self.router
                                    .dispatch(definition, &call.id, &parameters, cancel)
                                    .await
                            }
                        }
                    }
                };

                tool_calls_made += 1;
                self.host.notify(HostEvent::ToolCallCompleted {
                    id: call.id.clone(),
                    tool_name: call.name.clone(),
                    success: result.success,
                    execution_time_ms: result.execution_time_ms,
                });

                let rendered = result.to_model_text(&call.name);
                conversation.push(Message::tool_result(&call.id, rendered).with_execution(result));

                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    /// Stream one model response, forwarding deltas to the host, until the
    /// terminal `Completed` event arrives.
    async fn stream_round(
        &self,
        conversation: &Conversation,
        specs: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> Result<ChatTurn> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: conversation.messages.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            tools: specs.to_vec(),
        };

        let mut events = self.client.stream(request).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Turn cancelled mid-stream");
                    return Err(Error::Cancelled);
                }
                event = events.recv() => match event {
                    Some(Ok(StreamEvent::TextDelta(content))) => {
                        self.host.notify(HostEvent::TextDelta { content });
                    }
                    Some(Ok(StreamEvent::ReasoningDelta(content))) => {
                        self.host.notify(HostEvent::ReasoningDelta { content });
                    }
                    Some(Ok(StreamEvent::Completed(turn))) => return Ok(turn),
                    Some(Err(e)) => return Err(Error::Chat(e)),
                    None => {
                        return Err(Error::Chat(ChatError::StreamInterrupted(
                            "stream ended without a completed turn".into(),
                        )));
                    }
                }
            }
        }
    }

    /// Install or refresh the leading system message. The prompt is
    /// re-rendered every turn so configuration changes take effect on the
    /// next turn of a long-lived conversation.
    fn ensure_system_message(&self, conversation: &mut Conversation) {
        let prompt = match self.composed_system_prompt() {
            Some(prompt) => prompt,
            None => return,
        };
        match conversation.messages.first() {
            Some(first) if first.role == Role::System => {
                conversation.messages[0].content = prompt;
            }
            _ => conversation.messages.insert(0, Message::system(prompt)),
        }
    }

    fn composed_system_prompt(&self) -> Option<String> {
        let mut sections: Vec<&str> = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            if !prompt.is_empty() {
                sections.push(prompt);
            }
        }
        for block in &self.context_blocks {
            if !block.is_empty() {
                sections.push(block);
            }
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    fn finish(&self, conversation: &Conversation, rounds: u32, tool_calls_made: usize) {
        info!(
            conversation_id = %conversation.id,
            rounds,
            tool_calls_made,
            "Turn completed"
        );
        self.host.notify(HostEvent::TurnCompleted {
            conversation_id: conversation.id.0.clone(),
            rounds,
            tool_calls_made,
        });
    }
}

fn assistant_entry(text: &str, reasoning: Option<&str>) -> Message {
    let entry = Message::assistant(text);
    match reasoning {
        Some(reasoning) => entry.with_reasoning(reasoning),
        None => entry,
    }
}

/// Drop calls whose arguments never parsed, then drop repeats of the same
/// (name, parameters) pair within the batch. Identical calls in later
/// rounds are legitimate retries and pass through again.
fn dedup_calls(calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(calls.len());
    for call in calls {
        let signature = match call_signature(&call) {
            Some(signature) => signature,
            None => {
                // No history entry for these: the model is free to retry
                // with arguments that parse.
                trace!(tool_name = %call.name, "Dropping tool call with unparseable arguments");
                continue;
            }
        };
        if !seen.insert(signature) {
            warn!(tool_name = %call.name, "Dropping duplicate tool call");
            continue;
        }
        kept.push(call);
    }
    kept
}

/// Identity of a call for dedup: name plus canonical parameter JSON.
/// Objects serialize with sorted keys, so key order never splits identity.
fn call_signature(call: &ToolCallRequest) -> Option<String> {
    let parameters = call.parameters.as_ref()?;
    let canonical = serde_json::to_string(parameters).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(call.name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

fn truncation_notice(max_iterations: u32) -> String {
    format!("\n\n[Stopped after {max_iterations} tool-call rounds: iteration limit reached]")
}
