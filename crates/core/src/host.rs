//! Host channel — the embedding application's window into a turn.
//!
//! The engine pushes [`HostEvent`]s outward (deltas, tool lifecycle) and,
//! for host-environment tools, asks the host to produce a result via a
//! correlated one-shot. Notification is fire-and-forget; only the
//! tool-request path flows back in.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::HostError;

/// Events emitted toward the host during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// Partial answer text from the model.
    TextDelta { content: String },

    /// Partial reasoning text from the model.
    ReasoningDelta { content: String },

    /// A tool call is about to execute.
    ToolCallStarted {
        id: String,
        tool_name: String,
        parameters: serde_json::Value,
    },

    /// A tool call finished, successfully or not.
    ToolCallCompleted {
        id: String,
        tool_name: String,
        success: bool,
        execution_time_ms: u64,
    },

    /// The host is asked to execute a host-environment tool and resolve
    /// `correlation_id` within `timeout_ms`.
    HostToolRequested {
        correlation_id: String,
        tool_name: String,
        parameters: serde_json::Value,
        timeout_ms: u64,
    },

    /// The turn reached a terminal state.
    TurnCompleted {
        conversation_id: String,
        rounds: u32,
        tool_calls_made: usize,
    },
}

impl HostEvent {
    /// Wire name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallCompleted { .. } => "tool_call_completed",
            Self::HostToolRequested { .. } => "host_tool_requested",
            Self::TurnCompleted { .. } => "turn_completed",
        }
    }
}

/// What a host answers a tool request with: a JSON value or an error
/// message that becomes a failed tool result.
pub type HostToolOutcome = std::result::Result<serde_json::Value, String>;

/// The host side of the channel.
///
/// `notify` must not block: implementations hand events to their own
/// delivery mechanism (print, send, enqueue) and return.
pub trait HostChannel: Send + Sync {
    fn notify(&self, event: HostEvent);

    /// Whether this host executes host-environment tools. When false,
    /// such calls fail fast instead of waiting out their timeout.
    fn handles_tool_requests(&self) -> bool {
        false
    }
}

/// A host that swallows every event. Used when no host is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHostChannel;

impl HostChannel for NullHostChannel {
    fn notify(&self, _event: HostEvent) {}
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<HostToolOutcome>>>>;

/// Engine-side endpoint pairing outbound notification with inbound
/// one-shot tool results.
///
/// Each host tool call gets a [`HostResultSlot`] keyed by correlation id.
/// [`HostBridge::resolve`] delivers at most once; a slot that is dropped
/// (timeout, cancellation) evicts its own pending entry, so late results
/// find nothing to complete and are discarded with a warning.
pub struct HostBridge {
    channel: Arc<dyn HostChannel>,
    pending: PendingMap,
}

impl HostBridge {
    pub fn new(channel: Arc<dyn HostChannel>) -> Self {
        Self {
            channel,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bridge with no host attached.
    pub fn detached() -> Self {
        Self::new(Arc::new(NullHostChannel))
    }

    pub fn notify(&self, event: HostEvent) {
        self.channel.notify(event);
    }

    pub fn accepts_tool_requests(&self) -> bool {
        self.channel.handles_tool_requests()
    }

    /// Open a result slot for `correlation_id` before the request event is
    /// sent, so a fast host cannot respond into a void.
    pub fn subscribe(&self, correlation_id: &str) -> HostResultSlot {
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(correlation_id.to_string(), tx);
        HostResultSlot {
            correlation_id: correlation_id.to_string(),
            pending: Arc::clone(&self.pending),
            rx,
        }
    }

    /// Deliver a host tool outcome. Returns false when the correlation id
    /// is unknown or already resolved; the outcome is then discarded.
    pub fn resolve(&self, correlation_id: &str, outcome: HostToolOutcome) -> bool {
        let sender = self.lock_pending().remove(correlation_id);
        match sender {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(correlation_id, "Host tool result arrived after the waiter left");
                    false
                } else {
                    true
                }
            }
            None => {
                warn!(correlation_id, "Discarding host tool result with no pending request");
                false
            }
        }
    }

    /// Number of host tool calls currently awaiting a result.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<HostToolOutcome>>> {
        // The map is only touched in short critical sections, never across
        // an await; recover the guard if a panic poisoned it.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One pending host tool result. Dropping the slot cancels the
/// subscription.
pub struct HostResultSlot {
    correlation_id: String,
    pending: PendingMap,
    rx: oneshot::Receiver<HostToolOutcome>,
}

impl HostResultSlot {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the host to resolve this request. Callers wrap this in
    /// their own timeout; the slot itself waits indefinitely.
    pub async fn wait(&mut self) -> std::result::Result<serde_json::Value, HostError> {
        match (&mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(HostError::Failed(message)),
            // Sender dropped without resolving: the bridge went away.
            Err(_) => Err(HostError::Cancelled),
        }
    }
}

impl Drop for HostResultSlot {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.correlation_id);
        }
    }
}
