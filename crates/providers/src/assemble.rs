//! Turn assembly from stream deltas.
//!
//! The assembler is per-request state: text and reasoning accumulate as
//! plain strings, tool calls merge by their delta `index` so interleaved
//! fragments of parallel calls reassemble correctly. Nothing is decided
//! until [`StreamAssembler::finish`], which revalidates every argument
//! buffer in its final state.

use std::collections::BTreeMap;

use capstan_core::chat::ChatTurn;
use capstan_core::tool::ToolCallRequest;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::wire::StreamToolCallDelta;

#[derive(Default)]
pub(crate) struct StreamAssembler {
    text: String,
    reasoning: String,
    // Keyed by delta index; iteration order is the model's call order.
    calls: BTreeMap<u32, ToolCallRequest>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text_delta(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    pub fn reasoning_delta(&mut self, delta: &str) {
        self.reasoning.push_str(delta);
    }

    /// Merge one tool call delta. The id and name are set by whichever
    /// fragment carries them; argument fragments append in arrival order.
    pub fn tool_call_delta(&mut self, delta: &StreamToolCallDelta) {
        let slot = self
            .calls
            .entry(delta.index)
            .or_insert_with(|| ToolCallRequest::new("", ""));

        if let Some(id) = &delta.id {
            slot.id = id.clone();
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                slot.name = name.clone();
            }
            if let Some(arguments) = &function.arguments {
                slot.append_arguments(arguments);
            }
        }
    }

    /// Assemble the final turn.
    ///
    /// Slots that never received a name are discarded; slots whose final
    /// buffer is not valid JSON are logged and excluded, but the turn's
    /// text survives. Missing ids are synthesized so history entries can
    /// always be paired with results.
    pub fn finish(self) -> ChatTurn {
        let mut tool_calls = Vec::with_capacity(self.calls.len());
        for (index, mut call) in self.calls {
            if call.name.is_empty() {
                trace!(index, "Skipping tool call slot that never received a name");
                continue;
            }
            if !call.finalize_arguments() {
                warn!(
                    tool_name = %call.name,
                    buffer_len = call.arguments.len(),
                    "Dropping tool call with unparseable arguments"
                );
                continue;
            }
            if call.id.is_empty() {
                call.id = format!("call_{}", Uuid::new_v4().simple());
            }
            tool_calls.push(call);
        }

        ChatTurn {
            text: self.text,
            reasoning: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            tool_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::StreamFunctionDelta;
    use serde_json::json;

    fn delta(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> StreamToolCallDelta {
        StreamToolCallDelta {
            index,
            id: id.map(String::from),
            function: Some(StreamFunctionDelta {
                name: name.map(String::from),
                arguments: arguments.map(String::from),
            }),
        }
    }

    #[test]
    fn interleaved_parallel_calls_reassemble_by_index() {
        let mut asm = StreamAssembler::new();
        asm.tool_call_delta(&delta(1, Some("call_b"), Some("get_weather"), Some("{\"loc")));
        asm.tool_call_delta(&delta(0, Some("call_a"), Some("search_web"), Some("{\"que")));
        asm.tool_call_delta(&delta(1, None, None, Some("ation\":\"Paris\"}")));
        asm.tool_call_delta(&delta(0, None, None, Some("ry\":\"rust\"}")));

        let turn = asm.finish();
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].id, "call_a");
        assert_eq!(
            turn.tool_calls[0].parameters,
            Some(json!({"query": "rust"}))
        );
        assert_eq!(turn.tool_calls[1].id, "call_b");
        assert_eq!(
            turn.tool_calls[1].parameters,
            Some(json!({"location": "Paris"}))
        );
    }

    #[test]
    fn nameless_slot_is_discarded() {
        let mut asm = StreamAssembler::new();
        asm.tool_call_delta(&delta(0, Some("call_x"), None, Some("{}")));
        assert!(asm.finish().tool_calls.is_empty());
    }

    #[test]
    fn no_argument_fragments_mean_empty_object() {
        let mut asm = StreamAssembler::new();
        asm.tool_call_delta(&delta(0, Some("call_1"), Some("list_tables"), None));
        let turn = asm.finish();
        assert_eq!(turn.tool_calls[0].parameters, Some(json!({})));
    }

    #[test]
    fn unparseable_arguments_drop_the_call_but_keep_the_text() {
        let mut asm = StreamAssembler::new();
        asm.text_delta("Working on it");
        asm.tool_call_delta(&delta(0, Some("call_1"), Some("get_weather"), Some("{\"loc")));
        // Stream ended before the buffer closed

        let turn = asm.finish();
        assert!(turn.tool_calls.is_empty());
        assert_eq!(turn.text, "Working on it");
    }

    #[test]
    fn missing_id_is_synthesized() {
        let mut asm = StreamAssembler::new();
        asm.tool_call_delta(&delta(0, None, Some("get_weather"), Some("{}")));
        let turn = asm.finish();
        assert!(turn.tool_calls[0].id.starts_with("call_"));
    }

    #[test]
    fn reasoning_is_separate_from_text() {
        let mut asm = StreamAssembler::new();
        asm.reasoning_delta("Considering ");
        asm.reasoning_delta("the options");
        asm.text_delta("Answer");
        let turn = asm.finish();
        assert_eq!(turn.text, "Answer");
        assert_eq!(turn.reasoning.as_deref(), Some("Considering the options"));
    }

    #[test]
    fn empty_reasoning_stays_none() {
        let mut asm = StreamAssembler::new();
        asm.text_delta("hi");
        assert!(asm.finish().reasoning.is_none());
    }
}
