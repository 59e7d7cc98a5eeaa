//! Terminal host channel — streams a turn onto stdout/stderr.
//!
//! Answer text deltas go to stdout as they arrive, so a piped `chat
//! --message` invocation emits exactly the answer. Tool lifecycle lines
//! go to stderr. Host-environment tools are not served here; the engine
//! fails such calls fast because [`TerminalHost::handles_tool_requests`]
//! stays false.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use capstan_core::host::{HostChannel, HostEvent};

pub struct TerminalHost {
    /// Answer bytes streamed since the last `begin_turn`.
    streamed: AtomicUsize,
    /// Whether the last stdout write left an unterminated line.
    open_line: AtomicBool,
}

impl TerminalHost {
    pub fn new() -> Self {
        Self {
            streamed: AtomicUsize::new(0),
            open_line: AtomicBool::new(false),
        }
    }

    /// Reset per-turn accounting.
    pub fn begin_turn(&self) {
        self.streamed.store(0, Ordering::Relaxed);
        self.open_line.store(false, Ordering::Relaxed);
    }

    /// Whether any answer text reached stdout this turn. Providers that
    /// only deliver a terminal event stream nothing; the caller then
    /// prints the returned answer itself.
    pub fn streamed_output(&self) -> bool {
        self.streamed.load(Ordering::Relaxed) > 0
    }

    /// Terminate a dangling output line, if any.
    pub fn finish_line(&self) {
        if self.open_line.swap(false, Ordering::Relaxed) {
            println!();
        }
    }
}

impl Default for TerminalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostChannel for TerminalHost {
    fn notify(&self, event: HostEvent) {
        match event {
            HostEvent::TextDelta { content } => {
                print!("{content}");
                let _ = std::io::stdout().flush();
                self.streamed.fetch_add(content.len(), Ordering::Relaxed);
                self.open_line
                    .store(!content.ends_with('\n'), Ordering::Relaxed);
            }
            // Reasoning is not rendered; it stays out of the transcript.
            HostEvent::ReasoningDelta { .. } => {}
            HostEvent::ToolCallStarted { tool_name, .. } => {
                self.finish_line();
                eprintln!("  [{tool_name}] running...");
            }
            HostEvent::ToolCallCompleted {
                tool_name,
                success,
                execution_time_ms,
                ..
            } => {
                if success {
                    eprintln!("  [{tool_name}] done ({execution_time_ms}ms)");
                } else {
                    eprintln!("  [{tool_name}] failed");
                }
            }
            HostEvent::HostToolRequested { .. } => {}
            HostEvent::TurnCompleted { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_streamed_output_per_turn() {
        let host = TerminalHost::new();
        assert!(!host.streamed_output());

        host.notify(HostEvent::TextDelta {
            content: "hello".into(),
        });
        assert!(host.streamed_output());

        host.begin_turn();
        assert!(!host.streamed_output());
    }

    #[test]
    fn does_not_serve_host_tools() {
        let host = TerminalHost::new();
        assert!(!host.handles_tool_requests());
    }
}
