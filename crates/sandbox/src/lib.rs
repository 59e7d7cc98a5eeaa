//! Sandboxed local tool execution.
//!
//! Every call gets a fresh subprocess: one JSON request line goes in on
//! stdin, one JSON response line comes back on stdout, and the process
//! exits. There is no pooling and no reuse; isolation and cleanup come
//! from process disposal. A child that exceeds its budget is killed, a
//! child that exits without responding is reported with its exit status
//! and stderr tail, and anything it prints after the first response is
//! discarded.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use capstan_core::error::SandboxError;
use capstan_core::tool::ToolExecutionResult;

/// How long a child gets to exit after it has responded, and how long
/// exit-status collection may take for a crashed child.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Stderr kept for crash diagnostics.
const STDERR_TAIL_BYTES: usize = 2048;

/// The single request line written to the child.
#[derive(Debug, Serialize)]
struct SandboxRequest<'a> {
    code: &'a str,
    parameters: &'a serde_json::Value,
    timeout_ms: u64,
}

/// The single response line expected back.
#[derive(Debug, Deserialize)]
struct SandboxResponse {
    success: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    /// Child-measured; the parent fills in wall time when absent
    #[serde(default)]
    execution_time_ms: Option<u64>,
}

/// Limits applied to every execution regardless of per-tool settings.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    /// Whether children see the parent environment. PATH is always
    /// passed through so the runtime binary resolves.
    pub inherit_env: bool,

    /// Upper bound on any requested timeout; a requested timeout of 0
    /// is replaced with this bound.
    pub max_timeout_ms: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            inherit_env: false,
            max_timeout_ms: 120_000,
        }
    }
}

impl SandboxPolicy {
    /// Clamp a requested timeout to the policy bound.
    pub fn effective_timeout_ms(&self, requested: u64) -> u64 {
        if requested == 0 {
            self.max_timeout_ms
        } else {
            requested.min(self.max_timeout_ms)
        }
    }
}

/// JavaScript harness for the default `node` runtime.
///
/// Reads one request line, evaluates the tool code as a function body
/// with `parameters` in scope, and writes the response line before
/// exiting; the exit happens in the write callback so the response is
/// flushed first.
const NODE_HARNESS: &str = r#"
const rl = require('readline').createInterface({ input: process.stdin });
function respond(response) {
  process.stdout.write(JSON.stringify(response) + '\n', () => process.exit(0));
}
rl.once('line', async (line) => {
  let request;
  try {
    request = JSON.parse(line);
  } catch (e) {
    respond({ success: false, error: 'invalid request: ' + e.message });
    return;
  }
  const started = Date.now();
  try {
    const fn = new Function('parameters', request.code);
    let result = fn(request.parameters ?? {});
    if (result && typeof result.then === 'function') {
      result = await result;
    }
    respond({
      success: true,
      result: result === undefined ? null : result,
      execution_time_ms: Date.now() - started,
    });
  } catch (e) {
    respond({
      success: false,
      error: String(e && e.message ? e.message : e),
      execution_time_ms: Date.now() - started,
    });
  }
});
"#;

/// Runs local tool code in disposable subprocesses.
pub struct SandboxedExecutor {
    program: String,
    args: Vec<String>,
    policy: SandboxPolicy,
}

impl SandboxedExecutor {
    /// The built-in Node.js runtime.
    pub fn node() -> Self {
        Self::command("node", vec!["-e".into(), NODE_HARNESS.into()])
    }

    /// A custom runtime command. It must speak the same line protocol:
    /// one request line on stdin, one response line on stdout, exit.
    pub fn command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            policy: SandboxPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SandboxPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Execute `code` with `parameters`, bounded by `timeout_ms`.
    ///
    /// `Ok` carries the child-reported outcome, success or failure.
    /// `Err` means the execution itself broke down: the runtime could not
    /// spawn, the budget elapsed, the call was cancelled, or the child
    /// died without answering.
    pub async fn execute(
        &self,
        tool_name: &str,
        code: &str,
        parameters: &serde_json::Value,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<ToolExecutionResult, SandboxError> {
        let effective_ms = self.policy.effective_timeout_ms(timeout_ms);
        let started = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.policy.inherit_env {
            command
                .env_clear()
                .env("PATH", std::env::var("PATH").unwrap_or_default());
        }

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(format!("{}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Protocol("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Protocol("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let request = SandboxRequest {
            code,
            parameters,
            timeout_ms: effective_ms,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| SandboxError::Protocol(format!("request encoding failed: {e}")))?;
        line.push('\n');

        // A child that crashed on startup closes its stdin; fall through
        // to the read so the crash surfaces as ExitedWithoutResponse.
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(tool = tool_name, error = %e, "Sandbox stdin write failed");
        } else {
            let _ = stdin.flush().await;
        }
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(SandboxError::Cancelled(tool_name.to_string()));
            }
            outcome = tokio::time::timeout(
                Duration::from_millis(effective_ms),
                first_response(&mut lines),
            ) => match outcome {
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(SandboxError::Timeout {
                        tool_name: tool_name.to_string(),
                        timeout_ms: effective_ms,
                    });
                }
                Ok(None) => {
                    let detail = exit_detail(child, stderr).await;
                    return Err(SandboxError::ExitedWithoutResponse {
                        tool_name: tool_name.to_string(),
                        detail,
                    });
                }
                Ok(Some(response)) => response,
            },
        };

        // One response per call; the child is expected to exit now.
        if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
            debug!(tool = tool_name, "Sandbox lingered after responding, killing it");
            let _ = child.start_kill();
        }

        let wall_ms = started.elapsed().as_millis() as u64;
        let execution_time_ms = response.execution_time_ms.unwrap_or(wall_ms);

        Ok(if response.success {
            ToolExecutionResult::ok(
                response.result.unwrap_or(serde_json::Value::Null),
                execution_time_ms,
            )
        } else {
            ToolExecutionResult::failed(
                response
                    .error
                    .unwrap_or_else(|| "sandbox reported failure without detail".into()),
                execution_time_ms,
            )
        })
    }
}

/// Read until the first line that parses as a response. Non-protocol
/// output (runtime warnings, stray prints) is skipped; everything after
/// the first response is never read.
async fn first_response(lines: &mut Lines<BufReader<ChildStdout>>) -> Option<SandboxResponse> {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<SandboxResponse>(line) {
                    Ok(response) => return Some(response),
                    Err(e) => {
                        trace!(line, error = %e, "Ignoring non-protocol sandbox output");
                    }
                }
            }
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Sandbox stdout read error");
                return None;
            }
        }
    }
}

/// Collect what we can about a child that died without responding.
async fn exit_detail(mut child: Child, stderr: Option<ChildStderr>) -> String {
    let status = match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => match status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        },
        Ok(Err(e)) => format!("exit status unavailable: {e}"),
        Err(_) => {
            let _ = child.start_kill();
            "closed stdout but kept running".to_string()
        }
    };

    let mut tail = String::new();
    if let Some(mut stderr) = stderr {
        let mut buf = Vec::new();
        if tokio::time::timeout(EXIT_GRACE, stderr.read_to_end(&mut buf))
            .await
            .is_ok()
        {
            let text = String::from_utf8_lossy(&buf);
            let text = text.trim();
            let mut start = text.len().saturating_sub(STDERR_TAIL_BYTES);
            while start < text.len() && !text.is_char_boundary(start) {
                start += 1;
            }
            tail = text[start..].to_string();
        }
    }

    if tail.is_empty() {
        status
    } else {
        format!("{status}; stderr: {tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> SandboxedExecutor {
        SandboxedExecutor::command("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn responsive_child_result_is_returned() {
        let executor = sh(r#"read line; echo '{"success":true,"result":{"sum":5},"execution_time_ms":3}'"#);
        let result = executor
            .execute("add", "", &json!({"a": 2, "b": 3}), 5_000, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!({"sum": 5})));
        assert_eq!(result.execution_time_ms, 3);
    }

    #[tokio::test]
    async fn child_reported_failure_is_not_a_process_error() {
        let executor = sh(r#"read line; echo '{"success":false,"error":"TypeError: boom"}'"#);
        let result = executor
            .execute("bad", "", &json!({}), 5_000, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("TypeError"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_names_the_budget() {
        let executor = sh("sleep 5");
        let started = Instant::now();
        let err = executor
            .execute("slow", "", &json!({}), 200, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            SandboxError::Timeout { tool_name, timeout_ms } => {
                assert_eq!(tool_name, "slow");
                assert_eq!(timeout_ms, 200);
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn crash_before_response_reports_exit_status() {
        let executor = sh("read line; exit 3");
        let err = executor
            .execute("crash", "", &json!({}), 5_000, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SandboxError::ExitedWithoutResponse { detail, .. } => {
                assert!(detail.contains("exit code 3"), "detail was: {detail}");
            }
            other => panic!("Expected ExitedWithoutResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stderr_tail_is_captured_for_crashes() {
        let executor = sh("read line; echo 'module not found: left-pad' >&2; exit 1");
        let err = executor
            .execute("crash", "", &json!({}), 5_000, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SandboxError::ExitedWithoutResponse { detail, .. } => {
                assert!(detail.contains("left-pad"), "detail was: {detail}");
            }
            other => panic!("Expected ExitedWithoutResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_response_wins_and_duplicates_are_discarded() {
        let executor = sh(
            r#"read line; echo '{"success":true,"result":1}'; echo '{"success":true,"result":2}'"#,
        );
        let result = executor
            .execute("dup", "", &json!({}), 5_000, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn non_protocol_lines_are_skipped() {
        let executor = sh(
            r#"read line; echo 'warning: experimental feature'; echo '{"success":true,"result":"ok"}'"#,
        );
        let result = executor
            .execute("noisy", "", &json!({}), 5_000, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn missing_child_timing_falls_back_to_wall_time() {
        let executor = sh(r#"read line; echo '{"success":true,"result":null}'"#);
        let result = executor
            .execute("untimed", "", &json!({}), 5_000, &CancellationToken::new())
            .await
            .unwrap();
        // Parent wall time; just has to be present and sane.
        assert!(result.execution_time_ms < 5_000);
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let executor = sh("sleep 5");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = executor
            .execute("cancelled", "", &json!({}), 30_000, &cancel)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, SandboxError::Cancelled(_)));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let executor = SandboxedExecutor::command("/nonexistent/runtime", vec![]);
        let err = executor
            .execute("ghost", "", &json!({}), 1_000, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn policy_clamps_oversized_timeouts() {
        let executor = sh("sleep 5").with_policy(SandboxPolicy {
            inherit_env: false,
            max_timeout_ms: 100,
        });
        let err = executor
            .execute("clamped", "", &json!({}), 60_000, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SandboxError::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 100),
            other => panic!("Expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn zero_timeout_uses_the_policy_bound() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.effective_timeout_ms(0), policy.max_timeout_ms);
        assert_eq!(policy.effective_timeout_ms(500), 500);
    }

    #[tokio::test]
    async fn environment_is_cleared_by_default() {
        // Safety: the variable is unique to this test.
        unsafe { std::env::set_var("CAPSTAN_SANDBOX_SENTINEL", "leaky") };
        let script = r#"read line; echo "{\"success\":true,\"result\":\"${CAPSTAN_SANDBOX_SENTINEL:-clean}\"}""#;

        let isolated = sh(script)
            .execute("env", "", &json!({}), 5_000, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(isolated.result, Some(json!("clean")));

        let inherited = sh(script)
            .with_policy(SandboxPolicy {
                inherit_env: true,
                max_timeout_ms: 120_000,
            })
            .execute("env", "", &json!({}), 5_000, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(inherited.result, Some(json!("leaky")));
    }
}
