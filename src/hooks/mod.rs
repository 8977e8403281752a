//! Lifecycle hook manager
//!
//! Hooks are user-declared external commands invoked at well-defined points
//! (`PreToolUse`, `PostToolUse`, `Notification`, `Stop`). Each matching hook
//! receives a JSON payload on stdin and may answer with a JSON response on
//! stdout to block execution, modify the tool input, or attach a message.
//! Hook configuration is read-only; the engine never mutates it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::constants;

/// Lifecycle point a hook fires at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    Notification,
    Stop,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::Notification => "Notification",
            HookEvent::Stop => "Stop",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-declared hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    pub event: HookEvent,
    /// Exact tool name, pipe-separated alternatives, or `*`. Absent matches
    /// every tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    /// Shell command line, run through the platform shell.
    pub command: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl HookConfig {
    pub fn new(event: HookEvent, command: impl Into<String>) -> Self {
        Self {
            event,
            matcher: None,
            command: command.into(),
            enabled: true,
            description: None,
        }
    }

    pub fn with_matcher(mut self, matcher: impl Into<String>) -> Self {
        self.matcher = Some(matcher.into());
        self
    }

    fn matches(&self, event: HookEvent, tool_name: Option<&str>) -> bool {
        if !self.enabled || self.event != event {
            return false;
        }
        match self.matcher.as_deref() {
            None | Some("") | Some("*") => true,
            Some(matcher) => match tool_name {
                Some(name) => matcher.split('|').any(|alt| alt.trim() == name),
                None => false,
            },
        }
    }
}

/// JSON document written to a hook's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct HookPayload {
    pub event: HookEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<Value>,
    pub session_id: String,
    pub workspace_dir: String,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

/// JSON document read from a hook's stdout.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HookResponse {
    #[serde(default)]
    pub block: Option<bool>,
    #[serde(default)]
    pub modify: Option<HookModify>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HookModify {
    #[serde(default)]
    pub tool_input: Option<Value>,
}

impl HookResponse {
    pub fn is_blocking(&self) -> bool {
        self.block == Some(true)
    }
}

/// Outcome of one hook invocation.
#[derive(Debug, Clone)]
pub struct HookExecution {
    pub hook: HookConfig,
    pub success: bool,
    pub response: Option<HookResponse>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// 🪝 HOOK MANAGER: Gateway between the engine and user-supplied commands
/// ARCHITECTURE DECISION: Sub-process callouts over in-process plugins
/// Why: Hooks run arbitrary user code; a process boundary contains crashes,
/// leaks, and hangs, and lets hooks be written in any language
/// Alternative: dylib/plugin loading (rejected: one bad hook takes down the
/// engine, no timeout story)
/// Audit: Verify payload serialization and timeout handling in spawn_and_collect
#[derive(Clone)]
pub struct HookManager {
    hooks: Vec<HookConfig>,
    session_id: String,
    workspace_dir: PathBuf,
    timeout: Duration,
}

impl HookManager {
    pub fn new(hooks: Vec<HookConfig>, session_id: impl Into<String>, workspace_dir: PathBuf) -> Self {
        Self {
            hooks,
            session_id: session_id.into(),
            workspace_dir,
            timeout: Duration::from_millis(constants::HOOK_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn hooks(&self) -> &[HookConfig] {
        &self.hooks
    }

    /// Fires every enabled hook matching `event`/`tool_name`. Execution stops
    /// after the first hook that answers `block: true`; its result is the
    /// last element of the returned vec.
    pub async fn fire(
        &self,
        event: HookEvent,
        tool_name: Option<&str>,
        tool_input: Option<Value>,
        tool_output: Option<Value>,
        context: Option<Map<String, Value>>,
    ) -> Vec<HookExecution> {
        let mut results = Vec::new();

        for hook in self.hooks.iter().filter(|h| h.matches(event, tool_name)) {
            let payload = HookPayload {
                event,
                tool_name: tool_name.map(str::to_string),
                tool_input: tool_input.clone(),
                tool_output: tool_output.clone(),
                session_id: self.session_id.clone(),
                workspace_dir: self.workspace_dir.display().to_string(),
                timestamp: Utc::now(),
                context: context.clone(),
            };

            let execution = self.run_hook(hook, &payload).await;
            let blocked = execution
                .response
                .as_ref()
                .map(HookResponse::is_blocking)
                .unwrap_or(false);
            results.push(execution);

            // 🛑 SHORT-CIRCUIT RULE: First block:true ends the chain
            // Why: A veto is final; spawning later hooks would waste their
            // work and let them observe an action that will never happen
            // Alternative: Run all, aggregate verdicts (rejected: hooks with
            // side effects fire for a blocked action)
            if blocked {
                debug!("Hook blocked {} for {:?}, short-circuiting", event, tool_name);
                break;
            }
        }

        results
    }

    async fn run_hook(&self, hook: &HookConfig, payload: &HookPayload) -> HookExecution {
        let started = Instant::now();

        let result = self.spawn_and_collect(hook, payload).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((response, error)) => HookExecution {
                hook: hook.clone(),
                success: error.is_none(),
                response,
                error,
                duration_ms,
            },
            Err(error) => {
                warn!("Hook {:?} failed: {}", hook.command, error);
                HookExecution {
                    hook: hook.clone(),
                    success: false,
                    response: None,
                    error: Some(error),
                    duration_ms,
                }
            }
        }
    }

    /// Spawns the command through the platform shell, feeds it the payload,
    /// and interprets stdout per the wire protocol.
    ///
    /// 🏗️ WORKSPACE INHERITANCE DECISION: Hooks run in the configured
    /// workspace directory with `HOOK_EVENT`/`HOOK_TOOL_NAME` in the
    /// environment
    /// Why: Shell one-liners can branch on the env vars without parsing
    /// stdin, and relative paths in hook commands resolve predictably
    /// Alternative: Inherit the engine's cwd (rejected: hooks would see
    /// whatever directory the embedder happened to start in)
    async fn spawn_and_collect(
        &self,
        hook: &HookConfig,
        payload: &HookPayload,
    ) -> std::result::Result<(Option<HookResponse>, Option<String>), String> {
        let mut command = shell_command(&hook.command);
        command
            .env("HOOK_EVENT", payload.event.as_str())
            .env("HOOK_TOOL_NAME", payload.tool_name.as_deref().unwrap_or(""))
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| format!("failed to spawn hook: {e}"))?;

        let body = serde_json::to_string_pretty(payload)
            .map_err(|e| format!("failed to serialize payload: {e}"))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A hook that exits without reading stdin closes the pipe early;
            // that is not an error on our side.
            let _ = stdin.write_all(body.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        // ⏱️ TIMEOUT ENFORCEMENT: Hard wall clock around the whole read
        // Why: A hook that never closes stdout must not gate its task forever
        // Implementation: Dropping the in-flight future kills the child via
        // kill_on_drop, so a timed-out hook cannot linger as a zombie
        // Alternative: SIGTERM-then-wait (rejected: a second wait needs a
        // second timeout, and the hook already had 30s to be polite)
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("failed to read hook output: {e}")),
            Err(_) => {
                return Err(format!(
                    "Hook timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code().unwrap_or(-1);

        if stdout.is_empty() {
            if output.status.success() {
                return Ok((Some(HookResponse::default()), None));
            }
            let error = if stderr.is_empty() {
                format!("exited {code}")
            } else {
                stderr
            };
            return Ok((None, Some(error)));
        }

        let mut response = match serde_json::from_str::<HookResponse>(&stdout) {
            Ok(response) => response,
            // Plain-text output is treated as a message, never a block.
            Err(_) => HookResponse {
                block: Some(false),
                message: Some(stdout),
                ..HookResponse::default()
            },
        };
        if response.exit_code.is_none() {
            response.exit_code = Some(code);
        }
        Ok((Some(response), None))
    }
}

/// 🐚 SHELL SELECTION: Route the command line through the platform shell
/// Why: Hook commands are user-written one-liners that expect pipes, quoting,
/// and env expansion to work exactly as they do in a terminal
/// Alternative: Tokenize and exec directly (rejected: reimplements shell
/// quoting badly, breaks every hook that uses a pipe)
fn shell_command(command_line: &str) -> Command {
    #[cfg(target_os = "windows")]
    {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(command_line);
        command
    }
    #[cfg(not(target_os = "windows"))]
    {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line);
        command
    }
}

/// True iff any successful result answered `block: true`, with its message.
pub fn is_blocked(results: &[HookExecution]) -> (bool, Option<String>) {
    for result in results {
        if let Some(response) = &result.response {
            if response.is_blocking() {
                return (true, response.message.clone());
            }
        }
    }
    (false, None)
}

/// The first modified tool input offered by any hook, if present.
pub fn modified_input(results: &[HookExecution]) -> Option<Value> {
    results.iter().find_map(|r| {
        r.response
            .as_ref()
            .and_then(|resp| resp.modify.as_ref())
            .and_then(|m| m.tool_input.clone())
    })
}

/// Ordered messages and error strings across all results.
pub fn messages(results: &[HookExecution]) -> Vec<String> {
    let mut out = Vec::new();
    for result in results {
        if let Some(message) = result.response.as_ref().and_then(|r| r.message.clone()) {
            out.push(message);
        }
        if let Some(error) = &result.error {
            out.push(error.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(hooks: Vec<HookConfig>) -> HookManager {
        HookManager::new(hooks, "session-1", std::env::temp_dir())
    }

    #[test]
    fn test_matcher_rules() {
        let exact = HookConfig::new(HookEvent::PreToolUse, "true").with_matcher("Bash");
        assert!(exact.matches(HookEvent::PreToolUse, Some("Bash")));
        assert!(!exact.matches(HookEvent::PreToolUse, Some("Edit")));
        assert!(!exact.matches(HookEvent::PostToolUse, Some("Bash")));
        assert!(!exact.matches(HookEvent::PreToolUse, None));

        let alternatives = HookConfig::new(HookEvent::PreToolUse, "true").with_matcher("Bash|Edit");
        assert!(alternatives.matches(HookEvent::PreToolUse, Some("Edit")));
        assert!(!alternatives.matches(HookEvent::PreToolUse, Some("Write")));

        let wildcard = HookConfig::new(HookEvent::PreToolUse, "true").with_matcher("*");
        assert!(wildcard.matches(HookEvent::PreToolUse, Some("anything")));
        assert!(wildcard.matches(HookEvent::PreToolUse, None));

        let unmatched = HookConfig::new(HookEvent::PreToolUse, "true");
        assert!(unmatched.matches(HookEvent::PreToolUse, Some("anything")));

        let mut disabled = HookConfig::new(HookEvent::PreToolUse, "true");
        disabled.enabled = false;
        assert!(!disabled.matches(HookEvent::PreToolUse, Some("Bash")));
    }

    #[tokio::test]
    async fn test_json_response_parsed() {
        let manager = manager(vec![HookConfig::new(
            HookEvent::PreToolUse,
            r#"echo '{"block":false,"message":"looks fine"}'"#,
        )]);
        let results = manager
            .fire(HookEvent::PreToolUse, Some("Bash"), None, None, None)
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        let response = results[0].response.as_ref().unwrap();
        assert_eq!(response.message.as_deref(), Some("looks fine"));
        let (blocked, _) = is_blocked(&results);
        assert!(!blocked);
    }

    #[tokio::test]
    async fn test_block_short_circuits_remaining_hooks() {
        let dir = tempfile::TempDir::new().unwrap();
        let witness = dir.path().join("second-ran");
        let manager = manager(vec![
            HookConfig::new(
                HookEvent::PreToolUse,
                r#"echo '{"block":true,"message":"no"}'"#,
            ),
            HookConfig::new(HookEvent::PreToolUse, format!("touch {}", witness.display())),
        ]);

        let results = manager
            .fire(HookEvent::PreToolUse, Some("Bash"), None, None, None)
            .await;

        assert_eq!(results.len(), 1);
        let (blocked, message) = is_blocked(&results);
        assert!(blocked);
        assert_eq!(message.as_deref(), Some("no"));
        assert!(!witness.exists());
    }

    #[tokio::test]
    async fn test_plain_text_stdout_becomes_message() {
        let manager = manager(vec![HookConfig::new(HookEvent::Notification, "echo hello there")]);
        let results = manager.fire(HookEvent::Notification, None, None, None, None).await;

        assert!(results[0].success);
        let response = results[0].response.as_ref().unwrap();
        assert_eq!(response.block, Some(false));
        assert_eq!(response.message.as_deref(), Some("hello there"));
        assert_eq!(messages(&results), vec!["hello there".to_string()]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_output_is_an_error() {
        let manager = manager(vec![HookConfig::new(
            HookEvent::PreToolUse,
            "echo oops >&2; exit 3",
        )]);
        let results = manager
            .fire(HookEvent::PreToolUse, Some("Bash"), None, None, None)
            .await;

        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("oops"));
        // Errors never block on their own.
        let (blocked, _) = is_blocked(&results);
        assert!(!blocked);
    }

    #[tokio::test]
    async fn test_timeout_kills_hook() {
        let manager = manager(vec![HookConfig::new(HookEvent::PreToolUse, "sleep 30")])
            .with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let results = manager
            .fire(HookEvent::PreToolUse, Some("Bash"), None, None, None)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!results[0].success);
        assert!(results[0].error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_environment_carries_event_and_tool() {
        let manager = manager(vec![HookConfig::new(
            HookEvent::PreToolUse,
            r#"printf '{"message":"%s/%s"}' "$HOOK_EVENT" "$HOOK_TOOL_NAME""#,
        )]);
        let results = manager
            .fire(HookEvent::PreToolUse, Some("Bash"), None, None, None)
            .await;

        let response = results[0].response.as_ref().unwrap();
        assert_eq!(response.message.as_deref(), Some("PreToolUse/Bash"));
    }

    #[tokio::test]
    async fn test_modified_input_extraction() {
        let manager = manager(vec![HookConfig::new(
            HookEvent::PreToolUse,
            r#"echo '{"modify":{"tool_input":{"extra":"context"}}}'"#,
        )]);
        let results = manager
            .fire(HookEvent::PreToolUse, Some("Bash"), None, None, None)
            .await;

        let modified = modified_input(&results).unwrap();
        assert_eq!(modified["extra"], "context");
    }

    #[tokio::test]
    async fn test_hooks_run_in_configuration_order() {
        let manager = manager(vec![
            HookConfig::new(HookEvent::PreToolUse, "echo first"),
            HookConfig::new(HookEvent::PreToolUse, "echo second"),
        ]);
        let results = manager
            .fire(HookEvent::PreToolUse, Some("Bash"), None, None, None)
            .await;

        assert_eq!(messages(&results), vec!["first".to_string(), "second".to_string()]);
    }
}
