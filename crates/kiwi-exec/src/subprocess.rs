// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subprocess primitive.
//!
//! Spawns a process from merged config (command, args, cwd, env, optional
//! stdin), captures stdout/stderr, and enforces the configured timeout by
//! killing the child and awaiting its exit. A timed-out process is never
//! orphaned.

use crate::env::{expand_str, merged_env};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Default timeout when the config does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Result of subprocess execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprocessResult {
    /// `true` when the process exited with status 0.
    pub success: bool,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr (or a synthesized failure description).
    pub stderr: String,
    /// Exit code; `-1` when the process never produced one.
    pub return_code: i64,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl SubprocessResult {
    fn failure(stderr: String, duration_ms: u64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr,
            return_code: -1,
            duration_ms,
        }
    }
}

/// Primitive for executing subprocess commands.
#[derive(Debug, Default)]
pub struct SubprocessPrimitive;

impl SubprocessPrimitive {
    /// Execute a command described by merged config.
    ///
    /// Recognized config keys: `command` (required), `args`, `env`, `cwd`,
    /// `timeout` (seconds, default 300), `input_data`.
    ///
    /// Failures are values: a missing command, spawn error, or timeout
    /// comes back as a [`SubprocessResult`] with `success == false`.
    pub async fn execute(&self, config: &Value) -> SubprocessResult {
        let start = Instant::now();

        let Some(command) = config.get("command").and_then(Value::as_str) else {
            return SubprocessResult::failure("command is required in config".into(), 0);
        };

        let timeout_secs = config
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        // A zero timeout fails before any process exists.
        if timeout_secs == 0 {
            return SubprocessResult::failure("timed out after 0 seconds".into(), 0);
        }

        let env = merged_env(config.get("env").and_then(Value::as_object));
        let command = expand_str(command, &env);
        let args: Vec<String> = config
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => expand_str(s, &env),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let input_data = config
            .get("input_data")
            .and_then(Value::as_str)
            .map(String::from);

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if input_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        if let Some(cwd) = config.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(expand_str(cwd, &env));
        }

        debug!(target: "kiwi.exec", %command, args = args.len(), timeout_secs, "spawning subprocess");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return SubprocessResult::failure(
                    format!("command not found: {command}"),
                    elapsed_ms(start),
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return SubprocessResult::failure(
                    format!("permission denied: {command}"),
                    elapsed_ms(start),
                );
            }
            Err(e) => {
                return SubprocessResult::failure(
                    format!("spawn failed: {e}"),
                    elapsed_ms(start),
                );
            }
        };

        if let Some(input) = input_data {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!(target: "kiwi.exec", error = %e, "failed to write stdin");
                }
                drop(stdin);
            }
        }

        // Drain pipes concurrently so a chatty child cannot deadlock on a
        // full pipe while we wait for exit.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(drain(stdout_pipe));
        let stderr_task = tokio::spawn(drain(stderr_pipe));

        let status = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await;

        match status {
            Ok(Ok(status)) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let return_code = i64::from(status.code().unwrap_or(-1));
                SubprocessResult {
                    success: status.success(),
                    stdout,
                    stderr,
                    return_code,
                    duration_ms: elapsed_ms(start),
                }
            }
            Ok(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                SubprocessResult::failure(format!("wait failed: {e}"), elapsed_ms(start))
            }
            Err(_) => {
                // Kill and await exit so the child is reaped, not orphaned.
                let _ = child.kill().await;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                warn!(target: "kiwi.exec", %command, timeout_secs, "subprocess timed out");
                SubprocessResult::failure(
                    format!("timed out after {timeout_secs} seconds"),
                    elapsed_ms(start),
                )
            }
        }
    }
}

async fn drain(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_succeeds() {
        let result = SubprocessPrimitive
            .execute(&json!({"command": "echo", "args": ["hello"]}))
            .await;
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.return_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_value() {
        let result = SubprocessPrimitive
            .execute(&json!({"command": "sh", "args": ["-c", "exit 3"]}))
            .await;
        assert!(!result.success);
        assert_eq!(result.return_code, 3);
    }

    #[tokio::test]
    async fn missing_command_field() {
        let result = SubprocessPrimitive.execute(&json!({})).await;
        assert!(!result.success);
        assert!(result.stderr.contains("command is required"));
    }

    #[tokio::test]
    async fn command_not_found() {
        let result = SubprocessPrimitive
            .execute(&json!({"command": "kiwi-definitely-not-a-binary"}))
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("command not found"));
        assert_eq!(result.return_code, -1);
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let result = SubprocessPrimitive
            .execute(&json!({"command": "sleep", "args": ["30"], "timeout": 1}))
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("timed out after 1 seconds"));
        assert!(result.duration_ms < 10_000);
    }

    #[tokio::test]
    async fn zero_timeout_fails_without_spawning() {
        let result = SubprocessPrimitive
            .execute(&json!({"command": "echo", "args": ["never"], "timeout": 0}))
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("timed out after 0 seconds"));
        assert_eq!(result.duration_ms, 0);
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let result = SubprocessPrimitive
            .execute(&json!({"command": "cat", "input_data": "from stdin"}))
            .await;
        assert!(result.success);
        assert_eq!(result.stdout, "from stdin");
    }

    #[tokio::test]
    async fn env_vars_are_resolved_in_args() {
        let result = SubprocessPrimitive
            .execute(&json!({
                "command": "sh",
                "args": ["-c", "echo ${KIWI_SUBPROC_TEST:-fallback}"],
                "env": {"KIWI_SUBPROC_TEST": "resolved"},
            }))
            .await;
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "resolved");
    }

    #[tokio::test]
    async fn cwd_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let result = SubprocessPrimitive
            .execute(&json!({
                "command": "pwd",
                "cwd": dir.path().to_str().unwrap(),
            }))
            .await;
        assert!(result.success);
        // Canonical paths may differ by symlink (macOS /private); compare suffix.
        let reported = result.stdout.trim();
        let expected = dir.path().file_name().unwrap().to_str().unwrap();
        assert!(reported.ends_with(expected));
    }
}
