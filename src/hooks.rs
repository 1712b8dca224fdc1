//! Event hook execution via subprocess
//!
//! Lifecycle events can each map to a user command. Invocations are
//! fire-and-forget with a wall-clock timeout; stderr is captured into
//! logs and the exit code is recorded but never affects satellite state.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::{Error, Result};

/// Default timeout for hook execution
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// What a hook receives on stdin
#[derive(Debug, Clone, PartialEq)]
pub enum StdinPayload {
    /// Nothing; stdin is closed immediately
    None,
    /// A text payload (transcript text, wake word name, timer id)
    Text(String),
    /// The event serialized as JSON
    Json(serde_json::Value),
}

impl StdinPayload {
    fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::None => None,
            Self::Text(text) => Some(text.into_bytes()),
            Self::Json(value) => Some(value.to_string().into_bytes()),
        }
    }
}

/// Spawn a hook and forget it.
///
/// The command runs on its own task with [`DEFAULT_TIMEOUT`]; failures
/// are logged and dropped.
pub fn fire(command: &[String], stdin: StdinPayload) {
    let command = command.to_vec();
    tokio::spawn(async move {
        match execute(&command, stdin, DEFAULT_TIMEOUT).await {
            Ok(code) if code != 0 => {
                tracing::warn!(command = ?command, code, "hook exited nonzero");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(command = ?command, error = %e, "hook failed");
            }
        }
    });
}

/// Run a hook to completion and return its exit code.
///
/// # Errors
///
/// Returns [`Error::Hook`] when the command is empty, fails to spawn,
/// or exceeds the timeout.
pub async fn execute(
    command: &[String],
    stdin: StdinPayload,
    hook_timeout: Duration,
) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::Hook("empty command".to_string()))?;

    tracing::debug!(program = %program, "running hook");

    let payload = stdin.into_bytes();
    let mut child = Command::new(program)
        .args(args)
        .stdin(if payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Hook(format!("failed to spawn {program}: {e}")))?;

    if let Some(payload) = payload {
        if let Some(mut child_stdin) = child.stdin.take() {
            child_stdin
                .write_all(&payload)
                .await
                .map_err(|e| Error::Hook(format!("stdin write: {e}")))?;
        }
    }

    let output = timeout(hook_timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::Hook(format!("{program} timed out after {hook_timeout:?}")))?
        .map_err(|e| Error::Hook(format!("{program}: {e}")))?;

    if !output.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(program = %program, stderr = %stderr.trim_end(), "hook stderr");
    }

    Ok(output.status.code().unwrap_or(-1))
}
