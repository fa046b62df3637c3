//! Subprocess runner for the external diagnostic tools.
//!
//! Spawns a tool, streams its output line-by-line into a handler callback,
//! enforces the wall-clock timeout and exposes the kill switch the safety
//! filter needs. stdout and stderr are interleaved in arrival order so the
//! accumulated text matches what an operator would see in a terminal.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

/// Handler verdict for each received line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAction {
    Continue,
    /// Kill the child immediately (private-IP abort).
    Kill,
}

/// How a tool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Process exited on its own with a zero status.
    Completed,
    /// Process exited on its own with a non-zero status.
    ExitedNonZero,
    /// The wall-clock timeout fired and the process was killed.
    TimedOut,
    /// The handler requested a kill mid-stream.
    Killed,
}

/// Run `argv` to completion, reporting each output line to `on_line`.
///
/// `on_line` runs on every line of stdout or stderr; returning
/// [`LineAction::Kill`] SIGKILLs the child and ends the run. A spawn
/// failure (tool not installed) surfaces as `Err`.
pub async fn run_tool<F>(
    argv: &[String],
    timeout: Duration,
    mut on_line: F,
) -> std::io::Result<RunOutcome>
where
    F: FnMut(&str) -> LineAction,
{
    if let Some(canned) = crate::fake::canned_output(argv) {
        for line in canned.lines() {
            if on_line(line) == LineAction::Kill {
                return Ok(RunOutcome::Killed);
            }
        }
        return Ok(RunOutcome::Completed);
    }

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .map(|s| BufReader::new(s).lines())
        .expect("stdout was piped");
    let mut stderr = child
        .stderr
        .take()
        .map(|s| BufReader::new(s).lines())
        .expect("stderr was piped");

    let deadline = Instant::now() + timeout;
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let action = tokio::select! {
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => on_line(&line),
                _ => {
                    stdout_open = false;
                    LineAction::Continue
                }
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => on_line(&line),
                _ => {
                    stderr_open = false;
                    LineAction::Continue
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                return Ok(RunOutcome::TimedOut);
            }
        };
        if action == LineAction::Kill {
            let _ = child.kill().await;
            return Ok(RunOutcome::Killed);
        }
    }

    // Streams are drained; the exit status should be imminent.
    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(RunOutcome::Completed),
        Ok(_) => Ok(RunOutcome::ExitedNonZero),
        Err(_) => {
            let _ = child.kill().await;
            Ok(RunOutcome::TimedOut)
        }
    }
}

/// Whether the `unbuffer` wrapper needed by the interactive tools is
/// available on this system.
pub async fn unbuffer_available() -> bool {
    if crate::fake::fake_commands_enabled() {
        return true;
    }
    Command::new("unbuffer")
        .arg("-h")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok()
}

/// Prefix an argument vector with `unbuffer` so the tool writes
/// line-buffered output even without a tty.
pub fn with_unbuffer(mut argv: Vec<String>) -> Vec<String> {
    let mut wrapped = Vec::with_capacity(argv.len() + 1);
    wrapped.push("unbuffer".to_string());
    wrapped.append(&mut argv);
    wrapped
}
