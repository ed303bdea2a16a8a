#![forbid(unsafe_code)]

//! Subprocess execution with live output.
//!
//! Conversions take tens of seconds, so callers need each output line the
//! moment the tool prints it, not a buffer after exit. Both stdio streams
//! are drained concurrently and handed to the callback in arrival order;
//! judging the exit status is left to the caller.

use anyhow::{Context, Result};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Runs `program` with `args`, invoking `on_line` for every line the process
/// writes to stdout or stderr, and returns the exit status once the process
/// has terminated and both streams are drained.
pub async fn run_with_live_output<F>(program: &str, args: &[String], mut on_line: F) -> Result<ExitStatus>
where
    F: FnMut(&str),
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Callers may wrap this future in a timeout; dropping it must not
        // leave the converter running.
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("launching {program}"))?;

    let stdout = child.stdout.take().context("capturing stdout")?;
    let stderr = child.stderr.take().context("capturing stderr")?;
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut stdout_open = true;
    let mut stderr_open = true;
    while stdout_open || stderr_open {
        tokio::select! {
            line = stdout_lines.next_line(), if stdout_open => {
                match line.with_context(|| format!("reading {program} stdout"))? {
                    Some(line) => on_line(&line),
                    None => stdout_open = false,
                }
            }
            line = stderr_lines.next_line(), if stderr_open => {
                match line.with_context(|| format!("reading {program} stderr"))? {
                    Some(line) => on_line(&line),
                    None => stderr_open = false,
                }
            }
        }
    }

    child
        .wait()
        .await
        .with_context(|| format!("waiting for {program}"))
}
