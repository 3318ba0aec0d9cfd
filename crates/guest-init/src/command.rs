use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::DEFAULT_PATH;
use crate::pid1;

/// Error from a failed helper command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Locate a helper binary on the default search path.
///
/// The kernel starts init without `PATH`, so lookups never rely on init's
/// own environment.
pub fn find_program(name: &str) -> Result<PathBuf, CommandError> {
    which::which_in(name, Some(DEFAULT_PATH), "/").map_err(|e| CommandError {
        command: name.to_string(),
        detail: format!("not found in {DEFAULT_PATH}: {e}"),
    })
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &Path, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.display().to_string());
    parts.extend(args.iter().map(|a| a.to_string()));
    parts.join(" ")
}

/// Execute a helper command.
///
/// The child is registered with the reaper for its whole lifetime. It is
/// killed if `deadline` passes or `cancel` fires first. Returns trimmed
/// stdout on success.
pub async fn exec(
    program: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let (child, _awaited) = pid1::spawn_tracked(&mut cmd).map_err(|e| CommandError {
        command: cmd_display.clone(),
        detail: e.to_string(),
    })?;

    let output = tokio::select! {
        output = tokio::time::timeout(deadline, child.wait_with_output()) => output,
        () = cancel.cancelled() => {
            return Err(CommandError {
                command: cmd_display,
                detail: "cancelled".to_string(),
            });
        }
    };

    let output = output
        .map_err(|_| CommandError {
            command: cmd_display.clone(),
            detail: format!("timed out after {}s", deadline.as_secs()),
        })?
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: format!("{}: {stderr}", output.status),
        })
    }
}
