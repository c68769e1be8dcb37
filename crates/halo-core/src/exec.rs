//! Subprocess helpers shared by the variable producers and instance hooks.
//!
//! Commands are always argv vectors; nothing goes through a shell.

use crate::{HaloError, Result};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Render argv for error messages and logs.
pub fn display_command<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| arg.as_ref())
        .collect::<Vec<_>>()
        .join(" ")
}

fn build_command<S: AsRef<str>>(argv: &[S]) -> Result<Command> {
    let (program, args) = argv.split_first().ok_or_else(|| HaloError::Validation {
        field: "argv".to_string(),
        message: "command must have at least a program name".to_string(),
    })?;

    let mut cmd = Command::new(program.as_ref());
    cmd.args(args.iter().map(|arg| arg.as_ref()));
    Ok(cmd)
}

/// Run `argv` to completion and return its stdout.
///
/// Trailing newlines are trimmed. A non-zero exit status fails with
/// `CommandFailed` carrying the command's stderr.
pub async fn exec_async<S: AsRef<str>>(argv: &[S]) -> Result<String> {
    let command = display_command(argv);
    let output = build_command(argv)?
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| HaloError::CommandFailed {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = match stderr.trim() {
            "" => format!("exited with {}", output.status),
            text => text.to_string(),
        };
        return Err(HaloError::CommandFailed { command, message });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim_end_matches(['\n', '\r']).to_string();
    debug!("{} -> {} bytes", command, trimmed.len());
    Ok(trimmed)
}

/// Spawn `argv` with piped stdout and stderr for line streaming.
///
/// On Unix the child leads its own process group (pgid == pid), so
/// [`kill_process_group`](crate::platform::kill_process_group) also takes
/// down anything it started. The child itself is killed if the handle is
/// dropped.
pub fn spawn_lines<S: AsRef<str>>(argv: &[S]) -> Result<Child> {
    let command = display_command(argv);
    let mut cmd = build_command(argv)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| HaloError::CommandFailed {
            command: command.clone(),
            message: e.to_string(),
        })?;

    debug!("Spawned {} (PID {:?})", command, child.id());
    Ok(child)
}
