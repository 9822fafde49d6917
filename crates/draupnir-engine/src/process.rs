//! Helpers for shelling out to privileged tooling

use anyhow::{anyhow, Result};
use std::ffi::OsStr;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Build a command for `program`, routed through `sudo -n` when requested.
pub(crate) fn command(program: impl AsRef<OsStr>, use_sudo: bool) -> AsyncCommand {
    if use_sudo {
        let mut cmd = AsyncCommand::new("sudo");
        cmd.arg("-n").arg(program);
        cmd
    } else {
        AsyncCommand::new(program)
    }
}

/// Run to completion and fail with the captured stderr on a non-zero exit.
pub(crate) async fn run(mut cmd: AsyncCommand, what: &str) -> Result<Output> {
    debug!("{} command: {:?}", what, cmd);
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
        .await
        .map_err(|_| anyhow!("{what} timed out after {}s", COMMAND_TIMEOUT.as_secs()))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        error!(status = %output.status, "{} failed: {}", what, stderr.trim());
        return Err(anyhow!(
            "{what} failed ({}): {}{}",
            output.status,
            stderr.trim(),
            if stdout.trim().is_empty() { String::new() } else { format!(" / {}", stdout.trim()) }
        ));
    }
    Ok(output)
}

/// Whether `program` resolves on the PATH
pub(crate) async fn on_path(program: &str) -> bool {
    AsyncCommand::new("which")
        .arg(program)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}
