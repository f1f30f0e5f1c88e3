use std::process::Command as StdCommand;

use crate::error::{SandboxError, SandboxResult};

/// No detach step is needed on Windows; taskkill /T walks the tree by pid.
pub fn configure_detached(_cmd: &mut tokio::process::Command) {}

/// Forcefully kill a single process
pub fn terminate(pid: u32) -> SandboxResult<()> {
    let status = StdCommand::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()
        .map_err(|e| SandboxError::platform_error(format!("failed to kill pid {}: {}", pid, e)))?;
    if status.status.success() {
        Ok(())
    } else {
        Err(SandboxError::platform_error(format!(
            "taskkill exited with {:?} for pid {}",
            status.status.code(),
            pid
        )))
    }
}

/// Forcefully kill the whole process tree rooted at `pid`, falling back to a
/// direct kill if the tree kill fails.
pub fn terminate_tree(pid: u32) -> SandboxResult<()> {
    let tree = StdCommand::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
    match tree {
        Ok(output) if output.status.success() => Ok(()),
        _ => terminate(pid),
    }
}
