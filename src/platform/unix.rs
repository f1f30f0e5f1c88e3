use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;

use crate::error::{SandboxError, SandboxResult};

/// Place the child in its own process group so the whole tree can be killed
/// with one signal.
pub fn configure_detached(cmd: &mut tokio::process::Command) {
    cmd.process_group(0);
}

/// Kill a single process with SIGKILL
pub fn terminate(pid: u32) -> SandboxResult<()> {
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| SandboxError::platform_error(format!("failed to kill pid {}: {}", pid, e)))
}

/// Kill the process group rooted at `pid` with SIGKILL. Works when the
/// process was spawned detached (its pgid equals its pid); falls back to
/// killing just the main process when group-kill fails.
pub fn terminate_tree(pid: u32) -> SandboxResult<()> {
    if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
        return Ok(());
    }
    terminate(pid)
}
