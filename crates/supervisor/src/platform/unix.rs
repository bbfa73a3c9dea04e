use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Ask the process to exit cleanly (SIGTERM).
pub fn terminate(pid: u32) -> anyhow::Result<()> {
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|errno| anyhow::anyhow!("SIGTERM failed for pid {pid}: {errno}"))
}

/// Unconditional kill (SIGKILL), used after the grace period elapses.
pub fn force_kill(pid: u32) -> anyhow::Result<()> {
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|errno| anyhow::anyhow!("SIGKILL failed for pid {pid}: {errno}"))
}
