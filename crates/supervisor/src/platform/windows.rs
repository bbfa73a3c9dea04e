//! Windows has no POSIX signal equivalent available through `nix`; callers
//! fall back to `tokio::process::Child::start_kill` for a hard kill and skip
//! straight past the grace period.

pub fn terminate(_pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("graceful terminate is not supported on this platform")
}

pub fn force_kill(_pid: u32) -> anyhow::Result<()> {
    Ok(())
}
