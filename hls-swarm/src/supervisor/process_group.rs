//! Process-group discipline: each child is spawned detached into its own
//! process group, so a single signal addressed at `-pgid` reaches the
//! child and any descendants it forks.

use tokio::process::Command;

/// Arrange for `cmd`'s child to start a new process group, and — on
/// platforms that support it — die if this process dies first
/// (`PR_SET_PDEATHSIG` on Linux; a best-effort no-op on other Unixes).
pub fn prepare(cmd: &mut Command) {
    #[cfg(unix)]
    {
        process_utils::group::apply(cmd);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Escalating stop: SIGTERM the group, then SIGKILL on timeout.
#[cfg(unix)]
pub fn send_term(pgid: u32) -> std::io::Result<()> {
    process_utils::group::signal_group(pgid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
pub fn send_kill(pgid: u32) -> std::io::Result<()> {
    process_utils::group::signal_group(pgid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
pub fn send_term(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn send_kill(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}
