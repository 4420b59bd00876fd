//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Unix process-group helpers used by components that need to signal a
/// child and its descendants as a unit (see `hls_swarm::supervisor`).
#[cfg(all(unix, feature = "tokio"))]
pub mod group {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use std::io;

    /// Put the child in a new process group led by itself, and — where the
    /// platform supports it — arrange for the kernel to deliver `SIGKILL`
    /// to the child if this process dies first.
    ///
    /// Must be called from `Command::pre_exec`, which runs in the forked
    /// child between `fork` and `exec`; only async-signal-safe calls are
    /// permitted here.
    ///
    /// # Safety
    /// Only async-signal-safe libc calls (`setpgid`, `prctl`) are made.
    pub unsafe fn detach_into_own_group() -> io::Result<()> {
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
        set_parent_death_signal();
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn set_parent_death_signal() {
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_parent_death_signal() {
        // No kernel-level parent-death signal outside Linux; per-child
        // monitoring (the Supervisor's own wait loop) is the fallback.
    }

    /// Install `detach_into_own_group` as a `pre_exec` hook on a tokio
    /// command. The child's pgid equals its own pid once spawned.
    pub fn apply(cmd: &mut tokio::process::Command) {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| detach_into_own_group());
        }
    }

    /// Send `signal` to the process group led by `pgid` (negative-pid
    /// addressing), so helper processes forked by the child are also
    /// reached. `ESRCH` (group already gone) is treated as success.
    pub fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
        match signal::kill(Pid::from_raw(-(pgid as i32)), signal) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_command_builds() {
        let cmd = std_command("true");
        assert_eq!(cmd.get_program(), "true");
    }
}
