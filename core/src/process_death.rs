//! Ties an isolated evaluation's lifetime to the server's.
//!
//! Runs in the forked child between `fork` and `exec`, so it may only make
//! async-signal-safe calls.

use std::io;

/// Asks the kernel to SIGKILL the calling process when its parent exits.
/// `parent_pid` is captured before forking; if the parent is already gone by
/// the time the signal is armed, the child kills itself.
#[cfg(target_os = "linux")]
pub(crate) fn set_parent_death(parent_pid: libc::pid_t) -> io::Result<()> {
    // SAFETY: prctl/getppid/kill/getpid are async-signal-safe and take no
    // pointers.
    unsafe {
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::getppid() != parent_pid {
            libc::kill(libc::getpid(), libc::SIGKILL);
        }
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn set_parent_death(_parent_pid: libc::pid_t) -> io::Result<()> {
    Ok(())
}
