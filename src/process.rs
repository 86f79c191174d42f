//! Process-group signaling and pid probes.
//!
//! All platform signaling goes through this module: steps are spawned into
//! their own process group, and signals are delivered to the group (negative
//! pid) so shells and their children receive them together.

use crate::error::{Error, Result};

pub const SIGINT: i32 = libc::SIGINT;
pub const SIGKILL: i32 = libc::SIGKILL;
pub const SIGTERM: i32 = libc::SIGTERM;

/// Resolve a signal name such as `SIGTERM` or `TERM` to its number.
pub fn signal_from_name(name: &str) -> Result<i32> {
    let upper = name.to_uppercase();
    let stripped = upper.strip_prefix("SIG").unwrap_or(&upper);
    let sig = match stripped {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ABRT" => libc::SIGABRT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        _ => return Err(Error::InvalidSignal(name.to_string())),
    };
    Ok(sig)
}

/// Send a signal to the process group led by `pid`.
pub fn kill_process_group(pid: i32, signal: i32) {
    if pid <= 0 {
        return;
    }
    // SAFETY: kill(2) with a negative pid targets the process group; the pid
    // comes from a child we spawned as a group leader.
    unsafe {
        libc::kill(-pid, signal);
    }
}

/// Check whether a process with the given pid is alive.
///
/// Signal 0 probes for existence without delivering anything. EPERM still
/// means the process exists.
pub fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the permission/existence check.
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().kind() == std::io::ErrorKind::PermissionDenied
}
