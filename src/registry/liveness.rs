//! Is a recorded daemon pid still one of our daemons?
//!
//! A pid alone is not enough: after the daemon exits the number can be
//! reused by an unrelated process, and a daemon that exited but has not been
//! reaped still answers signal 0. On Linux both cases are ruled out through
//! `/proc`; elsewhere the signal-0 check is all there is.

use std::fs;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Substring every session daemon command line contains.
pub const DAEMON_MARKER: &str = "duo-relayd";

/// Whether `pid` refers to a running session daemon.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    is_process_running(pid) && !is_zombie(pid) && is_daemon(pid)
}

/// Whether any process with `pid` exists.
#[must_use]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesised command name.
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_daemon(pid: u32) -> bool {
    match fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => String::from_utf8_lossy(&raw).contains(DAEMON_MARKER),
        // Unreadable cmdline: fall back to the signal-0 check.
        Err(_) => true,
    }
}

#[cfg(not(target_os = "linux"))]
fn is_daemon(_pid: u32) -> bool {
    true
}
