use std::fs;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};

use crate::child::ChildTable;
use crate::error::{Result, SupervisorError};

/// Reads `PPid:` out of `/proc/<pid>/status`. Returns `None` if the process
/// is gone or `/proc` isn't available (non-Linux), in which case `safe_kill`
/// conservatively refuses to signal.
fn os_reported_parent(pid: Pid) -> Option<Pid> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid.as_raw())).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("PPid:") {
            let ppid: i32 = rest.trim().parse().ok()?;
            return Some(Pid::from_raw(ppid));
        }
    }
    None
}

/// Signal `pid` only if (a) it is in our own child table AND (b) the OS
/// still reports this process as `pid`'s parent. This is the sole guard
/// against signalling a pid that has worn out and been recycled onto an
/// unrelated process (Invariant P8 / spec §4.10).
pub fn safe_kill<R>(table: &ChildTable<R>, pid: Pid, signal: Signal) -> Result<()> {
    if table.lookup(pid).is_none() {
        return Err(SupervisorError::KillRefused(pid));
    }
    match os_reported_parent(pid) {
        Some(ppid) if ppid == getpid() => {
            kill(pid, signal).map_err(|_| SupervisorError::KillRefused(pid))
        }
        _ => Err(SupervisorError::KillRefused(pid)),
    }
}

/// Force-kill, bypassing the pid-reuse guard: used only at the shutdown
/// deadline against pids this process itself just tracked and is certain
/// are still its own, after every softer option has already been tried.
pub fn force_kill(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
}
