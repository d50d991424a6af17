use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::BucketRegistry;
use crate::child::{ChildStatus, ChildTable};
use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::housekeeper::Housekeeper;
use crate::proc_util::{force_kill, safe_kill};
use crate::reaper;

/// Drives the interrupt/terminate shutdown sequence of spec §4.10: ask
/// nicely, wait, then force-kill whatever's left by the deadline.
///
/// Returns `Ok(())` once every child exited on its own before the deadline,
/// or `Err(SupervisorError::DeadlineExceeded)` if any had to be force-killed
/// at `children_max_timeout` — the caller still observes every child
/// STOPPED either way, the error is purely diagnostic.
pub fn run<W, R>(
    children: &mut ChildTable<R>,
    buckets: &mut BucketRegistry<W, R>,
    config: &SupervisorConfig,
) -> Result<()>
where
    W: Clone,
    R: Serialize + DeserializeOwned + Clone,
{
    for record in children.iter_mut() {
        if record.status == ChildStatus::Helper {
            record.respawn = false;
        }
    }

    let active_pids: Vec<_> = children.iter().filter(|r| r.is_active()).map(|r| r.pid).collect();
    for pid in active_pids {
        if let Err(e) = safe_kill(children, pid, Signal::SIGINT) {
            log::warn!("shutdown: {}", e);
        }
    }

    thread::sleep(Duration::from_secs(1));
    reaper::reap_all(children, buckets, config);

    let deadline = Instant::now() + config.children_max_timeout;
    let mut housekeeper = Housekeeper::new();
    while children.count_active(None) > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_secs(1));
        housekeeper.run(children, buckets, config);
    }

    if children.count_active(None) > 0 {
        let stragglers: Vec<_> = children
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.pid)
            .collect();
        for pid in &stragglers {
            force_kill(*pid);
            let _ = children.mark_stopped(*pid);
        }
        log::warn!(
            "{}: force-killed {} straggler(s): {:?}",
            SupervisorError::DeadlineExceeded,
            stragglers.len(),
            stragglers
        );
        return Err(SupervisorError::DeadlineExceeded);
    }

    Ok(())
}
