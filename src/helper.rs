use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{SigSet, Signal};
use nix::unistd::{fork, ForkResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::{BucketId, ChildVoidFn, WorkId};
use crate::channel::FramedChannel;
use crate::child::{ChildRecord, HelperEntry};
use crate::child_handle::{self, ChildHandle};
use crate::error::{Result, SupervisorError};

/// Forks a long-lived helper process running `entry`, which is re-invoked
/// synchronously (no further fork inside the reaper's own call frame — see
/// `crate::signals`) whenever this helper dies and `respawn` is true.
/// `child_exit`/`child_sighup` are the owning bucket's callbacks, invoked
/// by the same signal-watcher thread `dispatcher::dispatch_one` uses.
pub fn spawn_helper<R>(
    bucket_id: &BucketId,
    identifier: WorkId,
    entry: HelperEntry<R>,
    respawn: bool,
    child_exit: Option<Arc<ChildVoidFn>>,
    child_sighup: Option<Arc<ChildVoidFn>>,
) -> Result<ChildRecord<R>>
where
    R: Serialize + DeserializeOwned,
{
    let (parent_end, child_end) = FramedChannel::<R>::pair()?;

    let previous_mask = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGCHLD);
    let _ = blocked.thread_block();

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            let _ = previous_mask.thread_set_mask();
            drop(child_end);
            log::info!(
                "spawned helper pid={} for bucket {} id={} (respawn={})",
                child, bucket_id, identifier, respawn
            );
            Ok(ChildRecord::new_helper(
                child,
                bucket_id.clone(),
                identifier,
                parent_end,
                respawn,
                entry,
            ))
        }
        Ok(ForkResult::Child) => {
            drop(parent_end);
            let _ = previous_mask.thread_set_mask();

            child_handle::mark_current_process_as_child();
            let _ = child_handle::reseed_rng_after_fork();
            let (handle, exit_requested, sighup_received) = ChildHandle::new(bucket_id.clone(), child_end);
            child_handle::install_child_signal_flags(&exit_requested, &sighup_received);
            child_handle::spawn_signal_watcher(exit_requested, sighup_received, child_exit, child_sighup);

            if let Some(r) = entry(&handle) {
                if let Err(e) = handle.send_result(r) {
                    log::error!("helper failed to send result frame: {}", e);
                }
            }
            thread::sleep(Duration::from_micros(500));
            std::process::exit(0);
        }
        Err(e) => {
            let _ = previous_mask.thread_set_mask();
            log::error!("helper fork failed for bucket {}: {}", bucket_id, e);
            Err(SupervisorError::ForkFailure(e))
        }
    }
}
