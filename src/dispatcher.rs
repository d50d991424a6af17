use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{SigSet, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::{BucketCallbacks, BucketId, ChildInput, ChildVoidFn, WorkId};
use crate::callback::{Callback, CallbackDispatcher};
use crate::channel::FramedChannel;
use crate::child::ChildRecord;
use crate::child_handle::{self, ChildHandle};
use crate::error::{Result, SupervisorError};

/// Result of one dispatch attempt, reported back to the supervisor loop so
/// it can update its own bookkeeping (the dispatcher itself only knows
/// about the one child it just created).
pub struct Dispatched {
    pub pid: Pid,
    pub bucket: BucketId,
    pub identifier: WorkId,
}

/// Forks one child for `bucket`'s next batch and wires up its channel. Does
/// not touch the child table directly — returns the new record for the
/// caller (the supervisor, which owns the table) to insert, keeping this
/// function free of borrows on supervisor-wide state while it forks.
///
/// `prefork_hooks` run in registration order before the fork, matching the
/// "resource-cleanup hooks" of spec §4.7 step 3 (e.g. flushing buffers that
/// must not be duplicated into the child).
#[allow(clippy::too_many_arguments)]
pub fn dispatch_one<W, R>(
    bucket_id: &BucketId,
    input: ChildInput<W>,
    identifier: WorkId,
    child_run: Option<Rc<crate::bucket::ChildRunFn<W, R>>>,
    child_exit: Option<Arc<ChildVoidFn>>,
    child_sighup: Option<Arc<ChildVoidFn>>,
    prefork_hooks: &[Rc<dyn Fn()>],
) -> Result<(ChildRecord<R>, Dispatched)>
where
    W: Clone,
    R: Serialize + DeserializeOwned,
{
    for hook in prefork_hooks {
        hook();
    }

    let (parent_end, child_end) = FramedChannel::<R>::pair()?;

    let previous_mask = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGCHLD);
    let _ = blocked.thread_block();

    // SAFETY: between fork and exit, the child only touches its own stack,
    // the channel endpoint it was handed, and the (COW) callback closure;
    // it performs no allocation-unsafe work that fork() forbids beyond what
    // the callback itself does, same contract as any `nix::unistd::fork`
    // caller.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            let _ = previous_mask.thread_set_mask();
            drop(child_end);

            log::info!(
                "forked worker pid={} for bucket {} id={}",
                child, bucket_id, identifier
            );

            let record = ChildRecord::new_worker(child, bucket_id.clone(), identifier.clone(), parent_end);
            Ok((
                record,
                Dispatched {
                    pid: child,
                    bucket: bucket_id.clone(),
                    identifier,
                },
            ))
        }
        Ok(ForkResult::Child) => {
            // The child's copy of the parent's queues and sibling records
            // is simply never touched again: `parent_end`, the bucket
            // registry, and the rest of the child table are dropped here
            // rather than carried into the work loop.
            drop(parent_end);
            let _ = previous_mask.thread_set_mask();

            child_handle::mark_current_process_as_child();
            let _ = child_handle::reseed_rng_after_fork();
            let (handle, exit_requested, sighup_received) = ChildHandle::new(bucket_id.clone(), child_end);
            child_handle::install_child_signal_flags(&exit_requested, &sighup_received);
            child_handle::spawn_signal_watcher(exit_requested, sighup_received, child_exit, child_sighup);

            let child_run_cb: Callback<crate::bucket::ChildRunFn<W, R>> = child_run.into();
            let result = CallbackDispatcher::invoke_required(&child_run_cb, "child_run", |run| run(input, &handle))
                .unwrap_or(None);
            if let Some(r) = result {
                if let Err(e) = handle.send_result(r) {
                    log::error!("child failed to send result frame: {}", e);
                }
            }

            // Gives a parent that is about to call waitpid() a moment to
            // observe the channel write before the exit notification races
            // ahead of it.
            thread::sleep(Duration::from_micros(500));
            std::process::exit(0);
        }
        Err(e) => {
            let _ = previous_mask.thread_set_mask();
            log::error!("fork failed for bucket {}: {}", bucket_id, e);
            Err(SupervisorError::ForkFailure(e))
        }
    }
}

pub(crate) fn invoke_parent_fork<W, R>(callbacks: &BucketCallbacks<W, R>, pid: Pid, identifier: &WorkId) {
    CallbackDispatcher::invoke_optional(&callbacks.parent_fork, |f| f(pid, identifier.clone()));
}
