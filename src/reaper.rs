use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::BucketRegistry;
use crate::callback::CallbackDispatcher;
use crate::channel::Received;
use crate::child::{ChildStatus, ChildTable};
use crate::config::SupervisorConfig;
use crate::helper;

/// Converts OS exit notifications into state transitions without blocking
/// and without losing results (spec §4.6).
///
/// Runs entirely as an ordinary function call from the main loop — not from
/// inside a signal handler — per the mailbox redesign in `crate::signals`.
/// Its own respawn path forks a brand new helper but never calls back into
/// `reap_all` itself, so there is no re-entrancy to guard against.
pub fn reap_all<W, R>(children: &mut ChildTable<R>, buckets: &mut BucketRegistry<W, R>, config: &SupervisorConfig)
where
    W: Clone,
    R: Serialize + DeserializeOwned + Clone,
{
    loop {
        let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(s) => s,
            Err(nix::Error::ECHILD) => break,
            Err(e) => {
                log::warn!("waitpid failed during reap: {}", e);
                break;
            }
        };

        let pid = match status {
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => pid,
            _ => break, // StillAlive or a stopped/continued notification: nothing to reap yet.
        };

        handle_exit(pid, children, buckets, config);
    }
}

fn handle_exit<W, R>(
    pid: Pid,
    children: &mut ChildTable<R>,
    buckets: &mut BucketRegistry<W, R>,
    config: &SupervisorConfig,
) where
    W: Clone,
    R: Serialize + DeserializeOwned + Clone,
{
    let (bucket_id, identifier, prior_status, respawn, helper_entry) = {
        let record = match children.lookup(pid) {
            Some(r) => r,
            None => {
                // Subprocesses forked by user code inside a callback are
                // possible; this is informational, not an error.
                log::info!("reaped unknown pid {}", pid);
                return;
            }
        };
        (
            record.bucket.clone(),
            record.identifier.clone(),
            record.status.clone(),
            record.respawn,
            record.helper_entry.clone(),
        )
    };

    if prior_status == ChildStatus::Worker {
        if let Ok(bucket) = buckets.get(&bucket_id) {
            CallbackDispatcher::invoke_optional(&bucket.callbacks.parent_child_exited, |f| {
                f(pid, identifier.clone())
            });
        }
    }

    if let Err(e) = children.mark_stopped(pid) {
        log::warn!("{}", e);
    }

    if prior_status == ChildStatus::Helper && respawn {
        if let Some(entry) = helper_entry {
            let (child_exit, child_sighup) = buckets
                .get(&bucket_id)
                .map(|b| (b.callbacks.child_exit.get().cloned(), b.callbacks.child_sighup.get().cloned()))
                .unwrap_or((None, None));
            match helper::spawn_helper(&bucket_id, identifier.clone(), entry, true, child_exit, child_sighup) {
                Ok(record) => children.insert(record),
                Err(e) => log::error!("failed to respawn helper for bucket {}: {}", bucket_id, e),
            }
        }
    }

    post_results(pid, children, buckets, config);

    // Invariant C1: only drop the record once it's both reaped (already the
    // case here) and its channel fully drained (no more bytes, peer closed).
    if let Some(record) = children.lookup(pid) {
        if record.status == ChildStatus::Stopped && record.channel.is_none() {
            children.remove(pid);
        }
    }
}

/// Drains every frame currently buffered on `pid`'s channel, posting each to
/// the owning bucket's `parent_function_results` callback and/or storing it,
/// per `store_result`. Frames may arrive before or after the exit
/// notification; this is called both opportunistically (while the child is
/// still alive) and once more right after reaping, so ordering between the
/// two is simply "whichever happens to observe the bytes first".
pub fn post_results<W, R>(pid: Pid, children: &mut ChildTable<R>, buckets: &mut BucketRegistry<W, R>, config: &SupervisorConfig)
where
    R: Serialize + DeserializeOwned + Clone,
{
    let bucket_id = match children.lookup(pid) {
        Some(r) => r.bucket.clone(),
        None => return,
    };

    loop {
        let record = match children.lookup_mut(pid) {
            Some(r) => r,
            None => return,
        };
        let channel = match record.channel.as_mut() {
            Some(c) => c,
            None => return,
        };

        match channel.try_receive() {
            Ok(Some(Received::Message(result))) => {
                record.last_active = std::time::Instant::now();
                if let Ok(bucket) = buckets.get_mut(&bucket_id) {
                    let delivered = CallbackDispatcher::invoke_optional(&bucket.callbacks.parent_results, |f| {
                        f(clone_for_callback(&result))
                    })
                    .is_some();
                    if config.store_result || !delivered {
                        bucket.push_result(result);
                    }
                }
            }
            Ok(Some(Received::Closed)) => {
                record.channel = None;
                return;
            }
            Ok(None) => return,
            Err(e) => {
                log::error!("channel error draining pid {}: {}", pid, e);
                record.channel = None;
                return;
            }
        }
    }
}

/// `parent_function_results` and the `pending_results` store both want a
/// copy of a delivered result; `R` is required to be `Clone` for this sole
/// purpose at the supervisor boundary (see `Supervisor::register_parent_results`).
fn clone_for_callback<R: Clone>(value: &R) -> R {
    value.clone()
}
