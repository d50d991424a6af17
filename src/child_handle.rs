use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::{BucketId, ChildVoidFn};
use crate::channel::FramedChannel;
use crate::error::Result;

/// Installs the child-side half of spec §4.5/§4.10: `SIGINT`/`SIGTERM`
/// flip `exit_requested`, `SIGHUP` flips `sighup_received`. These are
/// `signal_hook::flag` registrations — the async-signal-safe minimum, a
/// single atomic store — picked up promptly by the watcher thread spawned
/// via `spawn_signal_watcher`, and also readable by a cooperative callback
/// through `ChildHandle::received_exit_request`/`received_sighup`.
pub(crate) fn install_child_signal_flags(
    exit_requested: &Arc<AtomicBool>,
    sighup_received: &Arc<AtomicBool>,
) {
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, exit_requested.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, exit_requested.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGHUP, sighup_received.clone());
}

/// Spawns the signal-driven watcher that makes spec §4.5/§4.10's child-side
/// callbacks unconditional rather than opt-in: a child whose run/entry
/// callback never polls `received_exit_request`/`received_sighup` still
/// gets `child_sighup` invoked on every hangup, and `child_exit` invoked
/// followed by `exit(-1)` the moment an interrupt/terminate is observed —
/// regardless of whether the run/entry callback is still blocked.
///
/// This is the one place in the crate that spawns a second thread: it runs
/// inside a freshly forked child, a separate OS process from the
/// single-threaded parent, so it doesn't touch any of the parent's
/// `RefCell`/`Cell` state. `child_exit`/`child_sighup` are `Arc`-backed
/// (`SyncCallback`, not `Callback`) precisely so they can cross into this
/// thread.
pub(crate) fn spawn_signal_watcher(
    exit_requested: Arc<AtomicBool>,
    sighup_received: Arc<AtomicBool>,
    child_exit: Option<Arc<ChildVoidFn>>,
    child_sighup: Option<Arc<ChildVoidFn>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        if exit_requested.load(Ordering::Relaxed) {
            if let Some(f) = child_exit.as_ref() {
                f();
            }
            std::process::exit(-1);
        }
        // Edge-triggered: this thread is the sole place `sighup_received` is
        // reset, so `ChildHandle::received_sighup` can peek it without
        // racing this loop for the one `true` observation.
        if sighup_received.swap(false, Ordering::Relaxed) {
            if let Some(f) = child_sighup.as_ref() {
                f();
            }
        }
        thread::sleep(Duration::from_millis(20));
    })
}

/// Reseeds the process-global RNG state right after fork so siblings
/// forked in the same tick don't produce identical random sequences
/// (spec §4.7 child branch). Returns the fresh generator for callbacks
/// that want a forked-safe source directly rather than relying on
/// `rand::thread_rng()`'s lazy per-thread seeding.
pub fn reseed_rng_after_fork() -> rand::rngs::StdRng {
    use rand::SeedableRng;
    rand::rngs::StdRng::from_entropy()
}

thread_local! {
    static IS_CHILD: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current process as a forked child. Called once, at the very
/// start of the child branch of a fork, before the user's run/entry
/// callback gets control.
pub(crate) fn mark_current_process_as_child() {
    IS_CHILD.with(|c| c.set(true));
}

/// Whether the calling process is a forked child of a `Supervisor`, per
/// spec §6's `is_child()`. A free function rather than a method because,
/// unlike everything else in this crate, there may be no `Supervisor` value
/// reachable from inside the child's run callback.
pub fn is_child() -> bool {
    IS_CHILD.with(|c| c.get())
}

/// What a child process needs to talk back to its parent: which bucket it
/// belongs to, whether it's been asked to exit or hung up on, and its end
/// of the per-child channel.
///
/// Passed explicitly into the run/entry callback rather than reached for
/// through thread-local ambient state (besides `is_child()` itself, which
/// has no payload to carry): explicit handles are easier to test and don't
/// require the callback to trust a global that may not have been set.
pub struct ChildHandle<R> {
    bucket: BucketId,
    exit_requested: Arc<AtomicBool>,
    sighup_received: Arc<AtomicBool>,
    channel: RefCell<FramedChannel<R>>,
}

impl<R> ChildHandle<R>
where
    R: Serialize + DeserializeOwned,
{
    pub(crate) fn new(bucket: BucketId, channel: FramedChannel<R>) -> (Self, Arc<AtomicBool>, Arc<AtomicBool>) {
        let exit_requested = Arc::new(AtomicBool::new(false));
        let sighup_received = Arc::new(AtomicBool::new(false));
        (
            ChildHandle {
                bucket,
                exit_requested: exit_requested.clone(),
                sighup_received: sighup_received.clone(),
                channel: RefCell::new(channel),
            },
            exit_requested,
            sighup_received,
        )
    }

    pub fn bucket(&self) -> &BucketId {
        &self.bucket
    }

    /// True once this child has received SIGINT/SIGTERM, per spec §6's
    /// `received_exit_request()`. A long-running callback (typically a
    /// helper) should poll this and wind down cooperatively.
    pub fn received_exit_request(&self) -> bool {
        self.exit_requested.load(Ordering::Relaxed)
    }

    /// Non-consuming peek at the hangup flag: the signal-watcher thread
    /// (`spawn_signal_watcher`) owns resetting it after invoking
    /// `child_sighup`, so this never races that reset.
    pub fn received_sighup(&self) -> bool {
        self.sighup_received.load(Ordering::Relaxed)
    }

    /// Sends an extra result frame to the parent ahead of the one the run
    /// callback may still return. Spec §6's `child_send_result_to_parent`.
    pub fn send_result(&self, value: R) -> Result<()> {
        self.channel.borrow_mut().send(&value)
    }
}
