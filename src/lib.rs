//! A single-process, single-threaded fork-and-dispatch work supervisor.
//!
//! A `Supervisor` partitions work into named buckets, forks a child per
//! batch (or a long-lived helper), and talks to each child over a
//! length-prefixed byte-stream channel. Everything here runs on one thread:
//! the parent's main loop is expected to call [`Supervisor::process_work`]
//! (or drive the pieces directly) in whatever cadence the embedder wants.

pub mod bucket;
pub mod callback;
pub mod channel;
pub mod child;
pub mod child_handle;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod helper;
pub mod housekeeper;
pub mod proc_util;
pub mod reaper;
pub mod role;
pub mod shutdown;
pub mod signals;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use bucket::{BucketConfig, BucketId, ChildInput, RunTimeLimit, WorkId};
pub use callback::Severity;
pub use child_handle::{is_child, ChildHandle};
pub use config::SupervisorConfig;
pub use error::{Result, SupervisorError};
pub use role::Role;

use bucket::{BucketRegistry, ChildPidIdFn, ChildRunFn, ChildVoidFn, ResultFn};
use callback::{Callback, CallbackDispatcher, LoggingFn};
use child::{ChildTable, HelperEntry};
use proc_util::safe_kill;
use role::ParentIdentity;
use signals::SignalRouter;

/// The supervisor itself. Parameterized over the work-item type `W` (never
/// serialized — it rides into the child on the COW fork-inherited heap) and
/// the result type `R` (crosses the IPC channel, so it must serialize).
pub struct Supervisor<W, R> {
    identity: ParentIdentity,
    config: RefCell<SupervisorConfig>,
    buckets: RefCell<BucketRegistry<W, R>>,
    children: RefCell<ChildTable<R>>,
    signals: RefCell<SignalRouter>,
    housekeeper: RefCell<housekeeper::Housekeeper>,
    prefork_hooks: RefCell<Vec<Rc<dyn Fn()>>>,
    logging: RefCell<Callback<LoggingFn>>,
    logging_severity: Cell<Severity>,
    parent_sighup: RefCell<Callback<dyn Fn()>>,
    sighup_cascade: Cell<bool>,
    parent_exit: RefCell<Callback<dyn Fn(Pid, Option<i32>)>>,
    shutting_down: Cell<bool>,
}

impl<W, R> Supervisor<W, R>
where
    W: Clone,
    R: Serialize + DeserializeOwned + Clone,
{
    /// Installs the signal mailbox and the default bucket, matching spec
    /// §4.1's construction-time setup.
    pub fn new() -> Result<Self> {
        let signals = SignalRouter::install()?;
        Ok(Supervisor {
            identity: ParentIdentity::capture(),
            config: RefCell::new(SupervisorConfig::default()),
            buckets: RefCell::new(BucketRegistry::new()),
            children: RefCell::new(ChildTable::new()),
            signals: RefCell::new(signals),
            housekeeper: RefCell::new(housekeeper::Housekeeper::new()),
            prefork_hooks: RefCell::new(Vec::new()),
            logging: RefCell::new(Callback::empty()),
            logging_severity: Cell::new(Severity::Info),
            parent_sighup: RefCell::new(Callback::empty()),
            sighup_cascade: Cell::new(false),
            parent_exit: RefCell::new(Callback::empty()),
            shutting_down: Cell::new(false),
        })
    }

    pub fn config(&self) -> SupervisorConfig {
        self.config.borrow().clone()
    }

    pub fn set_config(&self, config: SupervisorConfig) {
        *self.config.borrow_mut() = config;
    }

    pub fn role(&self) -> Role {
        if child_handle::is_child() {
            Role::Child(BucketId::default_bucket())
        } else {
            Role::Parent
        }
    }

    fn require_parent(&self) -> Result<()> {
        if self.identity.this_process_is_parent() {
            Ok(())
        } else {
            Err(SupervisorError::NotParent)
        }
    }

    fn log(&self, severity: Severity, message: &str) {
        callback::emit_log(&self.logging.borrow(), self.logging_severity.get(), severity, message);
    }

    // ---- bucket management (spec §4.3, §6) ----

    /// Creates `id` if it doesn't already exist, copying the default
    /// bucket's current knobs (Invariant B1).
    pub fn add_bucket(&self, id: impl Into<String>) -> BucketId {
        let bucket_id = BucketId::new(id.into());
        self.buckets.borrow_mut().add_bucket(bucket_id.clone());
        bucket_id
    }

    pub fn bucket_exists(&self, id: &BucketId) -> bool {
        self.buckets.borrow().bucket_exists(id)
    }

    pub fn bucket_list(&self, include_default: bool) -> Vec<BucketId> {
        self.buckets.borrow().bucket_list(include_default)
    }

    pub fn set_max_children(&self, bucket: &BucketId, value: u32) -> Result<()> {
        let old = self.buckets.borrow_mut().set_max_children(bucket, value)?;
        if value < old {
            self.request_persistent_shrink(bucket, old - value);
        }
        Ok(())
    }

    /// Lowering `max_children` on a persistent bucket asks the surplus
    /// long-lived helpers to exit, oldest first, rather than killing them
    /// outright; they finish their current unit of work on their own
    /// schedule once `received_exit_request()` starts returning true.
    fn request_persistent_shrink(&self, bucket: &BucketId, surplus: u32) {
        let mut children = self.children.borrow_mut();
        let mut candidates: Vec<Pid> = children
            .iter()
            .filter(|r| r.bucket == *bucket && r.is_active())
            .map(|r| r.pid)
            .collect();
        candidates.sort_by_key(|p| p.as_raw());
        for pid in candidates.into_iter().take(surplus as usize) {
            if let Some(record) = children.lookup_mut(pid) {
                record.respawn = false;
            }
            if let Err(e) = safe_kill(&children, pid, Signal::SIGINT) {
                self.log(Severity::Warn, &format!("shrink: {}", e));
            }
        }
    }

    pub fn set_max_work_per_child(&self, bucket: &BucketId, value: u32) -> Result<()> {
        let mut buckets = self.buckets.borrow_mut();
        let b = buckets.get_mut(bucket)?;
        b.config.max_work_per_child = value;
        b.config.normalize();
        Ok(())
    }

    pub fn set_child_max_run_time(&self, bucket: &BucketId, seconds: i64) -> Result<()> {
        let mut buckets = self.buckets.borrow_mut();
        let b = buckets.get_mut(bucket)?;
        b.config.child_max_run_time = RunTimeLimit::from_seconds(seconds);
        housekeeper::warn_if_immediate_deadline(&b.config);
        Ok(())
    }

    pub fn set_single_work_item(&self, bucket: &BucketId, value: bool) -> Result<()> {
        let mut buckets = self.buckets.borrow_mut();
        let b = buckets.get_mut(bucket)?;
        b.config.single_work_item = value;
        b.config.normalize();
        Ok(())
    }

    pub fn set_persistent_mode(&self, bucket: &BucketId, value: bool) -> Result<()> {
        let mut buckets = self.buckets.borrow_mut();
        buckets.get_mut(bucket)?.config.persistent_mode = value;
        Ok(())
    }

    pub fn set_default_bucket_config(&self, config: BucketConfig) {
        self.buckets.borrow_mut().set_default_config(config);
    }

    // ---- work intake (spec §4.3) ----

    pub fn add_work(&self, bucket: &BucketId, item: W) {
        self.buckets.borrow_mut().ensure(bucket).push_work(item);
    }

    pub fn add_identified_work(&self, bucket: &BucketId, id: WorkId, item: W) {
        self.buckets
            .borrow_mut()
            .ensure(bucket)
            .push_identified_work(id, item);
    }

    pub fn set_persistent_data(&self, bucket: &BucketId, item: W) {
        self.buckets.borrow_mut().ensure(bucket).persistent_mode_data = Some(item);
    }

    pub fn is_work_running(&self, bucket: &BucketId, id: &WorkId) -> bool {
        let buckets = self.buckets.borrow();
        let children = self.children.borrow();
        let queued = buckets.get(bucket).map(|b| b.is_work_running(id)).unwrap_or(false);
        let dispatched = children
            .iter()
            .any(|r| r.is_active() && &r.bucket == bucket && &r.identifier == id);
        queued || dispatched
    }

    pub fn work_running(&self, bucket: Option<&BucketId>) -> usize {
        self.children.borrow().count_active(bucket)
    }

    /// `all = false`: only items still queued. `all = true`: queued items
    /// plus work already dispatched to an active child of `bucket` (see
    /// `DESIGN.md`'s resolution of this knob — the original source was not
    /// available to settle it directly).
    pub fn work_sets_count(&self, bucket: &BucketId, all: bool) -> usize {
        let queued = self.buckets.borrow().get(bucket).map(|b| b.queue_len()).unwrap_or(0);
        if all {
            queued + self.children.borrow().count_active(Some(bucket))
        } else {
            queued
        }
    }

    /// Every item still queued in `bucket`, in insertion order, without
    /// consuming them.
    pub fn work_sets(&self, bucket: &BucketId) -> Vec<W> {
        self.buckets
            .borrow()
            .get(bucket)
            .map(|b| b.queued_items())
            .unwrap_or_default()
    }

    // ---- callback registration (spec §6) ----

    pub fn register_child_run(&self, bucket: &BucketId, f: Rc<ChildRunFn<W, R>>) -> Result<()> {
        self.buckets.borrow_mut().get_mut(bucket)?.callbacks.child_run.set(f);
        Ok(())
    }

    /// `f` must be `Send + Sync`: it runs on the dedicated signal-watcher
    /// thread spawned inside the forked child, not on the thread running
    /// `child_run` (spec §4.10's "on interrupt at a child: invoke
    /// `child_function_exit`, exit −1" — unconditional, not merely polled).
    pub fn register_child_exit(&self, bucket: &BucketId, f: Arc<ChildVoidFn>) -> Result<()> {
        self.buckets.borrow_mut().get_mut(bucket)?.callbacks.child_exit.set(f);
        Ok(())
    }

    /// `f` must be `Send + Sync`, for the same reason as `register_child_exit`:
    /// spec §4.5 invokes the child-sighup callback unconditionally on
    /// hangup, from the signal-watcher thread.
    pub fn register_child_sighup(&self, bucket: &BucketId, f: Arc<ChildVoidFn>) -> Result<()> {
        self.buckets.borrow_mut().get_mut(bucket)?.callbacks.child_sighup.set(f);
        Ok(())
    }

    pub fn register_child_timeout(&self, bucket: &BucketId, f: Rc<ChildPidIdFn>) -> Result<()> {
        self.buckets.borrow_mut().get_mut(bucket)?.callbacks.child_timeout.set(f);
        Ok(())
    }

    pub fn register_parent_fork(&self, bucket: &BucketId, f: Rc<ChildPidIdFn>) -> Result<()> {
        self.buckets.borrow_mut().get_mut(bucket)?.callbacks.parent_fork.set(f);
        Ok(())
    }

    pub fn register_parent_child_exited(&self, bucket: &BucketId, f: Rc<ChildPidIdFn>) -> Result<()> {
        self.buckets
            .borrow_mut()
            .get_mut(bucket)?
            .callbacks
            .parent_child_exited
            .set(f);
        Ok(())
    }

    pub fn register_parent_results(&self, bucket: &BucketId, f: Rc<ResultFn<R>>) -> Result<()> {
        self.buckets
            .borrow_mut()
            .get_mut(bucket)?
            .callbacks
            .parent_results
            .set(f);
        Ok(())
    }

    /// `cascade` governs whether a SIGHUP observed at the parent is also
    /// forwarded to every tracked child via `safe_kill`.
    pub fn register_parent_sighup(&self, f: Rc<dyn Fn()>, cascade: bool) {
        self.parent_sighup.borrow_mut().set(f);
        self.sighup_cascade.set(cascade);
    }

    /// Invoked once, with `(parent_pid, signal)`: at the tail of a blocking
    /// `process_work` call (`signal = None`) and at the tail of the shutdown
    /// sequence (`signal = Some(SIGINT|SIGTERM as i32)`).
    pub fn register_parent_exit(&self, f: Rc<dyn Fn(Pid, Option<i32>)>) {
        self.parent_exit.borrow_mut().set(f);
    }

    pub fn register_logging(&self, severity: Severity, f: Rc<LoggingFn>) {
        self.logging_severity.set(severity);
        self.logging.borrow_mut().set(f);
    }

    /// Registers a hook that runs (in registration order) in the parent,
    /// immediately before every fork — worker or helper.
    pub fn register_prefork_hook(&self, f: Rc<dyn Fn()>) {
        self.prefork_hooks.borrow_mut().push(f);
    }

    // ---- results (spec §4.6, §6) ----

    pub fn has_result(&self, bucket: &BucketId) -> bool {
        self.buckets.borrow().get(bucket).map(|b| b.has_result()).unwrap_or(false)
    }

    pub fn get_result(&self, bucket: &BucketId) -> Option<R> {
        self.buckets.borrow_mut().get_mut(bucket).ok()?.take_result()
    }

    pub fn get_all_results(&self, bucket: &BucketId) -> Vec<R> {
        self.buckets
            .borrow_mut()
            .get_mut(bucket)
            .map(|b| b.take_all_results())
            .unwrap_or_default()
    }

    // ---- dispatch loop (spec §4.7, §4.8) ----

    fn dispatch_one(&self, bucket_id: &BucketId) -> Result<bool> {
        let input = match self.buckets.borrow_mut().get_mut(bucket_id)?.take_batch() {
            Some(input) => input,
            None => return Ok(false),
        };

        let identifier = match &input {
            ChildInput::Single(id, _) => id.clone(),
            _ => WorkId(String::new()),
        };

        let (child_run, child_exit, child_sighup) = {
            let buckets = self.buckets.borrow();
            let b = buckets.get(bucket_id)?;
            (
                b.callbacks.child_run.get().cloned(),
                b.callbacks.child_exit.get().cloned(),
                b.callbacks.child_sighup.get().cloned(),
            )
        };
        let hooks: Vec<Rc<dyn Fn()>> = self.prefork_hooks.borrow().clone();
        let input_on_failure = input.clone();

        match dispatcher::dispatch_one(bucket_id, input, identifier, child_run, child_exit, child_sighup, &hooks) {
            Ok((record, dispatched)) => {
                self.children.borrow_mut().insert(record);
                let buckets = self.buckets.borrow();
                if let Ok(b) = buckets.get(bucket_id) {
                    dispatcher::invoke_parent_fork(&b.callbacks, dispatched.pid, &dispatched.identifier);
                }
                Ok(true)
            }
            Err(SupervisorError::ForkFailure(e)) => {
                self.log(Severity::Crit, &format!("fork failed for bucket {}: {}", bucket_id, e));
                // The batch stays at the head of the queue: no data loss on a
                // refused fork.
                if let Ok(b) = self.buckets.borrow_mut().get_mut(bucket_id) {
                    b.requeue_front(input_on_failure);
                }
                Err(SupervisorError::ForkFailure(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Spawns a long-lived helper process for `bucket`, per spec §4.4.
    pub fn helper_process_spawn(
        &self,
        bucket: &BucketId,
        identifier: WorkId,
        entry: HelperEntry<R>,
        respawn: bool,
    ) -> Result<Pid> {
        self.require_parent()?;
        let (child_exit, child_sighup) = {
            let buckets = self.buckets.borrow();
            let b = buckets.get(bucket)?;
            (b.callbacks.child_exit.get().cloned(), b.callbacks.child_sighup.get().cloned())
        };
        let record = helper::spawn_helper(bucket, identifier, entry, respawn, child_exit, child_sighup)?;
        let pid = record.pid;
        self.children.borrow_mut().insert(record);
        Ok(pid)
    }

    /// Asks a helper to respawn on its own schedule: flips `respawn` on its
    /// existing record and signals it to exit; the reaper spawns the
    /// replacement once it's reaped. No-op if `pid` isn't a tracked helper.
    pub fn helper_process_respawn(&self, pid: Pid) -> Result<()> {
        self.require_parent()?;
        {
            let mut children = self.children.borrow_mut();
            if let Some(record) = children.lookup_mut(pid) {
                record.respawn = true;
            }
        }
        let children = self.children.borrow();
        safe_kill(&children, pid, Signal::SIGINT)
    }

    /// Asks every pid in `pids` to exit via `safe_kill(SIGINT)`, waits up to
    /// `delay`, then force-kills whatever in that set is still active and
    /// marks it STOPPED locally. Spec §6/§5's `kill_child_pid(pids, delay)`.
    pub fn kill_child_pid(&self, pids: &[Pid], delay: Duration) -> Result<()> {
        self.require_parent()?;
        {
            let children = self.children.borrow();
            for &pid in pids {
                if let Err(e) = safe_kill(&children, pid, Signal::SIGINT) {
                    self.log(Severity::Warn, &format!("kill_child_pid: {}", e));
                }
            }
        }

        let deadline = std::time::Instant::now() + delay;
        while std::time::Instant::now() < deadline {
            self.service();
            let still_active = pids
                .iter()
                .any(|pid| self.children.borrow().lookup(*pid).map_or(false, |r| r.is_active()));
            if !still_active {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(200));
        }

        let mut children = self.children.borrow_mut();
        for &pid in pids {
            if children.lookup(pid).map_or(false, |r| r.is_active()) {
                proc_util::force_kill(pid);
                let _ = children.mark_stopped(pid);
            }
        }
        Ok(())
    }

    /// Signals a single tracked child, without the wait-then-escalate
    /// behavior of `kill_child_pid`. Useful for a caller that wants to send
    /// something other than SIGINT (e.g. SIGHUP) to exactly one child.
    pub fn signal_child_pid(&self, pid: Pid, signal: Signal) -> Result<()> {
        self.require_parent()?;
        safe_kill(&self.children.borrow(), pid, signal)
    }

    /// Runs one pass of signal draining, reaping, and (if due) housekeeping.
    /// Every blocking wait point in this crate calls this instead of a bare
    /// `sleep`, so a supervisor that spends its whole life inside one
    /// `process_work(true, ...)` call still reaps promptly and still reacts
    /// to SIGINT/SIGTERM/SIGHUP.
    fn service(&self) {
        let pending = self.signals.borrow_mut().drain();

        if pending.child_exited {
            let mut children = self.children.borrow_mut();
            let mut buckets = self.buckets.borrow_mut();
            reaper::reap_all(&mut children, &mut buckets, &self.config.borrow());
        }

        if pending.hangup {
            CallbackDispatcher::invoke_optional(&self.parent_sighup.borrow(), |f| f());
            if self.sighup_cascade.get() {
                let children = self.children.borrow();
                let active: Vec<Pid> = children.iter().filter(|r| r.is_active()).map(|r| r.pid).collect();
                for pid in active {
                    let _ = safe_kill(&children, pid, Signal::SIGHUP);
                }
            }
        }

        let interval = self.config.borrow().housekeeping_check_interval;
        if self.housekeeper.borrow().due(interval) {
            let mut children = self.children.borrow_mut();
            let mut buckets = self.buckets.borrow_mut();
            self.housekeeper
                .borrow_mut()
                .run(&mut children, &mut buckets, &self.config.borrow());
        }

        if (pending.interrupt || pending.terminate) && !self.shutting_down.replace(true) {
            self.log(Severity::Info, "shutdown requested; entering graceful shutdown sequence");
            let signal = if pending.interrupt {
                Signal::SIGINT
            } else {
                Signal::SIGTERM
            };
            {
                let mut children = self.children.borrow_mut();
                let mut buckets = self.buckets.borrow_mut();
                if let Err(e) = shutdown::run(&mut children, &mut buckets, &self.config.borrow()) {
                    self.log(Severity::Warn, &e.to_string());
                }
            }
            CallbackDispatcher::invoke_optional(&self.parent_exit.borrow(), |f| {
                f(self.identity.parent_pid(), Some(signal as i32))
            });
            std::process::exit(-1);
        }
    }

    /// Drives dispatch for one bucket, per spec §4.8.
    ///
    /// `blocking == false` fills available capacity and returns immediately.
    /// `blocking == true` spins, forking batches as capacity frees up, until
    /// the queue is empty and then until every dispatched child has exited,
    /// invoking the bucket's registered `parent_function_results` drain
    /// along the way via `service()`.
    fn process_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        let (max_children, persistent) = {
            let buckets = self.buckets.borrow();
            let b = buckets.get(bucket_id)?;
            (b.config.max_children, b.config.persistent_mode)
        };

        if max_children == 0 {
            self.log(
                Severity::Warn,
                &format!("bucket {} has max_children = 0; dispatch skipped", bucket_id),
            );
            return Ok(());
        }

        loop {
            let active = self.children.borrow().count_active(Some(bucket_id));
            if active >= max_children as usize {
                break;
            }
            let queue_empty = self.buckets.borrow().get(bucket_id)?.is_queue_empty();
            let has_work = persistent || !queue_empty;
            if !has_work {
                break;
            }
            if !self.dispatch_one(bucket_id)? {
                break;
            }
        }
        Ok(())
    }

    /// Blocking drain of `bucket_id`'s queue: forks batches as capacity
    /// frees up until the queue is empty, then waits for every dispatched
    /// child to exit before returning.
    fn process_bucket_blocking(&self, bucket_id: &BucketId) -> Result<()> {
        let max_children = self.buckets.borrow().get(bucket_id)?.config.max_children;
        if max_children == 0 {
            self.log(
                Severity::Warn,
                &format!("bucket {} has max_children = 0; dispatch skipped", bucket_id),
            );
            return Ok(());
        }

        loop {
            self.service();
            let queue_empty = self.buckets.borrow().get(bucket_id)?.is_queue_empty();
            if queue_empty {
                break;
            }
            let active = self.children.borrow().count_active(Some(bucket_id));
            if active >= max_children as usize {
                thread::sleep(Duration::from_secs(1));
                continue;
            }
            self.dispatch_one(bucket_id)?;
        }

        while self.children.borrow().count_active(Some(bucket_id)) > 0 {
            thread::sleep(Duration::from_secs(1));
            self.service();
        }

        CallbackDispatcher::invoke_optional(&self.parent_exit.borrow(), |f| {
            f(self.identity.parent_pid(), None)
        });
        Ok(())
    }

    /// Spec §4.8's `process_work`: `all_buckets` takes precedence over
    /// `bucket` when both are given, processing every non-default bucket in
    /// addition to whichever one `bucket` named.
    pub fn process_work(&self, blocking: bool, bucket: Option<&BucketId>, all_buckets: bool) -> Result<()> {
        self.require_parent()?;
        self.service();

        if all_buckets {
            let ids = self.buckets.borrow().bucket_list(true);
            for id in ids {
                self.process_work(blocking, Some(&id), false)?;
            }
            return Ok(());
        }

        let bucket_id = bucket.cloned().unwrap_or_else(BucketId::default_bucket);
        if blocking {
            self.process_bucket_blocking(&bucket_id)
        } else {
            self.process_bucket(&bucket_id)
        }
    }

    /// Runs one iteration of signal draining, reaping, and due housekeeping
    /// without attempting any dispatch. Useful for an embedder that wants to
    /// drive its own loop cadence around `process_work(false, ...)` calls.
    pub fn tick(&self) {
        self.service();
    }

    pub fn count_pending(&self, bucket: Option<&BucketId>) -> usize {
        self.children.borrow().count_pending(bucket)
    }

    /// Pids of every tracked child still running (or pending channel drain)
    /// in `bucket`, or across all buckets if `None`.
    pub fn active_pids(&self, bucket: Option<&BucketId>) -> Vec<Pid> {
        self.children
            .borrow()
            .iter()
            .filter(|r| r.is_active() && bucket.map_or(true, |b| &r.bucket == b))
            .map(|r| r.pid)
            .collect()
    }
}
