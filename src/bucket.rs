use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use nix::unistd::Pid;

use crate::callback::{Callback, SyncCallback};
use crate::error::{Result, SupervisorError};

/// Identifies a named partition of work. The empty string is the implicit
/// default bucket (`BucketId::DEFAULT`); callers never need to spell it out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(String);

impl BucketId {
    pub const DEFAULT: &'static str = "";

    pub fn default_bucket() -> Self {
        BucketId(Self::DEFAULT.to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        BucketId(id.into())
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_default() {
            write!(f, "<default>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifies one work item within a single-item bucket. Plain `String`: per
/// the redesign notes, there is no `"id-"` prefix and no risk of numeric-key
/// coercion because the queue is an ordered list of pairs, not a map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkId(pub String);

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long a child of this bucket is allowed to run before housekeeping
/// kills it. `Immediate` models the source's `child_max_run_time == 0`: per
/// the spec's resolved open question, this is still enforced (not merely
/// logged), just with a deadline of "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTimeLimit {
    Unlimited,
    Immediate,
    Bounded(Duration),
}

impl RunTimeLimit {
    pub fn from_seconds(secs: i64) -> Self {
        match secs {
            s if s < 0 => RunTimeLimit::Unlimited,
            0 => RunTimeLimit::Immediate,
            s => RunTimeLimit::Bounded(Duration::from_secs(s as u64)),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        match self {
            RunTimeLimit::Unlimited => None,
            RunTimeLimit::Immediate => Some(Duration::from_secs(0)),
            RunTimeLimit::Bounded(d) => Some(*d),
        }
    }
}

/// Per-bucket knobs. `BucketId::DEFAULT`'s values seed every bucket created
/// afterward (Invariant B1): the copy happens once, at creation time, and
/// later edits to the default bucket do not retroactively apply.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub max_children: u32,
    pub max_work_per_child: u32,
    pub child_max_run_time: RunTimeLimit,
    pub single_work_item: bool,
    pub persistent_mode: bool,
}

impl Default for BucketConfig {
    fn default() -> Self {
        BucketConfig {
            max_children: 0,
            max_work_per_child: 1,
            child_max_run_time: RunTimeLimit::Unlimited,
            single_work_item: false,
            persistent_mode: false,
        }
    }
}

impl BucketConfig {
    /// Clamp values into range, logging at WARN (ConfigError policy) for
    /// anything adjusted. `max_work_per_child` is forced to 1 when
    /// `single_work_item` is set, as the data model requires.
    pub fn normalize(&mut self) {
        if self.single_work_item && self.max_work_per_child != 1 {
            log::warn!(
                "max_work_per_child forced to 1 because single_work_item is set (was {})",
                self.max_work_per_child
            );
            self.max_work_per_child = 1;
        }
        if self.max_work_per_child == 0 {
            log::warn!("max_work_per_child clamped to 1 (was 0)");
            self.max_work_per_child = 1;
        }
    }
}

/// The batch handed to a freshly forked child's run callback.
#[derive(Debug, Clone)]
pub enum ChildInput<W> {
    /// Ordinary multi-item batch, `|batch| <= max_work_per_child`.
    Batch(Vec<W>),
    /// `single_work_item` mode: exactly one identified item.
    Single(WorkId, W),
    /// Persistent-mode fixed payload, re-delivered on every respawn.
    Persistent(W),
}

pub type ChildRunFn<W, R> = dyn Fn(ChildInput<W>, &crate::child_handle::ChildHandle<R>) -> Option<R>;
/// `Send + Sync` because `child_exit`/`child_sighup` run on the dedicated
/// signal-watcher thread spawned inside each forked child, not on the
/// thread running `child_run` (see `child_handle::spawn_signal_watcher`).
pub type ChildVoidFn = dyn Fn() + Send + Sync;
pub type ChildPidIdFn = dyn Fn(Pid, WorkId);
pub type ResultFn<R> = dyn Fn(R);

/// The seven callback slots the data model assigns per bucket.
pub struct BucketCallbacks<W, R> {
    pub child_run: Callback<ChildRunFn<W, R>>,
    pub child_exit: SyncCallback<ChildVoidFn>,
    pub child_sighup: SyncCallback<ChildVoidFn>,
    pub child_timeout: Callback<ChildPidIdFn>,
    pub parent_fork: Callback<ChildPidIdFn>,
    pub parent_child_exited: Callback<ChildPidIdFn>,
    pub parent_results: Callback<ResultFn<R>>,
}

impl<W, R> Default for BucketCallbacks<W, R> {
    fn default() -> Self {
        BucketCallbacks {
            child_run: Callback::empty(),
            child_exit: SyncCallback::empty(),
            child_sighup: SyncCallback::empty(),
            child_timeout: Callback::empty(),
            parent_fork: Callback::empty(),
            parent_child_exited: Callback::empty(),
            parent_results: Callback::empty(),
        }
    }
}

/// A named partition of work with its own queue and policy.
pub struct Bucket<W, R> {
    pub id: BucketId,
    pub config: BucketConfig,
    pub persistent_mode_data: Option<W>,
    work_queue: VecDeque<W>,
    single_queue: VecDeque<(WorkId, W)>,
    pending_results: VecDeque<R>,
    pub callbacks: BucketCallbacks<W, R>,
}

impl<W, R> Bucket<W, R> {
    fn new(id: BucketId, config: BucketConfig) -> Self {
        Bucket {
            id,
            config,
            persistent_mode_data: None,
            work_queue: VecDeque::new(),
            single_queue: VecDeque::new(),
            pending_results: VecDeque::new(),
            callbacks: BucketCallbacks::default(),
        }
    }

    pub fn queue_len(&self) -> usize {
        if self.config.single_work_item {
            self.single_queue.len()
        } else {
            self.work_queue.len()
        }
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue_len() == 0
    }

    /// The work set: every item still queued, in insertion order, without
    /// consuming them. Spec §6's `work_sets(bucket)`.
    pub fn queued_items(&self) -> Vec<W>
    where
        W: Clone,
    {
        if self.config.single_work_item {
            self.single_queue.iter().map(|(_, item)| item.clone()).collect()
        } else {
            self.work_queue.iter().cloned().collect()
        }
    }

    pub fn push_work(&mut self, item: W) {
        self.work_queue.push_back(item);
    }

    pub fn push_identified_work(&mut self, id: WorkId, item: W) {
        self.single_queue.push_back((id, item));
    }

    pub fn is_work_running(&self, id: &WorkId) -> bool {
        self.single_queue.iter().any(|(i, _)| i == id)
    }

    /// Pull a batch off the head of the queue, per §4.7: at most
    /// `max_work_per_child` items, or exactly one identified pair in
    /// single-item mode. FIFO order within the bucket is preserved
    /// (Invariant P3).
    pub fn take_batch(&mut self) -> Option<ChildInput<W>>
    where
        W: Clone,
    {
        if self.config.persistent_mode {
            return self
                .persistent_mode_data
                .clone()
                .map(ChildInput::Persistent);
        }
        if self.config.single_work_item {
            let (id, item) = self.single_queue.pop_front()?;
            return Some(ChildInput::Single(id, item));
        }
        if self.work_queue.is_empty() {
            return None;
        }
        let n = self.config.max_work_per_child as usize;
        let mut batch = Vec::with_capacity(n.min(self.work_queue.len()));
        for _ in 0..n {
            match self.work_queue.pop_front() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        Some(ChildInput::Batch(batch))
    }

    /// Puts a batch that failed to dispatch (fork refused by the OS) back
    /// at the head of the queue, preserving FIFO order, per the
    /// `ForkFailure` policy: "the batch stays at the head of the queue, no
    /// data loss."
    pub fn requeue_front(&mut self, input: ChildInput<W>) {
        match input {
            ChildInput::Batch(items) => {
                for item in items.into_iter().rev() {
                    self.work_queue.push_front(item);
                }
            }
            ChildInput::Single(id, item) => {
                self.single_queue.push_front((id, item));
            }
            ChildInput::Persistent(_) => {
                // Persistent payload is never consumed from a queue; nothing to restore.
            }
        }
    }

    pub fn push_result(&mut self, result: R) {
        self.pending_results.push_back(result);
    }

    pub fn has_result(&self) -> bool {
        !self.pending_results.is_empty()
    }

    pub fn take_result(&mut self) -> Option<R> {
        self.pending_results.pop_front()
    }

    pub fn take_all_results(&mut self) -> Vec<R> {
        self.pending_results.drain(..).collect()
    }
}

/// Create-on-demand registry of buckets.
///
/// The default bucket always exists (created lazily on first access) so
/// `add_work(DEFAULT, ...)` never fails for want of registration.
pub struct BucketRegistry<W, R> {
    default_config: BucketConfig,
    buckets: HashMap<BucketId, Bucket<W, R>>,
}

impl<W, R> BucketRegistry<W, R> {
    pub fn new() -> Self {
        let mut reg = BucketRegistry {
            default_config: BucketConfig::default(),
            buckets: HashMap::new(),
        };
        reg.buckets.insert(
            BucketId::default_bucket(),
            Bucket::new(BucketId::default_bucket(), BucketConfig::default()),
        );
        reg
    }

    /// Create `id` if it doesn't exist yet, shallow-copying the default
    /// bucket's knobs at this instant (Invariant B1).
    pub fn add_bucket(&mut self, id: BucketId) -> &mut Bucket<W, R> {
        self.buckets
            .entry(id.clone())
            .or_insert_with(|| Bucket::new(id, self.default_config.clone()))
    }

    pub fn bucket_exists(&self, id: &BucketId) -> bool {
        self.buckets.contains_key(id)
    }

    pub fn get(&self, id: &BucketId) -> Result<&Bucket<W, R>> {
        self.buckets
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownBucket(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &BucketId) -> Result<&mut Bucket<W, R>> {
        self.buckets
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownBucket(id.to_string()))
    }

    /// `add_work` auto-creates a missing bucket, per §4.3.
    pub fn ensure(&mut self, id: &BucketId) -> &mut Bucket<W, R> {
        self.add_bucket(id.clone())
    }

    pub fn bucket_list(&self, include_default: bool) -> Vec<BucketId> {
        self.buckets
            .keys()
            .filter(|id| include_default || !id.is_default())
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BucketId, &Bucket<W, R>)> {
        self.buckets.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&BucketId, &mut Bucket<W, R>)> {
        self.buckets.iter_mut()
    }

    /// Updating the default bucket's knob template affects only buckets
    /// created afterward (Invariant B1); existing buckets are untouched.
    pub fn set_default_config(&mut self, config: BucketConfig) {
        self.default_config = config;
    }

    pub fn default_config(&self) -> &BucketConfig {
        &self.default_config
    }

    /// Set `max_children` on `id`, returning the previous value so the
    /// caller (the supervisor) can request exit of `(old - new)` persistent
    /// workers when lowering it, per §4.3.
    pub fn set_max_children(&mut self, id: &BucketId, new_value: u32) -> Result<u32> {
        let bucket = self.get_mut(id)?;
        let old = bucket.config.max_children;
        bucket.config.max_children = new_value;
        Ok(old)
    }
}

impl<W, R> Default for BucketRegistry<W, R> {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedCallback<F> = Rc<F>;
