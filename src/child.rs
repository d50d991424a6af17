use std::collections::HashMap;
use std::time::Instant;

use nix::unistd::Pid;

use crate::bucket::{BucketId, WorkId};
use crate::channel::FramedChannel;
use crate::error::{Result, SupervisorError};

/// What kind of child this record tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    Worker,
    Helper,
    Stopped,
}

/// Stored arguments needed to re-invoke a helper's entry point on respawn.
/// Kept as a plain closure rather than a symbolic "function name + args"
/// pair (see `crate::callback`): the closure already owns everything it
/// needs to run again, including whatever fixed payload it was spawned
/// with. Runs in the forked child and may post a result frame; the
/// `ChildHandle` lets it poll for shutdown requests and send results ahead
/// of its own return.
pub type HelperEntry<R> = std::rc::Rc<dyn Fn(&crate::child_handle::ChildHandle<R>) -> Option<R>>;

/// One per live or recently-exited child, keyed by OS pid.
pub struct ChildRecord<R> {
    pub pid: Pid,
    pub ctime: Instant,
    pub identifier: WorkId,
    pub bucket: BucketId,
    pub status: ChildStatus,
    pub channel: Option<FramedChannel<R>>,
    pub last_active: Instant,
    pub respawn: bool,
    pub helper_entry: Option<HelperEntry<R>>,
}

impl<R> ChildRecord<R> {
    pub fn new_worker(pid: Pid, bucket: BucketId, identifier: WorkId, channel: FramedChannel<R>) -> Self {
        let now = Instant::now();
        ChildRecord {
            pid,
            ctime: now,
            identifier,
            bucket,
            status: ChildStatus::Worker,
            channel: Some(channel),
            last_active: now,
            respawn: false,
            helper_entry: None,
        }
    }

    pub fn new_helper(
        pid: Pid,
        bucket: BucketId,
        identifier: WorkId,
        channel: FramedChannel<R>,
        respawn: bool,
        helper_entry: HelperEntry<R>,
    ) -> Self {
        let now = Instant::now();
        ChildRecord {
            pid,
            ctime: now,
            identifier,
            bucket,
            status: ChildStatus::Helper,
            channel: Some(channel),
            last_active: now,
            respawn,
            helper_entry: Some(helper_entry),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != ChildStatus::Stopped
    }

    /// Whether the channel still has unread bytes available (used by
    /// `count_pending`, which counts STOPPED records with a drainable
    /// channel as still "pending").
    pub fn has_unread_bytes(&self) -> bool {
        match &self.channel {
            Some(ch) => ch.has_pending_bytes(),
            None => false,
        }
    }
}

/// Mapping from pid to child record. All mutation happens on the parent;
/// the table is not shared across processes.
pub struct ChildTable<R> {
    records: HashMap<i32, ChildRecord<R>>,
    active_count: usize,
}

impl<R> ChildTable<R> {
    pub fn new() -> Self {
        ChildTable {
            records: HashMap::new(),
            active_count: 0,
        }
    }

    pub fn insert(&mut self, record: ChildRecord<R>) {
        if record.is_active() {
            self.active_count += 1;
        }
        self.records.insert(record.pid.as_raw(), record);
    }

    pub fn lookup(&self, pid: Pid) -> Option<&ChildRecord<R>> {
        self.records.get(&pid.as_raw())
    }

    pub fn lookup_mut(&mut self, pid: Pid) -> Option<&mut ChildRecord<R>> {
        self.records.get_mut(&pid.as_raw())
    }

    /// Transition `pid` to STOPPED, decrementing the active count exactly
    /// once (Invariant C2). No-op (and `UnknownPid`) if the pid isn't
    /// tracked.
    pub fn mark_stopped(&mut self, pid: Pid) -> Result<()> {
        let record = self
            .records
            .get_mut(&pid.as_raw())
            .ok_or(SupervisorError::UnknownPid(pid))?;
        if record.status != ChildStatus::Stopped {
            record.status = ChildStatus::Stopped;
            self.active_count -= 1;
        }
        Ok(())
    }

    /// Remove the record for `pid`. Per Invariant C1, callers must ensure
    /// the child has been reaped and its channel fully drained before
    /// calling this.
    pub fn remove(&mut self, pid: Pid) -> Option<ChildRecord<R>> {
        self.records.remove(&pid.as_raw())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord<R>> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChildRecord<R>> {
        self.records.values_mut()
    }

    pub fn count_active(&self, bucket: Option<&BucketId>) -> usize {
        match bucket {
            None => self.active_count,
            Some(b) => self
                .records
                .values()
                .filter(|r| r.is_active() && &r.bucket == b)
                .count(),
        }
    }

    /// Includes STOPPED records whose channel still has unread bytes.
    pub fn count_pending(&self, bucket: Option<&BucketId>) -> usize {
        self.records
            .values()
            .filter(|r| bucket.map_or(true, |b| &r.bucket == b))
            .filter(|r| r.is_active() || r.has_unread_bytes())
            .count()
    }
}

impl<R> Default for ChildTable<R> {
    fn default() -> Self {
        Self::new()
    }
}
