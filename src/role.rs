use crate::bucket::BucketId;
use nix::unistd::{getpid, Pid};

/// Which side of a fork the current process is standing on.
///
/// Replaces the source's `getpid() == parent_pid` sentinel check scattered
/// through every component with a value captured once, at construction, and
/// threaded explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Parent,
    Child(BucketId),
}

impl Role {
    pub fn is_parent(&self) -> bool {
        matches!(self, Role::Parent)
    }
}

/// Captures the pid of the process that constructed the supervisor. Used as
/// the authoritative "am I still the original parent" test even if this
/// process later forks further children of its own.
#[derive(Debug, Clone, Copy)]
pub struct ParentIdentity {
    parent_pid: Pid,
}

impl ParentIdentity {
    pub fn capture() -> Self {
        ParentIdentity {
            parent_pid: getpid(),
        }
    }

    pub fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    pub fn this_process_is_parent(&self) -> bool {
        getpid() == self.parent_pid
    }
}
