use nix::unistd::Pid;
use thiserror::Error;

/// Every failure mode the supervisor can surface to a caller.
///
/// Per the error-handling policy: a failure local to one child never tears
/// down the supervisor. These variants are returned from the specific call
/// that failed; the main loop logs and continues.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid value for `{knob}`: {reason}")]
    Config { knob: &'static str, reason: String },

    #[error("required callback `{0}` did not resolve")]
    CallbackMissing(&'static str),

    #[error("fork failed: {0}")]
    ForkFailure(#[source] nix::Error),

    #[error("channel transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("failed to encode frame payload: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode frame payload: {0}")]
    Decode(#[source] bincode::Error),

    #[error("reaped unknown pid {0}")]
    UnknownPid(Pid),

    #[error("refused to signal pid {0}: not a tracked child of this process")]
    KillRefused(Pid),

    #[error("child(ren) did not exit within the shutdown deadline")]
    DeadlineExceeded,

    #[error("operation is only valid in the parent process")]
    NotParent,

    #[error("bucket `{0}` does not exist")]
    UnknownBucket(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
