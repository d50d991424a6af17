use nix::sys::signal::{self, SigHandler, Signal};
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::error::{Result, SupervisorError};

/// The signals the supervisor reacts to. Anything else that would otherwise
/// terminate or stop the process (spec §6's ignore list) is masked to
/// `SIG_IGN` once at construction.
const IGNORED: &[Signal] = &[
    Signal::SIGALRM,
    Signal::SIGUSR2,
    Signal::SIGBUS,
    Signal::SIGPIPE,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGQUIT,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

/// What a drained batch of pending signals asked the caller to do. The
/// main loop turns each of these into an ordinary function call (the Reaper,
/// the hangup handler, or the Shutdown coordinator) rather than running any
/// logic inside a signal handler itself — this is the "owned mailbox"
/// redesign from spec §9: `signal-hook`'s self-pipe does the async-signal-safe
/// part, and everything downstream of `pending()` runs on the main thread's
/// ordinary call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingSignals {
    pub child_exited: bool,
    pub hangup: bool,
    pub interrupt: bool,
    pub terminate: bool,
}

impl PendingSignals {
    pub fn any(&self) -> bool {
        self.child_exited || self.hangup || self.interrupt || self.terminate
    }
}

/// Owns the self-pipe registration for the signals the supervisor cares
/// about, plus the one-time `SIG_IGN` masking of the rest.
pub struct SignalRouter {
    signals: Signals,
}

impl SignalRouter {
    pub fn install() -> Result<Self> {
        for sig in IGNORED {
            // SAFETY: SIG_IGN is one of the two handlers nix itself
            // considers signal-safe to install (the other being the
            // default), so this carries none of the usual risk of
            // installing an arbitrary handler.
            unsafe {
                signal::signal(*sig, SigHandler::SigIgn)
                    .map_err(|e| SupervisorError::Config {
                        knob: "ignored_signals",
                        reason: e.to_string(),
                    })?;
            }
        }

        let signals = Signals::new([SIGCHLD, SIGHUP, SIGINT, SIGTERM]).map_err(|e| {
            SupervisorError::Config {
                knob: "signal_mailbox",
                reason: e.to_string(),
            }
        })?;

        Ok(SignalRouter { signals })
    }

    /// Non-blocking drain of every signal that arrived since the last call.
    pub fn drain(&mut self) -> PendingSignals {
        let mut pending = PendingSignals::default();
        for sig in self.signals.pending() {
            match sig {
                s if s == SIGCHLD => pending.child_exited = true,
                s if s == SIGHUP => pending.hangup = true,
                s if s == SIGINT => pending.interrupt = true,
                s if s == SIGTERM => pending.terminate = true,
                _ => {}
            }
        }
        pending
    }
}
