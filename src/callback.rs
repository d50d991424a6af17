use std::rc::Rc;
use std::sync::Arc;

use log::Level;

use crate::error::SupervisorError;

/// A registered callback slot.
///
/// The source resolved callbacks by name at call time: a bound method on a
/// supplied object, then a method on the supervisor, then a free function.
/// That symbolic lookup collapses here into an ordinary `Rc<dyn Fn>` — Rust
/// closures already capture "a receiver plus a method" when that's what the
/// caller wants, so there is exactly one variant worth keeping: present or
/// absent. Registration resolves eagerly (the closure either exists or it
/// doesn't), so there is no deferred "does this name resolve" step.
pub struct Callback<F: ?Sized>(Option<Rc<F>>);

impl<F: ?Sized> Clone for Callback<F> {
    fn clone(&self) -> Self {
        Callback(self.0.clone())
    }
}

impl<F: ?Sized> Default for Callback<F> {
    fn default() -> Self {
        Callback(None)
    }
}

impl<F: ?Sized> Callback<F> {
    pub fn empty() -> Self {
        Callback(None)
    }

    pub fn set(&mut self, f: Rc<F>) {
        self.0 = Some(f);
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn get(&self) -> Option<&Rc<F>> {
        self.0.as_ref()
    }
}

impl<F: ?Sized> From<Option<Rc<F>>> for Callback<F> {
    fn from(opt: Option<Rc<F>>) -> Self {
        Callback(opt)
    }
}

/// Like `Callback<F>`, but `Arc`-backed so the registered closure can be
/// moved into the dedicated signal-watcher thread spawned inside each
/// forked child (see `child_handle::spawn_signal_watcher`). Used for the
/// two callback slots — `child_exit`, `child_sighup` — that must run
/// off the child's main thread to be signal-driven rather than polled.
pub struct SyncCallback<F: ?Sized>(Option<Arc<F>>);

impl<F: ?Sized> Clone for SyncCallback<F> {
    fn clone(&self) -> Self {
        SyncCallback(self.0.clone())
    }
}

impl<F: ?Sized> Default for SyncCallback<F> {
    fn default() -> Self {
        SyncCallback(None)
    }
}

impl<F: ?Sized> SyncCallback<F> {
    pub fn empty() -> Self {
        SyncCallback(None)
    }

    pub fn set(&mut self, f: Arc<F>) {
        self.0 = Some(f);
    }

    pub fn get(&self) -> Option<&Arc<F>> {
        self.0.as_ref()
    }
}

/// Resolves and invokes callbacks with the "optional vs required" contract
/// from the source: a missing optional callback is silently a no-op; a
/// missing required one is a CRIT log event and a no-op.
pub struct CallbackDispatcher;

impl CallbackDispatcher {
    /// Invoke `call` if `cb` is set. Returns `None` if absent.
    pub fn invoke_optional<F: ?Sized, R>(cb: &Callback<F>, call: impl FnOnce(&Rc<F>) -> R) -> Option<R> {
        cb.get().map(call)
    }

    /// Invoke `call` if `cb` is set; otherwise log CRIT and return the
    /// `CallbackMissing` error, matching the source's "required callback
    /// unresolved" failure mode.
    pub fn invoke_required<F: ?Sized, R>(
        cb: &Callback<F>,
        name: &'static str,
        call: impl FnOnce(&Rc<F>) -> R,
    ) -> Result<R, SupervisorError> {
        match cb.get() {
            Some(f) => Ok(call(f)),
            None => {
                log::error!("required callback `{}` is not registered", name);
                Err(SupervisorError::CallbackMissing(name))
            }
        }
    }
}

/// Severity threshold for `register_logging`: only events at or above this
/// level are forwarded to the registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Crit,
}

impl Severity {
    pub fn to_log_level(self) -> Level {
        match self {
            Severity::Info => Level::Info,
            Severity::Warn => Level::Warn,
            Severity::Crit => Level::Error,
        }
    }
}

pub type LoggingFn = dyn Fn(Severity, &str);

/// Logs an event both through the `log` crate (so the embedder gets it for
/// free via any `log` backend) and through the user's registered logging
/// callback, if one has been registered and `severity` clears its threshold.
pub fn emit_log(sink: &Callback<LoggingFn>, min_severity: Severity, severity: Severity, message: &str) {
    log::log!(severity.to_log_level(), "{}", message);
    if severity >= min_severity {
        if let Some(f) = sink.get() {
            f(severity, message);
        }
    }
}
