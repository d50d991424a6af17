use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::{BucketConfig, BucketRegistry, RunTimeLimit};
use crate::callback::CallbackDispatcher;
use crate::child::ChildTable;
use crate::config::SupervisorConfig;
use crate::proc_util::force_kill;
use crate::reaper;

/// At most once every `housekeeping_check_interval`, kills any child that
/// has overrun its bucket's `child_max_run_time`, then reaps opportunistically.
pub struct Housekeeper {
    last_check: Instant,
}

impl Housekeeper {
    pub fn new() -> Self {
        Housekeeper {
            last_check: Instant::now() - Duration::from_secs(3600),
        }
    }

    /// Runs the pass unconditionally; callers that want the
    /// once-per-interval throttling should check `due()` first. Exposed
    /// separately so shutdown (§4.10) can force an extra pass without
    /// waiting out the interval.
    pub fn due(&self, interval: Duration) -> bool {
        self.last_check.elapsed() >= interval
    }

    pub fn run<W, R>(&mut self, children: &mut ChildTable<R>, buckets: &mut BucketRegistry<W, R>, config: &SupervisorConfig)
    where
        W: Clone,
        R: Serialize + DeserializeOwned + Clone,
    {
        let mut overrun = Vec::new();
        for record in children.iter() {
            if !record.is_active() {
                continue;
            }
            let bucket_config = buckets
                .get(&record.bucket)
                .map(|b| b.config.clone())
                .unwrap_or_default();
            if let Some(deadline) = bucket_config.child_max_run_time.deadline() {
                if record.ctime.elapsed() > deadline {
                    overrun.push((record.pid, record.bucket.clone(), record.identifier.clone()));
                }
            }
        }

        for (pid, bucket_id, identifier) in overrun {
            log::warn!(
                "child pid={} in bucket {} exceeded child_max_run_time; killing",
                pid, bucket_id
            );
            if let Ok(bucket) = buckets.get(&bucket_id) {
                CallbackDispatcher::invoke_optional(&bucket.callbacks.child_timeout, |f| {
                    f(pid, identifier.clone())
                });
            }
            force_kill(pid);
            thread::sleep(Duration::from_secs(3));
            reaper::reap_all(children, buckets, config);
        }

        reaper::reap_all(children, buckets, config);
        self.last_check = Instant::now();
    }
}

impl Default for Housekeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// `RunTimeLimit::deadline()` treats `child_max_run_time == 0` as "deadline
/// at now" (the spec's resolved open question): it is still enforced, not
/// merely logged. `normalize_run_time` exists purely so callers setting the
/// knob get the WARN-level heads-up described in spec §9 at set time, once,
/// rather than rediscovering it from every housekeeping pass.
pub fn warn_if_immediate_deadline(config: &BucketConfig) {
    if config.child_max_run_time == RunTimeLimit::Immediate {
        log::warn!(
            "child_max_run_time = 0: children of this bucket are killed on the very next housekeeping pass"
        );
    }
}
