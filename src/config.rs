use std::time::Duration;

/// Global (not per-bucket) knobs, per spec §6.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Whether `post_results` stores frames in `pending_results` for later
    /// retrieval via `get_result`/`get_all_results`, or drops them after
    /// invoking `parent_function_results`.
    pub store_result: bool,
    /// Deadline for graceful shutdown (§4.10) before children are
    /// force-killed.
    pub children_max_timeout: Duration,
    /// Minimum spacing between housekeeping passes (§4.9).
    pub housekeeping_check_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            store_result: true,
            children_max_timeout: Duration::from_secs(300),
            housekeeping_check_interval: Duration::from_secs(1),
        }
    }
}
