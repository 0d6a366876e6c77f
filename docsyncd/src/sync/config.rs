use std::time::Duration;

use super::backoff::Backoff;
use super::conflict::ConflictPolicy;
use super::filters::IgnoreRules;

/// Tunables of one [`super::engine::SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Remote document bound to the local sync root.
    pub remote_root_id: String,
    pub workers: usize,
    pub poll_interval: Duration,
    /// Sleep of an idle worker before it looks for ready records again.
    pub worker_idle: Duration,
    /// Periodic full scan; `None` relies on the watcher alone.
    pub rescan_interval: Option<Duration>,
    /// How long `stop()` waits for workers before aborting them.
    pub grace_period: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub conflict_policy: ConflictPolicy,
    pub ignore: IgnoreRules,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_root_id: "root".to_string(),
            workers: 4,
            poll_interval: Duration::from_secs(15),
            worker_idle: Duration::from_millis(500),
            rescan_interval: None,
            grace_period: Duration::from_secs(5),
            max_retries: 5,
            retry_base: Duration::from_millis(250),
            retry_max: Duration::from_secs(60),
            conflict_policy: ConflictPolicy::KeepBoth,
            ignore: IgnoreRules::default(),
        }
    }
}

impl EngineConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_base, self.retry_max, true)
    }
}
