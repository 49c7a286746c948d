use std::time::Duration;

use xposer_queue::QueueConfig;

/// What to do when the cache fails to sync within the configured wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncFailurePolicy {
    /// Refuse to start workers against an unsynced cache.
    #[default]
    Abort,
    /// Log and start workers anyway.
    Continue,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub sync_timeout: Duration,
    pub on_sync_failure: SyncFailurePolicy,
    /// Upper bound for a single create call.
    pub apply_timeout: Duration,
    /// Transient failures requeued more often than this are dropped.
    pub max_requeues: u32,
    /// Period for re-enqueueing every cached workload. Zero disables it.
    pub resync: Duration,
    pub queue: QueueConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            sync_timeout: Duration::from_secs(60),
            on_sync_failure: SyncFailurePolicy::Abort,
            apply_timeout: Duration::from_secs(10),
            max_requeues: 5,
            resync: Duration::from_secs(600),
            queue: QueueConfig::default(),
        }
    }
}
