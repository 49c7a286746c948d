use std::sync::Arc;

use xposer_apply::ResourceApplier;
use xposer_core::WorkloadCache;
use xposer_queue::WorkQueue;

use crate::config::ControllerConfig;

pub const QUEUE_NAME: &str = "xposer";

/// Handles shared by the event bridge, the workers and the lifecycle.
pub struct Context {
    /// Keys are `namespace/name` strings.
    pub queue: Arc<WorkQueue<String>>,
    pub cache: Arc<dyn WorkloadCache>,
    pub applier: Arc<dyn ResourceApplier>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(cache: Arc<dyn WorkloadCache>, applier: Arc<dyn ResourceApplier>, config: ControllerConfig) -> Arc<Self> {
        let queue = Arc::new(WorkQueue::new(QUEUE_NAME, config.queue));
        Arc::new(Self { queue, cache, applier, config })
    }
}
