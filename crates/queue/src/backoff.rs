use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemBackoff<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Clone + Eq + Hash> ItemBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: FxHashMap::default() }
    }

    /// Delay for the next retry of `key`; records one more failure.
    pub fn next_delay(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let secs = self.base.as_secs_f64() * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn failures(&self, key: &K) -> u32 { self.failures.get(key).copied().unwrap_or(0) }

    pub fn forget(&mut self, key: &K) { self.failures.remove(key); }
}
