//! xposer queue: deduplicating work queue with per-key exponential backoff.
//!
//! Keys added while pending collapse into one entry. Keys added while a
//! worker holds them are parked and redelivered after `done`, so no two
//! workers ever process the same key at once.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

mod backoff;

pub use backoff::ItemBackoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { backoff_base: Duration::from_millis(5), backoff_max: Duration::from_secs(1000) }
    }
}

pub struct WorkQueue<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    waiting: BinaryHeap<Delayed<K>>,
    waiting_until: FxHashMap<K, Instant>,
    backoff: ItemBackoff<K>,
    seq: u64,
    shutting_down: bool,
}

/// Heap entry ordered so the earliest deadline sits on top.
struct Delayed<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}
impl<K> Eq for Delayed<K> {}
impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K: Clone + Eq + Hash> State<K> {
    /// Returns true when the key became deliverable.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn schedule(&mut self, key: K, ready_at: Instant) -> bool {
        if matches!(self.waiting_until.get(&key), Some(at) if *at <= ready_at) {
            return false;
        }
        self.waiting_until.insert(key.clone(), ready_at);
        self.seq = self.seq.wrapping_add(1);
        self.waiting.push(Delayed { ready_at, seq: self.seq, key });
        true
    }

    fn promote_ready(&mut self, now: Instant) {
        while matches!(self.waiting.peek(), Some(d) if d.ready_at <= now) {
            let Some(d) = self.waiting.pop() else { break };
            // Superseded entries have a different deadline in the index.
            if self.waiting_until.get(&d.key) == Some(&d.ready_at) {
                self.waiting_until.remove(&d.key);
                self.insert(d.key);
            }
        }
    }
}

impl<K: Clone + Eq + Hash + Send> WorkQueue<K> {
    pub fn new(name: &'static str, cfg: QueueConfig) -> Self {
        Self {
            name,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                waiting: BinaryHeap::new(),
                waiting_until: FxHashMap::default(),
                backoff: ItemBackoff::new(cfg.backoff_base, cfg.backoff_max),
                seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn name(&self) -> &'static str { self.name }

    /// Keys ready for delivery (excludes in-flight and delayed keys).
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        counter!("workqueue_adds", 1, "queue" => self.name);
        if st.insert(key) {
            gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name);
            drop(st);
            self.notify.notify_waiters();
        }
    }

    /// Add the key once `delay` has elapsed. A key already waiting keeps the
    /// earlier of the two deadlines.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        if st.schedule(key, Instant::now() + delay) {
            drop(st);
            // Sleeping workers must re-arm their timers.
            self.notify.notify_waiters();
        }
    }

    /// Add the key after its per-key backoff delay and bump its failure count.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.lock().backoff.next_delay(&key);
        counter!("workqueue_retries", 1, "queue" => self.name);
        debug!(queue = self.name, delay_ms = delay.as_millis() as u64, "requeue rate limited");
        self.add_after(key, delay);
    }

    /// Reset the backoff state for a key that was handled cleanly.
    pub fn forget(&self, key: &K) { self.lock().backoff.forget(key) }

    pub fn num_requeues(&self, key: &K) -> u32 { self.lock().backoff.failures(key) }

    /// Wait for the next key. Returns `None` once the queue is shutting down.
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote_ready(Instant::now());
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name);
                    return Some(key);
                }
                st.waiting.peek().map(|d| d.ready_at)
            };

            match next_deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key as processed. If it was re-added meanwhile it becomes
    /// deliverable again.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            drop(st);
            self.notify.notify_waiters();
        }
    }

    /// Stop delivering keys; pending and future `get` calls return `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        debug!(queue = self.name, "work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
}
