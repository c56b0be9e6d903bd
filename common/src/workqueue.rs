// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A rate-limited, deduplicating work queue.
//!
//! Reconcilers push object keys here and worker tasks pull them. The queue
//! guarantees per-key serialization: a key being processed is never handed
//! to a second worker, and re-adds during processing are deferred until
//! the worker calls [`WorkQueue::done`]. Failed keys are requeued on a
//! fast/slow schedule (5 s for the first 12 attempts, 30 s after) so a
//! persistently failing object cannot monopolize a worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Requeue delay while a key is still young.
pub const FAST_REQUEUE_DELAY: Duration = Duration::from_secs(5);
/// Requeue delay once a key has exhausted its fast attempts.
pub const SLOW_REQUEUE_DELAY: Duration = Duration::from_secs(30);
/// Number of failures a key may accumulate before moving to the slow lane.
pub const MAX_FAST_ATTEMPTS: u32 = 12;

/// The delay applied before the `attempts`-th retry of a key.
pub fn requeue_delay(attempts: u32) -> Duration {
    if attempts <= MAX_FAST_ATTEMPTS {
        FAST_REQUEUE_DELAY
    } else {
        SLOW_REQUEUE_DELAY
    }
}

struct Inner<K> {
    queue: VecDeque<K>,
    /// Keys waiting in `queue`, or re-added while processing.
    dirty: HashSet<K>,
    /// Keys currently held by a worker.
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

pub struct WorkQueue<K> {
    name: &'static str,
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(name: &'static str) -> Arc<WorkQueue<K>> {
        Arc::new(WorkQueue {
            name,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueues a key. Keys already waiting are dropped (deduplication);
    /// keys currently being processed are marked dirty and requeued when
    /// their worker finishes.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue has been shut
    /// down and drained.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key as finished. If it was re-added while the worker held
    /// it, it goes straight back on the queue.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutdown {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Records a failure and schedules the key to be re-added after its
    /// rate-limited delay.
    pub fn requeue_rate_limited(queue: &Arc<WorkQueue<K>>, key: K) {
        let attempts = {
            let mut inner = queue.inner.lock().unwrap();
            if inner.shutdown {
                return;
            }
            let attempts = inner.failures.entry(key.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };
        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            tokio::time::sleep(requeue_delay(attempts)).await;
            queue.add(key);
        });
    }

    /// Clears a key's failure history after a successful sync.
    pub fn forget(&self, key: &K) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.lock().unwrap().failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the queue: pending keys drain, new adds are ignored, and
    /// workers see `None` once the backlog is gone.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.notify.notify_waiters();
    }
}
