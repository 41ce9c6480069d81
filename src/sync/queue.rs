//! Priority sync queue
//!
//! Pending paths keyed by path. Ordered by trigger priority, then arrival.
//! An entry is only ever replaced by a strictly higher priority; a
//! replacement counts as a new arrival.
//!
//! # Thread Safety
//!
//! One `parking_lot::Mutex` guards the map and the ordering index; a
//! `Condvar` wakes the worker when work arrives or the queue is closed.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::model::{now_timestamp, Trigger};

/// Anything that can accept resync requests: the in-process queue, or the
/// parent-side handle to an isolated worker process
pub trait ResyncSink: Send + Sync {
    /// Returns true if the request changed the pending work
    fn request_resync(&self, path: &str, trigger: Trigger) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    pub path: String,
    pub trigger: Trigger,
    pub priority: u8,
    pub enqueued_at: String,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// Existing entry replaced by a higher-priority trigger
    Upgraded,
    /// Existing entry already at equal or higher priority
    Unchanged,
    Closed,
}

type OrderKey = (Reverse<u8>, u64, String);

#[derive(Default)]
struct QueueState {
    entries: HashMap<String, QueueItem>,
    order: BTreeSet<OrderKey>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn order_key(item: &QueueItem) -> OrderKey {
        (Reverse(item.priority), item.seq, item.path.clone())
    }
}

#[derive(Default)]
pub struct SyncQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, path: &str, trigger: Trigger) -> EnqueueOutcome {
        let priority = trigger.priority();
        let mut state = self.state.lock();
        if state.closed {
            return EnqueueOutcome::Closed;
        }

        let outcome = match state.entries.get(path) {
            Some(existing) if existing.priority >= priority => return EnqueueOutcome::Unchanged,
            Some(existing) => {
                let key = QueueState::order_key(existing);
                state.order.remove(&key);
                EnqueueOutcome::Upgraded
            }
            None => EnqueueOutcome::Added,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        let item = QueueItem {
            path: path.to_string(),
            trigger,
            priority,
            enqueued_at: now_timestamp(),
            seq,
        };
        state.order.insert(QueueState::order_key(&item));
        state.entries.insert(path.to_string(), item);
        drop(state);

        self.available.notify_all();
        outcome
    }

    /// Enqueue many paths; returns how many changed the queue
    pub fn enqueue_all<I, S>(&self, paths: I, trigger: Trigger) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        paths
            .into_iter()
            .filter(|p| {
                matches!(
                    self.enqueue(p.as_ref(), trigger),
                    EnqueueOutcome::Added | EnqueueOutcome::Upgraded
                )
            })
            .count()
    }

    /// Remove and return the highest-priority, oldest entry
    pub fn dequeue(&self) -> Option<QueueItem> {
        let mut state = self.state.lock();
        let key = state.order.pop_first()?;
        state.entries.remove(&key.2)
    }

    /// Block until the queue is non-empty. Returns false once the queue is
    /// closed, even if entries remain.
    pub fn wait_for_item(&self) -> bool {
        let mut state = self.state.lock();
        while state.entries.is_empty() && !state.closed {
            self.available.wait(&mut state);
        }
        !state.closed
    }

    /// Like [`wait_for_item`](Self::wait_for_item) with an upper bound.
    /// Returns true if an item is available.
    pub fn wait_for_item_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.entries.is_empty() && !state.closed {
            self.available.wait_for(&mut state, timeout);
        }
        !state.closed && !state.entries.is_empty()
    }

    /// Stop accepting work and wake every waiter
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<QueueItem> {
        self.state.lock().entries.get(path).cloned()
    }

    /// Pending items in processing order
    pub fn snapshot(&self) -> Vec<QueueItem> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|(_, _, path)| state.entries.get(path).cloned())
            .collect()
    }
}

impl ResyncSink for SyncQueue {
    fn request_resync(&self, path: &str, trigger: Trigger) -> bool {
        matches!(
            self.enqueue(path, trigger),
            EnqueueOutcome::Added | EnqueueOutcome::Upgraded
        )
    }
}
