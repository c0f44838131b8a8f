//! Bounded record queue of a collector task.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::record::MetricRecord;

/// What to do when records arrive in a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for space.
    Block,
    /// Evict the oldest records to make room for the new ones.
    DropOldest,
    /// Discard the incoming records that don't fit.
    DropNewest,
}

/// The queue has been closed: the task does not accept records anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueClosed;

/// A FIFO queue with a capacity expressed in records.
///
/// Producers are the providers of the task: pull providers through the task itself,
/// push providers through their [`Emitter`](crate::provider::Emitter), on their own threads.
/// The only consumer is the dispatcher of the task.
pub(crate) struct RecordQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Wakes the consumer up.
    readable: Notify,
    /// Wakes blocked producers up.
    writable: Condvar,
}

struct QueueState {
    items: VecDeque<MetricRecord>,
    closed: bool,
    /// Records dropped by the overflow policy since the last call to `take_dropped`.
    dropped: u64,
}

/// How often a blocked producer checks for cancellation.
const BLOCKED_PRODUCER_RECHECK: Duration = Duration::from_millis(100);

impl RecordQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
                dropped: 0,
            }),
            capacity,
            policy,
            readable: Notify::new(),
            writable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Moves as many `pending` records as the overflow policy allows into the queue, without waiting.
    ///
    /// With [`OverflowPolicy::Block`], the records that don't fit are left in `pending`.
    /// With the other policies, `pending` is always emptied.
    pub fn offer(&self, pending: &mut VecDeque<MetricRecord>) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueClosed);
        }
        self.admit(&mut state, pending);
        Ok(())
    }

    /// Pushes all the `records`, waiting for space if the policy is [`OverflowPolicy::Block`].
    ///
    /// The records are admitted at once if they fit in the queue, otherwise in chunks.
    /// Waiting stops when the queue is closed or when `cancel` is triggered.
    pub fn push_blocking(&self, records: Vec<MetricRecord>, cancel: &CancellationToken) -> Result<(), QueueClosed> {
        let mut pending = VecDeque::from(records);
        let mut state = self.lock();
        loop {
            if state.closed || cancel.is_cancelled() {
                return Err(QueueClosed);
            }
            let room = self.capacity - state.items.len();
            if room >= pending.len().min(self.capacity) || self.policy != OverflowPolicy::Block {
                self.admit(&mut state, &mut pending);
                if pending.is_empty() {
                    return Ok(());
                }
            }
            state = self
                .writable
                .wait_timeout(state, BLOCKED_PRODUCER_RECHECK)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn admit(&self, state: &mut QueueState, pending: &mut VecDeque<MetricRecord>) {
        match self.policy {
            OverflowPolicy::DropOldest => {
                state.items.extend(pending.drain(..));
                let excess = state.items.len().saturating_sub(self.capacity);
                state.items.drain(..excess);
                state.dropped += excess as u64;
            }
            OverflowPolicy::DropNewest => {
                let room = self.capacity - state.items.len();
                let n = room.min(pending.len());
                state.items.extend(pending.drain(..n));
                state.dropped += pending.len() as u64;
                pending.clear();
            }
            OverflowPolicy::Block => {
                let room = self.capacity - state.items.len();
                let n = room.min(pending.len());
                state.items.extend(pending.drain(..n));
            }
        }
        if !state.items.is_empty() {
            self.readable.notify_one();
        }
    }

    /// Removes at most `max` records from the front of the queue.
    pub fn take_batch(&self, max: usize) -> Vec<MetricRecord> {
        let mut state = self.lock();
        let n = max.min(state.items.len());
        let batch: Vec<MetricRecord> = state.items.drain(..n).collect();
        drop(state);
        if !batch.is_empty() {
            self.writable.notify_all();
        }
        batch
    }

    /// Returns the number of records dropped since the last call, and resets it.
    pub fn take_dropped(&self) -> u64 {
        std::mem::take(&mut self.lock().dropped)
    }

    /// Waits until the queue contains records or is closed.
    pub async fn readable(&self) {
        loop {
            {
                let state = self.lock();
                if !state.items.is_empty() || state.closed {
                    return;
                }
            }
            // The consumer is unique: a notification sent before this point is kept as a permit.
            self.readable.notified().await;
        }
    }

    /// Refuses new records. The records already in the queue can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_one();
        self.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
