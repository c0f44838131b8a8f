//! Collector tasks.
//!
//! A collector task binds one or more providers to one or more writers, with a scheduling policy:
//! - [`SchedulingPolicy::FixedInterval`]: on every tick, fetch from all the providers,
//!   queue the records and dispatch them to the writers. Ticks that occur while a cycle
//!   is still running are skipped, never queued.
//! - [`SchedulingPolicy::Cron`]: the same cycle, run at each occurrence of a cron expression.
//! - [`SchedulingPolicy::EventDriven`]: subscribe to the providers, and dispatch
//!   the records as they arrive, with at most `max_concurrency` batches in flight.
//!
//! Records go through a bounded [`RecordQueue`](queue::RecordQueue), then are written
//! in batches. Each writer has its own FIFO lane, so that a slow writer does not delay
//! the others and batches reach each writer in order.

use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::plugin::PluginOptions;
use crate::record::MetricRecord;

mod error;
pub mod health;
mod lane;
pub mod policy;
pub(crate) mod queue;
pub(crate) mod run;

pub use error::TaskError;
pub use health::{HealthEvent, HealthEventKind, HealthState};
pub use policy::{CronSchedule, ExhaustedPolicy, RestartPolicy, RetryPolicy, SchedulingPolicy};
pub use queue::OverflowPolicy;

/// Unique identifier of a collector task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A plugin used by a task, with its options.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSpec {
    pub plugin: String,
    pub options: PluginOptions,
}

/// A validated task definition, ready to be started.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub policy: SchedulingPolicy,
    pub providers: Vec<ElementSpec>,
    pub writers: Vec<ElementSpec>,
    /// Capacity of the queue, in records.
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Maximum number of records per batch.
    pub batch_size: usize,
    /// Maximum number of batches in flight (event-driven tasks only).
    pub max_concurrency: usize,
    /// Number of consecutive transient failures that quarantines the task.
    pub quarantine_threshold: u32,
    pub retry: RetryPolicy,
    pub on_retries_exhausted: ExhaustedPolicy,
    pub restart: Option<RestartPolicy>,
    /// Number of successfully written records to keep in the history.
    pub max_history: usize,
    /// How long plugins get to return after a cancellation.
    pub cancel_grace: Duration,
    /// Minimum delay between two health checks of an unhealthy writer.
    pub healthcheck_interval: Duration,
    /// Where writers spill the batches they could not write.
    pub backlog_dir: Option<PathBuf>,
}

/// The last records written by a task.
pub(crate) struct History {
    max: usize,
    records: Mutex<VecDeque<MetricRecord>>,
}

impl History {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn extend(&self, batch: &[MetricRecord]) {
        if self.max == 0 {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let skip = batch.len().saturating_sub(self.max);
        records.extend(batch[skip..].iter().cloned());
        let excess = records.len().saturating_sub(self.max);
        records.drain(..excess);
    }

    pub fn snapshot(&self) -> Vec<MetricRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Timestamp;

    #[test]
    fn history_keeps_the_last_records() {
        let history = History::new(3);
        let batch: Vec<_> = (0..2u64).map(|i| MetricRecord::new(Timestamp::now(), "h", i)).collect();
        history.extend(&batch);
        let batch: Vec<_> = (2..7u64).map(|i| MetricRecord::new(Timestamp::now(), "h", i)).collect();
        history.extend(&batch);
        let values: Vec<String> = history.snapshot().iter().map(|r| r.value().to_string()).collect();
        assert_eq!(values, vec!["4", "5", "6"]);

        let disabled = History::new(0);
        disabled.extend(&batch);
        assert!(disabled.snapshot().is_empty());
    }
}
