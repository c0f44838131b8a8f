//! Health of collector tasks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{TaskError, TaskId};
use crate::record::Timestamp;

/// The health of a collector task.
///
/// Transitions only go forward, `Starting → Running → Degraded → Quarantined`,
/// except `Degraded → Running`, after a successful cycle.
/// `Stopped` and `Quarantined` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    /// The plugins of the task are being initialized.
    Starting,
    Running,
    /// The last cycles failed with transient errors. Holds the number of consecutive failures.
    Degraded(u32),
    /// The task has been stopped because of a permanent error or of too many transient failures.
    Quarantined { reason: String, since: Timestamp },
    /// The task has been stopped by a shutdown.
    Stopped,
}

impl HealthState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HealthState::Quarantined { .. } | HealthState::Stopped)
    }

    pub fn is_quarantined(&self) -> bool {
        matches!(self, HealthState::Quarantined { .. })
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Starting => f.write_str("starting"),
            HealthState::Running => f.write_str("running"),
            HealthState::Degraded(n) => write!(f, "degraded ({n} consecutive failures)"),
            HealthState::Quarantined { reason, .. } => write!(f, "quarantined: {reason}"),
            HealthState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Something happened to a task.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthEvent {
    pub task: TaskId,
    pub kind: HealthEventKind,
    /// The state of the task after the event.
    pub state: HealthState,
    pub timestamp: Timestamp,
    /// The error that caused the event, if any.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthEventKind {
    /// The health state changed (or, for `Degraded`, the failure count changed).
    Transition,
    /// A writer could not write a batch after all its attempts.
    RetriesExhausted { writer: String },
    /// A quarantined task is going to be restarted.
    Restarting { restart: u32, delay: Duration },
}

/// Result of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Continue,
    Quarantined,
}

/// Tracks the health of one task, and reports every change to the scheduler.
///
/// Shared by the parts of the task that can fail: the cycle loop and the writer lanes.
pub(crate) struct HealthTracker {
    task: TaskId,
    threshold: u32,
    inner: Mutex<TrackerState>,
    /// Successful cycles, shared by the successive runs of the task.
    successes: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<HealthEvent>,
    /// Cancelled when the task is quarantined.
    cancel: CancellationToken,
}

struct TrackerState {
    state: HealthState,
}

impl HealthTracker {
    pub fn new(
        task: TaskId,
        threshold: u32,
        events: mpsc::UnboundedSender<HealthEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let tracker = Self {
            task,
            threshold: threshold.max(1),
            inner: Mutex::new(TrackerState {
                state: HealthState::Starting,
            }),
            successes: Arc::new(AtomicU64::new(0)),
            events,
            cancel,
        };
        tracker.emit(HealthEventKind::Transition, HealthState::Starting, None);
        tracker
    }

    /// Counts the successful cycles in `counter`.
    pub fn with_success_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.successes = counter;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, kind: HealthEventKind, state: HealthState, detail: Option<String>) {
        let event = HealthEvent {
            task: self.task.clone(),
            kind,
            state,
            timestamp: Timestamp::now(),
            detail,
        };
        // the scheduler may be gone at the end of the shutdown
        let _ = self.events.send(event);
    }

    /// Changes the state and emits the event, while holding the lock so that events are ordered.
    fn transition(&self, inner: &mut TrackerState, state: HealthState, detail: Option<String>) {
        inner.state = state.clone();
        self.emit(HealthEventKind::Transition, state, detail);
    }

    pub fn task(&self) -> &TaskId {
        &self.task
    }

    pub fn state(&self) -> HealthState {
        self.lock().state.clone()
    }

    /// Number of successful cycles.
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn is_quarantined(&self) -> bool {
        self.lock().state.is_quarantined()
    }

    /// The plugins have been initialized.
    pub fn started(&self) {
        let mut inner = self.lock();
        if inner.state == HealthState::Starting {
            self.transition(&mut inner, HealthState::Running, None);
        }
    }

    /// A cycle succeeded: the failure count is reset.
    pub fn success(&self) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        self.successes.fetch_add(1, Ordering::Relaxed);
        if inner.state != HealthState::Running {
            self.transition(&mut inner, HealthState::Running, None);
        }
    }

    /// An operation that failed transiently worked on retry, outside of a cycle.
    ///
    /// The failure count is reset, but no successful cycle is counted.
    pub fn recovered(&self) {
        let mut inner = self.lock();
        if let HealthState::Degraded(_) = inner.state {
            self.transition(&mut inner, HealthState::Running, None);
        }
    }

    /// A fetch or a write attempt failed, but could work later.
    pub fn transient_failure(&self, error: &anyhow::Error) -> Verdict {
        let mut inner = self.lock();
        let count = match inner.state {
            HealthState::Quarantined { .. } => return Verdict::Quarantined,
            HealthState::Stopped => return Verdict::Continue,
            HealthState::Degraded(n) => n + 1,
            HealthState::Starting | HealthState::Running => 1,
        };
        let detail = format!("{error:#}");
        if count >= self.threshold {
            let reason = TaskError::TooManyFailures { count, last: detail }.describe();
            self.quarantine_locked(&mut inner, reason);
            Verdict::Quarantined
        } else {
            self.transition(&mut inner, HealthState::Degraded(count), Some(detail));
            Verdict::Continue
        }
    }

    /// Quarantines the task. Has no effect if the task is already stopped or quarantined.
    pub fn quarantine(&self, error: TaskError) {
        let mut inner = self.lock();
        if !inner.state.is_terminal() {
            self.quarantine_locked(&mut inner, error.describe());
        }
    }

    fn quarantine_locked(&self, inner: &mut TrackerState, reason: String) {
        let state = HealthState::Quarantined {
            reason: reason.clone(),
            since: Timestamp::now(),
        };
        self.transition(inner, state, Some(reason));
        self.cancel.cancel();
    }

    /// The task has been stopped gracefully. Has no effect if the task is quarantined.
    pub fn stopped(&self) {
        let mut inner = self.lock();
        if !inner.state.is_terminal() {
            self.transition(&mut inner, HealthState::Stopped, None);
        }
    }

    /// A writer could not write a batch.
    pub fn retries_exhausted(&self, writer: &str, error: &anyhow::Error) {
        let inner = self.lock();
        let kind = HealthEventKind::RetriesExhausted {
            writer: writer.to_owned(),
        };
        self.emit(kind, inner.state.clone(), Some(format!("{error:#}")));
    }
}
