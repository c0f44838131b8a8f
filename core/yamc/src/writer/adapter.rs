use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{Backlog, WriteContext, WriterError};
use crate::plugin::WriterInstance;
use crate::plugin::call::{CallError, call_blocking};
use crate::record::RecordBatch;
use crate::task::health::{HealthTracker, Verdict};
use crate::task::policy::{ExhaustedPolicy, RetryPolicy};
use crate::task::{TaskError, TaskId, TaskSpec};

/// Settings of a writer adapter, taken from the task configuration.
#[derive(Debug, Clone)]
pub(crate) struct WriterSettings {
    pub retry: RetryPolicy,
    pub on_exhausted: ExhaustedPolicy,
    pub healthcheck_interval: Duration,
    pub cancel_grace: Duration,
}

impl WriterSettings {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self {
            retry: spec.retry,
            on_exhausted: spec.on_retries_exhausted,
            healthcheck_interval: spec.healthcheck_interval,
            cancel_grace: spec.cancel_grace,
        }
    }
}

/// Wraps a writer instance for a collector task: retries, health checks and backlog.
pub(crate) struct WriterAdapter {
    label: String,
    task: TaskId,
    instance: Option<WriterInstance>,
    settings: WriterSettings,
    backlog: Option<Backlog>,
    /// `false` after the retries have been exhausted, until a health check succeeds.
    healthy: bool,
    last_healthcheck: Option<Instant>,
}

/// The result of [`WriterAdapter::deliver`].
#[derive(Debug)]
pub(crate) enum Delivery {
    /// The batch has been written.
    Written { attempts: u32 },
    /// The batch could not be written, it has been dropped or spilled to the backlog.
    Exhausted,
    /// The task has been cancelled or quarantined before the batch could be written.
    Interrupted,
    /// The writer cannot be used anymore.
    Failed(TaskError),
}

enum WriteFailure {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
    Unresponsive,
}

impl WriterAdapter {
    pub fn new(task: TaskId, instance: WriterInstance, settings: WriterSettings, backlog: Option<Backlog>) -> Self {
        Self {
            label: instance.label().to_owned(),
            task,
            instance: Some(instance),
            settings,
            backlog,
            healthy: true,
            last_healthcheck: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Writes a batch, retrying with exponential backoff on transient errors.
    ///
    /// Every failed attempt is reported to `health`.
    pub async fn deliver(&mut self, batch: RecordBatch, health: &HealthTracker, cancel: &CancellationToken) -> Delivery {
        if !self.healthy {
            match self.healthcheck(cancel).await {
                Ok(true) => (),
                Ok(false) => {
                    let err = anyhow::anyhow!("{} is unhealthy, the batch has not been written", self.label);
                    health.transient_failure(&err);
                    self.set_aside(&batch, "the writer is unhealthy");
                    return Delivery::Exhausted;
                }
                Err(e) => return Delivery::Failed(e),
            }
        }

        let max_attempts = self.settings.retry.max_attempts.max(1);
        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            if cancel.is_cancelled() {
                self.set_aside(&batch, "the task has been cancelled");
                return Delivery::Interrupted;
            }
            match self.write_once(batch.clone(), attempt, cancel).await {
                Ok(()) => {
                    if attempt > 1 {
                        log::info!("{} of task {}: batch written at attempt {attempt}", self.label, self.task);
                    }
                    self.replay_backlog(cancel).await;
                    return Delivery::Written { attempts: attempt };
                }
                Err(WriteFailure::Transient(e)) => {
                    log::warn!(
                        "{} of task {}: attempt {attempt}/{max_attempts} failed: {e:#}",
                        self.label,
                        self.task
                    );
                    if health.transient_failure(&e) == Verdict::Quarantined {
                        self.set_aside(&batch, "the task has been quarantined");
                        return Delivery::Interrupted;
                    }
                    if attempt >= max_attempts {
                        break e;
                    }
                    let delay = self.settings.retry.backoff(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => (),
                        _ = cancel.cancelled() => {
                            self.set_aside(&batch, "the task has been cancelled");
                            return Delivery::Interrupted;
                        }
                    }
                }
                Err(WriteFailure::Permanent(source)) => {
                    return Delivery::Failed(TaskError::Writer {
                        element: self.label.clone(),
                        source,
                    });
                }
                Err(WriteFailure::Unresponsive) => {
                    return Delivery::Failed(TaskError::CancellationTimeout {
                        element: self.label.clone(),
                        grace: self.settings.cancel_grace,
                    });
                }
            }
        };

        log::error!(
            "{} of task {}: giving up after {max_attempts} attempts: {last_error:#}",
            self.label,
            self.task
        );
        self.healthy = false;
        self.last_healthcheck = None;
        health.retries_exhausted(&self.label, &last_error);
        self.set_aside(&batch, "retries exhausted");
        Delivery::Exhausted
    }

    async fn write_once(&mut self, batch: RecordBatch, attempt: u32, cancel: &CancellationToken) -> Result<(), WriteFailure> {
        let ctx = WriteContext::new(self.task.clone(), attempt, cancel.clone());
        let res = call_blocking(&mut self.instance, cancel, self.settings.cancel_grace, move |w| {
            w.write(&batch, &ctx)
        })
        .await;
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(WriterError::Transient(e))) => Err(WriteFailure::Transient(e)),
            Ok(Err(WriterError::Permanent(e))) => Err(WriteFailure::Permanent(e)),
            Err(e) => Err(call_failure(e)),
        }
    }

    /// Runs the health check of the writer, if the last one is old enough.
    ///
    /// Returns `Ok(true)` if the writer is healthy again.
    async fn healthcheck(&mut self, cancel: &CancellationToken) -> Result<bool, TaskError> {
        if let Some(last) = self.last_healthcheck {
            if last.elapsed() < self.settings.healthcheck_interval {
                return Ok(false);
            }
        }
        self.last_healthcheck = Some(Instant::now());
        let res = call_blocking(&mut self.instance, cancel, self.settings.cancel_grace, |w| w.healthcheck()).await;
        let failure = match res {
            Ok(Ok(())) => {
                log::info!("{} of task {} is healthy again", self.label, self.task);
                self.healthy = true;
                return Ok(true);
            }
            Ok(Err(WriterError::Transient(e))) => WriteFailure::Transient(e),
            Ok(Err(WriterError::Permanent(e))) => WriteFailure::Permanent(e),
            Err(e) => call_failure(e),
        };
        match failure {
            WriteFailure::Transient(e) => {
                log::warn!("Health check of {} failed: {e:#}", self.label);
                Ok(false)
            }
            WriteFailure::Permanent(source) => Err(TaskError::Writer {
                element: self.label.clone(),
                source,
            }),
            WriteFailure::Unresponsive => Err(TaskError::CancellationTimeout {
                element: self.label.clone(),
                grace: self.settings.cancel_grace,
            }),
        }
    }

    /// Drops the batch or spills it to the backlog, depending on the policy.
    fn set_aside(&mut self, batch: &RecordBatch, why: &str) {
        match (self.settings.on_exhausted, self.backlog.as_mut()) {
            (ExhaustedPolicy::Spill, Some(backlog)) => match backlog.push(batch) {
                Ok(()) => log::info!(
                    "{} of task {}: {why}, {} records spilled to {} ({} batches in backlog)",
                    self.label,
                    self.task,
                    batch.len(),
                    backlog.dir().display(),
                    backlog.len()
                ),
                Err(e) => log::error!(
                    "{} of task {}: {why}, and spilling failed, {} records lost: {e:#}",
                    self.label,
                    self.task,
                    batch.len()
                ),
            },
            _ => log::warn!(
                "{} of task {}: {why}, {} records dropped",
                self.label,
                self.task,
                batch.len()
            ),
        }
    }

    /// Writes the batches of the backlog, oldest first, until one of them fails.
    async fn replay_backlog(&mut self, cancel: &CancellationToken) {
        let Some(mut backlog) = self.backlog.take() else {
            return;
        };
        while !cancel.is_cancelled() {
            let records = match backlog.peek() {
                None => break,
                Some(Ok(records)) => records,
                Some(Err(e)) => {
                    log::error!("Discarding an unreadable batch of the backlog of {}: {e:#}", self.label);
                    if let Err(e) = backlog.pop() {
                        log::error!("{e:#}");
                        break;
                    }
                    continue;
                }
            };
            let n = records.len();
            match self.write_once(records.into(), 1, cancel).await {
                Ok(()) => {
                    log::debug!("{}: {n} records replayed from the backlog", self.label);
                    if let Err(e) = backlog.pop() {
                        log::error!("{e:#}");
                        break;
                    }
                }
                Err(WriteFailure::Transient(e) | WriteFailure::Permanent(e)) => {
                    log::warn!("{}: replay of the backlog interrupted: {e:#}", self.label);
                    break;
                }
                Err(WriteFailure::Unresponsive) => break,
            }
        }
        self.backlog = Some(backlog);
    }

    /// Releases the writer. Errors are logged.
    pub fn dispose(mut self) {
        if let Some(instance) = self.instance.take() {
            if let Err(e) = instance.dispose() {
                log::error!("Error while disposing {}: {e:#}", self.label);
            }
        }
    }
}

fn call_failure(e: CallError) -> WriteFailure {
    match e {
        CallError::Panicked(msg) => WriteFailure::Permanent(anyhow::anyhow!("panicked: {msg}")),
        CallError::Unresponsive => WriteFailure::Unresponsive,
        CallError::Unavailable => {
            WriteFailure::Permanent(anyhow::anyhow!("instance unavailable after an abandoned call"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::plugin::Instance;
    use crate::record::{MetricRecord, Timestamp};
    use crate::task::health::{HealthEvent, HealthEventKind, HealthState};
    use crate::writer::{WriteRetry, Writer};

    /// Fails while `failures` is positive, records what it writes.
    struct Scripted {
        failures: Arc<Mutex<u32>>,
        healthy: Arc<Mutex<bool>>,
        written: Arc<Mutex<Vec<(String, u32)>>>,
    }

    impl Writer for Scripted {
        fn write(&mut self, batch: &[MetricRecord], ctx: &WriteContext) -> Result<(), WriterError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(std::io::Error::other("connection reset")).retry_write();
            }
            let mut written = self.written.lock().unwrap();
            for r in batch {
                written.push((r.name().to_owned(), ctx.attempt()));
            }
            Ok(())
        }

        fn healthcheck(&mut self) -> Result<(), WriterError> {
            if *self.healthy.lock().unwrap() {
                Ok(())
            } else {
                Err(WriterError::Transient(anyhow::anyhow!("still down")))
            }
        }
    }

    struct Fixture {
        failures: Arc<Mutex<u32>>,
        healthy: Arc<Mutex<bool>>,
        written: Arc<Mutex<Vec<(String, u32)>>>,
        health: HealthTracker,
        events: mpsc::UnboundedReceiver<HealthEvent>,
    }

    fn fixture(on_exhausted: ExhaustedPolicy, backlog: Option<Backlog>) -> (WriterAdapter, Fixture) {
        let failures = Arc::new(Mutex::new(0));
        let healthy = Arc::new(Mutex::new(true));
        let written = Arc::new(Mutex::new(Vec::new()));
        let writer: Box<dyn Writer> = Box::new(Scripted {
            failures: failures.clone(),
            healthy: healthy.clone(),
            written: written.clone(),
        });
        let settings = WriterSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
            },
            on_exhausted,
            healthcheck_interval: Duration::ZERO,
            cancel_grace: Duration::from_secs(1),
        };
        let adapter = WriterAdapter::new(
            TaskId::from("t"),
            Instance::new(String::from("writer 'scripted'"), writer),
            settings,
            backlog,
        );
        let (tx, events) = mpsc::unbounded_channel();
        let health = HealthTracker::new(TaskId::from("t"), 100, tx, CancellationToken::new());
        health.started();
        let fixture = Fixture {
            failures,
            healthy,
            written,
            health,
            events,
        };
        (adapter, fixture)
    }

    fn batch(name: &str) -> RecordBatch {
        vec![MetricRecord::new(Timestamp::now(), name, 1u64)].into()
    }

    #[tokio::test]
    async fn retried_until_written() {
        let (mut adapter, f) = fixture(ExhaustedPolicy::Drop, None);
        *f.failures.lock().unwrap() = 2;
        let delivery = adapter.deliver(batch("a"), &f.health, &CancellationToken::new()).await;
        assert!(matches!(delivery, Delivery::Written { attempts: 3 }));
        assert_eq!(*f.written.lock().unwrap(), vec![(String::from("a"), 3)]);
        assert_eq!(f.health.state(), HealthState::Degraded(2));
        adapter.dispose();
    }

    #[tokio::test]
    async fn exhausted_batches_are_spilled_then_replayed() {
        let tmp = tempfile::tempdir().unwrap();
        let backlog = Backlog::open(tmp.path()).unwrap();
        let (mut adapter, mut f) = fixture(ExhaustedPolicy::Spill, Some(backlog));
        let cancel = CancellationToken::new();

        *f.failures.lock().unwrap() = 3;
        let delivery = adapter.deliver(batch("lost"), &f.health, &cancel).await;
        assert!(matches!(delivery, Delivery::Exhausted));
        let exhausted = std::iter::from_fn(|| f.events.try_recv().ok())
            .filter(|e| matches!(e.kind, HealthEventKind::RetriesExhausted { .. }))
            .count();
        assert_eq!(exhausted, 1);

        // unhealthy: the batch is spilled without any write attempt
        *f.healthy.lock().unwrap() = false;
        let delivery = adapter.deliver(batch("gated"), &f.health, &cancel).await;
        assert!(matches!(delivery, Delivery::Exhausted));
        assert!(f.written.lock().unwrap().is_empty());

        // healthy again: the new batch is written, then the backlog, oldest first
        *f.healthy.lock().unwrap() = true;
        let delivery = adapter.deliver(batch("new"), &f.health, &cancel).await;
        assert!(matches!(delivery, Delivery::Written { attempts: 1 }));
        let names: Vec<String> = f.written.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["new", "lost", "gated"]);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        adapter.dispose();
    }

    #[tokio::test]
    async fn cancelled_during_backoff() {
        let (mut adapter, f) = fixture(ExhaustedPolicy::Drop, None);
        adapter.settings.retry.initial_backoff = Duration::from_secs(60);
        adapter.settings.retry.max_backoff = Duration::from_secs(60);
        *f.failures.lock().unwrap() = 1;
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let delivery = tokio::time::timeout(Duration::from_secs(5), adapter.deliver(batch("a"), &f.health, &cancel))
            .await
            .expect("the backoff must be interrupted");
        assert!(matches!(delivery, Delivery::Interrupted));
        canceller.await.unwrap();
    }
}
