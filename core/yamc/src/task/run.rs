//! Execution of a collector task.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::health::{HealthTracker, Verdict};
use super::lane::Lane;
use super::queue::RecordQueue;
use super::{CronSchedule, ExhaustedPolicy, History, SchedulingPolicy, TaskError, TaskSpec};
use crate::plugin::{Capabilities, PluginKind, PluginRegistry};
use crate::provider::{Emitter, FetchContext, FetchFailure, ProviderAdapter};
use crate::record::{RecordBatch, Timestamp};
use crate::writer::{Backlog, WriterAdapter, WriterSettings};

/// Everything a task needs to run.
pub(crate) struct TaskContext {
    pub spec: Arc<TaskSpec>,
    pub registry: Arc<PluginRegistry>,
    pub health: Arc<HealthTracker>,
    pub history: Arc<History>,
    /// Graceful stop: no new cycle, unsubscribe, write what remains in the queue.
    pub stop: CancellationToken,
    /// Aborts the in-flight plugin calls. Also cancelled when the task is quarantined.
    pub cancel: CancellationToken,
}

/// Runs a task until it is stopped or quarantined.
pub(crate) async fn run_task(ctx: TaskContext) {
    let TaskContext {
        spec,
        registry,
        health,
        history,
        stop,
        cancel,
    } = ctx;

    let resolved = {
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || resolve(&spec, &registry)).await
    };
    let (providers, writers) = match resolved {
        Ok(Ok(elements)) => elements,
        Ok(Err(e)) => {
            health.quarantine(e);
            return;
        }
        Err(e) => {
            health.quarantine(TaskError::Panicked(e.to_string()));
            return;
        }
    };
    health.started();
    log::debug!(
        "Task {} started with {} provider(s) and {} writer(s)",
        spec.id,
        providers.len(),
        writers.len()
    );

    let queue = Arc::new(RecordQueue::new(spec.queue_capacity, spec.overflow));
    let lanes = writers
        .into_iter()
        .map(|w| Lane::spawn(w, health.clone(), cancel.clone()))
        .collect();
    let mut runner = Runner {
        spec,
        health,
        history,
        queue,
        providers,
        lanes,
        stop,
        cancel,
    };
    let mut in_flight = JoinSet::new();
    match runner.spec.policy.clone() {
        SchedulingPolicy::FixedInterval(period) => runner.run_interval(period).await,
        SchedulingPolicy::Cron(schedule) => runner.run_cron(&schedule).await,
        SchedulingPolicy::EventDriven => runner.run_events(&mut in_flight).await,
    }
    runner.finish(in_flight).await;
}

/// Instantiates the plugins of the task. Blocking.
fn resolve(spec: &TaskSpec, registry: &PluginRegistry) -> Result<(Vec<ProviderAdapter>, Vec<WriterAdapter>), TaskError> {
    let mut providers = Vec::with_capacity(spec.providers.len());
    for p in &spec.providers {
        let instance = registry.resolve_provider(&p.plugin, &p.options)?;
        let capabilities = registry
            .descriptor(PluginKind::Provider, &p.plugin)
            .and_then(|d| d.capabilities())
            .unwrap_or(Capabilities::PULL);
        providers.push(ProviderAdapter::new(instance, capabilities, spec.cancel_grace));
    }

    let settings = WriterSettings::from_spec(spec);
    let mut writers = Vec::with_capacity(spec.writers.len());
    for (i, w) in spec.writers.iter().enumerate() {
        let instance = registry.resolve_writer(&w.plugin, &w.options)?;
        let backlog = match (&spec.backlog_dir, spec.on_retries_exhausted) {
            (Some(root), ExhaustedPolicy::Spill) => {
                let dir = root
                    .join(path_component(spec.id.as_str()))
                    .join(format!("{i}_{}", path_component(&w.plugin)));
                let backlog = Backlog::open(dir).map_err(|source| TaskError::Backlog {
                    element: instance.label().to_owned(),
                    source,
                })?;
                Some(backlog)
            }
            _ => None,
        };
        writers.push(WriterAdapter::new(spec.id.clone(), instance, settings.clone(), backlog));
    }
    Ok((providers, writers))
}

/// Replaces the characters that are not safe in a file name.
fn path_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

struct Runner {
    spec: Arc<TaskSpec>,
    health: Arc<HealthTracker>,
    history: Arc<History>,
    queue: Arc<RecordQueue>,
    providers: Vec<ProviderAdapter>,
    lanes: Vec<Lane>,
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl Runner {
    /// Takes a batch from the queue and submits it to every writer lane.
    ///
    /// Returns `None` if the queue is empty. The returned future resolves to `true`
    /// if every writer has written the batch.
    fn dispatch(&self) -> Option<impl Future<Output = bool> + Send + 'static> {
        let dropped = self.queue.take_dropped();
        if dropped > 0 {
            log::warn!(
                "Task {}: the queue is full, {dropped} records dropped ({:?} policy)",
                self.spec.id,
                self.queue.policy()
            );
        }
        let records = self.queue.take_batch(self.spec.batch_size);
        if records.is_empty() {
            return None;
        }
        let batch: RecordBatch = records.into();
        let receivers: Vec<_> = self.lanes.iter().map(|lane| lane.submit(batch.clone())).collect();
        let history = self.history.clone();
        Some(async move {
            let results = join_all(receivers).await;
            let written = results.into_iter().all(|r| r.unwrap_or(false));
            if written {
                history.extend(&batch);
            }
            written
        })
    }

    async fn run_interval(&mut self, period: Duration) {
        let mut tick = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(tick) => (),
            }
            if self.cycle().await {
                self.health.success();
            }
            if self.cancel.is_cancelled() {
                break;
            }
            let (next, skipped) = next_tick(tick, period, Instant::now());
            if skipped > 0 {
                log::debug!(
                    "Task {}: the cycle took longer than the interval ({period:?}), {skipped} tick(s) skipped",
                    self.spec.id
                );
            }
            tick = next;
        }
    }

    /// Runs a cycle at each occurrence of the schedule, in local time.
    async fn run_cron(&mut self, schedule: &CronSchedule) {
        let mut previous = None;
        loop {
            let now = chrono::Local::now();
            // the wall clock may lag behind the timer: never run the same occurrence twice
            let from = previous.map_or(now, |p| now.max(p));
            let Some(next) = schedule.next_after(&from) else {
                log::warn!("Task {}: the cron expression '{schedule}' has no upcoming occurrence", self.spec.id);
                break;
            };
            previous = Some(next);
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            log::debug!("Task {}: next cycle at {next}", self.spec.id);
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => (),
            }
            if self.cycle().await {
                self.health.success();
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
    }

    /// Fetch, enqueue, dispatch. Returns `true` if the cycle succeeded.
    async fn cycle(&mut self) -> bool {
        let ctx = FetchContext::new(self.spec.id.clone(), Timestamp::now(), self.cancel.clone());
        let results = join_all(self.providers.iter_mut().map(|p| p.poll_once(ctx.clone()))).await;

        let mut success = true;
        let mut fetched = Vec::with_capacity(results.len());
        for (provider, res) in self.providers.iter().zip(results) {
            match res {
                Ok(records) => fetched.push(records),
                Err(FetchFailure::Transient(e)) => {
                    log::warn!("{} of task {}: {e:#}", provider.label(), self.spec.id);
                    success = false;
                    if self.health.transient_failure(&e) == Verdict::Quarantined {
                        return false;
                    }
                }
                Err(FetchFailure::Permanent(source)) => {
                    let element = provider.label().to_owned();
                    self.health.quarantine(TaskError::Provider { element, source });
                    return false;
                }
                Err(FetchFailure::Unresponsive) => {
                    let element = provider.label().to_owned();
                    let grace = self.spec.cancel_grace;
                    self.health.quarantine(TaskError::CancellationTimeout { element, grace });
                    return false;
                }
            }
        }

        let mut deliveries = Vec::new();
        for records in fetched {
            let mut pending = VecDeque::from(records);
            while !pending.is_empty() {
                if self.queue.offer(&mut pending).is_err() {
                    break;
                }
                if !pending.is_empty() {
                    // the queue is full (block policy): dispatch before enqueuing more
                    match self.dispatch() {
                        Some(delivery) => deliveries.push(delivery),
                        None => break,
                    }
                }
            }
        }
        while let Some(delivery) = self.dispatch() {
            deliveries.push(delivery);
        }
        let written = join_all(deliveries).await.into_iter().all(|w| w);
        success && written
    }

    async fn run_events(&mut self, in_flight: &mut JoinSet<()>) {
        if !self.subscribe_all().await {
            return;
        }

        let permits = Arc::new(Semaphore::new(self.spec.max_concurrency.max(1)));
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = self.queue.readable() => (),
            }
            let Some(delivery) = self.dispatch() else {
                continue;
            };
            let health = self.health.clone();
            in_flight.spawn(async move {
                if delivery.await {
                    health.success();
                }
                drop(permit);
            });
            while let Some(res) = in_flight.try_join_next() {
                if let Err(e) = res {
                    log::error!("A delivery of task {} failed: {e}", self.spec.id);
                }
            }
        }
    }

    /// Subscribes to every provider.
    ///
    /// A transient failure degrades the task, and the subscription is attempted again
    /// after the backoff of the retry policy. Returns `false` if the task must not go on:
    /// it has been quarantined or stopped in the meantime.
    async fn subscribe_all(&mut self) -> bool {
        for provider in &mut self.providers {
            let mut attempt = 0;
            loop {
                let emitter = Emitter::new(self.queue.clone(), self.cancel.clone());
                let element = provider.label().to_owned();
                let error = match provider.subscribe(emitter).await {
                    Ok(()) => {
                        if attempt > 0 {
                            self.health.recovered();
                        }
                        break;
                    }
                    Err(FetchFailure::Transient(e)) => {
                        log::warn!("{element} of task {}: subscription failed: {e:#}", self.spec.id);
                        if self.health.transient_failure(&e) == Verdict::Quarantined {
                            return false;
                        }
                        attempt += 1;
                        let delay = self.spec.retry.backoff(attempt);
                        tokio::select! {
                            biased;
                            _ = self.stop.cancelled() => return false,
                            _ = self.cancel.cancelled() => return false,
                            _ = tokio::time::sleep(delay) => (),
                        }
                        continue;
                    }
                    Err(FetchFailure::Permanent(source)) => TaskError::Provider { element, source },
                    Err(FetchFailure::Unresponsive) => TaskError::CancellationTimeout {
                        element,
                        grace: self.spec.cancel_grace,
                    },
                };
                self.health.quarantine(error);
                return false;
            }
        }
        true
    }

    /// Stops the providers, writes the records that remain in the queue
    /// (unless the task has been cancelled), then disposes every plugin.
    async fn finish(mut self, mut in_flight: JoinSet<()>) {
        self.queue.close();
        for provider in &mut self.providers {
            provider.unsubscribe(&self.cancel).await;
        }

        let mut deliveries = Vec::new();
        while !self.cancel.is_cancelled() {
            match self.dispatch() {
                Some(delivery) => deliveries.push(delivery),
                None => break,
            }
        }
        let left = self.queue.len();
        if left > 0 {
            log::warn!("Task {}: {left} queued records discarded", self.spec.id);
        }
        join_all(deliveries).await;
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                log::error!("A delivery of task {} failed: {e}", self.spec.id);
            }
        }

        for lane in self.lanes.drain(..) {
            lane.close().await;
        }
        let providers = std::mem::take(&mut self.providers);
        let disposal = tokio::task::spawn_blocking(move || providers.into_iter().for_each(ProviderAdapter::dispose));
        if let Err(e) = disposal.await {
            log::error!("Error while disposing the providers of task {}: {e}", self.spec.id);
        }
        self.health.stopped();
        log::debug!("Task {} finished: {}", self.spec.id, self.health.state());
    }
}

/// The tick that follows `tick` on the grid `tick + k * period`.
///
/// Ticks that are already past at `now` are skipped, never caught up.
/// Returns the next tick and the number of skipped ticks.
fn next_tick(tick: Instant, period: Duration, now: Instant) -> (Instant, u32) {
    let next = tick + period;
    if next >= now {
        return (next, 0);
    }
    let late = now.duration_since(tick).as_nanos() / period.as_nanos().max(1);
    let skipped = u32::try_from(late).unwrap_or(u32::MAX);
    let next = tick
        .checked_add(period.saturating_mul(skipped.saturating_add(1)))
        .unwrap_or(now + period);
    (next, skipped)
}
