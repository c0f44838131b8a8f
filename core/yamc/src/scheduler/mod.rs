//! The scheduling core: runs the collector tasks, supervises them and shuts them down.
//!
//! ## Example
//!
//! ```no_run
//! use yamc::config::CollectorConfig;
//! use yamc::observe::LogObserver;
//! use yamc::plugin::PluginRegistry;
//! use yamc::scheduler::Scheduler;
//!
//! let config = CollectorConfig::from_toml(&std::fs::read_to_string("yamc.toml").unwrap()).unwrap();
//! let running = Scheduler::new(PluginRegistry::with_builtins())
//!     .add_observer(LogObserver)
//!     .start(&config)
//!     .unwrap();
//! running.wait_for_shutdown();
//! let report = running.stop();
//! assert!(!report.is_truncated());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CollectorConfig, ConfigurationError};
use crate::observe::{HealthObserver, ObserverHub};
use crate::plugin::PluginRegistry;
use crate::plugin::call::panic_message;
use crate::record::{MetricRecord, Timestamp};
use crate::task::health::HealthTracker;
use crate::task::run::{TaskContext, run_task};
use crate::task::{History, TaskError, TaskId, TaskSpec};
use crate::task::{HealthEvent, HealthEventKind, HealthState};


/// Settings of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Number of worker threads of the runtime. Defaults to the number of CPUs.
    pub worker_threads: Option<usize>,
    /// How long the tasks get to finish their cycle and write their queue, after a stop request.
    pub grace_period: Duration,
    /// After this delay (measured from the stop request), the remaining tasks are aborted.
    pub hard_timeout: Duration,
    /// Capacity of the channel that feeds the health observers.
    pub observer_channel_size: usize,
    /// Where writers spill the batches they could not write.
    pub backlog_dir: Option<PathBuf>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_threads: None,
            grace_period: Duration::from_secs(5),
            hard_timeout: Duration::from_secs(15),
            observer_channel_size: 256,
            backlog_dir: None,
        }
    }
}

/// Error that prevents the scheduler from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("could not start the scheduler threads")]
    Runtime(#[source] std::io::Error),
}

/// Builds and starts the scheduling core.
pub struct Scheduler {
    registry: Arc<PluginRegistry>,
    settings: SchedulerSettings,
    observers: Vec<Box<dyn HealthObserver>>,
}

impl Scheduler {
    pub fn new(registry: PluginRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            settings: SchedulerSettings::default(),
            observers: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Adds an observer of the health events.
    pub fn add_observer(mut self, observer: impl HealthObserver) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Validates the configuration and starts every enabled task.
    ///
    /// Fails if the configuration is invalid. Errors that occur while initializing the plugins
    /// of a task only quarantine that task.
    pub fn start(self, config: &CollectorConfig) -> Result<RunningScheduler, StartError> {
        let specs = config.validate(&self.registry, self.settings.backlog_dir.as_deref())?;
        let runtime = build_runtime(self.settings.worker_threads).map_err(StartError::Runtime)?;
        let hub = ObserverHub::spawn(self.observers, self.settings.observer_channel_size).map_err(StartError::Runtime)?;

        let mut entries = BTreeMap::new();
        let mut histories = BTreeMap::new();
        let mut tasks = BTreeMap::new();
        for spec in specs {
            entries.insert(spec.id.clone(), TaskEntry::default());
            histories.insert(spec.id.clone(), Arc::new(History::new(spec.max_history)));
            tasks.insert(spec.id.clone(), Arc::new(spec));
        }
        log::info!("Starting {} collector task(s)", tasks.len());

        let control = SchedulerControl {
            requested: CancellationToken::new(),
            entries: Arc::new(Mutex::new(entries)),
            histories: Arc::new(histories),
        };
        let stop = CancellationToken::new();
        let idle = CancellationToken::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            registry: self.registry,
            tasks,
            control: control.clone(),
            events_tx,
            events,
            hub,
            runs: JoinSet::new(),
            running: HashMap::new(),
            stop: stop.clone(),
            cancel: CancellationToken::new(),
            idle: idle.clone(),
            grace_period: self.settings.grace_period,
            hard_timeout: self.settings.hard_timeout.max(self.settings.grace_period),
        };
        let supervisor = runtime.spawn(supervisor.run());
        Ok(RunningScheduler {
            runtime,
            supervisor,
            control,
            stop,
            idle,
        })
    }
}

fn build_runtime(worker_threads: Option<usize>) -> std::io::Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name_fn(|| {
        static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
        let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
        format!("yamc-worker-{id}")
    });
    if let Some(n) = worker_threads {
        builder.worker_threads(n);
    }
    builder.build()
}

/// The status of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub state: HealthState,
    /// Number of automatic restarts.
    pub restarts: u32,
    /// Number of successful cycles, across restarts.
    pub successes: u64,
}

struct TaskEntry {
    state: HealthState,
    restarts: u32,
    successes: Arc<AtomicU64>,
}

impl Default for TaskEntry {
    fn default() -> Self {
        Self {
            state: HealthState::Starting,
            restarts: 0,
            successes: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl TaskEntry {
    fn status(&self) -> TaskStatus {
        TaskStatus {
            state: self.state.clone(),
            restarts: self.restarts,
            successes: self.successes.load(Ordering::Relaxed),
        }
    }
}

/// Queries the scheduler and requests its shutdown. Can be cloned and sent to other threads.
#[derive(Clone)]
pub struct SchedulerControl {
    requested: CancellationToken,
    entries: Arc<Mutex<BTreeMap<TaskId, TaskEntry>>>,
    histories: Arc<BTreeMap<TaskId, Arc<History>>>,
}

impl SchedulerControl {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<TaskId, TaskEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The status of every started task.
    pub fn status(&self) -> BTreeMap<TaskId, TaskStatus> {
        self.lock().iter().map(|(id, e)| (id.clone(), e.status())).collect()
    }

    /// The status of one task.
    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.lock().get(id).map(TaskEntry::status)
    }

    /// The last records written by a task (see the `max_history` option).
    pub fn history(&self, id: &str) -> Option<Vec<MetricRecord>> {
        self.histories.get(id).map(|h| h.snapshot())
    }

    /// Makes [`RunningScheduler::wait_for_shutdown`] return.
    pub fn request_stop(&self) {
        self.requested.cancel();
    }
}

/// Why [`RunningScheduler::wait_for_shutdown`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ctrl+C or SIGINT.
    Signal,
    /// [`SchedulerControl::request_stop`] has been called.
    Requested,
    /// Every task has ended, by quarantine, and no restart is pending.
    AllTasksEnded,
}

/// What happened during the shutdown.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// The final status of every task.
    pub tasks: BTreeMap<TaskId, TaskStatus>,
    /// Tasks that did not finish within the grace period, and whose plugin calls were cancelled.
    pub cancelled_after_grace: Vec<TaskId>,
    /// Tasks that were still alive at the hard timeout, and had to be aborted.
    pub forced: Vec<TaskId>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Returns `true` if some tasks had to be aborted.
    pub fn is_truncated(&self) -> bool {
        !self.forced.is_empty()
    }

    /// Returns `true` if there is at least one task, and every task has been quarantined
    /// without completing a single successful cycle.
    pub fn all_quarantined_without_success(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .values()
                .all(|s| s.state.is_quarantined() && s.successes == 0)
    }
}

/// The scheduler, running.
///
/// Call [`stop`](Self::stop) to shut it down gracefully.
pub struct RunningScheduler {
    runtime: Runtime,
    supervisor: JoinHandle<(ShutdownReport, ObserverHub)>,
    control: SchedulerControl,
    stop: CancellationToken,
    idle: CancellationToken,
}

impl RunningScheduler {
    pub fn control(&self) -> SchedulerControl {
        self.control.clone()
    }

    pub fn status(&self) -> BTreeMap<TaskId, TaskStatus> {
        self.control.status()
    }

    pub fn history(&self, id: &str) -> Option<Vec<MetricRecord>> {
        self.control.history(id)
    }

    /// Blocks until Ctrl+C, a stop request, or the end of every task.
    pub fn wait_for_shutdown(&self) -> StopReason {
        self.runtime.block_on(async {
            let signal = async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => log::info!("Ctrl+C received, shutting down..."),
                    Err(e) => {
                        log::error!("Cannot listen to Ctrl+C: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            };
            tokio::select! {
                _ = signal => StopReason::Signal,
                _ = self.control.requested.cancelled() => StopReason::Requested,
                _ = self.idle.cancelled() => StopReason::AllTasksEnded,
            }
        })
    }

    /// Stops every task and waits for them, within the limits of the grace period and hard timeout.
    pub fn stop(self) -> ShutdownReport {
        log::info!("Stopping the collector tasks...");
        self.stop.cancel();
        let report = match self.runtime.block_on(self.supervisor) {
            Ok((report, hub)) => {
                hub.close();
                report
            }
            Err(e) => {
                log::error!("The supervisor of the tasks failed: {e}");
                ShutdownReport {
                    tasks: self.control.status(),
                    ..Default::default()
                }
            }
        };
        // Abandoned plugin calls may still be running on blocking threads: don't wait for them.
        self.runtime.shutdown_timeout(Duration::from_millis(500));
        report
    }
}

/// Runs the tasks, tracks their health and restarts them when needed.
struct Supervisor {
    registry: Arc<PluginRegistry>,
    tasks: BTreeMap<TaskId, Arc<TaskSpec>>,
    control: SchedulerControl,
    events_tx: mpsc::UnboundedSender<HealthEvent>,
    events: mpsc::UnboundedReceiver<HealthEvent>,
    hub: ObserverHub,
    /// Runs of the tasks, including the delayed ones (pending restarts).
    runs: JoinSet<TaskId>,
    running: HashMap<tokio::task::Id, TaskId>,
    /// Graceful stop of every task.
    stop: CancellationToken,
    /// Parent of the cancellation token of every run.
    cancel: CancellationToken,
    /// Cancelled when every task has ended.
    idle: CancellationToken,
    grace_period: Duration,
    hard_timeout: Duration,
}

impl Supervisor {
    async fn run(mut self) -> (ShutdownReport, ObserverHub) {
        let ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        for id in ids {
            self.spawn_run(id, None);
        }

        loop {
            if self.runs.is_empty() {
                // No task is running, and no task can be restarted.
                self.idle.cancel();
            }
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(event) = self.events.recv() => self.on_event(event),
                Some(res) = self.runs.join_next_with_id(), if !self.runs.is_empty() => self.on_run_finished(res),
            }
        }
        let report = self.shutdown().await;
        (report, self.hub)
    }

    fn spawn_run(&mut self, id: TaskId, delay: Option<Duration>) {
        let Some(spec) = self.tasks.get(&id).cloned() else {
            return;
        };
        let (successes, history) = {
            let entries = self.control.lock();
            let successes = entries.get(&id).map(|e| e.successes.clone()).unwrap_or_default();
            let history = self.control.histories.get(&id).cloned();
            (successes, history.unwrap_or_else(|| Arc::new(History::new(0))))
        };
        let registry = self.registry.clone();
        let events = self.events_tx.clone();
        let stop = self.stop.clone();
        let cancel = self.cancel.child_token();
        let task_id = id.clone();

        let run = async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => (),
                    _ = stop.cancelled() => return task_id,
                }
            }
            let health = HealthTracker::new(task_id.clone(), spec.quarantine_threshold, events, cancel.clone())
                .with_success_counter(successes);
            let ctx = TaskContext {
                spec,
                registry,
                health: Arc::new(health),
                history,
                stop,
                cancel,
            };
            run_task(ctx).await;
            task_id
        };
        let handle = self.runs.spawn(run);
        self.running.insert(handle.id(), id);
    }

    fn on_event(&mut self, event: HealthEvent) {
        if !self.running.values().any(|id| *id == event.task) {
            log::trace!("ignoring a late event of task {}: {:?}", event.task, event.kind);
            return;
        }
        if event.kind == HealthEventKind::Transition {
            if let Some(entry) = self.control.lock().get_mut(&event.task) {
                entry.state = event.state.clone();
            }
        }
        self.hub.notify(event);
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.on_event(event);
        }
    }

    fn on_run_finished(&mut self, res: Result<(tokio::task::Id, TaskId), JoinError>) {
        // the events of the run have been sent before the end of the run
        self.drain_events();
        let id = match res {
            Ok((tokio_id, id)) => {
                self.running.remove(&tokio_id);
                id
            }
            Err(e) => {
                let Some(id) = self.running.remove(&e.id()) else {
                    return;
                };
                let error = if e.is_panic() {
                    TaskError::Panicked(panic_message(e.into_panic().as_ref()))
                } else {
                    TaskError::ForcedTermination
                };
                self.force_quarantine(&id, error);
                id
            }
        };
        if !self.stop.is_cancelled() {
            self.restart_if_needed(id);
        }
    }

    /// Quarantines a task whose run did not end normally.
    fn force_quarantine(&mut self, id: &TaskId, error: TaskError) {
        let reason = error.describe();
        let state = HealthState::Quarantined {
            reason: reason.clone(),
            since: Timestamp::now(),
        };
        {
            let mut entries = self.control.lock();
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            if entry.state.is_terminal() {
                return;
            }
            entry.state = state.clone();
        }
        self.hub.notify(HealthEvent {
            task: id.clone(),
            kind: HealthEventKind::Transition,
            state,
            timestamp: Timestamp::now(),
            detail: Some(reason),
        });
    }

    fn restart_if_needed(&mut self, id: TaskId) {
        let Some(policy) = self.tasks.get(&id).and_then(|spec| spec.restart) else {
            return;
        };
        let (restart, state) = {
            let mut entries = self.control.lock();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            if !entry.state.is_quarantined() {
                return;
            }
            if entry.restarts >= policy.max_restarts {
                log::warn!("Task {id} has been restarted {} times, it will not be restarted again", entry.restarts);
                return;
            }
            entry.restarts += 1;
            (entry.restarts, entry.state.clone())
        };
        let delay = policy.delay(restart);
        self.hub.notify(HealthEvent {
            task: id.clone(),
            kind: HealthEventKind::Restarting { restart, delay },
            state,
            timestamp: Timestamp::now(),
            detail: None,
        });
        self.spawn_run(id, Some(delay));
    }

    /// Waits for the runs to finish, until `deadline`. Returns `true` if they all finished.
    async fn wait_runs(&mut self, deadline: Instant) -> bool {
        while !self.runs.is_empty() {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.on_event(event),
                Some(res) = self.runs.join_next_with_id() => self.on_run_finished(res),
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
        true
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        let started = Instant::now();
        let mut report = ShutdownReport::default();
        log::debug!("Waiting for {} task(s) to finish", self.running.len());

        if !self.wait_runs(started + self.grace_period).await {
            report.cancelled_after_grace = self.running_tasks();
            log::warn!(
                "{} task(s) still running after the grace period ({:?}), cancelling them",
                report.cancelled_after_grace.len(),
                self.grace_period
            );
            self.cancel.cancel();
            if !self.wait_runs(started + self.hard_timeout).await {
                report.forced = self.running_tasks();
                log::error!(
                    "{} task(s) still running at the hard timeout ({:?}), aborting them",
                    report.forced.len(),
                    self.hard_timeout
                );
                self.runs.abort_all();
                while let Some(res) = self.runs.join_next_with_id().await {
                    self.on_run_finished(res);
                }
            }
        }
        self.drain_events();
        self.idle.cancel();

        report.tasks = self.control.status();
        report.elapsed = started.elapsed();
        log::info!("All the collector tasks have been stopped in {:?}", report.elapsed);
        report
    }

    fn running_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.running.values().cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
