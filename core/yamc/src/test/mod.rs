//! Scripted plugins, to test the scheduling core, plugins and configurations.
//!
//! Every plugin comes with a probe, which records what the core did with it.
//! The script and the probe are shared by all the instances created by the same descriptor,
//! so that a restarted task continues the script where the previous run stopped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::plugin::{Capabilities, PluginDescriptor};
use crate::provider::{Emitter, FetchContext, FetchRetry, Provider, ProviderError};
use crate::record::{MetricRecord, MetricValue, Timestamp};
use crate::task::TaskId;
use crate::task::queue::{OverflowPolicy, RecordQueue};
use crate::writer::{WriteContext, WriteRetry, Writer, WriterError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Polls `condition` until it returns `true` or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A context to call [`Provider::fetch`] outside of a task.
pub fn fetch_context(task: &str) -> FetchContext {
    FetchContext::new(TaskId::from(task), Timestamp::now(), CancellationToken::new())
}

/// A context to call [`Writer::write`] outside of a task.
pub fn write_context(task: &str) -> WriteContext {
    WriteContext::new(TaskId::from(task), 1, CancellationToken::new())
}

/// Receives what is sent to an [`Emitter`] created by [`emitter`].
pub struct EmitterSink {
    queue: Arc<RecordQueue>,
}

impl EmitterSink {
    /// Takes the records received so far.
    pub fn drain(&self) -> Vec<MetricRecord> {
        self.queue.take_batch(usize::MAX)
    }

    /// Closes the emitter, like a task that unsubscribes.
    pub fn close(&self) {
        self.queue.close();
    }
}

/// Creates an emitter that is not attached to a task, to test push providers.
///
/// The emitter drops the oldest records beyond `capacity`.
pub fn emitter(capacity: usize) -> (Emitter, EmitterSink) {
    emitter_with_policy(capacity, OverflowPolicy::DropOldest)
}

/// Like [`emitter`], with another overflow policy.
pub fn emitter_with_policy(capacity: usize, policy: OverflowPolicy) -> (Emitter, EmitterSink) {
    let queue = Arc::new(RecordQueue::new(capacity, policy));
    let emitter = Emitter::new(queue.clone(), CancellationToken::new());
    (emitter, EmitterSink { queue })
}

/// What a [`ScriptedProvider`] does on `fetch`.
#[derive(Debug, Clone)]
pub enum FetchStep {
    /// Returns this number of records. The values of the records are a sequence
    /// that continues from one fetch to the next.
    Emit(usize),
    Transient,
    Permanent,
    Panic,
    /// Sleeps, ignoring cancellation, then returns one record.
    Block(Duration),
    /// Sleeps until the duration elapses or the task is cancelled, then returns one record.
    Slow(Duration),
}

/// Records the calls made to scripted providers.
#[derive(Debug, Default)]
pub struct ProviderProbe {
    fetches: AtomicUsize,
    closes: AtomicUsize,
    instances: AtomicUsize,
    /// Start and end of each fetch.
    spans: Mutex<Vec<(Instant, Instant)>>,
}

impl ProviderProbe {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of instances closed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of instances created.
    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }

    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        lock(&self.spans).clone()
    }
}

struct ProviderScript {
    steps: VecDeque<FetchStep>,
    fallback: FetchStep,
    next_value: u64,
}

/// A pull provider that follows a script.
pub struct ScriptedProvider {
    name: String,
    script: Arc<Mutex<ProviderScript>>,
    probe: Arc<ProviderProbe>,
}

impl ScriptedProvider {
    /// Describes a pull provider that runs `steps`, then `fallback` forever.
    pub fn descriptor(
        name: &str,
        steps: Vec<FetchStep>,
        fallback: FetchStep,
    ) -> (PluginDescriptor, Arc<ProviderProbe>) {
        let script = Arc::new(Mutex::new(ProviderScript {
            steps: steps.into(),
            fallback,
            next_value: 0,
        }));
        let probe = Arc::new(ProviderProbe::default());
        let descriptor = {
            let probe = probe.clone();
            let name = name.to_owned();
            PluginDescriptor::provider(name.clone(), "0.0.0", Capabilities::PULL, move |_options| {
                probe.instances.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedProvider {
                    name: name.clone(),
                    script: script.clone(),
                    probe: probe.clone(),
                }))
            })
        };
        (descriptor, probe)
    }

    fn records(&self, n: usize, ctx: &FetchContext) -> Vec<MetricRecord> {
        let mut script = lock(&self.script);
        (0..n)
            .map(|_| {
                let value = script.next_value;
                script.next_value += 1;
                MetricRecord::new(ctx.timestamp(), self.name.clone(), value)
            })
            .collect()
    }
}

impl Provider for ScriptedProvider {
    fn fetch(&mut self, ctx: &FetchContext) -> Result<Vec<MetricRecord>, ProviderError> {
        let start = Instant::now();
        self.probe.fetches.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = lock(&self.script);
            let fallback = script.fallback.clone();
            script.steps.pop_front().unwrap_or(fallback)
        };
        let res = match step {
            FetchStep::Emit(n) => Ok(self.records(n, ctx)),
            FetchStep::Transient => Err(std::io::Error::other("source temporarily unavailable")).retry_fetch(),
            FetchStep::Permanent => Err(ProviderError::Permanent(anyhow::anyhow!("source is gone"))),
            FetchStep::Panic => panic!("scripted provider panic"),
            FetchStep::Block(duration) => {
                std::thread::sleep(duration);
                Ok(self.records(1, ctx))
            }
            FetchStep::Slow(duration) => {
                let deadline = Instant::now() + duration;
                while Instant::now() < deadline && !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(self.records(1, ctx))
            }
        };
        lock(&self.probe.spans).push((start, Instant::now()));
        res
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Controls a [`PushProvider`] from the test.
#[derive(Default)]
pub struct PushHandle {
    emitter: Mutex<Option<Emitter>>,
    subscriptions: AtomicUsize,
    unsubscriptions: AtomicUsize,
    closes: AtomicUsize,
    /// Number of subscriptions to refuse with a transient error.
    refused: AtomicUsize,
}

impl PushHandle {
    /// Pushes records through the current subscription, if any.
    ///
    /// Returns `false` if there is no subscription or if it has been closed.
    pub fn emit(&self, records: Vec<MetricRecord>) -> bool {
        let emitter = lock(&self.emitter).clone();
        match emitter {
            Some(emitter) => emitter.emit(records).is_ok(),
            None => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.emitter).as_ref().is_some_and(|e| !e.is_closed())
    }

    /// The next `n` calls to `subscribe` fail with a transient error.
    pub fn refuse_subscriptions(&self, n: usize) {
        self.refused.store(n, Ordering::SeqCst);
    }

    /// Number of accepted subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn unsubscriptions(&self) -> usize {
        self.unsubscriptions.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// A push provider, driven by a [`PushHandle`].
pub struct PushProvider {
    handle: Arc<PushHandle>,
}

impl PushProvider {
    pub fn descriptor(name: &str) -> (PluginDescriptor, Arc<PushHandle>) {
        let handle = Arc::new(PushHandle::default());
        let descriptor = {
            let handle = handle.clone();
            PluginDescriptor::provider(name, "0.0.0", Capabilities::PUSH, move |_options| {
                Ok(Box::new(PushProvider { handle: handle.clone() }))
            })
        };
        (descriptor, handle)
    }
}

impl Provider for PushProvider {
    fn subscribe(&mut self, emitter: Emitter) -> Result<(), ProviderError> {
        let refused = self.handle.refused.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(ProviderError::Transient(anyhow::anyhow!("broker not ready yet")));
        }
        self.handle.subscriptions.fetch_add(1, Ordering::SeqCst);
        *lock(&self.handle.emitter) = Some(emitter);
        Ok(())
    }

    fn unsubscribe(&mut self) -> anyhow::Result<()> {
        self.handle.unsubscriptions.fetch_add(1, Ordering::SeqCst);
        *lock(&self.handle.emitter) = None;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.handle.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a [`RecordingWriter`] does on `write`.
#[derive(Debug, Clone)]
pub enum WriteStep {
    Ok,
    Transient,
    Permanent,
    Panic,
    /// Sleeps, ignoring cancellation, then succeeds.
    Hang(Duration),
}

/// Records the calls made to recording writers.
#[derive(Debug)]
pub struct WriterProbe {
    batches: Mutex<Vec<Vec<MetricRecord>>>,
    attempts: AtomicUsize,
    closes: AtomicUsize,
    healthy: Mutex<bool>,
}

impl Default for WriterProbe {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            healthy: Mutex::new(true),
        }
    }
}

impl WriterProbe {
    /// The batches that have been written successfully.
    pub fn batches(&self) -> Vec<Vec<MetricRecord>> {
        lock(&self.batches).clone()
    }

    /// The records that have been written successfully, in order.
    pub fn records(&self) -> Vec<MetricRecord> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }

    /// The values of the written records, as integers.
    pub fn values(&self) -> Vec<u64> {
        self.records()
            .iter()
            .filter_map(|r| match r.value() {
                MetricValue::U64(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Number of calls to `write`, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Sets the result of the next health checks.
    pub fn set_healthy(&self, healthy: bool) {
        *lock(&self.healthy) = healthy;
    }
}

struct WriterScript {
    steps: VecDeque<WriteStep>,
    fallback: WriteStep,
}

/// A writer that follows a script and records what it writes.
pub struct RecordingWriter {
    script: Arc<Mutex<WriterScript>>,
    probe: Arc<WriterProbe>,
}

impl RecordingWriter {
    /// Describes a writer that runs `steps`, then `fallback` forever.
    pub fn descriptor(name: &str, steps: Vec<WriteStep>, fallback: WriteStep) -> (PluginDescriptor, Arc<WriterProbe>) {
        let script = Arc::new(Mutex::new(WriterScript {
            steps: steps.into(),
            fallback,
        }));
        let probe = Arc::new(WriterProbe::default());
        let descriptor = {
            let probe = probe.clone();
            PluginDescriptor::writer(name, "0.0.0", move |_options| {
                Ok(Box::new(RecordingWriter {
                    script: script.clone(),
                    probe: probe.clone(),
                }))
            })
        };
        (descriptor, probe)
    }

    /// Describes a writer that always succeeds.
    pub fn reliable(name: &str) -> (PluginDescriptor, Arc<WriterProbe>) {
        Self::descriptor(name, Vec::new(), WriteStep::Ok)
    }
}

impl Writer for RecordingWriter {
    fn write(&mut self, batch: &[MetricRecord], _ctx: &WriteContext) -> Result<(), WriterError> {
        self.probe.attempts.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = lock(&self.script);
            let fallback = script.fallback.clone();
            script.steps.pop_front().unwrap_or(fallback)
        };
        match step {
            WriteStep::Ok => (),
            WriteStep::Transient => return Err(std::io::Error::other("backend timeout")).retry_write(),
            WriteStep::Permanent => return Err(WriterError::Permanent(anyhow::anyhow!("backend rejected the batch"))),
            WriteStep::Panic => panic!("scripted writer panic"),
            WriteStep::Hang(duration) => std::thread::sleep(duration),
        }
        lock(&self.probe.batches).push(batch.to_vec());
        Ok(())
    }

    fn healthcheck(&mut self) -> Result<(), WriterError> {
        if *lock(&self.probe.healthy) {
            Ok(())
        } else {
            Err(WriterError::Transient(anyhow::anyhow!("backend unreachable")))
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
