//! Writer lanes: one FIFO lane per writer of a task.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::health::HealthTracker;
use crate::record::RecordBatch;
use crate::writer::{Delivery, WriterAdapter};

struct Job {
    batch: RecordBatch,
    /// Receives `true` if the batch has been written.
    done: oneshot::Sender<bool>,
}

/// Feeds one writer, one batch at a time, in submission order.
///
/// Batches submitted concurrently by the dispatcher cannot overtake each other at a writer.
pub(crate) struct Lane {
    tx: Option<mpsc::UnboundedSender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Lane {
    pub fn spawn(adapter: WriterAdapter, health: Arc<HealthTracker>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_lane(adapter, rx, health, cancel));
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queues a batch. The receiver gets `true` once the batch has been written,
    /// and `false` (or an error, if the lane is closed) otherwise.
    pub fn submit(&self, batch: RecordBatch) -> oneshot::Receiver<bool> {
        let (done, rx) = oneshot::channel();
        if let Some(tx) = &self.tx {
            // if the lane has stopped, the job is dropped and so is `done`
            let _ = tx.send(Job { batch, done });
        }
        rx
    }

    /// Waits for the queued batches to be processed, then disposes the writer.
    pub async fn close(mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("A writer lane failed: {e}");
            }
        }
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        // Not closed gracefully: the task is being aborted.
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run_lane(
    mut adapter: WriterAdapter,
    mut rx: mpsc::UnboundedReceiver<Job>,
    health: Arc<HealthTracker>,
    cancel: CancellationToken,
) {
    while let Some(job) = rx.recv().await {
        let delivery = adapter.deliver(job.batch, &health, &cancel).await;
        let written = matches!(delivery, Delivery::Written { .. });
        let _ = job.done.send(written);
        if let Delivery::Failed(e) = delivery {
            log::error!("{} of task {} failed: {}", adapter.label(), health.task(), e);
            health.quarantine(e);
            break;
        }
    }
    // refuse the remaining jobs
    rx.close();
    // `close()` may block
    let label = adapter.label().to_owned();
    if let Err(e) = tokio::task::spawn_blocking(move || adapter.dispose()).await {
        log::error!("Error while disposing {label} of task {}: {e}", health.task());
    }
}
