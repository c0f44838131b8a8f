use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::record::MetricRecord;
use crate::task::queue::RecordQueue;

/// Sends pushed records to a collector task.
///
/// The emitter can be cloned and sent to other threads. It stays valid until the task
/// unsubscribes from the provider: from then on, [`Emitter::emit`] returns [`EmitError::Closed`].
#[derive(Clone)]
pub struct Emitter {
    queue: Arc<RecordQueue>,
    cancel: CancellationToken,
}

/// Error returned by [`Emitter::emit`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("the task has unsubscribed from this provider")]
    Closed,
}

impl Emitter {
    pub(crate) fn new(queue: Arc<RecordQueue>, cancel: CancellationToken) -> Self {
        Self { queue, cancel }
    }

    /// Sends records to the task, in one push.
    ///
    /// If the task queue is full, this method waits or drops records,
    /// depending on the overflow policy of the task.
    /// It must therefore be called from a thread where blocking is allowed.
    pub fn emit(&self, records: Vec<MetricRecord>) -> Result<(), EmitError> {
        if records.is_empty() {
            return if self.is_closed() { Err(EmitError::Closed) } else { Ok(()) };
        }
        self.queue
            .push_blocking(records, &self.cancel)
            .map_err(|_| EmitError::Closed)
    }

    /// Sends records to the task, without ever waiting.
    ///
    /// With the `block` overflow policy, the records that don't fit in the queue are given back.
    /// With the other policies, this is the same as [`emit`](Self::emit) and nothing is given back.
    pub fn try_emit(&self, records: Vec<MetricRecord>) -> Result<Vec<MetricRecord>, EmitError> {
        let mut pending = VecDeque::from(records);
        self.queue.offer(&mut pending).map_err(|_| EmitError::Closed)?;
        Ok(pending.into())
    }

    /// Sends one record to the task.
    pub fn emit_one(&self, record: MetricRecord) -> Result<(), EmitError> {
        self.emit(vec![record])
    }

    /// Returns `true` if the task has unsubscribed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Triggered when the task is cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("closed", &self.is_closed()).finish()
    }
}
