//! Writers persist batches of metric records.
//!
//! All the methods of a writer are called on a thread where blocking is allowed.
//! A writer only receives one batch at a time, and batches arrive in the order of the task queue.
//!
//! Delivery is at-least-once: after an ambiguous failure (for instance a timeout),
//! the same batch can be written again. Writers that care about duplicates must deduplicate.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::record::MetricRecord;
use crate::task::TaskId;

mod adapter;
mod backlog;

pub(crate) use adapter::{Delivery, WriterAdapter, WriterSettings};
pub use backlog::Backlog;

/// Persists metric records.
pub trait Writer: Send {
    /// Writes a batch of records. The batch should be written entirely, or not at all.
    fn write(&mut self, batch: &[MetricRecord], ctx: &WriteContext) -> Result<(), WriterError>;

    /// Checks that the storage backend can be used.
    ///
    /// Called before writing again after a writer exhausted its retries.
    fn healthcheck(&mut self) -> Result<(), WriterError> {
        Ok(())
    }

    /// Releases the resources held by the writer (files, connections). Called exactly once.
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Information about the current write.
#[derive(Debug, Clone)]
pub struct WriteContext {
    task: TaskId,
    attempt: u32,
    cancel: CancellationToken,
}

impl WriteContext {
    pub fn new(task: TaskId, attempt: u32, cancel: CancellationToken) -> Self {
        Self { task, attempt, cancel }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task
    }

    /// The attempt number, starting at 1. Greater than 1 when the batch is retried.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Error which can occur during [`Writer::write`] or [`Writer::healthcheck`].
#[derive(Debug)]
pub enum WriterError {
    /// The error is temporary, writing again may work.
    ///
    /// Use this kind of error when the writer communicates with an external entity
    /// that can fail from time to time, and when `write` can be called again with the same batch.
    Transient(anyhow::Error),
    /// The records could not be written, and the writer cannot be used anymore.
    Permanent(anyhow::Error),
}

impl WriterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WriterError::Transient(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            WriterError::Transient(e) | WriterError::Permanent(e) => e,
        }
    }
}

impl fmt::Display for WriterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterError::Transient(e) => write!(f, "writing failed (but could work later): {e:#}"),
            WriterError::Permanent(e) => write!(f, "permanent writer error: {e:#}"),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for WriterError {
    fn from(value: T) -> Self {
        Self::Permanent(value.into())
    }
}

/// Adds the convenient method `result.retry_write()`.
pub trait WriteRetry<T> {
    fn retry_write(self) -> Result<T, WriterError>;
}

impl<T, E: Into<anyhow::Error>> WriteRetry<T> for Result<T, E> {
    /// Turns the error into [`WriterError::Transient`].
    fn retry_write(self) -> Result<T, WriterError> {
        self.map_err(|e| WriterError::Transient(e.into()))
    }
}
