//! Providers acquire metric records from a data source.
//!
//! A provider supports pull, push, or both, as declared by the [`Capabilities`](crate::plugin::Capabilities)
//! of its descriptor:
//! - pull: the collector task calls [`Provider::fetch`] on every tick;
//! - push: the task calls [`Provider::subscribe`] once, and the provider sends
//!   records through the [`Emitter`] whenever it wants, until [`Provider::unsubscribe`].
//!
//! All the methods of a provider are called on a thread where blocking is allowed.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::record::{MetricRecord, Timestamp};
use crate::task::TaskId;

mod adapter;
mod emitter;

pub(crate) use adapter::{FetchFailure, ProviderAdapter};
pub use emitter::{EmitError, Emitter};

/// Produces metric records.
pub trait Provider: Send {
    /// Acquires the current records of the source.
    ///
    /// Long operations should check [`FetchContext::is_cancelled`] regularly.
    fn fetch(&mut self, ctx: &FetchContext) -> Result<Vec<MetricRecord>, ProviderError> {
        let _ = ctx;
        Err(ProviderError::Permanent(anyhow::anyhow!("this provider does not support pull")))
    }

    /// Starts sending records to `emitter`.
    ///
    /// This method should return quickly: spawn a thread or register a callback
    /// that keeps a clone of the emitter.
    fn subscribe(&mut self, emitter: Emitter) -> Result<(), ProviderError> {
        let _ = emitter;
        Err(ProviderError::Permanent(anyhow::anyhow!("this provider does not support push")))
    }

    /// Stops sending records. The emitter is already closed when this is called.
    fn unsubscribe(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Releases the resources held by the provider. Called exactly once.
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Information about the current fetch.
#[derive(Debug, Clone)]
pub struct FetchContext {
    task: TaskId,
    timestamp: Timestamp,
    cancel: CancellationToken,
}

impl FetchContext {
    pub fn new(task: TaskId, timestamp: Timestamp, cancel: CancellationToken) -> Self {
        Self { task, timestamp, cancel }
    }

    /// The task that requested the records.
    pub fn task_id(&self) -> &TaskId {
        &self.task
    }

    /// The time of the tick that triggered this fetch.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns `true` if the task is being cancelled, in which case `fetch` should return as soon as possible.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Error which can occur during [`Provider::fetch`] or [`Provider::subscribe`].
#[derive(Debug)]
pub enum ProviderError {
    /// The records could not be acquired, but trying again later may work.
    ///
    /// The task keeps running, in a degraded state, and tries again on the next tick.
    Transient(anyhow::Error),
    /// The provider cannot be used anymore. Its task is quarantined.
    Permanent(anyhow::Error),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            ProviderError::Transient(e) | ProviderError::Permanent(e) => e,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transient(e) => write!(f, "fetching failed (but could work later): {e:#}"),
            ProviderError::Permanent(e) => write!(f, "permanent provider error: {e:#}"),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for ProviderError {
    fn from(value: T) -> Self {
        Self::Permanent(value.into())
    }
}

/// Adds the convenient method `result.retry_fetch()`.
pub trait FetchRetry<T> {
    fn retry_fetch(self) -> Result<T, ProviderError>;
}

impl<T, E: Into<anyhow::Error>> FetchRetry<T> for Result<T, E> {
    /// Turns the error into [`ProviderError::Transient`].
    fn retry_fetch(self) -> Result<T, ProviderError> {
        self.map_err(|e| ProviderError::Transient(e.into()))
    }
}
