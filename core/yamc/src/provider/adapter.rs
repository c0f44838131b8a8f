use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Emitter, FetchContext, ProviderError};
use crate::plugin::call::{CallError, call_blocking};
use crate::plugin::{Capabilities, ProviderInstance};
use crate::record::MetricRecord;

/// Wraps a provider instance for a collector task.
///
/// Every call to the plugin runs on the blocking thread pool and can be abandoned
/// if the plugin does not return within the cancellation grace period after a cancellation.
pub(crate) struct ProviderAdapter {
    label: String,
    capabilities: Capabilities,
    instance: Option<ProviderInstance>,
    subscribed: bool,
    cancel_grace: Duration,
}

/// A call to the provider failed.
#[derive(Debug)]
pub(crate) enum FetchFailure {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
    /// Cancellation was requested and the provider did not return in time.
    Unresponsive,
}

impl From<CallError> for FetchFailure {
    fn from(value: CallError) -> Self {
        match value {
            CallError::Panicked(msg) => FetchFailure::Permanent(anyhow::anyhow!("panicked: {msg}")),
            CallError::Unresponsive => FetchFailure::Unresponsive,
            CallError::Unavailable => {
                FetchFailure::Permanent(anyhow::anyhow!("instance unavailable after an abandoned call"))
            }
        }
    }
}

impl From<ProviderError> for FetchFailure {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Transient(e) => FetchFailure::Transient(e),
            ProviderError::Permanent(e) => FetchFailure::Permanent(e),
        }
    }
}

impl ProviderAdapter {
    pub fn new(instance: ProviderInstance, capabilities: Capabilities, cancel_grace: Duration) -> Self {
        Self {
            label: instance.label().to_owned(),
            capabilities,
            instance: Some(instance),
            subscribed: false,
            cancel_grace,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Fetches the current records of the provider.
    pub async fn poll_once(&mut self, ctx: FetchContext) -> Result<Vec<MetricRecord>, FetchFailure> {
        let cancel = ctx.cancellation_token().clone();
        let res = call_blocking(&mut self.instance, &cancel, self.cancel_grace, move |p| p.fetch(&ctx)).await?;
        res.map_err(FetchFailure::from)
    }

    /// Subscribes to the provider: it will push its records through `emitter`.
    pub async fn subscribe(&mut self, emitter: Emitter) -> Result<(), FetchFailure> {
        let cancel = emitter.cancellation_token().clone();
        let res = call_blocking(&mut self.instance, &cancel, self.cancel_grace, move |p| {
            p.subscribe(emitter)
        })
        .await?;
        res.map_err(FetchFailure::from)?;
        self.subscribed = true;
        log::debug!("Subscribed to {}", self.label);
        Ok(())
    }

    /// Unsubscribes from the provider, if needed. Errors are logged.
    ///
    /// The emitter must be closed before calling this method.
    pub async fn unsubscribe(&mut self, cancel: &CancellationToken) {
        if !self.subscribed {
            return;
        }
        self.subscribed = false;
        match call_blocking(&mut self.instance, cancel, self.cancel_grace, |p| p.unsubscribe()).await {
            Ok(Ok(())) => log::debug!("Unsubscribed from {}", self.label),
            Ok(Err(e)) => log::error!("Error while unsubscribing from {}: {e:#}", self.label),
            Err(e) => log::error!("Error while unsubscribing from {}: {:#}", self.label, describe(e)),
        }
    }

    /// Releases the provider. Errors are logged.
    pub fn dispose(mut self) {
        if let Some(instance) = self.instance.take() {
            if let Err(e) = instance.dispose() {
                log::error!("Error while disposing {}: {e:#}", self.label);
            }
        }
    }
}

fn describe(e: CallError) -> anyhow::Error {
    match FetchFailure::from(e) {
        FetchFailure::Transient(e) | FetchFailure::Permanent(e) => e,
        FetchFailure::Unresponsive => anyhow::anyhow!("no response within the cancellation grace period"),
    }
}
