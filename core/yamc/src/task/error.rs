use std::time::Duration;

use crate::plugin::RegistryError;

/// Error that quarantines a collector task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("initialization failed")]
    Initialization(#[from] RegistryError),
    #[error("could not open the backlog of {element}")]
    Backlog {
        element: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{element} failed permanently")]
    Provider {
        element: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{element} failed permanently")]
    Writer {
        element: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{element} did not return within {grace:?} after cancellation")]
    CancellationTimeout { element: String, grace: Duration },
    #[error("{count} consecutive transient failures, the last one was: {last}")]
    TooManyFailures { count: u32, last: String },
    #[error("the task was still running at the shutdown hard timeout")]
    ForcedTermination,
    #[error("the task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// The full description of the error, including its sources.
    pub fn describe(self) -> String {
        format!("{:#}", anyhow::Error::new(self))
    }
}
