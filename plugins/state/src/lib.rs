//! State objects: a writer that keeps the last record of each topic,
//! and a provider that reads them or follows their updates.
//!
//! The `state` writer and the `state` provider are linked by the `name` of the state object.
//! A task can thus react to what another task wrote.
//!
//! ```toml
//! [[tasks]]
//! id = "sensors"
//! schedule = { strategy = "interval", every = "10s" }
//! providers = [{ plugin = "procfs-loadavg" }]
//! writers = [{ plugin = "state", name = "host" }]
//!
//! [[tasks]]
//! id = "alerts"
//! schedule = { strategy = "event" }
//! providers = [{ plugin = "state", name = "host", topics = ["load_1m"] }]
//! writers = [{ plugin = "csv", path = "alerts.csv" }]
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use yamc::plugin::{Capabilities, PluginDescriptor};
use yamc::provider::{Emitter, FetchContext, Provider, ProviderError};
use yamc::writer::{WriteContext, Writer, WriterError};
use yamc::{MetricRecord, Timestamp};

mod store;

pub use store::{State, StateStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The descriptors of the state plugins, bound to `store`.
pub fn plugins(store: &StateStore) -> Vec<PluginDescriptor> {
    let writer_store = store.clone();
    let provider_store = store.clone();
    vec![
        PluginDescriptor::writer("state", VERSION, move |options| {
            let config: WriterConfig = options.deserialize()?;
            Ok(Box::new(StateWriter {
                state: writer_store.get_or_create(&config.name),
            }))
        }),
        PluginDescriptor::provider("state", VERSION, Capabilities::PULL_AND_PUSH, move |options| {
            let config: ProviderConfig = options.deserialize()?;
            Ok(Box::new(StateProvider {
                state: provider_store.get_or_create(&config.name),
                topics: config.topics,
                subscription: None,
            }))
        }),
    ]
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WriterConfig {
    /// Name of the state object.
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderConfig {
    name: String,
    /// Topics to read, every topic if empty.
    #[serde(default)]
    topics: Vec<String>,
}

/// Stores the records in a state object.
pub struct StateWriter {
    state: Arc<State>,
}

impl Writer for StateWriter {
    fn write(&mut self, batch: &[MetricRecord], _ctx: &WriteContext) -> Result<(), WriterError> {
        log::debug!("Writing {} records to the state object '{}'", batch.len(), self.state.name());
        self.state.update(batch);
        Ok(())
    }
}

/// Reads a state object (pull), or follows its updates (push).
pub struct StateProvider {
    state: Arc<State>,
    topics: Vec<String>,
    subscription: Option<u64>,
}

impl Provider for StateProvider {
    fn fetch(&mut self, ctx: &FetchContext) -> Result<Vec<MetricRecord>, ProviderError> {
        let records = self
            .state
            .snapshot(&self.topics)
            .into_iter()
            .map(|r| resample(r, ctx.timestamp(), self.state.name()))
            .collect();
        Ok(records)
    }

    fn subscribe(&mut self, emitter: Emitter) -> Result<(), ProviderError> {
        if let Some(previous) = self.subscription.take() {
            self.state.unsubscribe(previous);
        }
        self.subscription = Some(self.state.subscribe(self.topics.clone(), emitter));
        Ok(())
    }

    fn unsubscribe(&mut self) -> anyhow::Result<()> {
        if let Some(id) = self.subscription.take() {
            self.state.unsubscribe(id);
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.unsubscribe()
    }
}

/// The last value of a topic, observed at `timestamp`.
fn resample(record: MetricRecord, timestamp: Timestamp, state: &str) -> MetricRecord {
    let tags: Vec<(String, String)> = record
        .tags()
        .iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    MetricRecord::new(timestamp, record.name(), record.value().clone())
        .with_tags(tags)
        .with_tag("state", state.to_owned())
}
