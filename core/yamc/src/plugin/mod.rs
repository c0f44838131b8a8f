//! Plugin descriptors, instances and the plugin registry.
//!
//! There are three kinds of plugins:
//! - providers acquire records, by pull ([`Provider::fetch`]) or push ([`Provider::subscribe`]);
//! - writers persist batches of records ([`Writer::write`]);
//! - collection strategies turn options into a [`SchedulingPolicy`].
//!
//! A plugin is described by a [`PluginDescriptor`]: a name, a version and a factory.
//! Descriptors are registered in a [`PluginRegistry`], which resolves the plugin names
//! found in the configuration into live instances.
//!
//! ## Example
//!
//! ```
//! use yamc::plugin::{Capabilities, PluginDescriptor, PluginRegistry};
//! use yamc::provider::{FetchContext, Provider, ProviderError};
//! use yamc::record::MetricRecord;
//!
//! struct Uptime;
//!
//! impl Provider for Uptime {
//!     fn fetch(&mut self, ctx: &FetchContext) -> Result<Vec<MetricRecord>, ProviderError> {
//!         Ok(vec![MetricRecord::new(ctx.timestamp(), "uptime", 42u64)])
//!     }
//! }
//!
//! let registry = PluginRegistry::with_builtins();
//! registry
//!     .register(PluginDescriptor::provider("uptime", "0.1.0", Capabilities::PULL, |_options| {
//!         Ok(Box::new(Uptime))
//!     }))
//!     .unwrap();
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::sync::Arc;

use crate::provider::Provider;
use crate::task::policy::SchedulingPolicy;
use crate::writer::Writer;

pub(crate) mod call;
mod instance;
mod registry;

pub use instance::{Instance, Lifecycle, ProviderInstance, WriterInstance};
pub use registry::{PluginRegistry, RegistryError, Resolved};

/// The role of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Provider,
    Writer,
    /// A collection strategy, which decides when a task runs.
    Collector,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginKind::Provider => "provider",
            PluginKind::Writer => "writer",
            PluginKind::Collector => "collector",
        };
        f.write_str(s)
    }
}

/// How a provider delivers its records.
///
/// Declared once, when the provider is registered, so that configurations
/// can be validated before any plugin is instantiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub pull: bool,
    pub push: bool,
}

impl Capabilities {
    pub const PULL: Capabilities = Capabilities { pull: true, push: false };
    pub const PUSH: Capabilities = Capabilities { pull: false, push: true };
    pub const PULL_AND_PUSH: Capabilities = Capabilities { pull: true, push: true };
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pull, self.push) {
            (true, true) => f.write_str("pull+push"),
            (true, false) => f.write_str("pull"),
            (false, true) => f.write_str("push"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Options of a plugin instance, taken from the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginOptions(toml::Table);

impl PluginOptions {
    pub fn new(table: toml::Table) -> Self {
        Self(table)
    }

    /// Deserializes the options into the plugin's config structure.
    pub fn deserialize<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let value = toml::Value::Table(self.0.clone());
        value.try_into().context("invalid plugin options")
    }

    /// Builds options from a serializable config structure.
    pub fn serialize<T: Serialize>(config: &T) -> anyhow::Result<Self> {
        match toml::Value::try_from(config).context("could not serialize plugin options")? {
            toml::Value::Table(table) => Ok(Self(table)),
            other => Err(anyhow::anyhow!("plugin options must be a table, not a {}", other.type_str())),
        }
    }

    pub fn table(&self) -> &toml::Table {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A canonical string representation, used to recognize identical options.
    pub(crate) fn fingerprint(&self) -> String {
        self.0.to_string()
    }
}

impl From<toml::Table> for PluginOptions {
    fn from(value: toml::Table) -> Self {
        Self(value)
    }
}

pub type ProviderFactory = Arc<dyn Fn(&PluginOptions) -> anyhow::Result<Box<dyn Provider>> + Send + Sync>;
pub type WriterFactory = Arc<dyn Fn(&PluginOptions) -> anyhow::Result<Box<dyn Writer>> + Send + Sync>;
pub type StrategyFactory = Arc<dyn Fn(&PluginOptions) -> anyhow::Result<SchedulingPolicy> + Send + Sync>;

/// Describes a plugin: kind, name, version and factory.
///
/// Immutable once registered. The factory is called once per instance,
/// that is once per task that uses the plugin (and again when a task is restarted).
#[derive(Clone)]
pub struct PluginDescriptor {
    name: String,
    version: String,
    factory: Factory,
}

#[derive(Clone)]
pub(crate) enum Factory {
    Provider {
        capabilities: Capabilities,
        shareable: bool,
        build: ProviderFactory,
    },
    Writer(WriterFactory),
    Collector(StrategyFactory),
}

impl PluginDescriptor {
    /// Describes a provider with the given capabilities.
    pub fn provider<F>(name: impl Into<String>, version: impl Into<String>, capabilities: Capabilities, factory: F) -> Self
    where
        F: Fn(&PluginOptions) -> anyhow::Result<Box<dyn Provider>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: version.into(),
            factory: Factory::Provider {
                capabilities,
                shareable: false,
                build: Arc::new(factory),
            },
        }
    }

    /// Describes a writer.
    pub fn writer<F>(name: impl Into<String>, version: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginOptions) -> anyhow::Result<Box<dyn Writer>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: version.into(),
            factory: Factory::Writer(Arc::new(factory)),
        }
    }

    /// Describes a collection strategy.
    pub fn collector<F>(name: impl Into<String>, version: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginOptions) -> anyhow::Result<SchedulingPolicy> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: version.into(),
            factory: Factory::Collector(Arc::new(factory)),
        }
    }

    /// Marks a provider as shareable: tasks that resolve it with identical
    /// options get handles to a single instance.
    ///
    /// Has no effect on writers and collection strategies.
    pub fn shareable(mut self) -> Self {
        if let Factory::Provider { shareable, .. } = &mut self.factory {
            *shareable = true;
        }
        self
    }

    pub fn kind(&self) -> PluginKind {
        match self.factory {
            Factory::Provider { .. } => PluginKind::Provider,
            Factory::Writer(_) => PluginKind::Writer,
            Factory::Collector(_) => PluginKind::Collector,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The capabilities of a provider, `None` for other kinds of plugins.
    pub fn capabilities(&self) -> Option<Capabilities> {
        match self.factory {
            Factory::Provider { capabilities, .. } => Some(capabilities),
            _ => None,
        }
    }

    pub fn is_shareable(&self) -> bool {
        matches!(self.factory, Factory::Provider { shareable: true, .. })
    }

    pub(crate) fn factory(&self) -> &Factory {
        &self.factory
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("kind", &self.kind())
            .field("name", &self.name)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}
