use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock, Weak};

use super::call::panic_message;
use super::{Factory, Instance, PluginDescriptor, PluginKind, PluginOptions, ProviderInstance, WriterInstance};
use crate::provider::{Emitter, FetchContext, Provider, ProviderError};
use crate::record::MetricRecord;
use crate::task::policy::SchedulingPolicy;

/// Resolves plugin names into plugin instances.
///
/// The registry is built explicitly and owned by the scheduler (through an `Arc`).
/// It is read-mostly: registration usually happens before the scheduler starts,
/// and concurrent resolutions only take a read lock.
pub struct PluginRegistry {
    entries: RwLock<BTreeMap<(PluginKind, String), Arc<PluginDescriptor>>>,
    /// Live instances of shareable providers, keyed by (name, options).
    shared: Mutex<HashMap<(String, String), Weak<SharedInstance>>>,
}

type SharedInstance = Mutex<ProviderInstance>;

/// Error that can occur when registering or resolving a plugin.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a {kind} named '{name}' is already registered")]
    DuplicateName { kind: PluginKind, name: String },
    #[error("unknown {kind} '{name}'")]
    NotFound { kind: PluginKind, name: String },
    #[error("initialization of {kind} '{name}' failed")]
    Initialization {
        kind: PluginKind,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// The result of [`PluginRegistry::resolve`].
#[derive(Debug)]
pub enum Resolved {
    Provider(ProviderInstance),
    Writer(WriterInstance),
    Collector(SchedulingPolicy),
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            shared: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a registry that contains the built-in collection strategies `interval` and `event`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for descriptor in crate::task::policy::builtin_strategies() {
            registry
                .register(descriptor)
                .expect("built-in strategies have unique names");
        }
        registry
    }

    /// Registers a new plugin.
    ///
    /// Fails if a plugin of the same kind and name is already registered.
    pub fn register(&self, descriptor: PluginDescriptor) -> Result<(), RegistryError> {
        let key = (descriptor.kind(), descriptor.name().to_owned());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&key) {
            let (kind, name) = key;
            return Err(RegistryError::DuplicateName { kind, name });
        }
        log::debug!(
            "Registered {} '{}' v{}",
            descriptor.kind(),
            descriptor.name(),
            descriptor.version()
        );
        entries.insert(key, Arc::new(descriptor));
        Ok(())
    }

    /// Registers multiple plugins, stopping at the first error.
    pub fn register_all(&self, descriptors: impl IntoIterator<Item = PluginDescriptor>) -> Result<(), RegistryError> {
        for d in descriptors {
            self.register(d)?;
        }
        Ok(())
    }

    /// Returns the descriptor of a plugin, if it is registered.
    pub fn descriptor(&self, kind: PluginKind, name: &str) -> Option<Arc<PluginDescriptor>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&(kind, name.to_owned())).cloned()
    }

    /// Lists the registered plugins of the given kind, sorted by name.
    pub fn descriptors(&self, kind: PluginKind) -> Vec<Arc<PluginDescriptor>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Instantiates a plugin of the given kind.
    pub fn resolve(&self, kind: PluginKind, name: &str, options: &PluginOptions) -> Result<Resolved, RegistryError> {
        match kind {
            PluginKind::Provider => self.resolve_provider(name, options).map(Resolved::Provider),
            PluginKind::Writer => self.resolve_writer(name, options).map(Resolved::Writer),
            PluginKind::Collector => self.resolve_strategy(name, options).map(Resolved::Collector),
        }
    }

    /// Instantiates a provider.
    ///
    /// For shareable providers, an existing instance with identical options is reused.
    pub fn resolve_provider(&self, name: &str, options: &PluginOptions) -> Result<ProviderInstance, RegistryError> {
        let descriptor = self.get(PluginKind::Provider, name)?;
        let Factory::Provider { shareable, build, .. } = descriptor.factory() else {
            unreachable!("the descriptor of a provider must have a provider factory");
        };
        let label = format!("provider '{name}'");

        if !shareable {
            let plugin = build_guarded(PluginKind::Provider, name, || build(options))?;
            return Ok(Instance::new(label, plugin));
        }

        let key = (name.to_owned(), options.fingerprint());
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.retain(|_, weak| weak.strong_count() > 0);
        let instance = match shared.get(&key).and_then(Weak::upgrade) {
            Some(existing) => {
                log::debug!("Reusing the shared instance of {label}");
                existing
            }
            None => {
                let plugin = build_guarded(PluginKind::Provider, name, || build(options))?;
                let instance = Arc::new(Mutex::new(Instance::new(label.clone(), plugin)));
                shared.insert(key, Arc::downgrade(&instance));
                instance
            }
        };
        let handle: Box<dyn Provider> = Box::new(SharedProvider { instance });
        Ok(Instance::new(format!("{label} (shared)"), handle))
    }

    /// Instantiates a writer.
    pub fn resolve_writer(&self, name: &str, options: &PluginOptions) -> Result<WriterInstance, RegistryError> {
        let descriptor = self.get(PluginKind::Writer, name)?;
        let Factory::Writer(build) = descriptor.factory() else {
            unreachable!("the descriptor of a writer must have a writer factory");
        };
        let plugin = build_guarded(PluginKind::Writer, name, || build(options))?;
        Ok(Instance::new(format!("writer '{name}'"), plugin))
    }

    /// Turns the options of a collection strategy into a scheduling policy.
    pub fn resolve_strategy(&self, name: &str, options: &PluginOptions) -> Result<SchedulingPolicy, RegistryError> {
        let descriptor = self.get(PluginKind::Collector, name)?;
        let Factory::Collector(build) = descriptor.factory() else {
            unreachable!("the descriptor of a collector must have a strategy factory");
        };
        build_guarded(PluginKind::Collector, name, || build(options))
    }

    /// Releases the resources of a plugin instance.
    ///
    /// Dropping the instance has the same effect, but the error is only logged.
    pub fn dispose<P: ?Sized + super::Lifecycle>(&self, instance: Instance<P>) -> anyhow::Result<()> {
        instance.dispose()
    }

    fn get(&self, kind: PluginKind, name: &str) -> Result<Arc<PluginDescriptor>, RegistryError> {
        self.descriptor(kind, name).ok_or_else(|| RegistryError::NotFound {
            kind,
            name: name.to_owned(),
        })
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Calls a plugin factory, turning errors and panics into [`RegistryError::Initialization`].
fn build_guarded<T>(
    kind: PluginKind,
    name: &str,
    build: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, RegistryError> {
    let res = match catch_unwind(AssertUnwindSafe(build)) {
        Ok(res) => res,
        Err(panic) => Err(anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref()))),
    };
    res.map_err(|source| RegistryError::Initialization {
        kind,
        name: name.to_owned(),
        source,
    })
}

/// A handle to a shared provider instance.
///
/// Calls are serialized. The shared instance is closed when the last handle is dropped.
struct SharedProvider {
    instance: Arc<SharedInstance>,
}

impl SharedProvider {
    fn with<R>(&self, f: impl FnOnce(&mut dyn Provider) -> R) -> R {
        let mut guard = self.instance.lock().unwrap_or_else(|e| e.into_inner());
        f(guard.get_mut())
    }
}

impl Provider for SharedProvider {
    fn fetch(&mut self, ctx: &FetchContext) -> Result<Vec<MetricRecord>, ProviderError> {
        self.with(|p| p.fetch(ctx))
    }

    fn subscribe(&mut self, emitter: Emitter) -> Result<(), ProviderError> {
        self.with(|p| p.subscribe(emitter))
    }

    // Other handles may still be subscribed: the emitter of this handle is closed,
    // and the shared instance unsubscribes when it is closed.
    fn unsubscribe(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
