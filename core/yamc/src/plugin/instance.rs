use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::provider::Provider;
use crate::writer::Writer;

/// Scoped release of plugin resources.
pub trait Lifecycle: Send {
    fn close(&mut self) -> anyhow::Result<()>;
}

impl Lifecycle for dyn Provider {
    fn close(&mut self) -> anyhow::Result<()> {
        Provider::close(self)
    }
}

impl Lifecycle for dyn Writer {
    fn close(&mut self) -> anyhow::Result<()> {
        Writer::close(self)
    }
}

pub type ProviderInstance = Instance<dyn Provider>;
pub type WriterInstance = Instance<dyn Writer>;

/// A live plugin instance.
///
/// The plugin is closed exactly once: either explicitly with [`Instance::dispose`],
/// or when the instance is dropped. The latter happens when a task is aborted,
/// or when a blocking call that has been abandoned finally returns.
pub struct Instance<P: ?Sized + Lifecycle> {
    label: String,
    inner: Option<Box<P>>,
}

impl<P: ?Sized + Lifecycle> Instance<P> {
    pub(crate) fn new(label: String, plugin: Box<P>) -> Self {
        Self {
            label,
            inner: Some(plugin),
        }
    }

    /// A human-readable name, for instance `provider 'procfs'`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get(&self) -> &P {
        // inner is only taken by dispose and drop, which consume the instance
        self.inner.as_deref().expect("instance used after disposal")
    }

    pub fn get_mut(&mut self) -> &mut P {
        self.inner.as_deref_mut().expect("instance used after disposal")
    }

    /// Closes the plugin and reports the error, if any.
    pub fn dispose(mut self) -> anyhow::Result<()> {
        match self.inner.take() {
            Some(plugin) => close_guarded(&self.label, plugin),
            None => Ok(()),
        }
    }
}

fn close_guarded<P: ?Sized + Lifecycle>(label: &str, mut plugin: Box<P>) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(|| plugin.close())) {
        Ok(res) => {
            log::debug!("{label} closed");
            res
        }
        Err(_) => Err(anyhow::anyhow!("{label} panicked while closing")),
    }
}

impl<P: ?Sized + Lifecycle> Drop for Instance<P> {
    fn drop(&mut self) {
        if let Some(plugin) = self.inner.take() {
            if let Err(e) = close_guarded(&self.label, plugin) {
                log::error!("Error while disposing {}: {e:#}", self.label);
            }
        }
    }
}

impl<P: ?Sized + Lifecycle> fmt::Debug for Instance<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").field("label", &self.label).finish()
    }
}
