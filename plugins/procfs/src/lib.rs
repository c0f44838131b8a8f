//! Providers that read the system metrics of Linux, from the `/proc` virtual filesystem.
//!
//! - `procfs-loadavg`: the load average and the number of processes;
//! - `procfs-meminfo`: selected entries of `/proc/meminfo`, in bytes.
//!
//! ```toml
//! providers = [
//!     { plugin = "procfs-loadavg" },
//!     { plugin = "procfs-meminfo", entries = ["MemTotal", "MemAvailable"] },
//! ]
//! ```

use std::path::PathBuf;

use procfs::Current;
use serde::{Deserialize, Serialize};
use yamc::plugin::{Capabilities, PluginDescriptor};

mod loadavg;
mod memory;

pub use loadavg::LoadAvgProvider;
pub use memory::MeminfoProvider;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The descriptors of the plugins of this crate.
pub fn plugins() -> Vec<PluginDescriptor> {
    vec![
        PluginDescriptor::provider("procfs-loadavg", VERSION, Capabilities::PULL, |options| {
            let config: LoadAvgConfig = options.deserialize()?;
            Ok(Box::new(LoadAvgProvider::new(config.path)))
        }),
        PluginDescriptor::provider("procfs-meminfo", VERSION, Capabilities::PULL, |options| {
            let config: MeminfoConfig = options.deserialize()?;
            if config.entries.is_empty() {
                anyhow::bail!("at least one meminfo entry is required");
            }
            log::debug!("Reading {} entries of {}", config.entries.len(), config.path.display());
            Ok(Box::new(MeminfoProvider::new(&config.path, &config.entries)?))
        })
        .shareable(),
    ]
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadAvgConfig {
    #[serde(default = "default_loadavg_path")]
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeminfoConfig {
    #[serde(default = "default_meminfo_path")]
    pub path: PathBuf,
    /// The entries to read, with their name in the file.
    /// They become records named `meminfo_<entry in snake_case>`.
    #[serde(default = "default_meminfo_entries")]
    pub entries: Vec<String>,
}

fn default_loadavg_path() -> PathBuf {
    PathBuf::from(procfs::LoadAverage::PATH)
}

fn default_meminfo_path() -> PathBuf {
    PathBuf::from(procfs::Meminfo::PATH)
}

fn default_meminfo_entries() -> Vec<String> {
    ["MemTotal", "MemFree", "MemAvailable", "Cached", "SwapTotal", "SwapFree"]
        .map(String::from)
        .to_vec()
}

/// Converts a meminfo key such as `MemAvailable` or `SReclaimable` to snake_case.
///
/// Keys that already contain an underscore, such as `HugePages_Total`, are only lowercased.
fn convert_to_snake_case(key: &str) -> String {
    if key.contains('_') {
        return key.to_lowercase();
    }
    let chars: Vec<char> = key.chars().collect();
    let mut res = String::with_capacity(key.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            // a new word starts after a lowercase letter, or at the last capital of an acronym
            if prev.is_lowercase() || (prev.is_uppercase() && next_is_lower) {
                res.push('_');
            }
        }
        res.extend(c.to_lowercase());
    }
    res
}
