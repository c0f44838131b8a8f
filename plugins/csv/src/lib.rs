//! Writes the records to a CSV file.
//!
//! ```toml
//! writers = [{ plugin = "csv", path = "out/load.csv", delimiter = "," }]
//! ```

mod csv;
mod writer;

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use yamc::plugin::PluginDescriptor;

pub use csv::CsvParams;
pub use writer::CsvWriter;

/// The descriptors of the plugins of this crate.
pub fn plugins() -> Vec<PluginDescriptor> {
    vec![PluginDescriptor::writer("csv", env!("CARGO_PKG_VERSION"), |options| {
        let config: Config = options.deserialize()?;
        let params = CsvParams {
            delimiter: config.delimiter,
            late_delimiter: config.late_delimiter,
        };
        let writer = CsvWriter::open(&config.path, config.append, config.force_flush, params)
            .with_context(|| format!("could not open {}", config.path.display()))?;
        Ok(Box::new(writer))
    })]
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Absolute or relative path to the output file.
    pub path: PathBuf,
    /// Do we add to the existing file instead of replacing it?
    pub append: bool,
    /// Do we flush after each batch?
    pub force_flush: bool,
    /// The CSV delimiter, such as `;`.
    pub delimiter: char,
    /// The delimiter of the late tags.
    pub late_delimiter: char,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("yamc-output.csv"),
            append: true,
            force_flush: true,
            delimiter: ';',
            late_delimiter: ',',
        }
    }
}
