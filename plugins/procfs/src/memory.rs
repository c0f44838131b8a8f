//! Memory status of the machine.

use std::{
    fs::File,
    io::{BufRead, BufReader, Seek},
    path::Path,
};

use anyhow::Context;
use yamc::provider::{FetchContext, FetchRetry, Provider, ProviderError};
use yamc::MetricRecord;

use crate::convert_to_snake_case;

/// Reads memory status from /proc/meminfo.
pub struct MeminfoProvider {
    /// A reader opened to /proc/meminfo, rewound before each fetch.
    reader: BufReader<File>,
    /// The entries to read, as `(meminfo key, record name)`, sorted by key.
    /// Other entries are ignored.
    entries: Vec<(String, String)>,
}

impl MeminfoProvider {
    pub fn new(path: &Path, entries: &[String]) -> anyhow::Result<Self> {
        let mut entries: Vec<(String, String)> = entries
            .iter()
            .map(|key| (key.to_owned(), format!("meminfo_{}", convert_to_snake_case(key))))
            .collect();
        // sorted for the binary search in fetch()
        entries.sort_unstable();
        entries.dedup_by(|a, b| a.0 == b.0);
        let file = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
            entries,
        })
    }
}

impl Provider for MeminfoProvider {
    fn fetch(&mut self, ctx: &FetchContext) -> Result<Vec<MetricRecord>, ProviderError> {
        self.reader.rewind().retry_fetch()?;
        let mut records = Vec::with_capacity(self.entries.len());
        for line in (&mut self.reader).lines() {
            let line = line.context("could not read line from meminfo").retry_fetch()?;
            if line.is_empty() {
                continue;
            }
            let (key, value) = parse_meminfo_line(&line).with_context(|| format!("invalid line in meminfo: {line}"))?;
            if let Ok(i) = self.entries.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
                let name = &self.entries[i].1;
                records.push(MetricRecord::new(ctx.timestamp(), name.as_str(), value).with_tag("unit", "B"));
            }
        }
        Ok(records)
    }
}

/// Parses `Key:   value [unit]` into the key and the value in bytes.
fn parse_meminfo_line(line: &str) -> Option<(&str, u64)> {
    let mut parts = line.split_ascii_whitespace();
    let key = parts.next()?.strip_suffix(':')?;
    let value: u64 = parts.next()?.parse().ok()?;
    // no unit means bytes
    let value = match parts.next() {
        Some(unit) => convert_meminfo_to_bytes(value, unit)?,
        None => value,
    };
    Some((key, value))
}

fn convert_meminfo_to_bytes(value: u64, unit: &str) -> Option<u64> {
    // In meminfo, "kB" is a kibibyte.
    let factor: u64 = match unit {
        "B" => 1,
        "kB" | "KiB" | "kiB" | "KB" => 1 << 10,
        "mB" | "MiB" | "miB" | "MB" => 1 << 20,
        "gB" | "GiB" | "giB" | "GB" => 1 << 30,
        _ => return None,
    };
    value.checked_mul(factor)
}
