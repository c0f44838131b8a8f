use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use procfs::{FromRead, LoadAverage, ProcError};
use yamc::provider::{FetchContext, FetchRetry, Provider, ProviderError};
use yamc::{MetricRecord, Timestamp};

/// Reads the system load from /proc/loadavg.
pub struct LoadAvgProvider {
    path: PathBuf,
}

impl LoadAvgProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> Result<LoadAverage, ProviderError> {
        let file = File::open(&self.path)
            .with_context(|| format!("could not read {}", self.path.display()))
            .retry_fetch()?;
        match LoadAverage::from_read(file) {
            Ok(load) => Ok(load),
            // reading failed, the content may be fine next time
            Err(ProcError::Io(e, _)) => Err(e)
                .with_context(|| format!("could not read {}", self.path.display()))
                .retry_fetch(),
            Err(e) => {
                let e = anyhow::Error::new(e).context(format!("invalid content in {}", self.path.display()));
                Err(ProviderError::Permanent(e))
            }
        }
    }
}

fn load_records(load: &LoadAverage, timestamp: Timestamp) -> Vec<MetricRecord> {
    vec![
        MetricRecord::new(timestamp, "load_1m", f64::from(load.one)),
        MetricRecord::new(timestamp, "load_5m", f64::from(load.five)),
        MetricRecord::new(timestamp, "load_15m", f64::from(load.fifteen)),
        MetricRecord::new(timestamp, "processes_running", u64::from(load.cur)),
        MetricRecord::new(timestamp, "processes_total", u64::from(load.max)),
    ]
}

impl Provider for LoadAvgProvider {
    fn fetch(&mut self, ctx: &FetchContext) -> Result<Vec<MetricRecord>, ProviderError> {
        let load = self.read()?;
        Ok(load_records(&load, ctx.timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use yamc::MetricValue;
    use yamc::test::fetch_context;

    use super::*;

    #[test]
    fn missing_file_is_transient() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("loadavg");
        let mut provider = LoadAvgProvider::new(path.clone());
        let ctx = fetch_context("load");

        let err = provider.fetch(&ctx).unwrap_err();
        assert!(err.is_transient());

        // the file appears later
        std::fs::write(&path, "1.50 0.75 0.25 3/120 4242\n").unwrap();
        let records = provider.fetch(&ctx).unwrap();
        let got: Vec<(&str, &MetricValue)> = records.iter().map(|r| (r.name(), r.value())).collect();
        assert_eq!(
            got,
            vec![
                ("load_1m", &MetricValue::F64(1.5)),
                ("load_5m", &MetricValue::F64(0.75)),
                ("load_15m", &MetricValue::F64(0.25)),
                ("processes_running", &MetricValue::U64(3)),
                ("processes_total", &MetricValue::U64(120)),
            ]
        );
        assert!(records.iter().all(|r| r.timestamp() == ctx.timestamp()));
    }

    #[test]
    fn invalid_content_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("loadavg");
        std::fs::write(&path, "not a load average\n").unwrap();
        let mut provider = LoadAvgProvider::new(path);

        let err = provider.fetch(&fetch_context("load")).unwrap_err();
        assert!(!err.is_transient());
    }
}
