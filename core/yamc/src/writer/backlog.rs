//! On-disk backlog of batches that could not be written.
//!
//! Each batch is stored in its own file, `items_<n>.jsonl`, one JSON record per line.
//! Batches are replayed oldest first, that is by increasing `n`.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::record::MetricRecord;

const PREFIX: &str = "items_";
const EXTENSION: &str = "jsonl";

/// Batches waiting to be written, stored in a directory.
#[derive(Debug)]
pub struct Backlog {
    dir: PathBuf,
    /// Sequence numbers of the files, in increasing order.
    files: VecDeque<u64>,
    next: u64,
}

impl Backlog {
    /// Opens the backlog stored in `dir`, creating the directory if needed.
    ///
    /// Batches left by a previous run are picked up.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("could not create backlog directory {}", dir.display()))?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("could not list {}", dir.display()))? {
            let entry = entry?;
            if let Some(n) = parse_file_name(&entry.file_name().to_string_lossy()) {
                files.push(n);
            }
        }
        files.sort_unstable();
        let next = files.last().map(|n| n + 1).unwrap_or(0);
        if !files.is_empty() {
            log::info!("Found {} batch(es) in the backlog {}", files.len(), dir.display());
        }
        Ok(Self {
            dir,
            files: files.into(),
            next,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of batches in the backlog.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Stores a batch at the end of the backlog.
    pub fn push(&mut self, batch: &[MetricRecord]) -> anyhow::Result<()> {
        let n = self.next;
        let path = self.path(n);
        let tmp = path.with_extension("tmp");
        let write = || -> anyhow::Result<()> {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in batch {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        };
        write().with_context(|| format!("could not write backlog file {}", path.display()))?;
        self.next += 1;
        self.files.push_back(n);
        Ok(())
    }

    /// Reads the oldest batch, without removing it.
    pub fn peek(&self) -> Option<anyhow::Result<Vec<MetricRecord>>> {
        let n = *self.files.front()?;
        Some(read_batch(&self.path(n)))
    }

    /// Removes the oldest batch.
    pub fn pop(&mut self) -> anyhow::Result<()> {
        if let Some(n) = self.files.pop_front() {
            let path = self.path(n);
            fs::remove_file(&path).with_context(|| format!("could not remove backlog file {}", path.display()))?;
        }
        Ok(())
    }

    fn path(&self, n: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{n}.{EXTENSION}"))
    }
}

fn parse_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?
        .strip_suffix(EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

fn read_batch(path: &Path) -> anyhow::Result<Vec<MetricRecord>> {
    let file = File::open(path).with_context(|| format!("could not open backlog file {}", path.display()))?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("invalid record at line {} of {}", i + 1, path.display()))?;
        records.push(record);
    }
    Ok(records)
}
