use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use yamc::MetricRecord;
use yamc::writer::{WriteContext, WriteRetry, Writer, WriterError};

use crate::csv::CsvParams;

const FIXED_COLUMNS: [&str; 3] = ["timestamp", "name", "value"];
const LATE_COLUMN: &str = "__late_tags";

/// Writes records to a CSV file.
///
/// The header is made of the fixed columns, one column per tag key found in the first batch,
/// and a last column that holds the tags that appeared later, as `key=value` pairs.
pub struct CsvWriter {
    path: PathBuf,
    out: BufWriter<File>,
    /// The tag columns of the header, `None` until the header is written.
    tag_columns: Option<Vec<String>>,
    force_flush: bool,
    params: CsvParams,
}

impl CsvWriter {
    /// Opens the output file.
    ///
    /// When appending to a file that has content, its header is reused.
    pub fn open(path: &Path, append: bool, force_flush: bool, params: CsvParams) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tag_columns = if append { read_tag_columns(path, &params)? } else { None };
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        if tag_columns.is_some() {
            log::debug!("Appending to {} with its existing header", path.display());
        }
        Ok(Self {
            path: path.to_owned(),
            out: BufWriter::new(file),
            tag_columns,
            force_flush,
            params,
        })
    }

    fn write_records(&mut self, batch: &[MetricRecord]) -> Result<(), WriterError> {
        let tag_columns = match &self.tag_columns {
            Some(columns) => columns,
            None => {
                // sort the keys to get the same header from one run to the next
                let mut keys: Vec<String> = batch
                    .iter()
                    .flat_map(|r| r.tags().keys())
                    .map(str::to_owned)
                    .collect();
                keys.sort_unstable();
                keys.dedup();
                let header = FIXED_COLUMNS
                    .iter()
                    .copied()
                    .chain(keys.iter().map(String::as_str))
                    .chain([LATE_COLUMN]);
                self.params.write_line(&mut self.out, header).retry_write()?;
                self.tag_columns.insert(keys)
            }
        };

        for r in batch {
            let datetime = OffsetDateTime::from(SystemTime::from(r.timestamp())).format(&Rfc3339)?;
            let mut fields = Vec::with_capacity(FIXED_COLUMNS.len() + tag_columns.len() + 1);
            fields.push(datetime);
            fields.push(r.name().to_owned());
            fields.push(r.value().to_string());
            for column in tag_columns {
                fields.push(r.tag(column).unwrap_or_default().to_owned());
            }

            let late: Vec<String> = r
                .tags()
                .iter()
                .filter(|(k, _)| !tag_columns.iter().any(|c| c.as_str() == *k))
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        self.params.escape_string_late(k),
                        self.params.escape_string_late(v)
                    )
                })
                .collect();
            fields.push(late.join(&self.params.late_delimiter.to_string()));

            self.params.write_line(&mut self.out, &fields).retry_write()?;
        }

        if self.force_flush {
            log::trace!("flushing {}", self.path.display());
            self.out.flush().retry_write()?;
        }
        Ok(())
    }
}

impl Writer for CsvWriter {
    fn write(&mut self, batch: &[MetricRecord], ctx: &WriteContext) -> Result<(), WriterError> {
        log::debug!(
            "Writing {} rows of task {} to {} (attempt {})",
            batch.len(),
            ctx.task_id(),
            self.path.display(),
            ctx.attempt()
        );
        self.write_records(batch)
    }

    fn healthcheck(&mut self) -> Result<(), WriterError> {
        self.out.flush().retry_write()?;
        match self.path.try_exists() {
            Ok(true) => Ok(()),
            Ok(false) => Err(WriterError::Transient(anyhow::anyhow!(
                "{} has been removed",
                self.path.display()
            ))),
            Err(e) => Err(e).retry_write(),
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reads the tag columns from the header of an existing file.
fn read_tag_columns(path: &Path, params: &CsvParams) -> io::Result<Option<Vec<String>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut first_line = String::new();
    BufReader::new(file).read_line(&mut first_line)?;
    if first_line.trim().is_empty() {
        return Ok(None);
    }
    let columns = params.split_header(&first_line);
    let is_ours = columns.len() >= FIXED_COLUMNS.len() + 1
        && columns[..FIXED_COLUMNS.len()] == FIXED_COLUMNS
        && columns.last().map(String::as_str) == Some(LATE_COLUMN);
    if !is_ours {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("cannot append to {}: unexpected header {first_line:?}", path.display()),
        ));
    }
    let tags = columns[FIXED_COLUMNS.len()..columns.len() - 1].to_vec();
    Ok(Some(tags))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use yamc::test::write_context;
    use yamc::{MetricRecord, Timestamp};

    use super::*;

    fn at(secs: u64) -> Timestamp {
        Timestamp::from(UNIX_EPOCH + Duration::from_secs(secs))
    }

    #[test]
    fn header_and_late_tags() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("out.csv");
        let mut writer = CsvWriter::open(&path, false, true, CsvParams::default())?;
        let ctx = write_context("t");

        writer.write(
            &[
                MetricRecord::new(at(0), "load", 0.5).with_tag("host", "a"),
                MetricRecord::new(at(1), "mem", 1024u64).with_tags([("host", "b"), ("zone", "eu;west")]),
            ],
            &ctx,
        )
        .unwrap();
        writer.write(
            &[
                MetricRecord::new(at(2), "load", 0.75).with_tags([("gpu", "H200"), ("cpu", "EPYC,AMD")]),
                MetricRecord::new(at(3), "status", "say \"hi\""),
            ],
            &ctx,
        )
        .unwrap();
        writer.close()?;

        let output = std::fs::read_to_string(&path)?;
        assert_eq!(
            output,
            indoc! {r#"
                timestamp;name;value;host;zone;__late_tags
                1970-01-01T00:00:00Z;load;0.5;a;;
                1970-01-01T00:00:01Z;mem;1024;b;"eu;west";
                1970-01-01T00:00:02Z;load;0.75;;;gpu=H200,cpu=EPYC\,AMD
                1970-01-01T00:00:03Z;status;"say ""hi""";;;
            "#}
        );
        Ok(())
    }

    #[test]
    fn append_reuses_the_header() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("nested").join("out.csv");
        let ctx = write_context("t");

        let mut first = CsvWriter::open(&path, true, true, CsvParams::default())?;
        first.write(&[MetricRecord::new(at(0), "load", 1u64).with_tag("host", "a")], &ctx).unwrap();
        first.close()?;

        let mut second = CsvWriter::open(&path, true, false, CsvParams::default())?;
        second.write(&[MetricRecord::new(at(1), "load", 2u64).with_tags([("host", "b"), ("rack", "3")])], &ctx).unwrap();
        second.close()?;

        let output = std::fs::read_to_string(&path)?;
        assert_eq!(
            output,
            indoc! {"
                timestamp;name;value;host;__late_tags
                1970-01-01T00:00:00Z;load;1;a;
                1970-01-01T00:00:01Z;load;2;b;rack=3
            "}
        );
        Ok(())
    }

    #[test]
    fn append_with_a_quoted_tag_column() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("out.csv");
        let ctx = write_context("t");

        for (secs, value) in [(0, 1u64), (1, 2u64)] {
            let mut writer = CsvWriter::open(&path, true, true, CsvParams::default())?;
            writer.write(&[MetricRecord::new(at(secs), "load", value).with_tag("rack;row", "3")], &ctx).unwrap();
            writer.close()?;
        }

        let output = std::fs::read_to_string(&path)?;
        assert_eq!(
            output,
            indoc! {r#"
                timestamp;name;value;"rack;row";__late_tags
                1970-01-01T00:00:00Z;load;1;3;
                1970-01-01T00:00:01Z;load;2;3;
            "#}
        );
        Ok(())
    }

    #[test]
    fn append_refuses_foreign_files() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("other.csv");
        std::fs::write(&path, "a,b,c\n1,2,3\n")?;
        let err = CsvWriter::open(&path, true, true, CsvParams::default()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        Ok(())
    }

    #[test]
    fn truncate_without_append() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("out.csv");
        std::fs::write(&path, "old content\n")?;
        let mut writer = CsvWriter::open(&path, false, true, CsvParams::default())?;
        writer.write(&[MetricRecord::new(at(0), "x", 1u64)], &write_context("t")).unwrap();
        writer.healthcheck().unwrap();
        assert_eq!(
            std::fs::read_to_string(&path)?,
            "timestamp;name;value;__late_tags\n1970-01-01T00:00:00Z;x;1;\n"
        );
        Ok(())
    }
}
