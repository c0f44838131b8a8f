//! Metric records and batches.
//!
//! A [`MetricRecord`] is the unit of data that flows through a collector task:
//! providers produce records, the task queues them and writers persist them.
//! Records are immutable once they have been queued: writers receive them as a
//! shared [`RecordBatch`] and cannot modify them.
//!
//! # Producing records
//!
//! ```
//! use yamc::record::{MetricRecord, Timestamp};
//!
//! let record = MetricRecord::new(Timestamp::now(), "loadavg_1m", 0.42)
//!     .with_tag("host", "node-1")
//!     .with_tag("source", "procfs");
//! assert_eq!(record.tag("host"), Some("node-1"));
//! ```

use core::fmt;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A batch of records, as given to writers.
pub type RecordBatch = Arc<[MetricRecord]>;

/// A value that has been observed at a given point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    timestamp: Timestamp,
    name: String,
    tags: Tags,
    value: MetricValue,
}

/// A wall clock timestamp.
///
/// This opaque type is currently a wrapper around [`SystemTime`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(SystemTime);

/// Ordered key/value string pairs attached to a record. Keys are unique.
///
/// Uses [`SmallVec`] to avoid allocations when there are few tags, which is the common case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct Tags(SmallVec<[(Cow<'static, str>, String); 4]>);

/// The payload of a record: a number or a structured object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
    Text(String),
    /// Named fields, for state objects and other composite values.
    Structured(BTreeMap<String, MetricValue>),
}

impl MetricRecord {
    /// Creates a new record without tags.
    pub fn new(timestamp: Timestamp, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self {
            timestamp,
            name: name.into(),
            tags: Tags::default(),
            value: value.into(),
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &MetricValue {
        &self.value
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Returns the value of the tag `key`, if any.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key)
    }

    /// Sets a tag and returns self to allow for method chaining.
    /// If a tag with the same key already exists, its value is replaced.
    pub fn with_tag(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    /// Sets multiple tags. Existing tags with conflicting keys are replaced.
    pub fn with_tags<K, V>(mut self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Cow<'static, str>>,
        V: Into<String>,
    {
        for (k, v) in tags {
            self.tags.insert(k, v);
        }
        self
    }
}

impl Timestamp {
    /// Returns a `Timestamp` representing the current system time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Duration since the unix epoch, zero for times before the epoch.
    pub fn since_unix_epoch(&self) -> Duration {
        self.0.duration_since(UNIX_EPOCH).unwrap_or_default()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a tag. If the key exists, the value is replaced in place.
    pub fn insert(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_ref(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_ref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<(String, String)>> for Tags {
    fn from(value: Vec<(String, String)>) -> Self {
        let mut tags = Tags::new();
        for (k, v) in value {
            tags.insert(k, v);
        }
        tags
    }
}

impl From<Tags> for Vec<(String, String)> {
    fn from(value: Tags) -> Self {
        value.0.into_iter().map(|(k, v)| (k.into_owned(), v)).collect()
    }
}

impl MetricValue {
    /// Converts numeric values to `f64`. Booleans are converted to 0 or 1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::U64(v) => Some(*v as f64),
            MetricValue::I64(v) => Some(*v as f64),
            MetricValue::F64(v) => Some(*v),
            MetricValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            MetricValue::Text(_) | MetricValue::Structured(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::U64(v) => write!(f, "{v}"),
            MetricValue::I64(v) => write!(f, "{v}"),
            MetricValue::F64(v) => write!(f, "{v}"),
            MetricValue::Bool(v) => write!(f, "{v}"),
            MetricValue::Text(v) => write!(f, "{v}"),
            MetricValue::Structured(fields) => {
                f.write_str("{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::U64(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::I64(value)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::F64(value)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Bool(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_owned())
    }
}

impl From<BTreeMap<String, MetricValue>> for MetricValue {
    fn from(value: BTreeMap<String, MetricValue>) -> Self {
        MetricValue::Structured(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn tag_replacement_keeps_position() {
        let record = MetricRecord::new(Timestamp::now(), "m", 1u64)
            .with_tag("a", "1")
            .with_tag("b", "2")
            .with_tag("a", "3");
        let tags: Vec<_> = record.tags().iter().collect();
        assert_eq!(tags, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn deserialized_tags_are_unique() {
        let tags = Tags::from(vec![
            ("k".to_owned(), "v1".to_owned()),
            ("other".to_owned(), "x".to_owned()),
            ("k".to_owned(), "v2".to_owned()),
        ]);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("k"), Some("v2"));
    }

    #[test]
    fn structured_value_display() {
        let mut fields = BTreeMap::new();
        fields.insert("status".to_owned(), MetricValue::from("up"));
        fields.insert("count".to_owned(), MetricValue::from(3u64));
        let value = MetricValue::Structured(fields);
        assert_eq!(value.to_string(), "{count: 3, status: up}");
        assert_eq!(value.as_f64(), None);
        assert_eq!(MetricValue::Bool(true).as_f64(), Some(1.0));
    }

    #[test]
    fn json_keeps_value_types() {
        let record = MetricRecord::new(Timestamp::now(), "temperature", -4i64).with_tag("room", "attic");
        let json = serde_json::to_string(&record).unwrap();
        let back: MetricRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.value(), &MetricValue::I64(-4));
    }
}
