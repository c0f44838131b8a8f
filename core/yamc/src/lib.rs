//! The scheduling core of yamc, yet another metric collector.
//!
//! yamc separates three roles, implemented by plugins:
//! - [providers](provider) acquire metric records, on demand (pull) or by subscription (push);
//! - collection strategies decide when a [task](task) runs: at a fixed interval, or on events;
//! - [writers](writer) persist the records.
//!
//! The [scheduler] runs the collector tasks described by the [configuration](config),
//! isolates the failures of each task, and shuts everything down gracefully.
//!
//! The plugins are registered in a [`PluginRegistry`](plugin::PluginRegistry),
//! which is owned by the scheduler.

pub mod config;
pub mod observe;
pub mod plugin;
pub mod provider;
pub mod record;
pub mod scheduler;
pub mod task;
pub mod writer;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use record::{MetricRecord, MetricValue, RecordBatch, Tags, Timestamp};
