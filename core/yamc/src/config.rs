//! Configuration of the collector tasks.
//!
//! The configuration is a list of tasks, usually written in TOML:
//!
//! ```toml
//! [[tasks]]
//! id = "load"
//! schedule = { strategy = "interval", every = "10s" }
//! providers = [{ plugin = "procfs-loadavg" }]
//! writers = [{ plugin = "csv", path = "load.csv" }]
//! ```
//!
//! Parsing only checks the structure. [`CollectorConfig::validate`] checks the content
//! against a [`PluginRegistry`] and produces the [`TaskSpec`]s, or every problem at once.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::{PluginKind, PluginOptions, PluginRegistry, RegistryError};
use crate::task::{
    ElementSpec, ExhaustedPolicy, OverflowPolicy, RestartPolicy, RetryPolicy, SchedulingPolicy, TaskId, TaskSpec,
};

/// The collector tasks to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Configuration of one collector task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub id: String,
    /// Disabled tasks are validated, but not started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub providers: Vec<PluginRef>,
    #[serde(default)]
    pub writers: Vec<PluginRef>,

    /// Capacity of the task queue, in records.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// What to do when the queue is full.
    /// Defaults to `block` for interval and cron tasks, and `drop-oldest` for event-driven tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow: Option<OverflowPolicy>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum number of batches in flight, for event-driven tasks.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Number of consecutive transient failures that quarantines the task.
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,

    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub on_retries_exhausted: ExhaustedPolicy,
    /// Restart the task after a quarantine. Disabled by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartPolicy>,
    #[serde(default)]
    pub max_history: usize,

    #[serde(default = "default_cancel_grace", with = "humantime_serde")]
    pub cancel_grace: Duration,
    #[serde(default = "default_healthcheck_interval", with = "humantime_serde")]
    pub healthcheck_interval: Duration,
}

/// The collection strategy of a task, and its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub strategy: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

/// Reference to a provider or a writer, with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRef {
    pub plugin: String,
    #[serde(flatten)]
    pub options: PluginOptions,
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_batch_size() -> usize {
    100
}

fn default_max_concurrency() -> usize {
    4
}

fn default_quarantine_threshold() -> u32 {
    5
}

fn default_cancel_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_healthcheck_interval() -> Duration {
    Duration::from_secs(20)
}

impl TaskConfig {
    /// Creates a task configuration with the default settings, and without any plugin.
    pub fn new(id: impl Into<String>, schedule: ScheduleConfig) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            schedule,
            providers: Vec::new(),
            writers: Vec::new(),
            queue_capacity: default_queue_capacity(),
            overflow: None,
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            quarantine_threshold: default_quarantine_threshold(),
            retry: RetryPolicy::default(),
            on_retries_exhausted: ExhaustedPolicy::default(),
            restart: None,
            max_history: 0,
            cancel_grace: default_cancel_grace(),
            healthcheck_interval: default_healthcheck_interval(),
        }
    }

    pub fn with_provider(mut self, plugin: impl Into<String>, options: PluginOptions) -> Self {
        self.providers.push(PluginRef {
            plugin: plugin.into(),
            options,
        });
        self
    }

    pub fn with_writer(mut self, plugin: impl Into<String>, options: PluginOptions) -> Self {
        self.writers.push(PluginRef {
            plugin: plugin.into(),
            options,
        });
        self
    }
}

impl ScheduleConfig {
    /// A fixed interval schedule.
    pub fn every(period: Duration) -> Self {
        let mut options = toml::Table::new();
        options.insert(
            String::from("every"),
            toml::Value::String(format!("{}ms", period.as_millis())),
        );
        Self {
            strategy: String::from("interval"),
            options,
        }
    }

    /// A schedule that follows a cron expression.
    pub fn cron(expression: &str) -> Self {
        let mut options = toml::Table::new();
        options.insert(String::from("schedule"), toml::Value::String(expression.to_owned()));
        Self {
            strategy: String::from("cron"),
            options,
        }
    }

    /// An event-driven schedule.
    pub fn on_event() -> Self {
        Self {
            strategy: String::from("event"),
            options: toml::Table::new(),
        }
    }
}

/// The configuration is invalid.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {}", ProblemList(.problems))]
pub struct ConfigurationError {
    pub problems: Vec<ConfigProblem>,
}

/// One problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigProblem {
    /// The task concerned by the problem, if any.
    pub task: Option<String>,
    pub message: String,
}

impl fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Some(task) => write!(f, "task '{task}': {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

struct ProblemList<'a>(&'a [ConfigProblem]);

impl fmt::Display for ProblemList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            [single] => write!(f, "{single}"),
            problems => {
                write!(f, "{} problems", problems.len())?;
                for p in problems {
                    write!(f, "\n  - {p}")?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    fn single(message: String) -> Self {
        Self {
            problems: vec![ConfigProblem { task: None, message }],
        }
    }
}

impl CollectorConfig {
    /// Parses the configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(content).map_err(|e| ConfigurationError::single(e.to_string()))
    }

    /// Parses the configuration from a TOML table.
    pub fn from_table(table: toml::Table) -> Result<Self, ConfigurationError> {
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigurationError::single(e.to_string()))
    }

    /// Checks the configuration and returns the specifications of the enabled tasks.
    ///
    /// `backlog_dir` is where writers spill the batches they could not write, if enabled.
    pub fn validate(&self, registry: &PluginRegistry, backlog_dir: Option<&Path>) -> Result<Vec<TaskSpec>, ConfigurationError> {
        let mut problems = Vec::new();
        let mut ids = HashSet::new();
        let mut specs = Vec::new();
        for task in &self.tasks {
            let mut report = |message: String| {
                problems.push(ConfigProblem {
                    task: Some(task.id.clone()),
                    message,
                })
            };
            if task.id.trim().is_empty() {
                report(String::from("the task id cannot be empty"));
            } else if !ids.insert(task.id.as_str()) {
                report(String::from("duplicate task id"));
            }
            match check_task(task, registry, backlog_dir, &mut report) {
                Some(spec) if task.enabled => specs.push(spec),
                Some(_) => log::debug!("Task {} is disabled.", task.id),
                None => (),
            }
        }
        if problems.is_empty() {
            Ok(specs)
        } else {
            Err(ConfigurationError { problems })
        }
    }
}

/// Checks one task. Returns its spec if the task is valid.
fn check_task(
    task: &TaskConfig,
    registry: &PluginRegistry,
    backlog_dir: Option<&Path>,
    report: &mut impl FnMut(String),
) -> Option<TaskSpec> {
    let mut valid = true;
    let mut problem = |message: String| {
        valid = false;
        report(message);
    };

    let schedule_options = PluginOptions::new(task.schedule.options.clone());
    let policy = match registry.resolve_strategy(&task.schedule.strategy, &schedule_options) {
        Ok(policy) => Some(policy),
        Err(RegistryError::Initialization { source, .. }) => {
            problem(format!("invalid schedule '{}': {source:#}", task.schedule.strategy));
            None
        }
        Err(e) => {
            problem(e.to_string());
            None
        }
    };

    if task.providers.is_empty() {
        problem(String::from("at least one provider is required"));
    }
    for p in &task.providers {
        let Some(descriptor) = registry.descriptor(PluginKind::Provider, &p.plugin) else {
            problem(format!("unknown provider '{}'", p.plugin));
            continue;
        };
        let capabilities = descriptor.capabilities().unwrap_or_default();
        match &policy {
            Some(SchedulingPolicy::EventDriven) if !capabilities.push => problem(format!(
                "provider '{}' does not support push, which event-driven tasks require",
                p.plugin
            )),
            Some(SchedulingPolicy::FixedInterval(_)) if !capabilities.pull => problem(format!(
                "provider '{}' does not support pull, which interval tasks require",
                p.plugin
            )),
            Some(SchedulingPolicy::Cron(_)) if !capabilities.pull => problem(format!(
                "provider '{}' does not support pull, which cron tasks require",
                p.plugin
            )),
            _ => (),
        }
    }

    if task.writers.is_empty() {
        problem(String::from("at least one writer is required"));
    }
    for w in &task.writers {
        if registry.descriptor(PluginKind::Writer, &w.plugin).is_none() {
            problem(format!("unknown writer '{}'", w.plugin));
        }
    }

    let positive = [
        ("queue_capacity", task.queue_capacity == 0),
        ("batch_size", task.batch_size == 0),
        ("max_concurrency", task.max_concurrency == 0),
        ("quarantine_threshold", task.quarantine_threshold == 0),
        ("retry.max_attempts", task.retry.max_attempts == 0),
    ];
    for (name, is_zero) in positive {
        if is_zero {
            problem(format!("{name} must be greater than zero"));
        }
    }
    if task.retry.multiplier.is_nan() || task.retry.multiplier < 1.0 {
        problem(String::from("retry.multiplier must be at least 1"));
    }
    if task.on_retries_exhausted == ExhaustedPolicy::Spill && backlog_dir.is_none() {
        problem(String::from(
            "on_retries_exhausted = \"spill\" requires a backlog directory (option backlog_dir)",
        ));
    }

    let policy = policy?;
    if !valid {
        return None;
    }
    let overflow = task.overflow.unwrap_or(if policy.is_pull() {
        OverflowPolicy::Block
    } else {
        OverflowPolicy::DropOldest
    });
    let elements = |refs: &[PluginRef]| {
        refs.iter()
            .map(|r| ElementSpec {
                plugin: r.plugin.clone(),
                options: r.options.clone(),
            })
            .collect()
    };
    Some(TaskSpec {
        id: TaskId::from(task.id.as_str()),
        policy,
        providers: elements(&task.providers),
        writers: elements(&task.writers),
        queue_capacity: task.queue_capacity,
        overflow,
        batch_size: task.batch_size,
        max_concurrency: task.max_concurrency,
        quarantine_threshold: task.quarantine_threshold,
        retry: task.retry,
        on_retries_exhausted: task.on_retries_exhausted,
        restart: task.restart,
        max_history: task.max_history,
        cancel_grace: task.cancel_grace,
        healthcheck_interval: task.healthcheck_interval,
        backlog_dir: backlog_dir.map(Path::to_path_buf),
    })
}
