//! Configuration of the agent.
//!
//! The configuration file contains the general options of the agent at the top level,
//! and the collector tasks in a `[[tasks]]` array:
//!
//! ```toml
//! grace_period = "5s"
//! status_interval = "1min"
//!
//! [[tasks]]
//! id = "load"
//! schedule = { strategy = "interval", every = "10s" }
//! providers = [{ plugin = "procfs-loadavg" }]
//! writers = [{ plugin = "csv", path = "${HOME}/load.csv" }]
//! ```

use std::borrow::Cow;
use std::env::VarError;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use yamc::config::{CollectorConfig, TaskConfig};
use yamc::scheduler::SchedulerSettings;

use error::{InvalidSubstitutionError, LoadError, LoadErrorCause};

/// The key of the task array in the configuration file.
const TASKS_KEY: &str = "tasks";

/// Loads the agent configuration from a TOML file.
pub struct Loader<'d> {
    file: PathBuf,
    default_provider: Option<Box<dyn DefaultConfigProvider + 'd>>,
    save_default: bool,
    overrides: Option<toml::Table>,
    substitute_env: bool,
}

/// Provides the content of the configuration file when it does not exist.
pub trait DefaultConfigProvider {
    fn default_config(&self) -> anyhow::Result<String>;
}

impl<F: Fn() -> anyhow::Result<String>> DefaultConfigProvider for F {
    fn default_config(&self) -> anyhow::Result<String> {
        self()
    }
}

impl<'d> Loader<'d> {
    /// Creates a new `Loader` that will read `config_file` on [`load`](Self::load).
    pub fn parse_file<P: Into<PathBuf>>(config_file: P) -> Self {
        Self {
            file: config_file.into(),
            default_provider: None,
            save_default: false,
            overrides: None,
            substitute_env: false,
        }
    }

    /// If the configuration file does not exist, use the content given by `default_provider`.
    ///
    /// Set `save_to_file` to `true` to write the default config to the file.
    pub fn or_default<D: DefaultConfigProvider + 'd>(mut self, default_provider: D, save_to_file: bool) -> Self {
        self.default_provider = Some(Box::new(default_provider));
        self.save_default = save_to_file;
        self
    }

    /// Overrides the content of the configuration by [merging](merge_override) it with another table.
    ///
    /// Multiple overrides can be set, they are applied in order.
    pub fn with_override(mut self, config_override: toml::Table) -> Self {
        match &mut self.overrides {
            Some(existing) => merge_override(existing, config_override),
            None => self.overrides = Some(config_override),
        }
        self
    }

    /// Enables or disables the substitution of environment variables, see [`substitute_env`].
    ///
    /// The substitution happens before the TOML parsing.
    pub fn substitute_env_variables(mut self, substitute_env: bool) -> Self {
        self.substitute_env = substitute_env;
        self
    }

    /// Loads the configuration with the provided settings.
    pub fn load(mut self) -> Result<toml::Table, LoadError> {
        self.load_impl().map_err(|e| LoadError {
            config_file: self.file,
            kind: e,
        })
    }

    fn load_impl(&mut self) -> Result<toml::Table, LoadErrorCause> {
        let content = self.read_config_or_default()?;
        let content = if self.substitute_env {
            substitute_env(&content)?
        } else {
            Cow::Borrowed(content.as_str())
        };
        let mut config = toml::Table::from_str(&content)?;
        if let Some(overrides) = self.overrides.take() {
            merge_override(&mut config, overrides);
        }
        Ok(config)
    }

    fn read_config_or_default(&mut self) -> Result<String, LoadErrorCause> {
        match std::fs::read_to_string(&self.file) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(provider) = self.default_provider.take() else {
                    return Err(LoadErrorCause::Read(e));
                };
                let content = provider.default_config().map_err(LoadErrorCause::DefaultProvider)?;
                if self.save_default {
                    std::fs::write(&self.file, &content).map_err(LoadErrorCause::DefaultWrite)?;
                    log::info!("Default configuration file written to: {}", self.file.display());
                }
                Ok(content)
            }
            Err(e) => Err(LoadErrorCause::Read(e)),
        }
    }
}

/// Replaces every `${VAR_NAME}` by the value of the environment variable `VAR_NAME`.
///
/// A backslash prevents the substitution: `\${NOT_A_VAR}` becomes `${NOT_A_VAR}`.
/// Fails if a variable does not exist, or if the syntax is wrong.
pub fn substitute_env(input: &str) -> Result<Cow<'_, str>, InvalidSubstitutionError> {
    if !input.contains("${") {
        return Ok(Cow::Borrowed(input));
    }

    let mut res = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let (before, pattern) = rest.split_at(start);
        if let Some(before) = before.strip_suffix('\\') {
            // escaped: keep the pattern, without the backslash
            res.push_str(before);
            res.push_str("${");
            rest = &pattern[2..];
            continue;
        }
        res.push_str(before);

        let end = pattern.find('}').ok_or(InvalidSubstitutionError::WrongSyntax)?;
        let name = &pattern[2..end];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(InvalidSubstitutionError::InvalidName(name.to_owned()));
        }
        match std::env::var(name) {
            Ok(value) => res.push_str(&value),
            Err(VarError::NotPresent) => return Err(InvalidSubstitutionError::Missing(name.to_owned())),
            Err(VarError::NotUnicode(_)) => return Err(InvalidSubstitutionError::InvalidValue(name.to_owned())),
        }
        rest = &pattern[end + 1..];
    }
    res.push_str(rest);
    Ok(Cow::Owned(res))
}

/// Merges two toml tables by overriding the content of `original` with the content of `overrider`.
///
/// Tables are merged recursively, other values (including arrays) are replaced.
pub fn merge_override(original: &mut toml::Table, overrider: toml::Table) {
    for (key, value) in overrider {
        match original.entry(key) {
            toml::map::Entry::Vacant(entry) => {
                entry.insert(value);
            }
            toml::map::Entry::Occupied(mut entry) => match (entry.get_mut(), value) {
                (toml::Value::Table(table), toml::Value::Table(table_override)) => {
                    merge_override(table, table_override);
                }
                (_, value) => {
                    entry.insert(value);
                }
            },
        }
    }
}

/// General options of the agent, which are not specific to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeneralConfig {
    /// How long the tasks get to finish, after a stop request.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// After this delay, the remaining tasks are aborted.
    #[serde(with = "humantime_serde")]
    pub hard_timeout: Duration,
    /// How often the status of every task is logged. Zero disables the status log.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
    /// Number of worker threads. Defaults to the number of CPUs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
    /// Where the batches that could not be written are kept until they can.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backlog_dir: Option<PathBuf>,
    pub observer_channel_size: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        let settings = SchedulerSettings::default();
        Self {
            grace_period: settings.grace_period,
            hard_timeout: settings.hard_timeout,
            status_interval: Duration::from_secs(60),
            worker_threads: settings.worker_threads,
            backlog_dir: settings.backlog_dir,
            observer_channel_size: settings.observer_channel_size,
        }
    }
}

impl GeneralConfig {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            worker_threads: self.worker_threads,
            grace_period: self.grace_period,
            hard_timeout: self.hard_timeout,
            observer_channel_size: self.observer_channel_size,
            backlog_dir: self.backlog_dir.clone(),
        }
    }
}

/// The whole configuration of the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub general: GeneralConfig,
    pub collector: CollectorConfig,
}

impl AgentConfig {
    /// Splits a loaded configuration into the general options and the tasks.
    pub fn from_table(mut table: toml::Table) -> anyhow::Result<Self> {
        let mut tasks = toml::Table::new();
        if let Some(value) = table.remove(TASKS_KEY) {
            tasks.insert(String::from(TASKS_KEY), value);
        }
        let general: GeneralConfig = toml::Value::Table(table)
            .try_into()
            .context("invalid general config")?;
        let collector = CollectorConfig::from_table(tasks)?;
        Ok(Self { general, collector })
    }

    /// Serializes the general options and the tasks into a single configuration file.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let mut table = toml::Table::try_from(&self.general)?;
        let tasks = toml::Table::try_from(&self.collector)?;
        merge_override(&mut table, tasks);
        Ok(toml::to_string_pretty(&table)?)
    }
}

/// Generates the content of the default configuration file, with the given example tasks.
pub fn default_config(tasks: Vec<TaskConfig>) -> anyhow::Result<String> {
    let config = AgentConfig {
        general: GeneralConfig::default(),
        collector: CollectorConfig { tasks },
    };
    config.to_toml()
}

pub mod error {
    use std::{io, path::PathBuf};
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("could not load config from '{}'", config_file.display())]
    pub struct LoadError {
        pub config_file: PathBuf,
        #[source]
        pub(super) kind: LoadErrorCause,
    }

    #[derive(Error, Debug)]
    pub(super) enum LoadErrorCause {
        #[error("read failed")]
        Read(#[source] io::Error),
        #[error("could not generate the default config")]
        DefaultProvider(#[source] anyhow::Error),
        #[error("write (of default config) failed")]
        DefaultWrite(#[source] io::Error),
        #[error("env var substitution failed")]
        Substitution(#[from] InvalidSubstitutionError),
        #[error("invalid TOML config")]
        InvalidToml(#[from] toml::de::Error),
    }

    #[derive(Error, Debug, PartialEq)]
    pub enum InvalidSubstitutionError {
        /// The environment variable does not exist.
        #[error("the environment variable {0} does not exist")]
        Missing(String),
        /// The value of the variable is not valid UTF-8.
        #[error("value of env var {0} is not valid UTF-8")]
        InvalidValue(String),
        #[error("env var name {0:?} is not valid")]
        InvalidName(String),
        #[error("wrong use of the substitution syntax, it should be ${{ENV_VAR}}")]
        WrongSyntax,
    }
}
