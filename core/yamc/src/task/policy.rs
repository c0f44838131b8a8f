//! Scheduling, retry and restart policies.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::plugin::PluginDescriptor;

/// When a collector task runs its cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Fetch from every provider at a fixed interval, which must be greater than zero.
    FixedInterval(Duration),
    /// Fetch from every provider at the times of a cron schedule, in local time.
    Cron(CronSchedule),
    /// Subscribe to every provider, and dispatch records as they are pushed.
    EventDriven,
}

impl SchedulingPolicy {
    /// Returns `true` if the providers are polled, `false` if they push their records.
    pub fn is_pull(&self) -> bool {
        !matches!(self, SchedulingPolicy::EventDriven)
    }
}

/// A cron expression.
///
/// Both the classic form, `min hour day month weekday`, and the form with seconds
/// (and optionally years) are accepted. Weekdays are best written by name (`Mon-Fri`).
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Arc<cron::Schedule>,
}

impl CronSchedule {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first time of the schedule that is strictly after `now`.
    ///
    /// Returns `None` if the schedule has no upcoming time.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(now).next()
    }
}

impl FromStr for CronSchedule {
    type Err = cron::error::Error;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let expression = expression.trim();
        // without seconds: run at the start of the minute
        let schedule = if expression.split_whitespace().count() == 5 {
            cron::Schedule::from_str(&format!("0 {expression}"))?
        } else {
            cron::Schedule::from_str(expression)?
        };
        Ok(Self {
            expression: expression.to_owned(),
            schedule: Arc::new(schedule),
        })
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingPolicy::FixedInterval(period) => write!(f, "every {period:?}"),
            SchedulingPolicy::Cron(schedule) => write!(f, "cron '{schedule}'"),
            SchedulingPolicy::EventDriven => f.write_str("on event"),
        }
    }
}

/// Retries of a batch that could not be written.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Maximum number of attempts per batch, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound of the delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// The delay is multiplied by this factor after each failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The delay to wait after the failed attempt number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// What to do with a batch when the retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustedPolicy {
    /// Discard the batch.
    #[default]
    Drop,
    /// Store the batch in the backlog of the writer, to write it later.
    Spill,
}

/// Automatic restart of a quarantined task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// The delay before the restart number `restart` (starting at 1). Doubles after each restart.
    pub fn delay(&self, restart: u32) -> Duration {
        let factor = 2u32.saturating_pow(restart.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IntervalOptions {
    #[serde(with = "humantime_serde")]
    every: Duration,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CronOptions {
    schedule: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EventOptions {}

/// The collection strategies that are always available.
pub(crate) fn builtin_strategies() -> Vec<PluginDescriptor> {
    let version = env!("CARGO_PKG_VERSION");
    vec![
        PluginDescriptor::collector("interval", version, |options| {
            let options: IntervalOptions = options.deserialize()?;
            anyhow::ensure!(!options.every.is_zero(), "the interval must be greater than zero");
            Ok(SchedulingPolicy::FixedInterval(options.every))
        }),
        PluginDescriptor::collector("cron", version, |options| {
            let options: CronOptions = options.deserialize()?;
            let schedule = CronSchedule::from_str(&options.schedule)
                .with_context(|| format!("invalid cron expression '{}'", options.schedule))?;
            Ok(SchedulingPolicy::Cron(schedule))
        }),
        PluginDescriptor::collector("event", version, |options| {
            let _: EventOptions = options.deserialize()?;
            Ok(SchedulingPolicy::EventDriven)
        }),
    ]
}
