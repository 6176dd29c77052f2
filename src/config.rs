use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};

use crate::conflict::{ConflictPolicy, DEFAULT_CONFLICT_CLASSES};
use crate::reaper::ReaperConfig;
use crate::runner::RunnerConfig;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: Option<String>,
  pub server_port: u16,
  /// `id[=feed]` list seeding the in-memory catalog when there is no database.
  pub repositories: Option<String>,
  pub tick_interval: Duration,
  pub reaper_interval: Duration,
  pub operation_step: Duration,
  pub conflict_classes: ConflictPolicy,
  pub runner: RunnerConfig,
  pub reaper: ReaperConfig,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|name| env::var(name).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let secs = |name: &str, default: u64| parse_or(&lookup, name, default).map(Duration::from_secs);
    let conflict_spec = lookup("CONFLICT_CLASSES").unwrap_or_else(|| DEFAULT_CONFLICT_CLASSES.into());

    let config = Self {
      database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
      server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
      repositories: lookup("REPOSITORIES"),
      tick_interval: secs("TICK_INTERVAL_SECS", 30)?,
      reaper_interval: secs("REAPER_INTERVAL_SECS", 15)?,
      operation_step: Duration::from_millis(parse_or(&lookup, "OPERATION_STEP_MS", 2000)?),
      conflict_classes: ConflictPolicy::parse(&conflict_spec).context("CONFLICT_CLASSES")?,
      runner: RunnerConfig {
        max_concurrent: parse_or(&lookup, "MAX_CONCURRENT_TASKS", 4)?,
        heartbeat: secs("HEARTBEAT_SECS", 5)?,
        cancel_grace: secs("CANCEL_GRACE_SECS", 30)?,
      },
      reaper: ReaperConfig {
        runner_lost_after: secs("RUNNER_LOST_SECS", 60)?,
        retention: secs("TASK_RETENTION_SECS", 86_400)?,
      },
    };

    for (name, period) in [
      ("TICK_INTERVAL_SECS", config.tick_interval),
      ("REAPER_INTERVAL_SECS", config.reaper_interval),
      ("HEARTBEAT_SECS", config.runner.heartbeat),
    ] {
      ensure!(!period.is_zero(), "{} must be greater than zero", name);
    }
    Ok(config)
  }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: Display,
{
  match lookup(name) {
    None => Ok(default),
    Some(raw) => raw.trim().parse().map_err(|e| anyhow!("Invalid {}='{}': {}", name, raw, e)),
  }
}
