use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::time::interval;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::StatusError;
use crate::models::TaskRecord;
use crate::registry::TaskRegistry;
use crate::schedules::ScheduleStore;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
  /// A running task whose heartbeat is older than this lost its runner.
  pub runner_lost_after: Duration,
  /// Terminal tasks are dropped from the registry after this long.
  pub retention: Duration,
}

impl Default for ReaperConfig {
  fn default() -> Self {
    Self {
      runner_lost_after: Duration::from_secs(60),
      retention: Duration::from_secs(86_400),
    }
  }
}

#[derive(Debug, Default)]
pub struct ReapReport {
  pub lost: Vec<Uuid>,
  pub purged: Vec<Uuid>,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(age)
    .ok()
    .and_then(|age| now.checked_sub_signed(age))
    .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct Reaper {
  registry: TaskRegistry,
  schedules: Arc<dyn ScheduleStore>,
  config: ReaperConfig,
}

impl Reaper {
  pub fn new(registry: TaskRegistry, schedules: Arc<dyn ScheduleStore>, config: ReaperConfig) -> Self {
    Self { registry, schedules, config }
  }

  /// Tasks failed by this pass are not purged by it.
  pub async fn pass(&self, now: DateTime<Utc>) -> ReapReport {
    let purged = self.registry.purge_terminal(cutoff(now, self.config.retention)).await;
    if !purged.is_empty() {
      match self.schedules.clear_last_task(&purged).await {
        Ok(0) => {}
        Ok(cleared) => info!("Cleared last_task on {} schedules", cleared),
        Err(e) => error!("Failed to clear last_task for purged tasks: {}", e),
      }
    }

    let lost = self.registry.fail_lost(cutoff(now, self.config.runner_lost_after)).await;
    ReapReport { lost, purged }
  }

  /// Drops one terminal task ahead of its retention, unlinking any schedule
  /// that still points at it.
  pub async fn remove(&self, id: Uuid) -> Result<TaskRecord, StatusError> {
    let record = self.registry.remove(id).await?;
    if let Err(e) = self.schedules.clear_last_task(&[id]).await {
      error!("Failed to clear last_task for removed task {}: {}", id, e);
    }
    info!("Removed task {}", id);
    Ok(record)
  }

  pub async fn run(&self, every: Duration, shutdown: CancellationToken) {
    info!("Reaper started (every {:?})", every);
    let ticks = IntervalStream::new(interval(every)).take_until(shutdown.cancelled_owned());
    tokio::pin!(ticks);
    while ticks.next().await.is_some() {
      self.pass(Utc::now()).await;
    }
    info!("Reaper stopped");
  }
}
