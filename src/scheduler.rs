use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::DispatchError;
use crate::schedules::ScheduleStore;

#[derive(Debug, Default)]
pub struct TickReport {
  pub dispatched: Vec<(String, Uuid)>,
  /// Due schedules that produced no task this cycle, with the reason.
  pub skipped: Vec<(String, String)>,
}

/// Fires due schedules through the same dispatcher manual requests use.
pub struct RecurringScheduler {
  store: Arc<dyn ScheduleStore>,
  dispatcher: Arc<Dispatcher>,
  ticking: Mutex<()>,
}

impl RecurringScheduler {
  pub fn new(store: Arc<dyn ScheduleStore>, dispatcher: Arc<Dispatcher>) -> Self {
    Self {
      store,
      dispatcher,
      ticking: Mutex::new(()),
    }
  }

  /// One pass over the schedules due at `now`. Each schedule is claimed by
  /// advancing `next_dispatch` before it is dispatched, so a due time fires
  /// at most once even if ticks overlap or another process shares the store.
  /// Errors are logged per schedule and never abort the pass.
  pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
    let _ticking = self.ticking.lock().await;
    let mut report = TickReport::default();

    let due = match self.store.due(now).await {
      Ok(due) => due,
      Err(e) => {
        error!("Failed to load due schedules: {}", e);
        return report;
      }
    };
    if !due.is_empty() {
      debug!("{} schedules due", due.len());
    }

    for schedule in due {
      let Some(due_at) = schedule.next_dispatch else { continue };
      let next = match schedule.following_dispatch(due_at) {
        Ok(next) => next,
        Err(e) => {
          // unusable interval: take it out of rotation instead of failing every tick
          error!("Schedule '{}' deactivated: {}", schedule.name, e);
          if let Err(e) = self.store.advance(schedule.id, due_at, None).await {
            error!("Failed to deactivate schedule '{}': {}", schedule.name, e);
          }
          report.skipped.push((schedule.name, e.to_string()));
          continue;
        }
      };
      match self.store.advance(schedule.id, due_at, next).await {
        Ok(true) => {}
        Ok(false) => {
          debug!("Schedule '{}' was changed or claimed elsewhere; skipping", schedule.name);
          continue;
        }
        Err(e) => {
          error!("Failed to advance schedule '{}': {}", schedule.name, e);
          report.skipped.push((schedule.name, e.to_string()));
          continue;
        }
      }
      if next.is_none() {
        info!("One-shot schedule '{}' fired; deactivated", schedule.name);
      }

      let request = DispatchRequest::from_params(schedule.action, schedule.resource_id.clone(), schedule.args.clone());
      let result = match request {
        Ok(request) => self.dispatcher.dispatch(request).await,
        Err(e) => Err(e),
      };
      match result {
        Ok(task) => {
          info!("Schedule '{}' dispatched task {}", schedule.name, task.id);
          if let Err(e) = self.store.record_last_task(schedule.id, task.id).await {
            warn!("Could not record last task for schedule '{}': {}", schedule.name, e);
          }
          report.dispatched.push((schedule.name, task.id));
        }
        Err(DispatchError::ResourceConflict(reason)) => {
          info!("Schedule '{}' skipped this cycle: {}", schedule.name, reason);
          report.skipped.push((schedule.name, reason));
        }
        Err(e) => {
          warn!("Schedule '{}' failed to dispatch: {}", schedule.name, e);
          report.skipped.push((schedule.name, e.to_string()));
        }
      }
    }
    report
  }

  pub async fn run(&self, every: Duration, shutdown: CancellationToken) {
    info!("Schedule tick loop started (every {:?})", every);
    let ticks = IntervalStream::new(interval(every)).take_until(shutdown.cancelled_owned());
    tokio::pin!(ticks);
    while ticks.next().await.is_some() {
      let report = self.tick(Utc::now()).await;
      if !report.dispatched.is_empty() || !report.skipped.is_empty() {
        debug!("Tick dispatched {}, skipped {}", report.dispatched.len(), report.skipped.len());
      }
    }
    info!("Schedule tick loop stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::actions::Action;
  use crate::conflict::{ConflictGuard, ConflictPolicy};
  use crate::models::{Schedule, TaskState};
  use crate::registry::TaskRegistry;
  use crate::resources::MemoryResourceStore;
  use crate::runner::{OperationRunner, RunnerConfig};
  use crate::schedules::MemoryScheduleStore;
  use crate::testing::{Behavior, Gates};
  use chrono::Duration as ChronoDuration;
  use serde_json::{Map, json};

  struct Fixture {
    registry: TaskRegistry,
    store: Arc<MemoryScheduleStore>,
    scheduler: RecurringScheduler,
    dispatcher: Arc<Dispatcher>,
    _gates: Gates,
  }

  async fn fixture() -> Fixture {
    let registry = TaskRegistry::new();
    let resources = MemoryResourceStore::new();
    resources.seed("repo-a=yum:http://mirror/a,repo-b=yum:http://mirror/b,local").await;
    let gates = Gates::new(Behavior::Succeed);
    let guard = Arc::new(ConflictGuard::new(ConflictPolicy::default(), registry.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
      gates.table(),
      guard,
      Arc::new(resources),
      OperationRunner::new(RunnerConfig::default()),
    ));
    let store = Arc::new(MemoryScheduleStore::new());
    let scheduler = RecurringScheduler::new(store.clone(), dispatcher.clone());
    Fixture { registry, store, scheduler, dispatcher, _gates: gates }
  }

  async fn add(store: &MemoryScheduleStore, name: &str, resource: &str, interval: Option<i64>, next: DateTime<Utc>) -> Schedule {
    let now = Utc::now();
    store
      .insert(Schedule {
        id: Uuid::new_v4(),
        name: name.into(),
        action: Action::Sync,
        resource_id: resource.into(),
        args: Map::new(),
        dispatch_interval_secs: interval,
        next_dispatch: Some(next),
        last_task: None,
        created_at: now,
        updated_at: now,
      })
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn due_schedule_advances_from_its_due_time() {
    let f = fixture().await;
    let now = Utc::now();
    let due_at = now - ChronoDuration::minutes(1);
    add(&f.store, "hourly", "repo-a", Some(3600), due_at).await;

    let report = f.scheduler.tick(now).await;
    assert_eq!(report.dispatched.len(), 1);

    let schedule = f.store.get("hourly").await.unwrap().unwrap();
    assert_eq!(schedule.next_dispatch, Some(due_at + ChronoDuration::hours(1)));
    assert_eq!(schedule.last_task, Some(report.dispatched[0].1));
    assert_eq!(f.registry.find(Some("repo-a"), Some(Action::Sync)).await.len(), 1);

    let again = f.scheduler.tick(now).await;
    assert!(again.dispatched.is_empty(), "same due time must not fire twice");
  }

  #[tokio::test]
  async fn busy_resource_skips_cycle_but_still_advances() {
    let f = fixture().await;
    let manual = f
      .dispatcher
      .dispatch(DispatchRequest::from_params(Action::Sync, "repo-a", Map::new()).unwrap())
      .await
      .unwrap();
    let now = Utc::now();
    let due_at = now - ChronoDuration::seconds(5);
    add(&f.store, "hourly", "repo-a", Some(3600), due_at).await;

    let report = f.scheduler.tick(now).await;
    assert!(report.dispatched.is_empty());
    assert_eq!(report.skipped.len(), 1);

    let schedule = f.store.get("hourly").await.unwrap().unwrap();
    assert_eq!(schedule.next_dispatch, Some(due_at + ChronoDuration::hours(1)));
    assert_eq!(schedule.last_task, None);
    let tasks = f.registry.find(Some("repo-a"), None).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, manual.id);
  }

  #[tokio::test]
  async fn one_failing_schedule_does_not_block_others() {
    let f = fixture().await;
    let now = Utc::now();
    add(&f.store, "a-missing", "nope", Some(60), now).await;
    add(&f.store, "b-no-source", "local", Some(60), now).await;
    add(&f.store, "c-good", "repo-b", Some(60), now).await;

    let report = f.scheduler.tick(now).await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].0, "c-good");
    assert_eq!(report.skipped.len(), 2);
    assert!(f.store.due(now).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn out_of_range_interval_is_deactivated_without_blocking_others() {
    let f = fixture().await;
    let now = Utc::now();
    add(&f.store, "a-huge", "repo-a", Some(i64::MAX), now).await;
    add(&f.store, "b-good", "repo-b", Some(60), now).await;

    let report = f.scheduler.tick(now).await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].0, "b-good");
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "a-huge");

    assert!(!f.store.get("a-huge").await.unwrap().unwrap().is_active());
    assert!(f.registry.find(Some("repo-a"), None).await.is_empty());
    assert!(f.scheduler.tick(now).await.skipped.is_empty());
  }

  #[tokio::test]
  async fn one_shot_schedule_deactivates_after_firing() {
    let f = fixture().await;
    let now = Utc::now();
    add(&f.store, "once", "repo-a", None, now).await;

    assert_eq!(f.scheduler.tick(now).await.dispatched.len(), 1);
    let schedule = f.store.get("once").await.unwrap().unwrap();
    assert!(!schedule.is_active());
    assert!(f.scheduler.tick(now + ChronoDuration::days(1)).await.dispatched.is_empty());
  }

  #[tokio::test]
  async fn future_schedules_are_left_alone() {
    let f = fixture().await;
    let now = Utc::now();
    let later = now + ChronoDuration::minutes(10);
    add(&f.store, "later", "repo-a", Some(60), later).await;

    assert!(f.scheduler.tick(now).await.dispatched.is_empty());
    assert_eq!(f.store.get("later").await.unwrap().unwrap().next_dispatch, Some(later));
  }

  #[tokio::test]
  async fn schedule_args_flow_into_dispatch() {
    let f = fixture().await;
    let now = Utc::now();
    let mut schedule = add(&f.store, "with-timeout", "repo-a", Some(60), now).await;
    f.store.delete(&schedule.name).await.unwrap();
    schedule.args = json!({"timeout": "2:hours", "skip": {"errata": 1}}).as_object().cloned().unwrap();
    f.store.insert(schedule).await.unwrap();

    let report = f.scheduler.tick(now).await;
    let task = f.registry.get(report.dispatched[0].1).await.unwrap();
    assert_eq!(task.timeout_secs, Some(7200));
    assert_eq!(task.kwargs.get("skip"), Some(&json!({"errata": 1})));
    assert!(matches!(task.state, TaskState::Queued | TaskState::Running));
  }

  #[tokio::test]
  async fn run_stops_on_shutdown() {
    let f = fixture().await;
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(1), f.scheduler.run(std::time::Duration::from_millis(10), shutdown))
      .await
      .expect("loop exits once shut down");
  }
}
