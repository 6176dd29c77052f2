use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::actions::Action;
use crate::error::{ScheduleError, StoreError};
use crate::models::{MAX_DISPATCH_INTERVAL_SECS, NewSchedule, Schedule, TaskState};
use crate::registry::TaskRegistry;

pub mod memory;
pub mod postgres;

pub use memory::MemoryScheduleStore;
pub use postgres::PgScheduleStore;

const MAX_NAME_CHARS: usize = 256;

static NAME_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^[\w.\-]+$").ok());

/// Durable record of named schedules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
  /// Fails with `NameConflict` if the name is taken; never overwrites.
  async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError>;

  async fn get(&self, name: &str) -> Result<Option<Schedule>, StoreError>;

  /// All schedules, ordered by name.
  async fn list(&self) -> Result<Vec<Schedule>, StoreError>;

  async fn rename(&self, name: &str, new_name: &str) -> Result<Schedule, ScheduleError>;

  async fn delete(&self, name: &str) -> Result<bool, StoreError>;

  /// Snapshot of active schedules with `next_dispatch <= now`.
  async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;

  /// Moves `next_dispatch` from `expected` to `next` (`None` deactivates).
  /// Returns false when the schedule is gone or was already advanced.
  async fn advance(&self, id: Uuid, expected: DateTime<Utc>, next: Option<DateTime<Utc>>) -> Result<bool, StoreError>;

  async fn record_last_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StoreError>;

  /// Nulls every `last_task` pointing at one of `task_ids`.
  async fn clear_last_task(&self, task_ids: &[Uuid]) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleDescriptor {
  #[serde(flatten)]
  pub schedule: Schedule,
  pub active: bool,
  pub last_task_state: Option<TaskState>,
}

/// Management contract for schedules: validation on top of the store.
#[derive(Clone)]
pub struct ScheduleService {
  store: Arc<dyn ScheduleStore>,
  registry: TaskRegistry,
}

impl ScheduleService {
  pub fn new(store: Arc<dyn ScheduleStore>, registry: TaskRegistry) -> Self {
    Self { store, registry }
  }

  pub async fn create(&self, new: NewSchedule) -> Result<ScheduleDescriptor, ScheduleError> {
    validate_name(&new.name)?;
    let action = Action::from_name(&new.action).ok_or_else(|| ScheduleError::UnknownAction(new.action.clone()))?;
    if let Some(secs) = new.dispatch_interval_secs.filter(|secs| !(1..=MAX_DISPATCH_INTERVAL_SECS).contains(secs)) {
      return Err(ScheduleError::InvalidInterval(secs));
    }

    let now = Utc::now();
    let schedule = Schedule {
      id: Uuid::new_v4(),
      name: new.name,
      action,
      resource_id: new.resource_id,
      args: new.args,
      dispatch_interval_secs: new.dispatch_interval_secs,
      next_dispatch: Some(new.next_dispatch.unwrap_or(now)),
      last_task: None,
      created_at: now,
      updated_at: now,
    };
    let created = self.store.insert(schedule).await?;
    info!("Created schedule '{}' ({} on {})", created.name, created.action, created.resource_id);
    Ok(self.describe(created).await)
  }

  pub async fn get(&self, name: &str) -> Result<ScheduleDescriptor, ScheduleError> {
    let schedule = self.store.get(name).await?.ok_or_else(|| ScheduleError::NotFound(name.to_string()))?;
    Ok(self.describe(schedule).await)
  }

  pub async fn list(&self) -> Result<BTreeMap<String, ScheduleDescriptor>, ScheduleError> {
    let mut listing = BTreeMap::new();
    for schedule in self.store.list().await? {
      listing.insert(schedule.name.clone(), self.describe(schedule).await);
    }
    Ok(listing)
  }

  pub async fn rename(&self, name: &str, new_name: &str) -> Result<ScheduleDescriptor, ScheduleError> {
    validate_name(new_name)?;
    let renamed = self.store.rename(name, new_name).await?;
    info!("Renamed schedule '{}' to '{}'", name, new_name);
    Ok(self.describe(renamed).await)
  }

  pub async fn delete(&self, name: &str) -> Result<(), ScheduleError> {
    if !self.store.delete(name).await? {
      return Err(ScheduleError::NotFound(name.to_string()));
    }
    info!("Deleted schedule '{}'", name);
    Ok(())
  }

  async fn describe(&self, schedule: Schedule) -> ScheduleDescriptor {
    // last_task may point at a purged task; that simply resolves to no state
    let last_task_state = match schedule.last_task {
      Some(id) => self.registry.get(id).await.map(|task| task.state),
      None => None,
    };
    ScheduleDescriptor {
      active: schedule.is_active(),
      last_task_state,
      schedule,
    }
  }
}

pub fn validate_name(name: &str) -> Result<(), ScheduleError> {
  let length_ok = (1..=MAX_NAME_CHARS).contains(&name.chars().count());
  if length_ok && NAME_PATTERN.as_ref().is_some_and(|pattern| pattern.is_match(name)) {
    Ok(())
  } else {
    Err(ScheduleError::InvalidName(name.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::TaskRecord;
  use serde_json::Map;

  fn service() -> (ScheduleService, TaskRegistry) {
    let registry = TaskRegistry::new();
    (ScheduleService::new(Arc::new(MemoryScheduleStore::new()), registry.clone()), registry)
  }

  fn new_schedule(name: &str) -> NewSchedule {
    NewSchedule {
      name: name.into(),
      action: "sync".into(),
      resource_id: "repo-a".into(),
      args: Map::new(),
      dispatch_interval_secs: Some(3600),
      next_dispatch: None,
    }
  }

  #[tokio::test]
  async fn duplicate_name_is_a_conflict() {
    let (service, _) = service();
    let first = service.create(new_schedule("nightly")).await.unwrap();

    let mut other = new_schedule("nightly");
    other.resource_id = "repo-b".into();
    assert!(matches!(service.create(other).await, Err(ScheduleError::NameConflict(name)) if name == "nightly"));

    let kept = service.get("nightly").await.unwrap();
    assert_eq!(kept.schedule.id, first.schedule.id);
    assert_eq!(kept.schedule.resource_id, "repo-a");
  }

  #[tokio::test]
  async fn new_schedule_is_due_immediately() {
    let (service, _) = service();
    let created = service.create(new_schedule("nightly")).await.unwrap();
    assert!(created.active);
    assert!(created.schedule.is_due(Utc::now()));
  }

  #[tokio::test]
  async fn create_validates_input() {
    let (service, _) = service();
    assert!(matches!(service.create(new_schedule("bad name!")).await, Err(ScheduleError::InvalidName(_))));

    let mut unknown = new_schedule("upload");
    unknown.action = "upload".into();
    assert!(matches!(service.create(unknown).await, Err(ScheduleError::UnknownAction(_))));

    let mut zero = new_schedule("zero");
    zero.dispatch_interval_secs = Some(0);
    assert!(matches!(service.create(zero).await, Err(ScheduleError::InvalidInterval(0))));

    let mut huge = new_schedule("huge");
    huge.dispatch_interval_secs = Some(i64::MAX);
    assert!(matches!(service.create(huge).await, Err(ScheduleError::InvalidInterval(i64::MAX))));
    assert!(matches!(service.get("huge").await, Err(ScheduleError::NotFound(_))));
  }

  #[test]
  fn names_allow_word_characters_up_to_256() {
    assert!(validate_name("nightly-sync.v2_a").is_ok());
    assert!(validate_name(&"n".repeat(256)).is_ok());
    assert!(validate_name("ночной").is_ok());
    assert!(matches!(validate_name(&"n".repeat(257)), Err(ScheduleError::InvalidName(_))));
    assert!(validate_name("").is_err());
    assert!(validate_name("with space").is_err());
    assert!(validate_name("slash/name").is_err());
  }

  #[tokio::test]
  async fn rename_and_delete() {
    let (service, _) = service();
    service.create(new_schedule("a")).await.unwrap();
    service.create(new_schedule("b")).await.unwrap();

    assert!(matches!(service.rename("a", "b").await, Err(ScheduleError::NameConflict(_))));
    service.rename("a", "c").await.unwrap();
    assert!(matches!(service.get("a").await, Err(ScheduleError::NotFound(_))));

    let names: Vec<String> = service.list().await.unwrap().into_keys().collect();
    assert_eq!(names, vec!["b".to_string(), "c".to_string()]);

    service.delete("b").await.unwrap();
    assert!(matches!(service.delete("b").await, Err(ScheduleError::NotFound(_))));
  }

  #[tokio::test]
  async fn dangling_last_task_resolves_to_no_state() {
    let store = Arc::new(MemoryScheduleStore::new());
    let registry = TaskRegistry::new();
    let service = ScheduleService::new(store.clone(), registry.clone());
    let created = service.create(new_schedule("nightly")).await.unwrap();

    let task = registry
      .insert(TaskRecord::queued(Action::Sync, "repo-a".into(), vec![], Map::new(), None))
      .await;
    store.record_last_task(created.schedule.id, task.id()).await.unwrap();
    assert_eq!(service.get("nightly").await.unwrap().last_task_state, Some(TaskState::Queued));

    task.mark_canceled();
    registry.remove(task.id()).await.unwrap();
    let described = service.get("nightly").await.unwrap();
    assert_eq!(described.schedule.last_task, Some(task.id()));
    assert_eq!(described.last_task_state, None);
  }
}
