use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ScheduleStore;
use crate::error::{ScheduleError, StoreError};
use crate::models::Schedule;

/// Process-local schedule store, used when no database is configured.
#[derive(Default)]
pub struct MemoryScheduleStore {
  schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
  async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError> {
    let mut schedules = self.schedules.write().await;
    if schedules.values().any(|s| s.name == schedule.name) {
      return Err(ScheduleError::NameConflict(schedule.name));
    }
    schedules.insert(schedule.id, schedule.clone());
    Ok(schedule)
  }

  async fn get(&self, name: &str) -> Result<Option<Schedule>, StoreError> {
    Ok(self.schedules.read().await.values().find(|s| s.name == name).cloned())
  }

  async fn list(&self) -> Result<Vec<Schedule>, StoreError> {
    let mut all: Vec<Schedule> = self.schedules.read().await.values().cloned().collect();
    all.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(all)
  }

  async fn rename(&self, name: &str, new_name: &str) -> Result<Schedule, ScheduleError> {
    let mut schedules = self.schedules.write().await;
    if name != new_name && schedules.values().any(|s| s.name == new_name) {
      return Err(ScheduleError::NameConflict(new_name.to_string()));
    }
    let schedule = schedules
      .values_mut()
      .find(|s| s.name == name)
      .ok_or_else(|| ScheduleError::NotFound(name.to_string()))?;
    schedule.name = new_name.to_string();
    schedule.updated_at = Utc::now();
    Ok(schedule.clone())
  }

  async fn delete(&self, name: &str) -> Result<bool, StoreError> {
    let mut schedules = self.schedules.write().await;
    let before = schedules.len();
    schedules.retain(|_, s| s.name != name);
    Ok(schedules.len() != before)
  }

  async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
    let mut due: Vec<Schedule> = self.schedules.read().await.values().filter(|s| s.is_due(now)).cloned().collect();
    due.sort_by_key(|s| s.next_dispatch);
    Ok(due)
  }

  async fn advance(&self, id: Uuid, expected: DateTime<Utc>, next: Option<DateTime<Utc>>) -> Result<bool, StoreError> {
    let mut schedules = self.schedules.write().await;
    match schedules.get_mut(&id) {
      Some(schedule) if schedule.next_dispatch == Some(expected) => {
        schedule.next_dispatch = next;
        schedule.updated_at = Utc::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn record_last_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StoreError> {
    if let Some(schedule) = self.schedules.write().await.get_mut(&id) {
      schedule.last_task = Some(task_id);
    }
    Ok(())
  }

  async fn clear_last_task(&self, task_ids: &[Uuid]) -> Result<u64, StoreError> {
    let mut cleared = 0;
    for schedule in self.schedules.write().await.values_mut() {
      if schedule.last_task.is_some_and(|id| task_ids.contains(&id)) {
        schedule.last_task = None;
        cleared += 1;
      }
    }
    Ok(cleared)
  }
}
