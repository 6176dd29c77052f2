use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::ScheduleStore;
use crate::actions::Action;
use crate::error::{ScheduleError, StoreError};
use crate::models::Schedule;

const COLUMNS: &str =
  "id, name, action, resource_id, args, dispatch_interval_secs, next_dispatch, last_task, created_at, updated_at";

#[derive(FromRow)]
struct ScheduleRow {
  id: Uuid,
  name: String,
  action: String,
  resource_id: String,
  args: Json<Map<String, Value>>,
  dispatch_interval_secs: Option<i64>,
  next_dispatch: Option<DateTime<Utc>>,
  last_task: Option<Uuid>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for Schedule {
  type Error = StoreError;

  fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
    let action = Action::from_name(&row.action).ok_or_else(|| StoreError::Corrupt {
      id: row.id.to_string(),
      message: format!("unknown action '{}'", row.action),
    })?;
    Ok(Schedule {
      id: row.id,
      name: row.name,
      action,
      resource_id: row.resource_id,
      args: row.args.0,
      dispatch_interval_secs: row.dispatch_interval_secs,
      next_dispatch: row.next_dispatch,
      last_task: row.last_task,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
  matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Schedules kept in the `task_schedules` table.
pub struct PgScheduleStore {
  pool: PgPool,
}

impl PgScheduleStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
  async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError> {
    let query = format!(
      "INSERT INTO task_schedules ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING {COLUMNS}"
    );
    let row = sqlx::query_as::<_, ScheduleRow>(&query)
      .bind(schedule.id)
      .bind(&schedule.name)
      .bind(schedule.action.name())
      .bind(&schedule.resource_id)
      .bind(Json(&schedule.args))
      .bind(schedule.dispatch_interval_secs)
      .bind(schedule.next_dispatch)
      .bind(schedule.last_task)
      .bind(schedule.created_at)
      .bind(schedule.updated_at)
      .fetch_one(&self.pool)
      .await
      .map_err(|e| {
        if is_unique_violation(&e) {
          ScheduleError::NameConflict(schedule.name.clone())
        } else {
          StoreError::from(e).into()
        }
      })?;
    Ok(Schedule::try_from(row)?)
  }

  async fn get(&self, name: &str) -> Result<Option<Schedule>, StoreError> {
    let query = format!("SELECT {COLUMNS} FROM task_schedules WHERE name = $1");
    sqlx::query_as::<_, ScheduleRow>(&query)
      .bind(name)
      .fetch_optional(&self.pool)
      .await?
      .map(Schedule::try_from)
      .transpose()
  }

  async fn list(&self) -> Result<Vec<Schedule>, StoreError> {
    let query = format!("SELECT {COLUMNS} FROM task_schedules ORDER BY name");
    sqlx::query_as::<_, ScheduleRow>(&query)
      .fetch_all(&self.pool)
      .await?
      .into_iter()
      .map(Schedule::try_from)
      .collect()
  }

  async fn rename(&self, name: &str, new_name: &str) -> Result<Schedule, ScheduleError> {
    let query = format!("UPDATE task_schedules SET name = $2, updated_at = NOW() WHERE name = $1 RETURNING {COLUMNS}");
    let row = sqlx::query_as::<_, ScheduleRow>(&query)
      .bind(name)
      .bind(new_name)
      .fetch_optional(&self.pool)
      .await
      .map_err(|e| {
        if is_unique_violation(&e) {
          ScheduleError::NameConflict(new_name.to_string())
        } else {
          StoreError::from(e).into()
        }
      })?
      .ok_or_else(|| ScheduleError::NotFound(name.to_string()))?;
    Ok(Schedule::try_from(row)?)
  }

  async fn delete(&self, name: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM task_schedules WHERE name = $1")
      .bind(name)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
    let query = format!(
      "SELECT {COLUMNS} FROM task_schedules WHERE next_dispatch IS NOT NULL AND next_dispatch <= $1 ORDER BY next_dispatch"
    );
    sqlx::query_as::<_, ScheduleRow>(&query)
      .bind(now)
      .fetch_all(&self.pool)
      .await?
      .into_iter()
      .map(Schedule::try_from)
      .collect()
  }

  async fn advance(&self, id: Uuid, expected: DateTime<Utc>, next: Option<DateTime<Utc>>) -> Result<bool, StoreError> {
    let result = sqlx::query(
      "UPDATE task_schedules SET next_dispatch = $3, updated_at = NOW() WHERE id = $1 AND next_dispatch = $2",
    )
    .bind(id)
    .bind(expected)
    .bind(next)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() == 1)
  }

  async fn record_last_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StoreError> {
    sqlx::query("UPDATE task_schedules SET last_task = $2 WHERE id = $1")
      .bind(id)
      .bind(task_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn clear_last_task(&self, task_ids: &[Uuid]) -> Result<u64, StoreError> {
    let result = sqlx::query("UPDATE task_schedules SET last_task = NULL WHERE last_task = ANY($1)")
      .bind(task_ids.to_vec())
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }
}
