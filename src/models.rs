use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};

use crate::actions::Action;
use crate::error::ScheduleError;

/// Longest accepted `dispatch_interval_secs` (ten years).
pub const MAX_DISPATCH_INTERVAL_SECS: i64 = 10 * 366 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
  Queued,
  Running,
  Finished,
  Failed,
  Canceled,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskState::Finished | TaskState::Failed | TaskState::Canceled)
  }

  pub fn is_active(self) -> bool {
    !self.is_terminal()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  RunnerFailure,
  RunnerLost,
  Timeout,
}

/// Failure recorded on a task that ended in `FAILED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
  pub kind: FailureKind,
  pub message: String,
}

impl TaskError {
  pub fn runner_failure(err: &anyhow::Error) -> Self {
    Self { kind: FailureKind::RunnerFailure, message: format!("{:#}", err) }
  }

  pub fn runner_lost(message: impl Into<String>) -> Self {
    Self { kind: FailureKind::RunnerLost, message: message.into() }
  }

  pub fn timeout(after: std::time::Duration) -> Self {
    Self {
      kind: FailureKind::Timeout,
      message: format!("Operation exceeded its timeout of {}s", after.as_secs()),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
  pub id: Uuid,
  pub action: Action,
  pub resource_id: String,
  pub args: Vec<Value>,
  pub kwargs: Map<String, Value>,
  pub state: TaskState,
  pub progress: u8,
  pub result: Option<Value>,
  pub error: Option<TaskError>,
  pub timeout_secs: Option<u64>,
  pub cancel_requested: bool,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub heartbeat_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
  pub fn queued(
    action: Action,
    resource_id: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    timeout: Option<std::time::Duration>,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      action,
      resource_id,
      args,
      kwargs,
      state: TaskState::Queued,
      progress: 0,
      result: None,
      error: None,
      timeout_secs: timeout.map(|t| t.as_secs()),
      cancel_requested: false,
      created_at: Utc::now(),
      started_at: None,
      finished_at: None,
      heartbeat_at: None,
    }
  }
}

/// A named instruction to dispatch `action` on `resource_id`, either once or
/// every `dispatch_interval_secs`. `next_dispatch` is `None` once a one-shot
/// schedule has fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
  pub id: Uuid,
  pub name: String,
  pub action: Action,
  pub resource_id: String,
  pub args: Map<String, Value>,
  pub dispatch_interval_secs: Option<i64>,
  pub next_dispatch: Option<DateTime<Utc>>,
  pub last_task: Option<Uuid>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Schedule {
  pub fn is_active(&self) -> bool {
    self.next_dispatch.is_some()
  }

  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_dispatch.is_some_and(|next| next <= now)
  }

  /// Where `next_dispatch` moves after firing for `fired_at`. `None` for a
  /// one-shot schedule; an error when the interval cannot be represented.
  pub fn following_dispatch(&self, fired_at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let Some(secs) = self.dispatch_interval_secs else {
      return Ok(None);
    };
    Duration::try_seconds(secs)
      .filter(|interval| *interval > Duration::zero())
      .and_then(|interval| fired_at.checked_add_signed(interval))
      .map(Some)
      .ok_or(ScheduleError::InvalidInterval(secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSchedule {
  pub name: String,
  pub action: String,
  pub resource_id: String,
  #[serde(default)]
  pub args: Map<String, Value>,
  pub dispatch_interval_secs: Option<i64>,
  pub next_dispatch: Option<DateTime<Utc>>,
}
