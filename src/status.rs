use uuid::Uuid;

use crate::actions::Action;
use crate::error::StatusError;
use crate::models::TaskRecord;
use crate::registry::{CancelOutcome, TaskRegistry};

/// Read and cancel paths over the task registry.
#[derive(Clone)]
pub struct StatusService {
  registry: TaskRegistry,
}

impl StatusService {
  pub fn new(registry: TaskRegistry) -> Self {
    Self { registry }
  }

  pub async fn get_status(&self, task_id: Uuid) -> Result<TaskRecord, StatusError> {
    self.registry.get(task_id).await.ok_or(StatusError::NotFound(task_id))
  }

  /// Matching tasks ordered by creation time, oldest first.
  pub async fn find(&self, resource_id: Option<&str>, action: Option<Action>) -> Vec<TaskRecord> {
    self.registry.find(resource_id, action).await
  }

  /// `Canceled` is returned once per task; later calls, and calls on tasks
  /// that already reached a terminal state, get `AlreadyComplete`.
  pub async fn cancel(&self, task_id: Uuid) -> Result<CancelOutcome, StatusError> {
    self.registry.request_cancel(task_id).await.ok_or(StatusError::NotFound(task_id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Map;

  #[tokio::test]
  async fn unknown_task_is_not_found() {
    let status = StatusService::new(TaskRegistry::new());
    let id = Uuid::new_v4();
    assert!(matches!(status.get_status(id).await, Err(StatusError::NotFound(missing)) if missing == id));
    assert!(matches!(status.cancel(id).await, Err(StatusError::NotFound(_))));
    assert!(status.find(Some("repo-a"), None).await.is_empty());
  }

  #[tokio::test]
  async fn cancel_succeeds_exactly_once() {
    let registry = TaskRegistry::new();
    let status = StatusService::new(registry.clone());
    let record = TaskRecord::queued(Action::Sync, "repo-a".into(), vec![], Map::new(), None);
    let id = registry.insert(record).await.id();

    assert!(matches!(status.cancel(id).await, Ok(CancelOutcome::Canceled(_))));
    assert!(matches!(status.cancel(id).await, Ok(CancelOutcome::AlreadyComplete(_))));
  }
}
