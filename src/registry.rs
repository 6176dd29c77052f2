use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::Action;
use crate::error::StatusError;
use crate::models::{TaskError, TaskRecord, TaskState};

struct TaskEntry {
  seq: u64,
  record: watch::Sender<TaskRecord>,
  cancel: CancellationToken,
}

impl TaskEntry {
  fn snapshot(&self) -> TaskRecord {
    self.record.borrow().clone()
  }

  /// Compare-and-swap on the task state. Subscribers are only woken when the
  /// transition actually happens.
  fn transition(&self, from: &[TaskState], to: TaskState, apply: impl FnOnce(&mut TaskRecord)) -> bool {
    let now = Utc::now();
    self.record.send_if_modified(|record| {
      if !from.contains(&record.state) {
        return false;
      }
      record.state = to;
      if to == TaskState::Running {
        record.started_at = Some(now);
        record.heartbeat_at = Some(now);
      } else if to.is_terminal() {
        record.finished_at = Some(now);
      }
      apply(record);
      true
    })
  }
}

/// Outcome of a cancellation request on an existing task.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
  Canceled(TaskRecord),
  AlreadyComplete(TaskRecord),
}

/// Index of every task record known to this process.
///
/// Readers share the map lock; each task's record sits behind its own watch
/// channel so state writes serialize per task and run in parallel across
/// tasks. Cloning the registry clones the handle, not the data.
#[derive(Clone, Default)]
pub struct TaskRegistry {
  inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
  tasks: RwLock<HashMap<Uuid, Arc<TaskEntry>>>,
  seq: AtomicU64,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn insert(&self, record: TaskRecord) -> TaskHandle {
    let id = record.id;
    let entry = Arc::new(TaskEntry {
      seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
      record: watch::channel(record).0,
      cancel: CancellationToken::new(),
    });
    self.inner.tasks.write().await.insert(id, entry.clone());
    debug!("Registered task {}", id);
    TaskHandle { entry }
  }

  pub async fn get(&self, id: Uuid) -> Option<TaskRecord> {
    self.entry(id).await.map(|entry| entry.snapshot())
  }

  pub async fn handle(&self, id: Uuid) -> Option<TaskHandle> {
    self.entry(id).await.map(|entry| TaskHandle { entry })
  }

  pub async fn subscribe(&self, id: Uuid) -> Option<watch::Receiver<TaskRecord>> {
    self.entry(id).await.map(|entry| entry.record.subscribe())
  }

  /// Tasks matching the optional filters, oldest first.
  pub async fn find(&self, resource_id: Option<&str>, action: Option<Action>) -> Vec<TaskRecord> {
    let tasks = self.inner.tasks.read().await;
    let mut matches: Vec<(u64, TaskRecord)> = tasks
      .values()
      .map(|entry| (entry.seq, entry.snapshot()))
      .filter(|(_, record)| resource_id.is_none_or(|id| record.resource_id == id))
      .filter(|(_, record)| action.is_none_or(|action| record.action == action))
      .collect();
    matches.sort_by_key(|(seq, _)| *seq);
    matches.into_iter().map(|(_, record)| record).collect()
  }

  /// First queued or running task on `resource_id` whose action is in `actions`.
  pub async fn active_on(&self, resource_id: &str, actions: &[Action]) -> Option<Uuid> {
    let tasks = self.inner.tasks.read().await;
    tasks.values().find_map(|entry| {
      let record = entry.record.borrow();
      let hit = record.state.is_active()
        && record.resource_id == resource_id
        && actions.contains(&record.action);
      hit.then_some(record.id)
    })
  }

  /// Records the cancellation intent and signals the runner. Queued tasks
  /// are canceled on the spot; running ones move to `CANCELED` once the
  /// runner observes the signal.
  pub async fn request_cancel(&self, id: Uuid) -> Option<CancelOutcome> {
    let entry = self.entry(id).await?;
    let now = Utc::now();
    let mut requested = false;
    entry.record.send_if_modified(|record| {
      if record.state.is_terminal() || record.cancel_requested {
        return false;
      }
      record.cancel_requested = true;
      if record.state == TaskState::Queued {
        record.state = TaskState::Canceled;
        record.finished_at = Some(now);
      }
      requested = true;
      true
    });
    let snapshot = entry.snapshot();
    if requested {
      entry.cancel.cancel();
      info!("Cancellation requested for task {} ({:?})", id, snapshot.state);
      Some(CancelOutcome::Canceled(snapshot))
    } else {
      Some(CancelOutcome::AlreadyComplete(snapshot))
    }
  }

  /// Fails every running task whose last heartbeat is older than `cutoff`.
  pub async fn fail_lost(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
    let tasks = self.inner.tasks.read().await;
    let mut lost = Vec::new();
    for entry in tasks.values() {
      let stale = {
        let record = entry.record.borrow();
        record.state == TaskState::Running && record.heartbeat_at.is_none_or(|beat| beat < cutoff)
      };
      if !stale {
        continue;
      }
      let error = TaskError::runner_lost("No heartbeat from the operation runner");
      if entry.transition(&[TaskState::Running], TaskState::Failed, |record| record.error = Some(error)) {
        entry.cancel.cancel();
        let id = entry.record.borrow().id;
        warn!("Task {} lost its runner; marked failed", id);
        lost.push(id);
      }
    }
    lost
  }

  /// Drops terminal tasks that finished before `cutoff`.
  pub async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
    let mut tasks = self.inner.tasks.write().await;
    let mut purged = Vec::new();
    tasks.retain(|id, entry| {
      let record = entry.record.borrow();
      let expired = record.state.is_terminal() && record.finished_at.is_some_and(|at| at < cutoff);
      if expired {
        purged.push(*id);
      }
      !expired
    });
    if !purged.is_empty() {
      info!("Purged {} finished tasks", purged.len());
    }
    purged
  }

  pub async fn remove(&self, id: Uuid) -> Result<TaskRecord, StatusError> {
    let mut tasks = self.inner.tasks.write().await;
    let entry = tasks.get(&id).ok_or(StatusError::NotFound(id))?;
    let record = entry.snapshot();
    if record.state.is_active() {
      return Err(StatusError::StillActive(id));
    }
    tasks.remove(&id);
    Ok(record)
  }

  pub async fn len(&self) -> usize {
    self.inner.tasks.read().await.len()
  }

  async fn entry(&self, id: Uuid) -> Option<Arc<TaskEntry>> {
    self.inner.tasks.read().await.get(&id).cloned()
  }
}

/// The narrow write capability over one task handed to the runner.
#[derive(Clone)]
pub struct TaskHandle {
  entry: Arc<TaskEntry>,
}

impl TaskHandle {
  pub fn id(&self) -> Uuid {
    self.entry.record.borrow().id
  }

  pub fn snapshot(&self) -> TaskRecord {
    self.entry.snapshot()
  }

  pub fn cancellation(&self) -> CancellationToken {
    self.entry.cancel.clone()
  }

  pub fn start(&self) -> bool {
    let started = self.entry.transition(&[TaskState::Queued], TaskState::Running, |_| {});
    if started {
      info!("Task {} running", self.id());
    }
    started
  }

  pub fn heartbeat(&self) {
    let now = Utc::now();
    // liveness only; not worth waking subscribers
    self.entry.record.send_if_modified(|record| {
      if record.state == TaskState::Running {
        record.heartbeat_at = Some(now);
      }
      false
    });
  }

  pub fn set_progress(&self, progress: u8) {
    let progress = progress.min(100);
    self.entry.record.send_if_modified(|record| {
      if record.state != TaskState::Running || record.progress == progress {
        return false;
      }
      record.progress = progress;
      true
    });
  }

  pub fn finish(&self, result: Value) -> bool {
    let finished = self.entry.transition(&[TaskState::Running], TaskState::Finished, |record| {
      record.progress = 100;
      record.result = Some(result);
    });
    if finished {
      info!("Task {} finished", self.id());
    }
    finished
  }

  pub fn fail(&self, error: TaskError) -> bool {
    let message = error.message.clone();
    let failed = self.entry.transition(&[TaskState::Running], TaskState::Failed, |record| {
      record.error = Some(error);
    });
    if failed {
      warn!("Task {} failed: {}", self.id(), message);
    }
    failed
  }

  pub fn mark_canceled(&self) -> bool {
    let canceled = self.entry.transition(&[TaskState::Queued, TaskState::Running], TaskState::Canceled, |_| {});
    if canceled {
      info!("Task {} canceled", self.id());
    }
    canceled
  }
}
