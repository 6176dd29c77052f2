use thiserror::Error;
use uuid::Uuid;

/// Failures detected synchronously while dispatching. None of these create a
/// task record.
#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("No implementation for action '{0}'")]
  UnknownAction(String),

  #[error("No repository with id {0} found")]
  ResourceNotFound(String),

  #[error("{0}")]
  ResourceConflict(String),

  #[error("{0}")]
  PreconditionNotMet(String),

  #[error("Invalid arguments: {0}")]
  InvalidArguments(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("Database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("Corrupt record {id}: {message}")]
  Corrupt { id: String, message: String },
}

#[derive(Debug, Error)]
pub enum ScheduleError {
  #[error("A schedule named '{0}' already exists")]
  NameConflict(String),

  #[error("No schedule named '{0}'")]
  NotFound(String),

  #[error("Invalid schedule name '{0}'")]
  InvalidName(String),

  #[error("No implementation for action '{0}'")]
  UnknownAction(String),

  #[error("Dispatch interval must be between 1s and ten years, got {0}s")]
  InvalidInterval(i64),

  #[error(transparent)]
  Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StatusError {
  #[error("No task with id {0} found")]
  NotFound(Uuid),

  #[error("Task {0} is still active")]
  StillActive(Uuid),
}
