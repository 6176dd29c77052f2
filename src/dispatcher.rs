use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::actions::{Action, ActionTable};
use crate::conflict::ConflictGuard;
use crate::error::DispatchError;
use crate::models::TaskRecord;
use crate::resources::ResourceStore;
use crate::runner::OperationRunner;

/// Parses `<value>:<units>`, e.g. `2:hours`.
pub fn parse_timeout(raw: &str) -> Result<Duration, DispatchError> {
  let invalid = || DispatchError::InvalidArguments(format!("Invalid timeout '{}', expected <value>:<units>", raw));
  let (value, units) = raw.split_once(':').ok_or_else(invalid)?;
  let value: u64 = value.trim().parse().map_err(|_| invalid())?;
  let units = units.trim();
  let seconds = match units.strip_suffix('s').unwrap_or(units) {
    "second" => 1,
    "minute" => 60,
    "hour" => 3600,
    "day" => 86_400,
    "week" => 604_800,
    _ => return Err(invalid()),
  };
  value.checked_mul(seconds).map(Duration::from_secs).ok_or_else(invalid)
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
  pub action: Action,
  pub resource_id: String,
  pub params: Map<String, Value>,
  pub timeout: Option<Duration>,
}

impl DispatchRequest {
  /// Splits the `timeout` field out of request parameters; everything else
  /// is kept for the operation.
  pub fn from_params(action: Action, resource_id: impl Into<String>, mut params: Map<String, Value>) -> Result<Self, DispatchError> {
    let timeout = match params.remove("timeout") {
      None | Some(Value::Null) => None,
      Some(Value::String(raw)) => Some(parse_timeout(&raw)?),
      Some(other) => {
        return Err(DispatchError::InvalidArguments(format!("Invalid timeout {}", other)));
      }
    };
    Ok(Self {
      action,
      resource_id: resource_id.into(),
      params,
      timeout,
    })
  }
}

pub struct Dispatcher {
  actions: ActionTable,
  guard: Arc<ConflictGuard>,
  resources: Arc<dyn ResourceStore>,
  runner: OperationRunner,
}

impl Dispatcher {
  pub fn new(
    actions: ActionTable,
    guard: Arc<ConflictGuard>,
    resources: Arc<dyn ResourceStore>,
    runner: OperationRunner,
  ) -> Self {
    Self { actions, guard, resources, runner }
  }

  /// Creates a queued task and hands it to the runner. Returns as soon as
  /// the task is registered; nothing here waits on the operation.
  pub async fn dispatch(&self, request: DispatchRequest) -> Result<TaskRecord, DispatchError> {
    let DispatchRequest { action, resource_id, params, timeout } = request;

    if !self.resources.exists(&resource_id).await? {
      return Err(DispatchError::ResourceNotFound(resource_id));
    }
    let operation = self.actions.get(action);
    let args = operation
      .prepare(&resource_id, &params, self.resources.as_ref())
      .await
      .inspect_err(|e| warn!("Rejected {} on {}: {}", action, resource_id, e))?;

    let record = TaskRecord::queued(action, resource_id, args, params, timeout);
    let handle = self.guard.claim(record).await?;
    let snapshot = handle.snapshot();
    self.runner.submit(handle, operation);

    info!("Dispatched {} on {} as task {}", action, snapshot.resource_id, snapshot.id);
    Ok(snapshot)
  }
}
