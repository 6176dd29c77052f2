use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::actions::{Action, ActionTable, Operation};
use crate::error::DispatchError;
use crate::resources::ResourceStore;
use crate::runner::TaskContext;

const SYNC_STAGES: &[(&str, u8)] = &[
  ("fetch metadata", 20),
  ("download packages", 60),
  ("import errata", 80),
  ("write metadata", 100),
];
const CLONE_STAGES: &[(&str, u8)] = &[("copy packages", 50), ("copy groups", 75), ("write metadata", 100)];
const PUBLISH_STAGES: &[(&str, u8)] = &[("link content", 50), ("publish", 100)];

fn required_str<'a>(params: &'a Map<String, Value>, field: &str) -> Result<&'a str, DispatchError> {
  params
    .get(field)
    .and_then(Value::as_str)
    .filter(|value| !value.is_empty())
    .ok_or_else(|| DispatchError::InvalidArguments(format!("'{}' is required", field)))
}

/// Validates the resource state an action needs and builds its positional
/// arguments.
pub async fn check_preconditions(
  action: Action,
  resource_id: &str,
  params: &Map<String, Value>,
  resources: &dyn ResourceStore,
) -> Result<Vec<Value>, DispatchError> {
  match action {
    Action::Sync => {
      if resources.source(resource_id).await?.is_none() {
        return Err(DispatchError::PreconditionNotMet(format!(
          "Repo [{}] is not setup for sync. Please add packages using upload.",
          resource_id
        )));
      }
      Ok(vec![Value::from(resource_id)])
    }
    Action::Clone => {
      let clone_id = required_str(params, "clone_id")?;
      let clone_name = required_str(params, "clone_name")?;
      if resources.exists(clone_id).await? {
        return Err(DispatchError::ResourceConflict(format!(
          "A repository with the id, {}, already exists",
          clone_id
        )));
      }
      Ok(vec![Value::from(resource_id), Value::from(clone_id), Value::from(clone_name)])
    }
    Action::Publish => {
      let state = params
        .get("state")
        .and_then(Value::as_bool)
        .ok_or_else(|| DispatchError::InvalidArguments("'state' must be a boolean".into()))?;
      Ok(vec![Value::from(resource_id), Value::from(state)])
    }
  }
}

/// Stand-in for the content engine: walks a fixed list of stages, reporting
/// progress after each and stopping at the next stage boundary once canceled.
pub struct StagedOperation {
  action: Action,
  step: Duration,
}

impl StagedOperation {
  pub fn new(action: Action, step: Duration) -> Self {
    Self { action, step }
  }

  fn stages(&self) -> &'static [(&'static str, u8)] {
    match self.action {
      Action::Sync => SYNC_STAGES,
      Action::Clone => CLONE_STAGES,
      Action::Publish => PUBLISH_STAGES,
    }
  }
}

#[async_trait]
impl Operation for StagedOperation {
  async fn prepare(
    &self,
    resource_id: &str,
    params: &Map<String, Value>,
    resources: &dyn ResourceStore,
  ) -> Result<Vec<Value>, DispatchError> {
    check_preconditions(self.action, resource_id, params, resources).await
  }

  async fn run(&self, ctx: TaskContext) -> Result<Value> {
    info!("Task {}: {} on {} started", ctx.task_id, ctx.action, ctx.resource_id);
    let mut completed = Vec::new();
    for (stage, progress) in self.stages() {
      tokio::select! {
        _ = sleep(self.step) => {}
        _ = ctx.canceled() => {
          info!("Task {}: stopping before '{}'", ctx.task_id, stage);
          return Ok(json!({"completed": completed, "stopped_before": stage}));
        }
      }
      ctx.report_progress(*progress);
      completed.push(*stage);
      debug!("Task {}: {} {}%", ctx.task_id, stage, progress);
    }
    info!("Task {}: {} on {} complete", ctx.task_id, ctx.action, ctx.resource_id);
    Ok(json!({
      "resource_id": ctx.resource_id,
      "args": ctx.args,
      "completed": completed,
    }))
  }
}

pub fn staged_table(step: Duration) -> Result<ActionTable> {
  ActionTable::builder()
    .register(Action::Sync, Arc::new(StagedOperation::new(Action::Sync, step)))
    .register(Action::Clone, Arc::new(StagedOperation::new(Action::Clone, step)))
    .register(Action::Publish, Arc::new(StagedOperation::new(Action::Publish, step)))
    .build()
}
