//! Controllable operations for unit tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Notify;

use crate::actions::{Action, ActionTable, Operation};
use crate::error::DispatchError;
use crate::models::TaskState;
use crate::operations::check_preconditions;
use crate::registry::TaskHandle;
use crate::resources::ResourceStore;
use crate::runner::TaskContext;

#[derive(Debug, Clone, Copy, Default)]
pub enum Behavior {
  #[default]
  Succeed,
  Fail,
  Panic,
  /// Never returns and ignores cancellation.
  Hang,
}

/// Blocks until released or canceled, then behaves as configured.
#[derive(Default)]
pub struct GateOperation {
  action: Option<Action>,
  behavior: Behavior,
  release: Notify,
}

impl GateOperation {
  pub fn new(behavior: Behavior) -> Self {
    Self { behavior, ..Self::default() }
  }

  pub fn for_action(action: Action, behavior: Behavior) -> Self {
    Self { action: Some(action), behavior, release: Notify::new() }
  }

  pub fn release(&self) {
    self.release.notify_one();
  }
}

#[async_trait]
impl Operation for GateOperation {
  async fn prepare(
    &self,
    resource_id: &str,
    params: &Map<String, Value>,
    resources: &dyn ResourceStore,
  ) -> Result<Vec<Value>, DispatchError> {
    match self.action {
      Some(action) => check_preconditions(action, resource_id, params, resources).await,
      None => Ok(vec![Value::from(resource_id)]),
    }
  }

  async fn run(&self, ctx: TaskContext) -> Result<Value> {
    match self.behavior {
      Behavior::Panic => panic!("operation blew up"),
      Behavior::Hang => std::future::pending::<()>().await,
      Behavior::Succeed | Behavior::Fail => {}
    }
    tokio::select! {
      _ = self.release.notified() => {}
      _ = ctx.canceled() => return Ok(json!({"stopped": true})),
    }
    match self.behavior {
      Behavior::Fail => Err(anyhow!("upstream unreachable")),
      _ => Ok(json!({"done": true})),
    }
  }
}

pub struct Gates {
  pub sync: Arc<GateOperation>,
  pub clone: Arc<GateOperation>,
  pub publish: Arc<GateOperation>,
}

impl Gates {
  pub fn new(behavior: Behavior) -> Self {
    Self {
      sync: Arc::new(GateOperation::for_action(Action::Sync, behavior)),
      clone: Arc::new(GateOperation::for_action(Action::Clone, behavior)),
      publish: Arc::new(GateOperation::for_action(Action::Publish, behavior)),
    }
  }

  pub fn table(&self) -> ActionTable {
    ActionTable::builder()
      .register(Action::Sync, self.sync.clone())
      .register(Action::Clone, self.clone.clone())
      .register(Action::Publish, self.publish.clone())
      .build()
      .expect("all actions registered")
  }
}

pub async fn wait_for_state(handle: &TaskHandle, state: TaskState) {
  for _ in 0..200 {
    if handle.snapshot().state == state {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("task {} never reached {:?}", handle.id(), state);
}
