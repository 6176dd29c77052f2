use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DispatchError;
use crate::resources::ResourceStore;
use crate::runner::TaskContext;

/// Long-running repository operations that go through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Sync,
  Clone,
  Publish,
}

pub const ALL_ACTIONS: [Action; 3] = [Action::Sync, Action::Clone, Action::Publish];

const SYNC: &str = "sync";
const CLONE: &str = "clone";
const PUBLISH: &str = "publish";

// History lookups are keyed separately from the dispatch names.
const SYNC_HISTORY: &str = "sync";
const CLONE_HISTORY: &str = "clone";
const PUBLISH_HISTORY: &str = "publish";

impl Action {
  pub fn name(self) -> &'static str {
    match self {
      Action::Sync => SYNC,
      Action::Clone => CLONE,
      Action::Publish => PUBLISH,
    }
  }

  pub fn from_name(name: &str) -> Option<Action> {
    match name {
      SYNC => Some(Action::Sync),
      CLONE => Some(Action::Clone),
      PUBLISH => Some(Action::Publish),
      _ => None,
    }
  }

  pub fn history_key(self) -> &'static str {
    match self {
      Action::Sync => SYNC_HISTORY,
      Action::Clone => CLONE_HISTORY,
      Action::Publish => PUBLISH_HISTORY,
    }
  }

  pub fn from_history_key(key: &str) -> Option<Action> {
    ALL_ACTIONS.into_iter().find(|action| action.history_key() == key)
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Action {
  type Err = DispatchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Action::from_name(s).ok_or_else(|| DispatchError::UnknownAction(s.to_string()))
  }
}

/// The work behind one action.
///
/// `prepare` runs synchronously inside the dispatch call, before any task
/// record exists; it checks the action's resource preconditions and returns
/// the positional arguments recorded on the task. `run` executes on the
/// runner and must return promptly once `ctx.is_canceled()` turns true.
#[async_trait]
pub trait Operation: Send + Sync {
  async fn prepare(
    &self,
    resource_id: &str,
    _params: &Map<String, Value>,
    _resources: &dyn ResourceStore,
  ) -> Result<Vec<Value>, DispatchError> {
    Ok(vec![Value::from(resource_id)])
  }

  async fn run(&self, ctx: TaskContext) -> Result<Value>;
}

/// Maps every [`Action`] to the operation that performs it.
#[derive(Clone)]
pub struct ActionTable {
  handlers: HashMap<Action, Arc<dyn Operation>>,
}

impl ActionTable {
  pub fn builder() -> ActionTableBuilder {
    ActionTableBuilder::default()
  }

  pub fn get(&self, action: Action) -> Arc<dyn Operation> {
    // build() guarantees every action has a handler
    self.handlers[&action].clone()
  }
}

#[derive(Default)]
pub struct ActionTableBuilder {
  handlers: HashMap<Action, Arc<dyn Operation>>,
}

impl ActionTableBuilder {
  pub fn register(mut self, action: Action, operation: Arc<dyn Operation>) -> Self {
    self.handlers.insert(action, operation);
    self
  }

  pub fn build(self) -> Result<ActionTable> {
    let missing: Vec<&str> = ALL_ACTIONS
      .iter()
      .filter(|action| !self.handlers.contains_key(action))
      .map(|action| action.name())
      .collect();
    if !missing.is_empty() {
      return Err(anyhow!("No operation registered for: {}", missing.join(", ")));
    }
    Ok(ActionTable { handlers: self.handlers })
  }
}
