use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::actions::Action;
use crate::error::DispatchError;
use crate::models::TaskRecord;
use crate::registry::{TaskHandle, TaskRegistry};

pub const DEFAULT_CONFLICT_CLASSES: &str = "sync+clone,publish";

/// Groups of actions that may not run concurrently on the same resource.
/// Actions outside every class never conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPolicy {
  classes: Vec<Vec<Action>>,
}

impl ConflictPolicy {
  /// Parses `a+b,c`: classes separated by commas, members by `+`.
  pub fn parse(spec: &str) -> Result<Self> {
    let mut classes: Vec<Vec<Action>> = Vec::new();
    for class in spec.split(',').map(str::trim).filter(|c| !c.is_empty()) {
      let mut members = Vec::new();
      for name in class.split('+').map(str::trim) {
        let action = Action::from_name(name).ok_or_else(|| anyhow!("Unknown action '{}' in conflict class '{}'", name, class))?;
        if members.contains(&action) || classes.iter().any(|c| c.contains(&action)) {
          bail!("Action '{}' appears in more than one conflict class", name);
        }
        members.push(action);
      }
      classes.push(members);
    }
    Ok(Self { classes })
  }

  pub fn class_of(&self, action: Action) -> Option<usize> {
    self.classes.iter().position(|class| class.contains(&action))
  }

  pub fn members(&self, class: usize) -> &[Action] {
    &self.classes[class]
  }
}

impl Default for ConflictPolicy {
  fn default() -> Self {
    Self {
      classes: vec![vec![Action::Sync, Action::Clone], vec![Action::Publish]],
    }
  }
}

type ClaimKey = (usize, String);

/// The one place that decides whether a dispatch may create a task.
pub struct ConflictGuard {
  policy: ConflictPolicy,
  registry: TaskRegistry,
  locks: Mutex<HashMap<ClaimKey, Arc<Mutex<()>>>>,
}

impl ConflictGuard {
  pub fn new(policy: ConflictPolicy, registry: TaskRegistry) -> Self {
    Self {
      policy,
      registry,
      locks: Mutex::new(HashMap::new()),
    }
  }

  pub async fn is_conflicting(&self, action: Action, resource_id: &str) -> bool {
    match self.policy.class_of(action) {
      Some(class) => self.registry.active_on(resource_id, self.policy.members(class)).await.is_some(),
      None => false,
    }
  }

  /// Checks for a conflicting active task and registers `record` as one
  /// atomic step per (conflict class, resource).
  pub async fn claim(&self, record: TaskRecord) -> Result<TaskHandle, DispatchError> {
    let Some(class) = self.policy.class_of(record.action) else {
      return Ok(self.registry.insert(record).await);
    };

    let key = (class, record.resource_id.clone());
    let lock = self.locks.lock().await.entry(key.clone()).or_default().clone();
    let claimed = {
      let _held = lock.lock().await;
      self.claim_in_class(class, record).await
    };

    // Only the map and this claimer hold the lock: nobody else is waiting.
    let mut locks = self.locks.lock().await;
    if Arc::strong_count(&lock) == 2 {
      locks.remove(&key);
    }
    // Released under the map lock so the next claimer's count is exact.
    drop(lock);
    drop(locks);
    claimed
  }

  async fn claim_in_class(&self, class: usize, record: TaskRecord) -> Result<TaskHandle, DispatchError> {
    if let Some(active) = self.registry.active_on(&record.resource_id, self.policy.members(class)).await {
      info!(
        "Rejecting {} on {}: task {} is still active",
        record.action, record.resource_id, active
      );
      return Err(DispatchError::ResourceConflict(format!(
        "{} already in process for repo [{}]",
        record.action, record.resource_id
      )));
    }
    debug!("Claimed {} on {} for task {}", record.action, record.resource_id, record.id);
    Ok(self.registry.insert(record).await)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{Map, Value};

  fn record(action: Action, resource: &str) -> TaskRecord {
    TaskRecord::queued(action, resource.into(), vec![], Map::new(), None)
  }

  #[test]
  fn parses_default_classes() {
    let policy = ConflictPolicy::parse(DEFAULT_CONFLICT_CLASSES).unwrap();
    assert_eq!(policy, ConflictPolicy::default());
    assert_eq!(policy.class_of(Action::Sync), policy.class_of(Action::Clone));
    assert_ne!(policy.class_of(Action::Sync), policy.class_of(Action::Publish));
  }

  #[test]
  fn rejects_unknown_and_duplicate_actions() {
    assert!(ConflictPolicy::parse("sync+upload").is_err());
    assert!(ConflictPolicy::parse("sync,sync+clone").is_err());
    let none = ConflictPolicy::parse("").unwrap();
    assert_eq!(none.class_of(Action::Sync), None);
  }

  #[tokio::test]
  async fn same_class_conflicts_until_terminal() {
    let registry = TaskRegistry::new();
    let guard = ConflictGuard::new(ConflictPolicy::default(), registry.clone());

    let sync = guard.claim(record(Action::Sync, "repo-a")).await.unwrap();
    assert!(guard.is_conflicting(Action::Clone, "repo-a").await);
    assert!(matches!(
      guard.claim(record(Action::Clone, "repo-a")).await,
      Err(DispatchError::ResourceConflict(_))
    ));
    assert!(guard.claim(record(Action::Publish, "repo-a")).await.is_ok());
    assert!(guard.claim(record(Action::Sync, "repo-b")).await.is_ok());

    sync.start();
    sync.finish(Value::Null);
    assert!(!guard.is_conflicting(Action::Sync, "repo-a").await);
    assert!(guard.claim(record(Action::Sync, "repo-a")).await.is_ok());
  }

  #[tokio::test]
  async fn unclassified_actions_never_conflict() {
    let registry = TaskRegistry::new();
    let guard = ConflictGuard::new(ConflictPolicy::parse("sync").unwrap(), registry.clone());
    guard.claim(record(Action::Publish, "repo-a")).await.unwrap();
    guard.claim(record(Action::Publish, "repo-a")).await.unwrap();
    assert_eq!(registry.len().await, 2);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_claims_admit_exactly_one() {
    let registry = TaskRegistry::new();
    let guard = Arc::new(ConflictGuard::new(ConflictPolicy::default(), registry.clone()));

    let attempts: Vec<_> = (0..32)
      .map(|i| {
        let guard = guard.clone();
        let action = if i % 2 == 0 { Action::Sync } else { Action::Clone };
        tokio::spawn(async move { guard.claim(record(action, "repo-a")).await.is_ok() })
      })
      .collect();
    let admitted = futures::future::join_all(attempts)
      .await
      .into_iter()
      .filter(|joined| matches!(joined, Ok(true)))
      .count();

    assert_eq!(admitted, 1);
    assert_eq!(registry.find(Some("repo-a"), None).await.len(), 1);
    assert!(guard.locks.lock().await.is_empty());
  }

  #[tokio::test]
  async fn claim_locks_do_not_outlive_their_claims() {
    let registry = TaskRegistry::new();
    let guard = ConflictGuard::new(ConflictPolicy::default(), registry.clone());
    for i in 0..100 {
      let resource = format!("repo-{}", i);
      guard.claim(record(Action::Sync, &resource)).await.unwrap();
      assert!(guard.claim(record(Action::Clone, &resource)).await.is_err());
    }
    assert_eq!(registry.len().await, 100);
    assert!(guard.locks.lock().await.is_empty());
  }
}
