use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actions::{Action, Operation};
use crate::models::TaskError;
use crate::registry::TaskHandle;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
  pub max_concurrent: usize,
  pub heartbeat: Duration,
  pub cancel_grace: Duration,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    Self {
      max_concurrent: 4,
      heartbeat: Duration::from_secs(5),
      cancel_grace: Duration::from_secs(30),
    }
  }
}

/// What an operation sees of its task while it runs.
pub struct TaskContext {
  pub task_id: Uuid,
  pub action: Action,
  pub resource_id: String,
  pub args: Vec<Value>,
  pub kwargs: Map<String, Value>,
  handle: TaskHandle,
  cancel: CancellationToken,
}

impl TaskContext {
  pub fn is_canceled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Resolves once the operation has been asked to stop.
  pub async fn canceled(&self) {
    self.cancel.cancelled().await
  }

  pub fn report_progress(&self, progress: u8) {
    self.handle.set_progress(progress);
  }
}

enum Interrupt {
  Done(Result<anyhow::Result<Value>, JoinError>),
  Canceled,
  TimedOut(Duration),
}

/// Executes dispatched operations on the tokio runtime, at most
/// `max_concurrent` at a time, and drives each task record through its
/// lifecycle.
#[derive(Clone)]
pub struct OperationRunner {
  permits: Arc<Semaphore>,
  config: RunnerConfig,
}

impl OperationRunner {
  pub fn new(config: RunnerConfig) -> Self {
    Self {
      permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
      config,
    }
  }

  pub fn submit(&self, handle: TaskHandle, operation: Arc<dyn Operation>) -> JoinHandle<()> {
    let runner = self.clone();
    tokio::spawn(async move { runner.execute(handle, operation).await })
  }

  async fn execute(self, handle: TaskHandle, operation: Arc<dyn Operation>) {
    let task_id = handle.id();
    let cancel = handle.cancellation();

    let permit = tokio::select! {
      permit = self.permits.clone().acquire_owned() => permit,
      _ = cancel.cancelled() => {
        handle.mark_canceled();
        debug!("Task {} canceled while waiting for a worker", task_id);
        return;
      }
    };
    let permit = match permit {
      Ok(permit) => permit,
      Err(e) => {
        error!("Worker pool closed before task {} could start: {:?}", task_id, e);
        if handle.start() {
          handle.fail(TaskError::runner_lost("Worker pool shut down"));
        }
        return;
      }
    };

    if !handle.start() {
      debug!("Task {} is no longer queued; skipping", task_id);
      return;
    }

    let record = handle.snapshot();
    // A timeout stops the operation through this child token without the
    // task counting as canceled.
    let op_token = cancel.child_token();
    let ctx = TaskContext {
      task_id,
      action: record.action,
      resource_id: record.resource_id.clone(),
      args: record.args.clone(),
      kwargs: record.kwargs.clone(),
      handle: handle.clone(),
      cancel: op_token.clone(),
    };
    // The permit lives as long as the operation itself, even past a timeout
    // or an expired cancel grace.
    let mut work = tokio::spawn(async move {
      let _permit = permit;
      operation.run(ctx).await
    });

    let timeout = record.timeout_secs.map(Duration::from_secs);
    let deadline = async {
      match timeout {
        Some(after) => {
          sleep(after).await;
          after
        }
        None => std::future::pending().await,
      }
    };
    tokio::pin!(deadline);
    let mut beat = interval(self.config.heartbeat);

    let interrupt = loop {
      tokio::select! {
        joined = &mut work => break Interrupt::Done(joined),
        _ = cancel.cancelled() => break Interrupt::Canceled,
        after = &mut deadline => break Interrupt::TimedOut(after),
        _ = beat.tick() => handle.heartbeat(),
      }
    };

    match interrupt {
      Interrupt::Done(joined) => settle(&handle, joined, cancel.is_cancelled()),
      Interrupt::Canceled => {
        info!("Task {} asked to stop; waiting for the operation", task_id);
        let grace = sleep(self.config.cancel_grace);
        tokio::pin!(grace);
        loop {
          tokio::select! {
            _ = &mut work => break,
            _ = &mut grace => {
              warn!("Task {} did not stop within {:?}; recording it canceled", task_id, self.config.cancel_grace);
              break;
            }
            _ = beat.tick() => handle.heartbeat(),
          }
        }
        handle.mark_canceled();
      }
      Interrupt::TimedOut(after) => {
        op_token.cancel();
        handle.fail(TaskError::timeout(after));
      }
    }
  }
}

fn settle(handle: &TaskHandle, joined: Result<anyhow::Result<Value>, JoinError>, canceled: bool) {
  match joined {
    Err(e) => {
      handle.fail(TaskError::runner_lost(format!("Operation exited unexpectedly: {}", e)));
    }
    Ok(_) if canceled => {
      handle.mark_canceled();
    }
    Ok(Ok(value)) => {
      handle.finish(value);
    }
    Ok(Err(e)) => {
      handle.fail(TaskError::runner_failure(&e));
    }
  }
}
