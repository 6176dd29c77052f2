use futures::Stream;
use futures::stream;
use tokio::sync::watch;
use uuid::Uuid;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::{reject, with_app};
use crate::app::App;
use crate::error::StatusError;
use crate::models::TaskRecord;

pub fn sse_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / Uuid / "events")
    .and(warp::get())
    .and(with_app(app))
    .and_then(handle_sse)
}

async fn handle_sse(task_id: Uuid, app: App) -> Result<impl Reply, Rejection> {
  let updates = app
    .registry
    .subscribe(task_id)
    .await
    .ok_or_else(|| reject(StatusError::NotFound(task_id)))?;
  Ok(warp::sse::reply(warp::sse::keep_alive().stream(task_events(updates))))
}

/// The current record, then one event per change, ending after a terminal
/// state or when the task leaves the registry.
pub fn task_events(updates: watch::Receiver<TaskRecord>) -> impl Stream<Item = Result<Event, serde_json::Error>> {
  stream::unfold(Some((updates, true)), |state| async move {
    let (mut updates, first) = state?;
    if !first && updates.changed().await.is_err() {
      return None;
    }
    let record = updates.borrow_and_update().clone();
    let event = Event::default().event("task").json_data(&record);
    let next = if record.state.is_terminal() { None } else { Some((updates, false)) };
    Some((event, next))
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::actions::Action;
  use crate::registry::TaskRegistry;
  use futures::StreamExt;
  use serde_json::{Map, Value};

  #[tokio::test]
  async fn stream_ends_after_terminal_state() {
    let registry = TaskRegistry::new();
    let handle = registry
      .insert(TaskRecord::queued(Action::Publish, "repo-a".into(), vec![], Map::new(), None))
      .await;
    let events = task_events(registry.subscribe(handle.id()).await.unwrap());

    handle.start();
    handle.finish(Value::Null);

    let events: Vec<_> = events.collect().await;
    assert!(!events.is_empty());
    assert!(events.iter().all(Result::is_ok));
  }
}
