use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use super::{ApiError, reject, with_app};
use crate::actions::Action;
use crate::app::App;
use crate::dispatcher::DispatchRequest;
use crate::error::StatusError;
use crate::models::TaskRecord;
use crate::registry::CancelOutcome;

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Serialize)]
pub struct Accepted {
  pub task_id: Uuid,
  pub status_path: String,
  #[serde(flatten)]
  pub task: TaskRecord,
}

pub fn status_path(task: &TaskRecord) -> String {
  format!("/repositories/{}/{}/{}/", task.resource_id, task.action, task.id)
}

pub fn routes(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  schedules_route(app.clone())
    .or(dispatch_route(app.clone()))
    .or(history_route(app.clone()))
    .or(status_route(app.clone()))
    .or(cancel_route(app))
}

fn schedules_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("repositories" / "schedules")
    .and(warp::get())
    .and(with_app(app))
    .and_then(handle_list_schedules)
}

fn dispatch_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("repositories" / String / String)
    .and(warp::post())
    .and(body_within_limit())
    .and(warp::body::bytes())
    .and(with_app(app))
    .and_then(handle_dispatch)
}

fn history_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("repositories" / String / String)
    .and(warp::get())
    .and(with_app(app))
    .and_then(handle_history)
}

fn status_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("repositories" / String / String / Uuid)
    .and(warp::get())
    .and(with_app(app))
    .and_then(handle_status)
}

fn cancel_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("repositories" / String / String / Uuid)
    .and(warp::delete())
    .and(with_app(app))
    .and_then(handle_cancel)
}

/// Bodyless requests carry no `Content-Length`; only a declared length is
/// checked against the limit.
fn body_within_limit() -> impl Filter<Extract = (), Error = Rejection> + Clone {
  warp::header::optional::<u64>("content-length")
    .and_then(|length: Option<u64>| async move {
      match length {
        Some(length) if length > MAX_BODY_BYTES => Err(reject(ApiError::PayloadTooLarge(length))),
        _ => Ok::<(), Rejection>(()),
      }
    })
    .untuple_one()
}

/// An empty body is an empty parameter set; anything else must be a JSON object.
fn parse_params(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
  // Chunked bodies declare no length up front.
  if body.len() as u64 > MAX_BODY_BYTES {
    return Err(ApiError::PayloadTooLarge(body.len() as u64));
  }
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(Map::new());
  }
  serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Request body must be a JSON object: {}", e)))
}

async fn handle_dispatch(resource_id: String, action: String, body: Bytes, app: App) -> Result<impl Reply, Rejection> {
  let action: Action = action.parse().map_err(reject)?;
  let params = parse_params(&body).map_err(reject)?;
  let request = DispatchRequest::from_params(action, resource_id, params).map_err(reject)?;

  let task = app.dispatcher.dispatch(request).await.map_err(reject)?;
  let accepted = Accepted {
    task_id: task.id,
    status_path: status_path(&task),
    task,
  };
  Ok(warp::reply::with_status(warp::reply::json(&accepted), StatusCode::ACCEPTED))
}

async fn handle_history(resource_id: String, key: String, app: App) -> Result<impl Reply, Rejection> {
  let action = Action::from_history_key(&key).ok_or_else(|| reject(ApiError::NotFound(format!("Unknown action '{}'", key))))?;
  let tasks = app.status.find(Some(&resource_id), Some(action)).await;
  if tasks.is_empty() {
    return Err(reject(ApiError::NotFound(format!(
      "No recent {} task found for repo [{}]",
      key, resource_id
    ))));
  }
  Ok(warp::reply::json(&tasks))
}

/// Resolves a task only through the path it was dispatched under.
async fn task_at(app: &App, resource_id: &str, action: &str, task_id: Uuid) -> Result<TaskRecord, Rejection> {
  let task = app.status.get_status(task_id).await.map_err(reject)?;
  if task.resource_id != resource_id || task.action.name() != action {
    return Err(reject(StatusError::NotFound(task_id)));
  }
  Ok(task)
}

async fn handle_status(resource_id: String, action: String, task_id: Uuid, app: App) -> Result<impl Reply, Rejection> {
  let task = task_at(&app, &resource_id, &action, task_id).await?;
  Ok(warp::reply::json(&task))
}

async fn handle_cancel(resource_id: String, action: String, task_id: Uuid, app: App) -> Result<Response, Rejection> {
  task_at(&app, &resource_id, &action, task_id).await?;
  match app.status.cancel(task_id).await.map_err(reject)? {
    CancelOutcome::Canceled(task) => {
      info!("Cancel requested for task {} ({} on {})", task.id, task.action, task.resource_id);
      Ok(warp::reply::with_status(warp::reply::json(&task), StatusCode::ACCEPTED).into_response())
    }
    CancelOutcome::AlreadyComplete(_) => Ok(StatusCode::NO_CONTENT.into_response()),
  }
}

async fn handle_list_schedules(app: App) -> Result<impl Reply, Rejection> {
  let listing = app
    .schedules
    .list()
    .await
    .inspect_err(|e| error!("Failed to list schedules: {}", e))
    .map_err(reject)?;
  Ok(warp::reply::json(&listing))
}
