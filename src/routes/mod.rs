use std::convert::Infallible;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::app::App;
use crate::error::{DispatchError, ScheduleError, StatusError};

pub mod repositories;
pub mod schedules;
pub mod sse;
pub mod tasks;

pub fn routes(app: App) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  health_route()
    .or(repositories::routes(app.clone()))
    .or(schedules::routes(app.clone()))
    .or(tasks::routes(app.clone()))
    .or(sse::sse_route(app))
    .recover(handle_rejection)
}

fn health_route() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("health")
    .and(warp::get())
    .map(|| warp::reply::json(&json!({"status": "ok"})))
}

pub(crate) fn with_app(app: App) -> impl Filter<Extract = (App,), Error = Infallible> + Clone {
  warp::any().map(move || app.clone())
}

/// Everything a handler can reject with.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error(transparent)]
  Dispatch(#[from] DispatchError),

  #[error(transparent)]
  Schedule(#[from] ScheduleError),

  #[error(transparent)]
  Status(#[from] StatusError),

  #[error("{0}")]
  NotFound(String),

  #[error("{0}")]
  BadRequest(String),

  #[error("Request body of {0} bytes is too large")]
  PayloadTooLarge(u64),
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  fn status(&self) -> StatusCode {
    match self {
      ApiError::Dispatch(e) => match e {
        DispatchError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::ResourceConflict(_) => StatusCode::CONFLICT,
        DispatchError::PreconditionNotMet(_) => StatusCode::NOT_ACCEPTABLE,
        DispatchError::UnknownAction(_) | DispatchError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
        DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
      },
      ApiError::Schedule(e) => match e {
        ScheduleError::NameConflict(_) => StatusCode::CONFLICT,
        ScheduleError::NotFound(_) => StatusCode::NOT_FOUND,
        ScheduleError::InvalidName(_) | ScheduleError::UnknownAction(_) | ScheduleError::InvalidInterval(_) => {
          StatusCode::BAD_REQUEST
        }
        ScheduleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
      },
      ApiError::Status(StatusError::NotFound(_)) | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::Status(StatusError::StillActive(_)) => StatusCode::CONFLICT,
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
    }
  }
}

pub(crate) fn reject(err: impl Into<ApiError>) -> Rejection {
  warp::reject::custom(err.into())
}

#[derive(Serialize)]
struct ErrorBody {
  code: u16,
  message: String,
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if let Some(api) = err.find::<ApiError>() {
    let status = api.status();
    if status.is_server_error() {
      error!("Request failed: {}", api);
    }
    (status, api.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Expected a JSON body".to_string())
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else {
    warn!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
  };

  let body = ErrorBody {
    code: status.as_u16(),
    message,
  };
  Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
