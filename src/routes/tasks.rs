use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{reject, with_app};
use crate::app::App;

/// `DELETE /tasks/{task_id}/` drops a finished, failed or canceled task
/// from the registry.
pub fn routes(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::delete())
    .and(with_app(app))
    .and_then(remove_task)
}

async fn remove_task(task_id: Uuid, app: App) -> Result<impl Reply, Rejection> {
  app.reaper.remove(task_id).await.map_err(reject)?;
  Ok(StatusCode::NO_CONTENT)
}
