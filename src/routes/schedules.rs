use serde::Deserialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{reject, with_app};
use crate::app::App;
use crate::models::NewSchedule;

#[derive(Deserialize)]
pub struct Rename {
  pub name: String,
}

pub fn routes(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  create_route(app.clone())
    .or(get_route(app.clone()))
    .or(rename_route(app.clone()))
    .or(delete_route(app))
}

fn create_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("schedules")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_app(app))
    .and_then(handle_create)
}

fn get_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("schedules" / String)
    .and(warp::get())
    .and(with_app(app))
    .and_then(handle_get)
}

fn rename_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("schedules" / String)
    .and(warp::put())
    .and(warp::body::json())
    .and(with_app(app))
    .and_then(handle_rename)
}

fn delete_route(app: App) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("schedules" / String)
    .and(warp::delete())
    .and(with_app(app))
    .and_then(handle_delete)
}

async fn handle_create(new: NewSchedule, app: App) -> Result<impl Reply, Rejection> {
  let created = app.schedules.create(new).await.map_err(reject)?;
  Ok(warp::reply::with_status(warp::reply::json(&created), StatusCode::CREATED))
}

async fn handle_get(name: String, app: App) -> Result<impl Reply, Rejection> {
  let schedule = app.schedules.get(&name).await.map_err(reject)?;
  Ok(warp::reply::json(&schedule))
}

async fn handle_rename(name: String, body: Rename, app: App) -> Result<impl Reply, Rejection> {
  let renamed = app.schedules.rename(&name, &body.name).await.map_err(reject)?;
  Ok(warp::reply::json(&renamed))
}

async fn handle_delete(name: String, app: App) -> Result<impl Reply, Rejection> {
  app.schedules.delete(&name).await.map_err(reject)?;
  Ok(StatusCode::NO_CONTENT)
}
