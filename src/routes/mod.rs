use std::convert::Infallible;
use std::sync::Arc;
use serde_json::json;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::ValidationError;
use crate::orchestrator::Orchestrator;

pub mod sse;
pub mod tasks;
pub mod workers;

#[derive(Debug)]
pub enum ApiError {
  Validation(ValidationError),
  NotFound(String),
  Conflict(String),
}
impl warp::reject::Reject for ApiError {}

pub fn routes(
  orchestrator: Arc<Orchestrator>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  tasks::task_routes(orchestrator.clone())
    .or(workers::worker_routes(orchestrator.clone()))
    .or(sse::sse_route(orchestrator))
    .recover(handle_rejection)
}

pub(crate) fn with_orchestrator(
  orchestrator: Arc<Orchestrator>,
) -> impl Filter<Extract = (Arc<Orchestrator>,), Error = Infallible> + Clone {
  warp::any().map(move || orchestrator.clone())
}

fn error_reply(code: StatusCode, message: impl Into<String>) -> warp::reply::WithStatus<warp::reply::Json> {
  warp::reply::with_status(warp::reply::json(&json!({ "error": message.into() })), code)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let reply = if let Some(api) = err.find::<ApiError>() {
    match api {
      ApiError::Validation(e) => error_reply(StatusCode::BAD_REQUEST, e.to_string()),
      ApiError::NotFound(what) => error_reply(StatusCode::NOT_FOUND, format!("{what} not found")),
      ApiError::Conflict(message) => error_reply(StatusCode::CONFLICT, message.clone()),
    }
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    error_reply(StatusCode::BAD_REQUEST, e.to_string())
  } else if err.is_not_found() {
    error_reply(StatusCode::NOT_FOUND, "not found")
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    error_reply(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
  } else {
    error!("Unhandled rejection: {:?}", err);
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
  };
  Ok(reply)
}
