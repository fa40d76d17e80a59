use std::sync::Arc;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

use super::{with_orchestrator, ApiError};
use crate::models::{Heartbeat, SystemInfo, WorkerNode};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
  #[serde(default)]
  pub address: Option<String>,
  #[serde(default)]
  pub current_tasks: usize,
  #[serde(default)]
  pub system_info: SystemInfo,
}

#[derive(Debug, Deserialize)]
pub struct LoadBody {
  pub load: f64,
}

pub fn worker_routes(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  register_route(orchestrator.clone())
    .or(unregister_route(orchestrator.clone()))
    .or(heartbeat_route(orchestrator.clone()))
    .or(load_route(orchestrator))
}

fn register_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("workers")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_register)
}

fn unregister_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("workers" / String)
    .and(warp::delete())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_unregister)
}

fn heartbeat_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("workers" / String / "heartbeat")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_heartbeat)
}

fn load_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("workers" / String / "load")
    .and(warp::put())
    .and(warp::body::json())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_load)
}

async fn handle_register(node: WorkerNode, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  let worker_id = node.id.clone();
  orchestrator.register_worker(node).await;
  let registered = orchestrator
    .balancer()
    .get(&worker_id)
    .await
    .ok_or_else(|| warp::reject::custom(ApiError::NotFound(format!("worker {worker_id}"))))?;
  info!("Worker {} registered at {}", worker_id, registered.address);
  Ok(warp::reply::with_status(warp::reply::json(&registered), StatusCode::CREATED))
}

async fn handle_unregister(worker_id: String, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  if !orchestrator.unregister_worker(&worker_id).await {
    return Err(warp::reject::custom(ApiError::NotFound(format!("worker {worker_id}"))));
  }
  Ok(warp::reply::json(&json!({ "worker_id": worker_id, "unregistered": true })))
}

async fn handle_heartbeat(worker_id: String, body: HeartbeatBody, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  let heartbeat = Heartbeat {
    address: body.address.unwrap_or_default(),
    worker_id: worker_id.clone(),
    timestamp: Utc::now(),
    current_tasks: body.current_tasks,
    system_info: body.system_info,
  };
  if !orchestrator.record_heartbeat(heartbeat).await {
    return Err(warp::reject::custom(ApiError::NotFound(format!("worker {worker_id}"))));
  }
  Ok(warp::reply::json(&json!({ "worker_id": worker_id, "acknowledged": true })))
}

async fn handle_load(worker_id: String, body: LoadBody, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  if !orchestrator.update_worker_load(&worker_id, body.load).await {
    return Err(warp::reject::custom(ApiError::NotFound(format!("worker {worker_id}"))));
  }
  Ok(warp::reply::json(&json!({ "worker_id": worker_id, "load": body.load })))
}
