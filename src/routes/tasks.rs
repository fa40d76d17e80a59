use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};
use warp::http::StatusCode;
use warp::Filter;

use super::{with_orchestrator, ApiError};
use crate::error::QueueError;
use crate::models::{EngineKind, RenderTask, TaskPriority, TaskStatus};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Deserialize)]
pub struct NewTask {
  pub task_id: Option<String>,
  pub name: String,
  pub engine: EngineKind,
  pub input_files: Vec<String>,
  pub output_path: PathBuf,
  #[serde(default)]
  pub parameters: BTreeMap<String, Value>,
  #[serde(default)]
  pub priority: TaskPriority,
  #[serde(default)]
  pub dependencies: Vec<String>,
  pub estimated_duration: Option<f64>,
}

impl NewTask {
  pub fn into_task(self) -> RenderTask {
    let mut task = RenderTask::new(self.name, self.engine, self.input_files, self.output_path)
      .with_priority(self.priority)
      .with_dependencies(self.dependencies);
    if let Some(id) = self.task_id {
      task = task.with_id(id);
    }
    task.parameters = self.parameters;
    task.estimated_duration = self.estimated_duration;
    task
  }
}

#[derive(Debug, Deserialize)]
pub struct ProgressBody {
  pub progress: f64,
}

#[derive(Serialize)]
pub struct TaskResponse {
  pub task_id: String,
  pub status: TaskStatus,
  pub sse_url: String,
}

pub fn task_routes(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  submit_route(orchestrator.clone())
    .or(get_route(orchestrator.clone()))
    .or(cancel_route(orchestrator.clone()))
    .or(progress_route(orchestrator.clone()))
    .or(stats_route(orchestrator))
}

fn submit_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_submit_task)
}

fn get_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / String)
    .and(warp::get())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_get_task)
}

fn cancel_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / String)
    .and(warp::delete())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_cancel_task)
}

fn progress_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / String / "progress")
    .and(warp::put())
    .and(warp::body::json())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_progress)
}

fn stats_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("stats")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_stats)
}

async fn handle_submit_task(new_task: NewTask, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = orchestrator.submit(new_task.into_task()).await.map_err(|e| {
    error!("Task validation failed: {}", e);
    warp::reject::custom(ApiError::Validation(e))
  })?;

  let status = orchestrator.status(&task_id).await.unwrap_or(TaskStatus::Queued);
  info!("Task {} accepted", task_id);
  let response = TaskResponse {
    sse_url: format!("/events?task_id={}", task_id),
    task_id,
    status,
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::ACCEPTED))
}

async fn handle_get_task(task_id: String, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  match orchestrator.task(&task_id).await {
    Some(task) => Ok(warp::reply::json(&task)),
    None => Err(warp::reject::custom(ApiError::NotFound(format!("task {task_id}")))),
  }
}

async fn handle_cancel_task(task_id: String, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  if orchestrator.cancel(&task_id).await {
    return Ok(warp::reply::json(&json!({ "task_id": task_id, "cancelled": true })));
  }
  match orchestrator.status(&task_id).await {
    Some(status) => Err(warp::reject::custom(ApiError::Conflict(format!(
      "task {task_id} is {status} and can no longer be cancelled"
    )))),
    None => Err(warp::reject::custom(ApiError::NotFound(format!("task {task_id}")))),
  }
}

async fn handle_progress(task_id: String, body: ProgressBody, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  match orchestrator.update_progress(&task_id, body.progress).await {
    Ok(progress) => Ok(warp::reply::json(&json!({ "task_id": task_id, "progress": progress }))),
    Err(QueueError::UnknownTask(_)) => Err(warp::reject::custom(ApiError::NotFound(format!("task {task_id}")))),
    Err(QueueError::InvalidTransition { from, .. }) => Err(warp::reject::custom(ApiError::Conflict(format!(
      "task {task_id} is {from}, progress is only accepted while processing"
    )))),
    Err(e) => Err(warp::reject::custom(ApiError::Conflict(e.to_string()))),
  }
}

async fn handle_stats(orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  Ok(warp::reply::json(&orchestrator.stats().await))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn submission_body_fills_defaults() {
    let body: NewTask = serde_json::from_value(json!({
      "name": "shot",
      "engine": "blender",
      "input_files": ["/scenes/a.blend"],
      "output_path": "/renders/shot"
    }))
    .unwrap();
    let task = body.into_task();
    assert_eq!(task.priority, TaskPriority::Normal);
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(!task.id.is_empty());
    assert!(task.dependencies.is_empty());
  }

  #[test]
  fn submission_body_keeps_explicit_fields() {
    let body: NewTask = serde_json::from_value(json!({
      "task_id": "shot-7",
      "name": "shot",
      "engine": "custom",
      "input_files": ["/scenes/a.blend"],
      "output_path": "/renders/shot",
      "priority": "URGENT",
      "parameters": { "samples": 64 },
      "dependencies": ["shot-6"],
      "estimated_duration": 7200.0
    }))
    .unwrap();
    let task = body.into_task();
    assert_eq!(task.id, "shot-7");
    assert_eq!(task.engine, EngineKind::Custom);
    assert_eq!(task.priority, TaskPriority::Urgent);
    assert_eq!(task.parameter_u64("samples"), Some(64));
    assert_eq!(task.dependencies, vec!["shot-6".to_string()]);
    assert_eq!(task.estimated_duration, Some(7200.0));
  }
}
