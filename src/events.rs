use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::cost::CostEstimate;
use crate::models::{Heartbeat, RenderResult, RenderTask, WorkerNode};

const EVENT_BUFFER: usize = 256;

/// Observer surface. Every event is emitted after the state change it
/// describes has been committed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RenderEvent {
  TaskSubmitted { task: RenderTask },
  TaskStarted { task_id: String, worker_id: String },
  TaskProgress { task_id: String, progress: f64 },
  TaskCompleted { result: RenderResult },
  TaskFailed { task_id: String, error: String },
  TaskCancelled { task_id: String },
  WorkerRegistered { worker: WorkerNode },
  WorkerDisconnected { worker_id: String },
  WorkerHeartbeat { heartbeat: Heartbeat },
  CostEstimated { estimate: CostEstimate },
}

impl RenderEvent {
  pub fn kind(&self) -> &'static str {
    match self {
      RenderEvent::TaskSubmitted { .. } => "task_submitted",
      RenderEvent::TaskStarted { .. } => "task_started",
      RenderEvent::TaskProgress { .. } => "task_progress",
      RenderEvent::TaskCompleted { .. } => "task_completed",
      RenderEvent::TaskFailed { .. } => "task_failed",
      RenderEvent::TaskCancelled { .. } => "task_cancelled",
      RenderEvent::WorkerRegistered { .. } => "worker_registered",
      RenderEvent::WorkerDisconnected { .. } => "worker_disconnected",
      RenderEvent::WorkerHeartbeat { .. } => "worker_heartbeat",
      RenderEvent::CostEstimated { .. } => "cost_estimated",
    }
  }

  pub fn task_id(&self) -> Option<&str> {
    match self {
      RenderEvent::TaskSubmitted { task } => Some(&task.id),
      RenderEvent::TaskStarted { task_id, .. }
      | RenderEvent::TaskProgress { task_id, .. }
      | RenderEvent::TaskFailed { task_id, .. }
      | RenderEvent::TaskCancelled { task_id } => Some(task_id),
      RenderEvent::TaskCompleted { result } => Some(&result.task_id),
      RenderEvent::CostEstimated { estimate } => Some(&estimate.task_id),
      _ => None,
    }
  }

  pub fn worker_id(&self) -> Option<&str> {
    match self {
      RenderEvent::TaskStarted { worker_id, .. } | RenderEvent::WorkerDisconnected { worker_id } => Some(worker_id),
      RenderEvent::TaskCompleted { result } if !result.worker_id.is_empty() => Some(&result.worker_id),
      RenderEvent::WorkerRegistered { worker } => Some(&worker.id),
      RenderEvent::WorkerHeartbeat { heartbeat } => Some(&heartbeat.worker_id),
      _ => None,
    }
  }
}

/// Fan-out channel. Slow subscribers lag and lose the oldest events; the
/// emitter never waits on them.
#[derive(Clone)]
pub struct EventBus {
  sender: broadcast::Sender<RenderEvent>,
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

impl EventBus {
  pub fn new() -> Self {
    let (sender, _) = broadcast::channel(EVENT_BUFFER);
    Self { sender }
  }

  pub fn emit(&self, event: RenderEvent) {
    trace!(event = event.kind(), "emitting");
    // No subscribers is fine.
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
    self.sender.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn subscribers_see_events_in_order() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe();
    bus.emit(RenderEvent::TaskStarted { task_id: "t1".into(), worker_id: "w1".into() });
    bus.emit(RenderEvent::TaskProgress { task_id: "t1".into(), progress: 0.5 });

    let first = rx.recv().await.unwrap();
    assert_eq!(first.kind(), "task_started");
    assert_eq!(first.worker_id(), Some("w1"));
    let second = rx.recv().await.unwrap();
    assert_eq!(second.task_id(), Some("t1"));
  }

  #[test]
  fn emitting_without_subscribers_is_harmless() {
    EventBus::new().emit(RenderEvent::WorkerDisconnected { worker_id: "w1".into() });
  }

  #[test]
  fn events_serialize_with_a_tag() {
    let value = serde_json::to_value(RenderEvent::TaskFailed { task_id: "t1".into(), error: "boom".into() }).unwrap();
    assert_eq!(value, json!({"event": "task_failed", "task_id": "t1", "error": "boom"}));
  }
}
