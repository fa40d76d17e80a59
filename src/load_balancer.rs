use std::collections::{BTreeMap, HashMap};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{HardwareCapacity, RenderTask, WorkerNode, WorkerStatus};

const LOAD_WEIGHT: f64 = 0.6;
const TASK_WEIGHT: f64 = 0.4;

struct Entry {
  node: WorkerNode,
  load: f64,
  order: u64,
}

impl Entry {
  fn score(&self) -> f64 {
    LOAD_WEIGHT * self.load + TASK_WEIGHT * self.node.task_ratio()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
  pub address: String,
  pub status: WorkerStatus,
  pub capacity: HardwareCapacity,
  pub load: f64,
  pub load_score: f64,
  pub current_tasks: usize,
  pub max_concurrent_tasks: usize,
  pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
  Unknown,
  Refreshed,
  Revived,
}

#[derive(Default)]
struct Pool {
  workers: HashMap<String, Entry>,
  next_order: u64,
}

/// Scores workers by `0.6 * load + 0.4 * task_ratio`; ties go to whichever
/// registered first.
#[derive(Default)]
pub struct LoadBalancer {
  pool: RwLock<Pool>,
}

impl LoadBalancer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Re-registering an id replaces its record but keeps its place in the
  /// tie-break order.
  pub async fn register(&self, mut node: WorkerNode) {
    let mut pool = self.pool.write().await;
    let order = match pool.workers.get(&node.id) {
      Some(existing) => existing.order,
      None => {
        pool.next_order += 1;
        pool.next_order
      }
    };
    node.load_score = 0.0;
    node.status = WorkerStatus::Online;
    node.last_heartbeat = Utc::now();
    info!(worker_id = %node.id, address = %node.address, max_tasks = node.max_concurrent_tasks, "worker registered");
    pool.workers.insert(node.id.clone(), Entry { node, load: 0.0, order });
  }

  pub async fn unregister(&self, worker_id: &str) -> Option<WorkerNode> {
    let removed = self.pool.write().await.workers.remove(worker_id).map(|e| e.node);
    if removed.is_some() {
      info!(worker_id, "worker unregistered");
    }
    removed
  }

  pub async fn update_load(&self, worker_id: &str, load: f64) -> bool {
    let mut pool = self.pool.write().await;
    let Some(entry) = pool.workers.get_mut(worker_id) else {
      return false;
    };
    entry.load = if load.is_finite() { load.max(0.0) } else { 0.0 };
    entry.node.load_score = entry.score();
    true
  }

  pub async fn select_worker(&self, task: &RenderTask) -> Option<WorkerNode> {
    let pool = self.pool.read().await;
    let chosen = pool
      .workers
      .values()
      .filter(|e| e.node.is_online() && e.node.can_run(task) && e.node.has_spare_capacity())
      .min_by(|a, b| a.score().total_cmp(&b.score()).then(a.order.cmp(&b.order)));
    match chosen {
      Some(entry) => {
        debug!(task_id = %task.id, worker_id = %entry.node.id, score = entry.score(), "worker selected");
        Some(entry.node.clone())
      }
      None => None,
    }
  }

  /// Mirrors a dispatch the worker's manager accepted.
  pub async fn assign(&self, worker_id: &str, task_id: &str) -> bool {
    let mut pool = self.pool.write().await;
    let Some(entry) = pool.workers.get_mut(worker_id) else {
      return false;
    };
    if !entry.node.current_tasks.iter().any(|t| t == task_id) {
      entry.node.current_tasks.push(task_id.to_string());
    }
    entry.node.load_score = entry.score();
    true
  }

  pub async fn release(&self, worker_id: &str, task_id: &str) -> bool {
    let mut pool = self.pool.write().await;
    let Some(entry) = pool.workers.get_mut(worker_id) else {
      return false;
    };
    entry.node.current_tasks.retain(|t| t != task_id);
    entry.node.load_score = entry.score();
    true
  }

  pub async fn record_heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> HeartbeatOutcome {
    let mut pool = self.pool.write().await;
    let Some(entry) = pool.workers.get_mut(worker_id) else {
      return HeartbeatOutcome::Unknown;
    };
    if at > entry.node.last_heartbeat {
      entry.node.last_heartbeat = at;
    }
    if entry.node.is_online() {
      return HeartbeatOutcome::Refreshed;
    }
    entry.node.status = WorkerStatus::Online;
    info!(worker_id, "worker back online");
    HeartbeatOutcome::Revived
  }

  /// Marks workers silent for longer than `timeout` offline and returns the
  /// ids that changed state.
  pub async fn mark_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
    let mut pool = self.pool.write().await;
    let mut evicted: Vec<(u64, String)> = Vec::new();
    for entry in pool.workers.values_mut() {
      if entry.node.is_online() && now - entry.node.last_heartbeat > timeout {
        entry.node.status = WorkerStatus::Offline;
        warn!(
          worker_id = %entry.node.id,
          silent_secs = (now - entry.node.last_heartbeat).num_seconds(),
          in_flight = entry.node.current_tasks.len(),
          "worker heartbeat timed out, marking offline"
        );
        evicted.push((entry.order, entry.node.id.clone()));
      }
    }
    evicted.sort();
    evicted.into_iter().map(|(_, id)| id).collect()
  }

  pub async fn get(&self, worker_id: &str) -> Option<WorkerNode> {
    self.pool.read().await.workers.get(worker_id).map(|e| e.node.clone())
  }

  pub async fn stats(&self) -> BTreeMap<String, WorkerSnapshot> {
    let pool = self.pool.read().await;
    pool
      .workers
      .iter()
      .map(|(id, e)| {
        (
          id.clone(),
          WorkerSnapshot {
            address: e.node.address.clone(),
            status: e.node.status,
            capacity: e.node.capacity.clone(),
            load: e.load,
            load_score: e.score(),
            current_tasks: e.node.current_tasks.len(),
            max_concurrent_tasks: e.node.max_concurrent_tasks,
            last_heartbeat: e.node.last_heartbeat,
          },
        )
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::EngineKind;

  fn worker(id: &str, max: usize) -> WorkerNode {
    WorkerNode::new(id, format!("{id}:7000"), max).with_engine(EngineKind::Blender)
  }

  fn blender_task() -> RenderTask {
    RenderTask::new("shot", EngineKind::Blender, ["a.blend"], "/tmp/out")
  }

  #[tokio::test]
  async fn picks_lowest_score() {
    let lb = LoadBalancer::new();
    lb.register(worker("w1", 2)).await;
    lb.register(worker("w2", 2)).await;
    lb.update_load("w1", 0.5).await;

    assert_eq!(lb.select_worker(&blender_task()).await.unwrap().id, "w2");
    lb.assign("w2", "t1").await;
    // w1: 0.6 * 0.5 = 0.30, w2: 0.4 * 0.5 = 0.20
    assert_eq!(lb.select_worker(&blender_task()).await.unwrap().id, "w2");
    lb.assign("w2", "t2").await;
    assert_eq!(lb.select_worker(&blender_task()).await.unwrap().id, "w1");
  }

  #[tokio::test]
  async fn ties_go_to_registration_order() {
    let lb = LoadBalancer::new();
    for id in ["c", "a", "b"] {
      lb.register(worker(id, 1)).await;
    }
    assert_eq!(lb.select_worker(&blender_task()).await.unwrap().id, "c");
    lb.register(worker("c", 1)).await;
    assert_eq!(lb.select_worker(&blender_task()).await.unwrap().id, "c");
  }

  #[tokio::test]
  async fn none_when_every_worker_is_full() {
    let lb = LoadBalancer::new();
    for id in ["w1", "w2", "w3"] {
      lb.register(worker(id, 1)).await;
      lb.assign(id, &format!("task-{id}")).await;
    }
    assert!(lb.select_worker(&blender_task()).await.is_none());

    lb.release("w3", "task-w3").await;
    assert_eq!(lb.select_worker(&blender_task()).await.unwrap().id, "w3");
  }

  #[tokio::test]
  async fn filters_engine_support() {
    let lb = LoadBalancer::new();
    lb.register(WorkerNode::new("unity", "u:1", 4).with_engine(EngineKind::Unity)).await;
    assert!(lb.select_worker(&blender_task()).await.is_none());
    lb.register(worker("blender", 1)).await;
    assert_eq!(lb.select_worker(&blender_task()).await.unwrap().id, "blender");
  }

  #[tokio::test]
  async fn stale_workers_are_excluded_until_they_heartbeat() {
    let lb = LoadBalancer::new();
    lb.register(worker("w1", 1)).await;
    let later = Utc::now() + Duration::seconds(61);

    assert_eq!(lb.mark_stale(later, Duration::seconds(60)).await, vec!["w1".to_string()]);
    assert!(lb.mark_stale(later, Duration::seconds(60)).await.is_empty());
    assert!(lb.select_worker(&blender_task()).await.is_none());
    assert_eq!(lb.get("w1").await.unwrap().status, WorkerStatus::Offline);

    assert_eq!(lb.record_heartbeat("w1", later).await, HeartbeatOutcome::Revived);
    assert_eq!(lb.record_heartbeat("w1", later).await, HeartbeatOutcome::Refreshed);
    assert_eq!(lb.record_heartbeat("ghost", later).await, HeartbeatOutcome::Unknown);
    assert_eq!(lb.select_worker(&blender_task()).await.unwrap().id, "w1");
  }

  #[tokio::test]
  async fn register_resets_load_and_stats_report_it() {
    let lb = LoadBalancer::new();
    lb.register(worker("w1", 4)).await;
    assert!(lb.update_load("w1", 0.75).await);
    assert!(!lb.update_load("ghost", 0.1).await);
    lb.assign("w1", "t1").await;

    let stats = lb.stats().await;
    let snap = &stats["w1"];
    assert_eq!(snap.load, 0.75);
    assert_eq!(snap.current_tasks, 1);
    assert!((snap.load_score - (0.6 * 0.75 + 0.4 * 0.25)).abs() < 1e-9);

    lb.register(worker("w1", 4)).await;
    assert_eq!(lb.stats().await["w1"].load, 0.0);
    assert!(lb.unregister("w1").await.is_some());
    assert!(lb.stats().await.is_empty());
  }
}
