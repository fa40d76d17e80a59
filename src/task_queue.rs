use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::models::{RenderResult, RenderTask, TaskPriority, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
  Back,
  Front,
}

/// Shared backing store that lets several orchestrators work off one queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
  /// Upserts the record and adds a queue entry for it.
  async fn push(&self, task: &RenderTask, position: QueuePosition) -> anyhow::Result<()>;
  /// Claims the oldest queued entry of the highest priority `>= min_priority`.
  async fn pop_next(&self, min_priority: TaskPriority) -> anyhow::Result<Option<RenderTask>>;
  async fn update(&self, task: &RenderTask) -> anyhow::Result<()>;
  /// Drops queue entries for the task, keeping its record.
  async fn withdraw(&self, task_id: &str) -> anyhow::Result<()>;
  /// Drops queue entries and the record.
  async fn delete(&self, task_id: &str) -> anyhow::Result<()>;
  async fn counts(&self) -> anyhow::Result<QueueStats>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
  #[serde(rename = "URGENT")]
  pub urgent: usize,
  #[serde(rename = "HIGH")]
  pub high: usize,
  #[serde(rename = "NORMAL")]
  pub normal: usize,
  #[serde(rename = "LOW")]
  pub low: usize,
}

impl QueueStats {
  pub fn get(&self, priority: TaskPriority) -> usize {
    match priority {
      TaskPriority::Urgent => self.urgent,
      TaskPriority::High => self.high,
      TaskPriority::Normal => self.normal,
      TaskPriority::Low => self.low,
    }
  }

  pub fn add(&mut self, priority: TaskPriority, count: usize) {
    match priority {
      TaskPriority::Urgent => self.urgent += count,
      TaskPriority::High => self.high += count,
      TaskPriority::Normal => self.normal += count,
      TaskPriority::Low => self.low += count,
    }
  }

  pub fn total(&self) -> usize {
    self.urgent + self.high + self.normal + self.low
  }
}

#[derive(Debug)]
pub enum DispatchOutcome {
  Dispatched(RenderTask),
  Rejected,
  NotQueued(Option<TaskStatus>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DependencyState {
  Ready,
  Waiting,
  Blocked(String),
}

#[derive(Default)]
struct QueueState {
  buckets: [VecDeque<String>; 4],
  tasks: HashMap<String, RenderTask>,
}

impl QueueState {
  fn bucket(&mut self, priority: TaskPriority) -> &mut VecDeque<String> {
    &mut self.buckets[priority.rank() as usize]
  }

  fn is_queued(&self, task_id: &str) -> bool {
    self.tasks.get(task_id).is_some_and(|t| t.status == TaskStatus::Queued)
  }

  fn unlink(&mut self, task_id: &str) {
    for bucket in self.buckets.iter_mut() {
      bucket.retain(|id| id != task_id);
    }
  }

  fn insert_entry(&mut self, task_id: String, priority: TaskPriority, position: QueuePosition) {
    let bucket = self.bucket(priority);
    match position {
      QueuePosition::Back => bucket.push_back(task_id),
      QueuePosition::Front => bucket.push_front(task_id),
    }
  }

  /// Highest non-empty bucket, skipping entries that are no longer queued.
  fn best_local_priority(&mut self) -> Option<TaskPriority> {
    for priority in TaskPriority::DESCENDING {
      let mut bucket = std::mem::take(self.bucket(priority));
      bucket.retain(|id| self.is_queued(id));
      let non_empty = !bucket.is_empty();
      *self.bucket(priority) = bucket;
      if non_empty {
        return Some(priority);
      }
    }
    None
  }

  fn pop_local(&mut self) -> Option<RenderTask> {
    for priority in TaskPriority::DESCENDING {
      while let Some(id) = self.bucket(priority).pop_front() {
        if let Some(task) = self.tasks.get(&id).filter(|t| t.status == TaskStatus::Queued) {
          return Some(task.clone());
        }
      }
    }
    None
  }

  fn transition(&mut self, task_id: &str, next: TaskStatus) -> Result<&mut RenderTask, QueueError> {
    let task = self
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))?;
    if task.status != next && !task.status.can_transition_to(next) {
      return Err(QueueError::InvalidTransition {
        id: task_id.to_string(),
        from: task.status,
        to: next,
      });
    }
    let now = Utc::now();
    if next == TaskStatus::Processing && task.started_at.is_none() {
      task.started_at = Some(now);
    }
    if next.is_terminal() && task.status != next {
      task.completed_at = Some(now);
    }
    task.status = next;
    Ok(task)
  }
}

/// Tasks not yet on a worker, bucketed by priority, plus the full record of
/// every task ever enqueued so status stays queryable after completion.
///
/// With a [`QueueStore`] configured the store holds the queue entries and
/// local buckets only keep what the store could not take; any store failure
/// or timeout degrades to in-process operation.
pub struct TaskQueue {
  state: Mutex<QueueState>,
  store: Option<Arc<dyn QueueStore>>,
  store_timeout: Duration,
}

impl Default for TaskQueue {
  fn default() -> Self {
    Self::new()
  }
}

impl TaskQueue {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(QueueState::default()),
      store: None,
      store_timeout: Duration::from_secs(2),
    }
  }

  pub fn with_store(store: Arc<dyn QueueStore>, store_timeout: Duration) -> Self {
    Self {
      state: Mutex::new(QueueState::default()),
      store: Some(store),
      store_timeout,
    }
  }

  async fn mirror<T, F>(&self, op: &'static str, task_id: &str, fut: F) -> Option<T>
  where
    F: Future<Output = anyhow::Result<T>>,
  {
    match tokio::time::timeout(self.store_timeout, fut).await {
      Ok(Ok(value)) => Some(value),
      Ok(Err(e)) => {
        warn!(op, task_id, error = %e, "queue store unavailable, continuing in-process");
        None
      }
      Err(_) => {
        warn!(op, task_id, timeout_ms = self.store_timeout.as_millis() as u64, "queue store timed out, continuing in-process");
        None
      }
    }
  }

  async fn mirror_update(&self, task: &RenderTask) {
    if let Some(store) = &self.store {
      self.mirror("update", &task.id, store.update(task)).await;
    }
  }

  async fn place(&self, task: &RenderTask, position: QueuePosition) -> bool {
    match &self.store {
      Some(store) => self.mirror("push", &task.id, store.push(task, position)).await.is_some(),
      None => false,
    }
  }

  pub async fn enqueue(&self, mut task: RenderTask) -> Result<(), QueueError> {
    match task.status {
      TaskStatus::Pending => task.status = TaskStatus::Queued,
      TaskStatus::Queued => {}
      other => {
        return Err(QueueError::InvalidTransition {
          id: task.id.clone(),
          from: other,
          to: TaskStatus::Queued,
        })
      }
    }
    {
      let mut state = self.state.lock().await;
      if state.tasks.contains_key(&task.id) {
        return Err(QueueError::DuplicateTask(task.id.clone()));
      }
      state.tasks.insert(task.id.clone(), task.clone());
    }
    let mirrored = self.place(&task, QueuePosition::Back).await;

    let mut state = self.state.lock().await;
    if !mirrored && state.is_queued(&task.id) {
      state.insert_entry(task.id.clone(), task.priority, QueuePosition::Back);
    }
    debug!(task_id = %task.id, priority = task.priority.as_str(), mirrored, "task enqueued");
    Ok(())
  }

  /// Puts a previously dequeued, still-queued task back.
  pub async fn requeue(&self, task_id: &str, position: QueuePosition) -> Result<(), QueueError> {
    let task = {
      let state = self.state.lock().await;
      let task = state
        .tasks
        .get(task_id)
        .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))?;
      if task.status != TaskStatus::Queued {
        return Err(QueueError::InvalidTransition {
          id: task_id.to_string(),
          from: task.status,
          to: TaskStatus::Queued,
        });
      }
      task.clone()
    };
    let mirrored = self.place(&task, position).await;

    let mut state = self.state.lock().await;
    state.unlink(task_id);
    if !mirrored && state.is_queued(task_id) {
      state.insert_entry(task.id, task.priority, position);
    }
    Ok(())
  }

  /// URGENT before HIGH before NORMAL before LOW, FIFO within a level.
  pub async fn dequeue_next(&self) -> Option<RenderTask> {
    loop {
      if let Some(store) = &self.store {
        let floor = self.state.lock().await.best_local_priority().unwrap_or(TaskPriority::Low);
        if let Some(Some(claimed)) = self.mirror("pop", "-", store.pop_next(floor)).await {
          let mut state = self.state.lock().await;
          let record = state.tasks.entry(claimed.id.clone()).or_insert(claimed);
          if record.status == TaskStatus::Queued {
            return Some(record.clone());
          }
          // Cancelled or finished locally after the store entry was written.
          continue;
        }
      }
      return self.state.lock().await.pop_local();
    }
  }

  pub async fn get(&self, task_id: &str) -> Option<RenderTask> {
    self.state.lock().await.tasks.get(task_id).cloned()
  }

  pub async fn contains(&self, task_id: &str) -> bool {
    self.state.lock().await.tasks.contains_key(task_id)
  }

  pub async fn update_status(&self, task_id: &str, status: TaskStatus, progress: Option<f64>) -> Result<RenderTask, QueueError> {
    let snapshot = {
      let mut state = self.state.lock().await;
      let task = state.transition(task_id, status)?;
      if let Some(progress) = progress {
        task.progress = progress.clamp(0.0, 1.0);
      }
      let snapshot = task.clone();
      if status != TaskStatus::Queued {
        state.unlink(task_id);
      }
      snapshot
    };
    if let Some(store) = &self.store {
      if status != TaskStatus::Queued {
        self.mirror("withdraw", task_id, store.withdraw(task_id)).await;
      }
    }
    self.mirror_update(&snapshot).await;
    Ok(snapshot)
  }

  pub async fn update_progress(&self, task_id: &str, progress: f64) -> Result<RenderTask, QueueError> {
    let snapshot = {
      let mut state = self.state.lock().await;
      let task = state
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))?;
      if task.status != TaskStatus::Processing {
        return Err(QueueError::InvalidTransition {
          id: task_id.to_string(),
          from: task.status,
          to: TaskStatus::Processing,
        });
      }
      if !progress.is_nan() {
        task.progress = progress.clamp(0.0, 1.0);
      }
      task.clone()
    };
    self.mirror_update(&snapshot).await;
    Ok(snapshot)
  }

  pub async fn fail(&self, task_id: &str, error: impl Into<String>) -> Result<RenderTask, QueueError> {
    let error = error.into();
    let snapshot = {
      let mut state = self.state.lock().await;
      let task = state.transition(task_id, TaskStatus::Failed)?;
      task.error_message = Some(error);
      let snapshot = task.clone();
      state.unlink(task_id);
      snapshot
    };
    if let Some(store) = &self.store {
      self.mirror("withdraw", task_id, store.withdraw(task_id)).await;
    }
    self.mirror_update(&snapshot).await;
    Ok(snapshot)
  }

  pub async fn complete(&self, result: &RenderResult) -> Result<RenderTask, QueueError> {
    let next = if result.success { TaskStatus::Completed } else { TaskStatus::Failed };
    let snapshot = {
      let mut state = self.state.lock().await;
      let task = state.transition(&result.task_id, next)?;
      if result.success {
        task.progress = 1.0;
        task.error_message = None;
      } else {
        task.error_message = Some(result.error_message.clone().unwrap_or_else(|| "render failed".to_string()));
      }
      task.clone()
    };
    self.mirror_update(&snapshot).await;
    Ok(snapshot)
  }

  /// Only PENDING and QUEUED tasks can be cancelled.
  pub async fn cancel(&self, task_id: &str) -> bool {
    let snapshot = {
      let mut state = self.state.lock().await;
      let cancellable = state.tasks.get(task_id).is_some_and(|t| t.status.is_cancellable());
      if !cancellable {
        return false;
      }
      let Ok(task) = state.transition(task_id, TaskStatus::Cancelled) else {
        return false;
      };
      let snapshot = task.clone();
      state.unlink(task_id);
      snapshot
    };
    if let Some(store) = &self.store {
      self.mirror("withdraw", task_id, store.withdraw(task_id)).await;
    }
    self.mirror_update(&snapshot).await;
    true
  }

  /// Hands the task to `submit` while holding the queue lock, so a
  /// concurrent cancel either wins before dispatch or sees PROCESSING.
  pub async fn dispatch<F>(&self, task_id: &str, worker_id: &str, submit: F) -> DispatchOutcome
  where
    F: FnOnce(RenderTask) -> bool,
  {
    let snapshot = {
      let mut state = self.state.lock().await;
      let Some(task) = state.tasks.get_mut(task_id) else {
        return DispatchOutcome::NotQueued(None);
      };
      if task.status != TaskStatus::Queued {
        return DispatchOutcome::NotQueued(Some(task.status));
      }
      let mut assigned = task.clone();
      assigned.status = TaskStatus::Processing;
      assigned.worker_id = Some(worker_id.to_string());
      assigned.started_at.get_or_insert_with(Utc::now);
      if !submit(assigned.clone()) {
        return DispatchOutcome::Rejected;
      }
      *task = assigned.clone();
      state.unlink(task_id);
      assigned
    };
    self.mirror_update(&snapshot).await;
    DispatchOutcome::Dispatched(snapshot)
  }

  pub async fn dependency_state(&self, task: &RenderTask) -> DependencyState {
    let state = self.state.lock().await;
    let mut waiting = false;
    for dep in &task.dependencies {
      match state.tasks.get(dep).map(|t| t.status) {
        Some(TaskStatus::Completed) => {}
        Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) | None => {
          return DependencyState::Blocked(dep.clone());
        }
        Some(_) => waiting = true,
      }
    }
    if waiting { DependencyState::Waiting } else { DependencyState::Ready }
  }

  pub async fn remove(&self, task_id: &str) -> Option<RenderTask> {
    let removed = {
      let mut state = self.state.lock().await;
      state.unlink(task_id);
      state.tasks.remove(task_id)
    };
    if removed.is_some() {
      if let Some(store) = &self.store {
        self.mirror("delete", task_id, store.delete(task_id)).await;
      }
    }
    removed
  }

  pub async fn stats(&self) -> QueueStats {
    let mut stats = {
      let state = self.state.lock().await;
      let mut stats = QueueStats::default();
      for priority in TaskPriority::DESCENDING {
        let count = state.buckets[priority.rank() as usize]
          .iter()
          .filter(|id| state.is_queued(id))
          .count();
        stats.add(priority, count);
      }
      stats
    };
    if let Some(store) = &self.store {
      if let Some(remote) = self.mirror("counts", "-", store.counts()).await {
        for priority in TaskPriority::DESCENDING {
          stats.add(priority, remote.get(priority));
        }
      }
    }
    stats
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::models::EngineKind;
  use std::sync::Mutex as StdMutex;
  use tokio_test::{assert_err, assert_ok};

  fn task(id: &str, priority: TaskPriority) -> RenderTask {
    RenderTask::new(id, EngineKind::Blender, ["in.blend"], "/tmp/out")
      .with_id(id)
      .with_priority(priority)
  }

  /// Queue store held in memory; several `TaskQueue`s may share one.
  #[derive(Default)]
  pub(crate) struct MemoryStore {
    inner: StdMutex<(i64, Vec<(i64, String, TaskPriority)>, HashMap<String, RenderTask>)>,
  }

  #[async_trait]
  impl QueueStore for MemoryStore {
    async fn push(&self, task: &RenderTask, position: QueuePosition) -> anyhow::Result<()> {
      let mut inner = self.inner.lock().unwrap();
      let seq = match position {
        QueuePosition::Back => {
          inner.0 += 1;
          inner.0
        }
        QueuePosition::Front => inner.1.iter().map(|e| e.0).min().unwrap_or(0) - 1,
      };
      inner.1.retain(|e| e.1 != task.id);
      inner.1.push((seq, task.id.clone(), task.priority));
      inner.2.insert(task.id.clone(), task.clone());
      Ok(())
    }

    async fn pop_next(&self, min_priority: TaskPriority) -> anyhow::Result<Option<RenderTask>> {
      let mut inner = self.inner.lock().unwrap();
      let best = inner
        .1
        .iter()
        .filter(|e| e.2 >= min_priority)
        .filter(|e| inner.2.get(&e.1).is_some_and(|t| t.status == TaskStatus::Queued))
        .max_by(|a, b| a.2.cmp(&b.2).then(b.0.cmp(&a.0)))
        .cloned();
      let Some((seq, id, _)) = best else { return Ok(None) };
      inner.1.retain(|e| e.0 != seq);
      Ok(inner.2.get(&id).cloned())
    }

    async fn update(&self, task: &RenderTask) -> anyhow::Result<()> {
      self.inner.lock().unwrap().2.insert(task.id.clone(), task.clone());
      Ok(())
    }

    async fn withdraw(&self, task_id: &str) -> anyhow::Result<()> {
      self.inner.lock().unwrap().1.retain(|e| e.1 != task_id);
      Ok(())
    }

    async fn delete(&self, task_id: &str) -> anyhow::Result<()> {
      let mut inner = self.inner.lock().unwrap();
      inner.1.retain(|e| e.1 != task_id);
      inner.2.remove(task_id);
      Ok(())
    }

    async fn counts(&self) -> anyhow::Result<QueueStats> {
      let inner = self.inner.lock().unwrap();
      let mut stats = QueueStats::default();
      for entry in &inner.1 {
        stats.add(entry.2, 1);
      }
      Ok(stats)
    }
  }

  struct BrokenStore {
    hang: bool,
  }

  #[async_trait]
  impl QueueStore for BrokenStore {
    async fn push(&self, _task: &RenderTask, _position: QueuePosition) -> anyhow::Result<()> {
      self.fail().await
    }
    async fn pop_next(&self, _min_priority: TaskPriority) -> anyhow::Result<Option<RenderTask>> {
      self.fail().await
    }
    async fn update(&self, _task: &RenderTask) -> anyhow::Result<()> {
      self.fail().await
    }
    async fn withdraw(&self, _task_id: &str) -> anyhow::Result<()> {
      self.fail().await
    }
    async fn delete(&self, _task_id: &str) -> anyhow::Result<()> {
      self.fail().await
    }
    async fn counts(&self) -> anyhow::Result<QueueStats> {
      self.fail().await
    }
  }

  impl BrokenStore {
    async fn fail<T>(&self) -> anyhow::Result<T> {
      if self.hang {
        std::future::pending::<()>().await;
      }
      anyhow::bail!("connection refused")
    }
  }

  async fn drain(queue: &TaskQueue) -> Vec<String> {
    let mut order = Vec::new();
    while let Some(task) = queue.dequeue_next().await {
      order.push(task.id.clone());
      queue.update_status(&task.id, TaskStatus::Processing, None).await.unwrap();
    }
    order
  }

  #[tokio::test]
  async fn strict_priority_and_fifo_within_level() {
    let queue = TaskQueue::new();
    for (id, priority) in [
      ("low-1", TaskPriority::Low),
      ("normal-1", TaskPriority::Normal),
      ("urgent-1", TaskPriority::Urgent),
      ("high-1", TaskPriority::High),
      ("normal-2", TaskPriority::Normal),
      ("urgent-2", TaskPriority::Urgent),
      ("low-2", TaskPriority::Low),
    ] {
      queue.enqueue(task(id, priority)).await.unwrap();
    }
    assert_eq!(
      drain(&queue).await,
      vec!["urgent-1", "urgent-2", "high-1", "normal-1", "normal-2", "low-1", "low-2"]
    );
    assert!(queue.dequeue_next().await.is_none());
  }

  #[tokio::test]
  async fn enqueue_marks_queued_and_counts_buckets() {
    let queue = TaskQueue::new();
    queue.enqueue(task("a", TaskPriority::High)).await.unwrap();
    queue.enqueue(task("b", TaskPriority::High)).await.unwrap();
    queue.enqueue(task("c", TaskPriority::Low)).await.unwrap();

    assert_eq!(queue.get("a").await.unwrap().status, TaskStatus::Queued);
    let stats = queue.stats().await;
    assert_eq!(stats.high, 2);
    assert_eq!(stats.low, 1);
    assert_eq!(stats.total(), 3);
  }

  #[tokio::test]
  async fn known_ids_are_never_overwritten() {
    let queue = TaskQueue::new();
    queue.enqueue(task("a", TaskPriority::Low)).await.unwrap();
    queue.dequeue_next().await.unwrap();
    queue.update_status("a", TaskStatus::Processing, None).await.unwrap();

    assert_eq!(
      queue.enqueue(task("a", TaskPriority::Urgent)).await,
      Err(QueueError::DuplicateTask("a".into()))
    );
    let kept = queue.get("a").await.unwrap();
    assert_eq!(kept.status, TaskStatus::Processing);
    assert_eq!(kept.priority, TaskPriority::Low);
    assert!(queue.dequeue_next().await.is_none());
    assert_eq!(queue.stats().await.total(), 0);
  }

  #[tokio::test]
  async fn progress_only_moves_while_processing() {
    let queue = TaskQueue::new();
    queue.enqueue(task("a", TaskPriority::Normal)).await.unwrap();
    assert!(matches!(
      queue.update_progress("a", 0.5).await,
      Err(QueueError::InvalidTransition { from: TaskStatus::Queued, .. })
    ));
    assert!(matches!(queue.update_progress("ghost", 0.5).await, Err(QueueError::UnknownTask(_))));

    queue.update_status("a", TaskStatus::Processing, None).await.unwrap();
    assert_eq!(queue.update_progress("a", 0.3).await.unwrap().progress, 0.3);
    assert_eq!(queue.update_progress("a", 7.0).await.unwrap().progress, 1.0);
    assert_eq!(queue.update_progress("a", -2.0).await.unwrap().progress, 0.0);
    assert_eq!(queue.update_progress("a", f64::NAN).await.unwrap().progress, 0.0);
  }

  #[tokio::test]
  async fn status_updates_stamp_timestamps() {
    let queue = TaskQueue::new();
    queue.enqueue(task("a", TaskPriority::Normal)).await.unwrap();

    let started = queue.update_status("a", TaskStatus::Processing, Some(0.25)).await.unwrap();
    assert!(started.started_at.is_some());
    assert_eq!(started.progress, 0.25);
    assert!(started.completed_at.is_none());

    let done = queue.update_status("a", TaskStatus::Completed, Some(1.0)).await.unwrap();
    assert_eq!(done.started_at, started.started_at);
    assert!(done.completed_at.is_some());

    let err = queue.update_status("a", TaskStatus::Processing, None).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));
    assert_err!(queue.update_status("missing", TaskStatus::Queued, None).await);
  }

  #[tokio::test]
  async fn cancelled_tasks_are_never_dequeued() {
    let queue = TaskQueue::new();
    queue.enqueue(task("a", TaskPriority::Normal)).await.unwrap();
    queue.enqueue(task("b", TaskPriority::Normal)).await.unwrap();

    assert!(queue.cancel("a").await);
    assert!(!queue.cancel("a").await);
    assert_eq!(queue.get("a").await.unwrap().status, TaskStatus::Cancelled);
    assert_eq!(queue.dequeue_next().await.unwrap().id, "b");
    assert!(queue.dequeue_next().await.is_none());
  }

  #[tokio::test]
  async fn dispatch_respects_cancellation_and_rejection() {
    let queue = TaskQueue::new();
    queue.enqueue(task("a", TaskPriority::Normal)).await.unwrap();
    let popped = queue.dequeue_next().await.unwrap();

    assert!(matches!(queue.dispatch(&popped.id, "w1", |_| false).await, DispatchOutcome::Rejected));
    assert_eq!(queue.get("a").await.unwrap().status, TaskStatus::Queued);

    match queue.dispatch(&popped.id, "w1", |t| t.status == TaskStatus::Processing).await {
      DispatchOutcome::Dispatched(t) => {
        assert_eq!(t.worker_id.as_deref(), Some("w1"));
        assert!(t.started_at.is_some());
      }
      other => panic!("unexpected {other:?}"),
    }
    assert!(!queue.cancel("a").await);

    queue.enqueue(task("b", TaskPriority::Normal)).await.unwrap();
    let b = queue.dequeue_next().await.unwrap();
    assert!(queue.cancel("b").await);
    assert!(matches!(
      queue.dispatch(&b.id, "w1", |_| panic!("must not dispatch a cancelled task")).await,
      DispatchOutcome::NotQueued(Some(TaskStatus::Cancelled))
    ));
  }

  #[tokio::test]
  async fn requeue_front_keeps_submission_order() {
    let queue = TaskQueue::new();
    queue.enqueue(task("a", TaskPriority::Normal)).await.unwrap();
    queue.enqueue(task("b", TaskPriority::Normal)).await.unwrap();

    let a = queue.dequeue_next().await.unwrap();
    assert_ok!(queue.requeue(&a.id, QueuePosition::Front).await);
    assert_eq!(queue.dequeue_next().await.unwrap().id, "a");
    assert_ok!(queue.requeue("a", QueuePosition::Back).await);
    assert_eq!(drain(&queue).await, vec!["b", "a"]);
  }

  #[tokio::test]
  async fn dependencies_resolve_through_records() {
    let queue = TaskQueue::new();
    queue.enqueue(task("base", TaskPriority::Normal)).await.unwrap();
    let child = task("child", TaskPriority::Normal).with_dependencies(["base"]);
    queue.enqueue(child.clone()).await.unwrap();

    assert_eq!(queue.dependency_state(&child).await, DependencyState::Waiting);
    queue.update_status("base", TaskStatus::Processing, None).await.unwrap();
    queue.update_status("base", TaskStatus::Completed, None).await.unwrap();
    assert_eq!(queue.dependency_state(&child).await, DependencyState::Ready);

    let orphan = task("orphan", TaskPriority::Normal).with_dependencies(["ghost"]);
    assert_eq!(queue.dependency_state(&orphan).await, DependencyState::Blocked("ghost".into()));
  }

  #[tokio::test]
  async fn shared_store_lets_queues_cooperate() {
    let store = Arc::new(MemoryStore::default());
    let a = TaskQueue::with_store(store.clone(), Duration::from_millis(200));
    let b = TaskQueue::with_store(store.clone(), Duration::from_millis(200));

    a.enqueue(task("low", TaskPriority::Low)).await.unwrap();
    a.enqueue(task("urgent", TaskPriority::Urgent)).await.unwrap();
    assert_eq!(b.stats().await.total(), 2);

    let first = b.dequeue_next().await.unwrap();
    assert_eq!(first.id, "urgent");
    assert_eq!(b.get("urgent").await.unwrap().status, TaskStatus::Queued);
    assert_eq!(a.dequeue_next().await.unwrap().id, "low");
    assert!(a.dequeue_next().await.is_none());
    assert!(b.dequeue_next().await.is_none());
  }

  #[tokio::test]
  async fn local_fallback_entries_compete_by_priority() {
    let store = Arc::new(MemoryStore::default());
    let queue = TaskQueue::with_store(store.clone(), Duration::from_millis(200));
    queue.enqueue(task("stored-normal", TaskPriority::Normal)).await.unwrap();
    {
      let mut state = queue.state.lock().await;
      let mut local = task("local-high", TaskPriority::High);
      local.status = TaskStatus::Queued;
      state.insert_entry(local.id.clone(), local.priority, QueuePosition::Back);
      state.tasks.insert(local.id.clone(), local);
    }
    assert_eq!(queue.dequeue_next().await.unwrap().id, "local-high");
    assert_eq!(queue.dequeue_next().await.unwrap().id, "stored-normal");
  }

  #[tokio::test]
  async fn broken_store_degrades_to_in_process() {
    let queue = TaskQueue::with_store(Arc::new(BrokenStore { hang: false }), Duration::from_millis(100));
    queue.enqueue(task("a", TaskPriority::Low)).await.unwrap();
    queue.enqueue(task("b", TaskPriority::High)).await.unwrap();
    assert_eq!(queue.stats().await.total(), 2);
    assert_eq!(drain(&queue).await, vec!["b", "a"]);
  }

  #[tokio::test]
  async fn hanging_store_never_blocks_the_queue() {
    let queue = TaskQueue::with_store(Arc::new(BrokenStore { hang: true }), Duration::from_millis(20));
    let outcome = tokio::time::timeout(Duration::from_secs(2), async {
      queue.enqueue(task("a", TaskPriority::Normal)).await.unwrap();
      queue.dequeue_next().await
    })
    .await
    .expect("queue blocked on an unavailable store");
    assert_eq!(outcome.unwrap().id, "a");
  }

  #[tokio::test]
  async fn remove_forgets_the_record() {
    let queue = TaskQueue::new();
    queue.enqueue(task("a", TaskPriority::Normal)).await.unwrap();
    assert!(queue.remove("a").await.is_some());
    assert!(queue.get("a").await.is_none());
    assert!(queue.dequeue_next().await.is_none());
    assert!(queue.remove("a").await.is_none());
  }
}
