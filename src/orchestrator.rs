use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cloud::{strip_remote_inputs, CloudStager};
use crate::config::{SchedulerConfig, WorkerConfig, MAX_WORKER_TASKS};
use crate::cost::CostEstimator;
use crate::engine::EngineRegistry;
use crate::error::{QueueError, ValidationError};
use crate::events::{EventBus, RenderEvent};
use crate::load_balancer::{HeartbeatOutcome, LoadBalancer, WorkerSnapshot};
use crate::models::{Heartbeat, RenderResult, RenderTask, TaskStatus, WorkerNode};
use crate::storage::is_remote_ref;
use crate::task_queue::{DependencyState, DispatchOutcome, QueuePosition, QueueStats, TaskQueue};
use crate::worker_manager::{ManagerStatus, WorkerNodeManager, WorkerReport};

const MIN_LOOP_PERIOD: Duration = Duration::from_millis(10);

/// What one pass of the scheduling loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
  Idle,
  Dispatched { task_id: String, worker_id: String },
  /// Everything queued is waiting on prerequisites.
  Deferred(String),
  /// A prerequisite failed or was cancelled; the task was failed.
  Dropped(String),
  NoWorker(String),
  Rejected(String),
  /// Cancelled or removed between dequeue and dispatch.
  Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
  pub queue: QueueStats,
  pub workers: BTreeMap<String, WorkerSnapshot>,
  pub managers: Vec<ManagerStatus>,
  pub remote_queue_depth: Option<u64>,
}

pub struct OrchestratorBuilder {
  engines: EngineRegistry,
  config: SchedulerConfig,
  work_root: PathBuf,
  queue: Option<TaskQueue>,
  stager: Option<CloudStager>,
  costs: CostEstimator,
}

impl OrchestratorBuilder {
  pub fn config(mut self, config: SchedulerConfig) -> Self {
    self.config = config;
    self
  }

  /// Parent of per-task working directories for managers created by
  /// [`Orchestrator::register_worker`].
  pub fn work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
    self.work_root = work_root.into();
    self
  }

  pub fn queue(mut self, queue: TaskQueue) -> Self {
    self.queue = Some(queue);
    self
  }

  pub fn stager(mut self, stager: CloudStager) -> Self {
    self.stager = Some(stager);
    self
  }

  pub fn costs(mut self, costs: CostEstimator) -> Self {
    self.costs = costs;
    self
  }

  pub fn build(self) -> Arc<Orchestrator> {
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let (shutdown, _) = watch::channel(false);
    Arc::new(Orchestrator {
      queue: self.queue.unwrap_or_default(),
      balancer: LoadBalancer::new(),
      engines: self.engines,
      stager: self.stager,
      costs: self.costs,
      events: EventBus::new(),
      config: self.config,
      work_root: self.work_root,
      managers: RwLock::new(HashMap::new()),
      reports_tx,
      reports_rx: Mutex::new(Some(reports_rx)),
      wake: Notify::new(),
      shutdown,
      loops: Mutex::new(Vec::new()),
      running: AtomicBool::new(false),
    })
  }
}

/// Entry point of the scheduling subsystem. Owns the queue, the balancer and
/// one [`WorkerNodeManager`] per registered worker.
pub struct Orchestrator {
  queue: TaskQueue,
  balancer: LoadBalancer,
  engines: EngineRegistry,
  stager: Option<CloudStager>,
  costs: CostEstimator,
  events: EventBus,
  config: SchedulerConfig,
  work_root: PathBuf,
  managers: RwLock<HashMap<String, Arc<WorkerNodeManager>>>,
  reports_tx: mpsc::UnboundedSender<WorkerReport>,
  reports_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerReport>>>,
  wake: Notify,
  shutdown: watch::Sender<bool>,
  loops: Mutex<Vec<JoinHandle<()>>>,
  running: AtomicBool,
}

fn task_id_pattern() -> &'static Regex {
  static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
  PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid task id pattern"))
}

impl Orchestrator {
  pub fn builder(engines: EngineRegistry) -> OrchestratorBuilder {
    OrchestratorBuilder {
      engines,
      config: SchedulerConfig::default(),
      work_root: std::env::temp_dir().join("renderfarm"),
      queue: None,
      stager: None,
      costs: CostEstimator::default(),
    }
  }

  pub fn queue(&self) -> &TaskQueue {
    &self.queue
  }

  pub fn balancer(&self) -> &LoadBalancer {
    &self.balancer
  }

  pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
    self.events.subscribe()
  }

  fn managers_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<WorkerNodeManager>>> {
    self.managers.read().unwrap_or_else(|p| p.into_inner())
  }

  fn managers_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<WorkerNodeManager>>> {
    self.managers.write().unwrap_or_else(|p| p.into_inner())
  }

  pub fn manager(&self, worker_id: &str) -> Option<Arc<WorkerNodeManager>> {
    self.managers_read().get(worker_id).cloned()
  }

  pub async fn submit(&self, task: RenderTask) -> Result<String, ValidationError> {
    self.validate(&task).await?;

    let mut task = task;
    task.status = TaskStatus::Pending;
    task.started_at = None;
    task.completed_at = None;
    task.worker_id = None;
    task.progress = 0.0;
    task.error_message = None;

    let estimate = self.costs.estimate(&task);

    if let Some(stager) = &self.stager {
      match stager.stage(&task).await {
        Ok(staged) => task = staged,
        Err(e) => {
          let stripped = strip_remote_inputs(&mut task);
          if task.input_files().is_empty() {
            warn!(task_id = %task.id, error = %format!("{e:#}"), stripped, "cloud staging failed and no local input remains");
            return Err(ValidationError::NoLocalInputs(task.id));
          }
          warn!(task_id = %task.id, error = %format!("{e:#}"), stripped, "cloud staging failed, falling back to local execution");
        }
      }
    } else {
      strip_remote_inputs(&mut task);
    }

    let task_id = task.id.clone();
    if let Err(e) = self.queue.enqueue(task.clone()).await {
      warn!(task_id = %task_id, error = %e, "enqueue refused task");
      return Err(match e {
        QueueError::DuplicateTask(id) => ValidationError::DuplicateId(id),
        other => ValidationError::NotQueued(other.to_string()),
      });
    }
    self.events.emit(RenderEvent::CostEstimated { estimate });
    info!(task_id = %task_id, name = %task.name, engine = %task.engine, priority = task.priority.as_str(), "task submitted");
    self.events.emit(RenderEvent::TaskSubmitted { task });
    self.wake.notify_one();
    Ok(task_id)
  }

  async fn validate(&self, task: &RenderTask) -> Result<(), ValidationError> {
    if task.id.is_empty() {
      return Err(ValidationError::MissingId);
    }
    if !task_id_pattern().is_match(&task.id) {
      return Err(ValidationError::InvalidId(task.id.clone()));
    }
    if self.queue.contains(&task.id).await {
      return Err(ValidationError::DuplicateId(task.id.clone()));
    }
    if task.input_files().is_empty() {
      return Err(ValidationError::NoInputs);
    }
    for input in task.input_files() {
      let resolvable = if is_remote_ref(input) {
        self.stager.is_some()
      } else {
        tokio::fs::try_exists(input).await.unwrap_or(false)
      };
      if !resolvable {
        return Err(ValidationError::UnresolvableInput(input.clone()));
      }
    }
    let output = task.output_path();
    if output.as_os_str().is_empty() {
      return Err(ValidationError::MissingOutput);
    }
    if tokio::fs::create_dir_all(output).await.is_err() {
      return Err(ValidationError::UnwritableOutput(output.to_path_buf()));
    }
    for dep in &task.dependencies {
      if !self.queue.contains(dep).await {
        return Err(ValidationError::UnknownDependency(dep.clone()));
      }
    }
    Ok(())
  }

  /// PENDING and QUEUED only.
  pub async fn cancel(&self, task_id: &str) -> bool {
    let cancelled = self.queue.cancel(task_id).await;
    if cancelled {
      info!(task_id, "task cancelled");
      self.events.emit(RenderEvent::TaskCancelled { task_id: task_id.to_string() });
    }
    cancelled
  }

  pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
    self.queue.get(task_id).await.map(|t| t.status)
  }

  pub async fn task(&self, task_id: &str) -> Option<RenderTask> {
    self.queue.get(task_id).await
  }

  /// PROCESSING only; the value is clamped to `[0, 1]` and returned.
  pub async fn update_progress(&self, task_id: &str, progress: f64) -> Result<f64, QueueError> {
    let task = self.queue.update_progress(task_id, progress).await?;
    debug!(task_id, progress = task.progress, "task progress");
    self.events.emit(RenderEvent::TaskProgress {
      task_id: task.id,
      progress: task.progress,
    });
    Ok(task.progress)
  }

  /// Registers a worker that reports its own liveness through
  /// [`Orchestrator::record_heartbeat`]. Tasks routed to it run in a
  /// manager owned by this orchestrator.
  pub async fn register_worker(&self, node: WorkerNode) -> Arc<WorkerNodeManager> {
    let mut node = node;
    if node.max_concurrent_tasks > MAX_WORKER_TASKS {
      warn!(worker_id = %node.id, requested = node.max_concurrent_tasks, "worker capacity clamped");
      node.max_concurrent_tasks = MAX_WORKER_TASKS;
    }
    let engines = self.engines.subset(&node.supported_engines);
    if node.supported_engines.is_empty() {
      node.supported_engines = engines.kinds().into_iter().collect();
    }
    if node.capabilities.is_empty() {
      node.capabilities = engines
        .capabilities()
        .into_iter()
        .filter(|(kind, _)| node.supported_engines.contains(kind))
        .collect();
    }
    let config = WorkerConfig {
      id: node.id.clone(),
      address: node.address.clone(),
      max_tasks: node.max_concurrent_tasks,
      gpu_count: node.capacity.gpu_count,
      work_dir: self.work_root.clone(),
      heartbeat_interval: self.config.heartbeat_interval,
    };
    let manager = Arc::new(WorkerNodeManager::new(config, engines, self.storage(), self.reports_tx.clone()));
    self.install(manager.clone(), node).await;
    manager
  }

  /// Registers a worker living in this process; its manager sends the
  /// heartbeats.
  pub async fn register_local_worker(&self, config: WorkerConfig) -> Arc<WorkerNodeManager> {
    let engines = self.engines.clone();
    let manager = Arc::new(WorkerNodeManager::new(config, engines, self.storage(), self.reports_tx.clone()));
    let node = manager.describe();
    self.install(manager.clone(), node).await;
    manager.start();
    manager
  }

  fn storage(&self) -> Option<Arc<dyn crate::storage::ObjectStorage>> {
    self.stager.as_ref().map(|s| s.storage())
  }

  async fn install(&self, manager: Arc<WorkerNodeManager>, node: WorkerNode) {
    let previous = self.managers_write().insert(node.id.clone(), manager);
    if let Some(previous) = previous {
      previous.stop();
    }
    self.balancer.register(node.clone()).await;
    self.events.emit(RenderEvent::WorkerRegistered { worker: node });
    self.wake.notify_one();
  }

  pub async fn unregister_worker(&self, worker_id: &str) -> bool {
    let manager = self.managers_write().remove(worker_id);
    if let Some(manager) = &manager {
      manager.stop();
    }
    let removed = self.balancer.unregister(worker_id).await.is_some();
    if removed {
      self.events.emit(RenderEvent::WorkerDisconnected { worker_id: worker_id.to_string() });
    }
    removed || manager.is_some()
  }

  /// Returns `false` for workers the balancer does not know.
  pub async fn record_heartbeat(&self, heartbeat: Heartbeat) -> bool {
    match self.balancer.record_heartbeat(&heartbeat.worker_id, heartbeat.timestamp).await {
      HeartbeatOutcome::Unknown => {
        debug!(worker_id = %heartbeat.worker_id, "heartbeat from unknown worker");
        false
      }
      outcome => {
        self.events.emit(RenderEvent::WorkerHeartbeat { heartbeat });
        if outcome == HeartbeatOutcome::Revived {
          self.wake.notify_one();
        }
        true
      }
    }
  }

  pub async fn update_worker_load(&self, worker_id: &str, load: f64) -> bool {
    let updated = self.balancer.update_load(worker_id, load).await;
    if updated {
      self.wake.notify_one();
    }
    updated
  }

  /// Marks silent workers offline. Their PROCESSING tasks stay where they
  /// are; the manager still reports whatever outcome it reaches.
  pub async fn check_heartbeats(&self, now: DateTime<Utc>) -> Vec<String> {
    let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
    let evicted = self.balancer.mark_stale(now, timeout).await;
    for worker_id in &evicted {
      self.events.emit(RenderEvent::WorkerDisconnected { worker_id: worker_id.clone() });
    }
    evicted
  }

  /// Dispatches the first queued task whose prerequisites are done. Tasks
  /// still waiting are passed over and put back in their original order.
  pub async fn schedule_once(&self) -> ScheduleOutcome {
    let mut parked: Vec<String> = Vec::new();
    let outcome = loop {
      let Some(task) = self.queue.dequeue_next().await else {
        break match parked.first() {
          Some(task_id) => ScheduleOutcome::Deferred(task_id.clone()),
          None => ScheduleOutcome::Idle,
        };
      };
      match self.queue.dependency_state(&task).await {
        DependencyState::Ready => break self.place(task).await,
        DependencyState::Waiting => parked.push(task.id),
        DependencyState::Blocked(dep) => break self.drop_blocked(task, &dep).await,
      }
    };
    for task_id in parked.iter().rev() {
      self.requeue(task_id, QueuePosition::Front).await;
    }
    outcome
  }

  async fn drop_blocked(&self, task: RenderTask, dep: &str) -> ScheduleOutcome {
    let message = format!("prerequisite task {dep} did not complete");
    match self.queue.fail(&task.id, &message).await {
      Ok(_) => {
        warn!(task_id = %task.id, dependency = dep, "dropping task with failed prerequisite");
        self.events.emit(RenderEvent::TaskFailed { task_id: task.id.clone(), error: message });
      }
      Err(e) => debug!(task_id = %task.id, error = %e, "task changed state before it could be dropped"),
    }
    ScheduleOutcome::Dropped(task.id)
  }

  async fn place(&self, task: RenderTask) -> ScheduleOutcome {
    let Some(worker) = self.balancer.select_worker(&task).await else {
      self.requeue(&task.id, QueuePosition::Front).await;
      return ScheduleOutcome::NoWorker(task.id);
    };
    let Some(manager) = self.manager(&worker.id) else {
      warn!(worker_id = %worker.id, "selected worker has no manager");
      self.requeue(&task.id, QueuePosition::Front).await;
      return ScheduleOutcome::NoWorker(task.id);
    };

    // The slot is held before the manager can report a result.
    if !self.balancer.assign(&worker.id, &task.id).await {
      self.requeue(&task.id, QueuePosition::Front).await;
      return ScheduleOutcome::NoWorker(task.id);
    }

    match self.queue.dispatch(&task.id, &worker.id, |t| manager.submit(t)).await {
      DispatchOutcome::Dispatched(task) => {
        info!(task_id = %task.id, worker_id = %worker.id, "task dispatched");
        self.events.emit(RenderEvent::TaskStarted {
          task_id: task.id.clone(),
          worker_id: worker.id.clone(),
        });
        ScheduleOutcome::Dispatched {
          task_id: task.id,
          worker_id: worker.id,
        }
      }
      DispatchOutcome::Rejected => {
        debug!(task_id = %task.id, worker_id = %worker.id, "worker rejected task");
        self.balancer.release(&worker.id, &task.id).await;
        self.requeue(&task.id, QueuePosition::Front).await;
        ScheduleOutcome::Rejected(task.id)
      }
      DispatchOutcome::NotQueued(status) => {
        debug!(task_id = %task.id, status = ?status, "task left the queue before dispatch");
        self.balancer.release(&worker.id, &task.id).await;
        ScheduleOutcome::Skipped(task.id)
      }
    }
  }

  async fn requeue(&self, task_id: &str, position: QueuePosition) {
    if let Err(e) = self.queue.requeue(task_id, position).await {
      debug!(task_id, error = %e, "task not requeued");
    }
  }

  async fn handle_report(&self, report: WorkerReport) {
    match report {
      WorkerReport::Heartbeat(heartbeat) => {
        self.record_heartbeat(heartbeat).await;
      }
      WorkerReport::Finished { worker_id, result } => self.finish(&worker_id, result).await,
    }
  }

  async fn finish(&self, worker_id: &str, result: RenderResult) {
    self.balancer.release(worker_id, &result.task_id).await;
    match self.queue.complete(&result).await {
      Ok(task) if result.success => {
        info!(task_id = %task.id, worker_id, secs = result.processing_time, outputs = result.output_files.len(), "task completed");
        self.events.emit(RenderEvent::TaskProgress { task_id: task.id.clone(), progress: 1.0 });
        self.events.emit(RenderEvent::TaskCompleted { result });
      }
      Ok(task) => {
        let error = task.error_message.unwrap_or_default();
        warn!(task_id = %task.id, worker_id, error = %error, "task failed");
        self.events.emit(RenderEvent::TaskFailed { task_id: task.id, error });
      }
      Err(e) => warn!(task_id = %result.task_id, worker_id, error = %e, "result for a task that is not processing"),
    }
    self.wake.notify_one();
  }

  pub async fn stats(&self) -> OrchestratorStats {
    let managers: Vec<Arc<WorkerNodeManager>> = self.managers_read().values().cloned().collect();
    let mut managers: Vec<ManagerStatus> = managers.iter().map(|m| m.status()).collect();
    managers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    let remote_queue_depth = match self.stager.as_ref().and_then(|s| s.remote_queue()) {
      Some(remote) => match tokio::time::timeout(self.config.store_timeout, remote.depth()).await {
        Ok(Ok(depth)) => Some(depth),
        Ok(Err(e)) => {
          warn!(error = %e, "remote queue depth unavailable");
          None
        }
        Err(_) => {
          warn!("remote queue depth timed out");
          None
        }
      },
      None => None,
    };

    OrchestratorStats {
      queue: self.queue.stats().await,
      workers: self.balancer.stats().await,
      managers,
      remote_queue_depth,
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// Spawns the scheduling loop, the heartbeat monitor and the report pump.
  pub fn start(self: &Arc<Self>) {
    if self.running.swap(true, Ordering::SeqCst) {
      return;
    }
    self.shutdown.send_replace(false);
    let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());

    let scheduler = Arc::clone(self);
    let shutdown = self.shutdown.subscribe();
    loops.push(tokio::spawn(async move { scheduler.scheduling_loop(shutdown).await }));

    let monitor = Arc::clone(self);
    let shutdown = self.shutdown.subscribe();
    loops.push(tokio::spawn(async move { monitor.heartbeat_monitor(shutdown).await }));

    let receiver = self.reports_rx.lock().unwrap_or_else(|p| p.into_inner()).take();
    if let Some(receiver) = receiver {
      tokio::spawn(report_pump(Arc::downgrade(self), receiver));
    }
    info!("orchestrator started");
  }

  /// Stops the loops and worker heartbeats. Executions already running
  /// finish and their results are still recorded.
  pub fn stop(&self) {
    if !self.running.swap(false, Ordering::SeqCst) {
      return;
    }
    self.shutdown.send_replace(true);
    for manager in self.managers_read().values() {
      manager.stop();
    }
    self.loops.lock().unwrap_or_else(|p| p.into_inner()).clear();
    info!("orchestrator stopped");
  }

  async fn scheduling_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
    let idle = self.config.idle_delay.max(MIN_LOOP_PERIOD);
    let backoff = self.config.no_worker_backoff.max(MIN_LOOP_PERIOD);
    loop {
      if *shutdown.borrow() {
        break;
      }
      let pause = match self.schedule_once().await {
        ScheduleOutcome::Dispatched { .. } | ScheduleOutcome::Dropped(_) | ScheduleOutcome::Skipped(_) => None,
        ScheduleOutcome::Idle | ScheduleOutcome::Deferred(_) => Some(idle),
        ScheduleOutcome::NoWorker(_) | ScheduleOutcome::Rejected(_) => Some(backoff),
      };
      if let Some(pause) = pause {
        tokio::select! {
          _ = tokio::time::sleep(pause) => {}
          _ = self.wake.notified() => {}
          _ = shutdown.changed() => {}
        }
      }
    }
    debug!("scheduling loop stopped");
  }

  async fn heartbeat_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(self.config.heartbeat_check.max(MIN_LOOP_PERIOD));
    loop {
      tokio::select! {
        _ = interval.tick() => {
          self.check_heartbeats(Utc::now()).await;
        }
        _ = shutdown.changed() => {}
      }
      if *shutdown.borrow() {
        break;
      }
    }
    debug!("heartbeat monitor stopped");
  }
}

async fn report_pump(orchestrator: Weak<Orchestrator>, mut receiver: mpsc::UnboundedReceiver<WorkerReport>) {
  while let Some(report) = receiver.recv().await {
    let Some(orchestrator) = orchestrator.upgrade() else {
      break;
    };
    orchestrator.handle_report(report).await;
  }
}
