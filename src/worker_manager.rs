use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use sysinfo::System;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{WorkerConfig, MAX_WORKER_TASKS};
use crate::engine::{EngineRegistry, RenderEngine};
use crate::models::{HardwareCapacity, Heartbeat, RenderResult, RenderTask, SystemInfo, WorkerNode};
use crate::storage::{is_remote_ref, parse_remote_ref, ObjectStorage};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Messages a manager sends back to the orchestrator.
#[derive(Debug, Clone)]
pub enum WorkerReport {
  Heartbeat(Heartbeat),
  Finished { worker_id: String, result: RenderResult },
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
  pub worker_id: String,
  pub address: String,
  pub running: bool,
  pub current_tasks: usize,
  pub max_concurrent_tasks: usize,
  pub system_info: SystemInfo,
}

/// Executes the tasks dispatched to one worker. Concurrency is bounded by a
/// semaphore holding `max_tasks` permits; a task only starts with a permit.
pub struct WorkerNodeManager {
  config: WorkerConfig,
  engines: EngineRegistry,
  storage: Option<Arc<dyn ObjectStorage>>,
  reports: mpsc::UnboundedSender<WorkerReport>,
  slots: Arc<Semaphore>,
  current: Mutex<BTreeMap<String, RenderTask>>,
  system_info: SystemInfo,
  running: AtomicBool,
  heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerNodeManager {
  pub fn new(
    mut config: WorkerConfig,
    engines: EngineRegistry,
    storage: Option<Arc<dyn ObjectStorage>>,
    reports: mpsc::UnboundedSender<WorkerReport>,
  ) -> Self {
    config.max_tasks = config.max_tasks.min(MAX_WORKER_TASKS);
    let system_info = probe_system(config.gpu_count, &engines);
    Self {
      slots: Arc::new(Semaphore::new(config.max_tasks)),
      config,
      engines,
      storage,
      reports,
      current: Mutex::new(BTreeMap::new()),
      system_info,
      running: AtomicBool::new(false),
      heartbeat: Mutex::new(None),
    }
  }

  pub fn id(&self) -> &str {
    &self.config.id
  }

  fn current(&self) -> MutexGuard<'_, BTreeMap<String, RenderTask>> {
    self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Sends a heartbeat immediately, then every `heartbeat_interval`.
  pub fn start(self: &Arc<Self>) {
    if self.running.swap(true, Ordering::SeqCst) {
      return;
    }
    let manager = Arc::clone(self);
    let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      loop {
        interval.tick().await;
        manager.send_heartbeat();
      }
    });
    let previous = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner()).replace(handle);
    if let Some(previous) = previous {
      previous.abort();
    }
    info!(worker_id = %self.config.id, max_tasks = self.config.max_tasks, "worker manager started");
  }

  /// Stops heartbeats. Tasks already running finish and still report.
  pub fn stop(&self) {
    if !self.running.swap(false, Ordering::SeqCst) {
      return;
    }
    if let Some(handle) = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner()).take() {
      handle.abort();
    }
    info!(worker_id = %self.config.id, in_flight = self.current_task_count(), "worker manager stopped");
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  pub fn heartbeat(&self) -> Heartbeat {
    Heartbeat {
      worker_id: self.config.id.clone(),
      address: self.config.address.clone(),
      timestamp: Utc::now(),
      current_tasks: self.current_task_count(),
      system_info: self.system_info.clone(),
    }
  }

  fn send_heartbeat(&self) {
    if self.reports.send(WorkerReport::Heartbeat(self.heartbeat())).is_err() {
      debug!(worker_id = %self.config.id, "heartbeat receiver gone");
    }
  }

  pub fn current_tasks(&self) -> Vec<String> {
    self.current().keys().cloned().collect()
  }

  pub fn current_task_count(&self) -> usize {
    self.current().len()
  }

  pub fn has_capacity(&self) -> bool {
    self.current_task_count() < self.config.max_tasks
  }

  /// Accepts the task unless the worker is full or already running it.
  pub fn submit(self: &Arc<Self>, task: RenderTask) -> bool {
    let Ok(permit) = self.slots.clone().try_acquire_owned() else {
      debug!(worker_id = %self.config.id, task_id = %task.id, "worker at capacity");
      return false;
    };
    {
      let mut current = self.current();
      if current.contains_key(&task.id) || current.len() >= self.config.max_tasks {
        return false;
      }
      current.insert(task.id.clone(), task.clone());
    }

    let manager = Arc::clone(self);
    tokio::spawn(async move {
      let task_id = task.id.clone();
      let result = manager.run(task).await;
      manager.current().remove(&task_id);
      drop(permit);
      let report = WorkerReport::Finished {
        worker_id: manager.config.id.clone(),
        result,
      };
      if manager.reports.send(report).is_err() {
        warn!(worker_id = %manager.config.id, task_id = %task_id, "result dropped, orchestrator gone");
      }
    });
    true
  }

  async fn run(&self, task: RenderTask) -> RenderResult {
    let started = Instant::now();
    info!(worker_id = %self.config.id, task_id = %task.id, engine = %task.engine, "render started");
    let mut result = match self.engines.get(task.engine) {
      None => RenderResult::failure(&task.id, format!("unsupported engine: {}", task.engine), started.elapsed()),
      Some(engine) => match self.execute_isolated(engine, &task).await {
        Ok(result) => result,
        Err(e) => {
          error!(worker_id = %self.config.id, task_id = %task.id, error = %format!("{e:#}"), "render setup failed");
          RenderResult::failure(&task.id, format!("{e:#}"), started.elapsed())
        }
      },
    };
    result.worker_id = self.config.id.clone();
    info!(
      worker_id = %self.config.id,
      task_id = %task.id,
      success = result.success,
      secs = result.processing_time,
      "render finished"
    );
    result
  }

  /// Runs the engine inside a fresh directory under `work_dir`; the
  /// directory is removed on every path out.
  async fn execute_isolated(&self, engine: Arc<dyn RenderEngine>, task: &RenderTask) -> Result<RenderResult> {
    tokio::fs::create_dir_all(&self.config.work_dir)
      .await
      .with_context(|| format!("failed to create {}", self.config.work_dir.display()))?;
    let dir = tempfile::Builder::new()
      .prefix(&format!("render_{}_", task.id))
      .tempdir_in(&self.config.work_dir)
      .context("failed to create working directory")?;

    let local = self.localize_inputs(task, dir.path()).await?;
    let outcome = AssertUnwindSafe(engine.execute(&local, dir.path())).catch_unwind().await;
    let result = outcome.unwrap_or_else(|_| {
      error!(worker_id = %self.config.id, task_id = %task.id, "render engine panicked");
      RenderResult::failure(&task.id, "render engine panicked", Duration::ZERO)
    });

    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
      warn!(task_id = %task.id, dir = %path.display(), error = %e, "failed to remove working directory");
    }
    Ok(result)
  }

  /// Pulls remote inputs into `dir/inputs` and points the task at the copies.
  async fn localize_inputs(&self, task: &RenderTask, dir: &Path) -> Result<RenderTask> {
    if !task.input_files().iter().any(|i| is_remote_ref(i)) {
      return Ok(task.clone());
    }
    let storage = self
      .storage
      .as_ref()
      .ok_or_else(|| anyhow!("remote inputs but no object storage configured"))?;
    let inputs_dir = dir.join("inputs");
    let mut inputs = Vec::with_capacity(task.input_files().len());
    for input in task.input_files() {
      if !is_remote_ref(input) {
        inputs.push(input.clone());
        continue;
      }
      let file_name = parse_remote_ref(input)
        .and_then(|(_, key)| key.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("malformed remote input {input}"))?;
      let target = inputs_dir.join(file_name);
      storage
        .download(input, &target)
        .await
        .with_context(|| format!("failed to download {input}"))?;
      inputs.push(target.display().to_string());
    }
    let mut local = task.clone();
    local.replace_input_files(inputs);
    Ok(local)
  }

  pub fn status(&self) -> ManagerStatus {
    ManagerStatus {
      worker_id: self.config.id.clone(),
      address: self.config.address.clone(),
      running: self.is_running(),
      current_tasks: self.current_task_count(),
      max_concurrent_tasks: self.config.max_tasks,
      system_info: self.system_info.clone(),
    }
  }

  /// Registration record for the load balancer.
  pub fn describe(&self) -> WorkerNode {
    let mut node = WorkerNode::new(&self.config.id, &self.config.address, self.config.max_tasks).with_capacity(
      HardwareCapacity {
        cpu_cores: self.system_info.cpu_cores,
        memory_gb: self.system_info.memory_gb,
        gpu_count: self.system_info.gpu_count,
      },
    );
    node.supported_engines = self.engines.kinds().into_iter().collect();
    node.capabilities = self.engines.capabilities();
    node.current_tasks = self.current_tasks();
    node
  }
}

fn probe_system(gpu_count: u32, engines: &EngineRegistry) -> SystemInfo {
  let mut sys = System::new();
  sys.refresh_cpu_all();
  sys.refresh_memory();
  SystemInfo {
    cpu_cores: u32::try_from(sys.cpus().len()).unwrap_or(u32::MAX),
    memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
    gpu_count,
    engines: engines.kinds(),
  }
}
