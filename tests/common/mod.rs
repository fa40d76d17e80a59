#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use tokio::sync::{broadcast, Semaphore};

use renderfarm::config::SchedulerConfig;
use renderfarm::engine::{EngineRegistry, RenderEngine};
use renderfarm::events::RenderEvent;
use renderfarm::models::{EngineCapabilities, EngineKind, RenderResult, RenderTask, TaskPriority};
use renderfarm::orchestrator::Orchestrator;

/// Each run takes one permit from `gate` (if any) and keeps it.
pub struct StubEngine {
  pub kind: EngineKind,
  pub fail_with: Option<String>,
  pub gate: Option<Arc<Semaphore>>,
  pub runs: AtomicUsize,
}

impl StubEngine {
  pub fn ok(kind: EngineKind) -> Self {
    Self { kind, fail_with: None, gate: None, runs: AtomicUsize::new(0) }
  }

  pub fn gated(kind: EngineKind, gate: Arc<Semaphore>) -> Self {
    Self { gate: Some(gate), ..Self::ok(kind) }
  }

  pub fn failing(kind: EngineKind, error: &str) -> Self {
    Self { fail_with: Some(error.to_string()), ..Self::ok(kind) }
  }

  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl RenderEngine for StubEngine {
  fn kind(&self) -> EngineKind {
    self.kind
  }

  fn capabilities(&self) -> EngineCapabilities {
    EngineCapabilities {
      render_modes: Vec::new(),
      output_formats: vec!["PNG".into()],
      max_resolution: (1920, 1080),
      supports_gpu: false,
    }
  }

  async fn execute(&self, task: &RenderTask, _work_dir: &Path) -> RenderResult {
    let started = Instant::now();
    self.runs.fetch_add(1, Ordering::SeqCst);
    if let Some(gate) = &self.gate {
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }
    if let Some(error) = &self.fail_with {
      return RenderResult::failure(&task.id, error.clone(), started.elapsed());
    }
    let frame = task.output_path().join("render_0001.png");
    if let Err(e) = tokio::fs::write(&frame, b"png").await {
      return RenderResult::failure(&task.id, e.to_string(), started.elapsed());
    }
    RenderResult::success(&task.id, vec![frame.display().to_string()], started.elapsed())
  }
}

pub fn fast_scheduler() -> SchedulerConfig {
  SchedulerConfig {
    idle_delay: Duration::from_millis(10),
    no_worker_backoff: Duration::from_millis(10),
    heartbeat_check: Duration::from_millis(10),
    retry_base_delay: Duration::from_millis(1),
    store_timeout: Duration::from_millis(200),
    ..SchedulerConfig::default()
  }
}

/// Scratch scene files and output directories for one test.
pub struct Farm {
  pub dir: tempfile::TempDir,
}

impl Farm {
  pub fn new() -> Self {
    Self { dir: tempfile::tempdir().unwrap() }
  }

  pub fn work_root(&self) -> PathBuf {
    self.dir.path().join("work")
  }

  pub fn orchestrator(&self, engines: EngineRegistry, config: SchedulerConfig) -> Arc<Orchestrator> {
    Orchestrator::builder(engines).config(config).work_root(self.work_root()).build()
  }

  pub fn scene(&self, name: &str) -> String {
    let path = self.dir.path().join("scenes").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"scene").unwrap();
    path.display().to_string()
  }

  pub fn task(&self, id: &str, engine: EngineKind, priority: TaskPriority) -> RenderTask {
    RenderTask::new(id, engine, [self.scene(&format!("{id}.blend"))], self.dir.path().join("out").join(id))
      .with_id(id)
      .with_priority(priority)
  }
}

pub async fn next_event<F>(events: &mut broadcast::Receiver<RenderEvent>, mut wanted: F) -> RenderEvent
where
  F: FnMut(&RenderEvent) -> bool,
{
  tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      match events.recv().await {
        Ok(event) if wanted(&event) => return event,
        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
      }
    }
  })
  .await
  .expect("timed out waiting for event")
}

pub fn started(id: &str) -> impl FnMut(&RenderEvent) -> bool + '_ {
  move |event| matches!(event, RenderEvent::TaskStarted { task_id, .. } if task_id == id)
}

pub fn finished(id: &str) -> impl FnMut(&RenderEvent) -> bool + '_ {
  move |event| match event {
    RenderEvent::TaskCompleted { result } => result.task_id == id,
    RenderEvent::TaskFailed { task_id, .. } => task_id == id,
    _ => false,
  }
}
