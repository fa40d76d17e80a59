use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
  Blender,
  UnrealEngine,
  Unity,
  Custom,
}

impl EngineKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      EngineKind::Blender => "blender",
      EngineKind::UnrealEngine => "unreal_engine",
      EngineKind::Unity => "unity",
      EngineKind::Custom => "custom",
    }
  }
}

impl fmt::Display for EngineKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
  Low = 0,
  #[default]
  Normal = 1,
  High = 2,
  Urgent = 3,
}

impl TaskPriority {
  /// Scan order used when dequeuing: strict priority, highest first.
  pub const DESCENDING: [TaskPriority; 4] = [
    TaskPriority::Urgent,
    TaskPriority::High,
    TaskPriority::Normal,
    TaskPriority::Low,
  ];

  pub fn rank(self) -> i16 {
    self as i16
  }

  pub fn from_rank(rank: i16) -> Option<Self> {
    match rank {
      0 => Some(TaskPriority::Low),
      1 => Some(TaskPriority::Normal),
      2 => Some(TaskPriority::High),
      3 => Some(TaskPriority::Urgent),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskPriority::Low => "LOW",
      TaskPriority::Normal => "NORMAL",
      TaskPriority::High => "HIGH",
      TaskPriority::Urgent => "URGENT",
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  #[default]
  Pending,
  Queued,
  Processing,
  Completed,
  Failed,
  Cancelled,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Queued => "queued",
      TaskStatus::Processing => "processing",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
      TaskStatus::Cancelled => "cancelled",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
  }

  pub fn is_cancellable(&self) -> bool {
    matches!(self, TaskStatus::Pending | TaskStatus::Queued)
  }

  /// Forward-only lifecycle. A queued task may also fail without ever
  /// starting when one of its prerequisites cannot complete.
  pub fn can_transition_to(&self, next: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
      (self, next),
      (Pending, Queued)
        | (Pending, Cancelled)
        | (Queued, Processing)
        | (Queued, Cancelled)
        | (Queued, Failed)
        | (Processing, Completed)
        | (Processing, Failed)
    )
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderTask {
  pub id: String,
  pub name: String,
  pub engine: EngineKind,
  input_files: Vec<String>,
  output_path: PathBuf,
  #[serde(default)]
  pub parameters: BTreeMap<String, Value>,
  #[serde(default)]
  pub priority: TaskPriority,
  #[serde(default)]
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub worker_id: Option<String>,
  #[serde(default)]
  pub progress: f64,
  pub error_message: Option<String>,
  #[serde(default)]
  pub dependencies: Vec<String>,
  /// Expected wall-clock duration in seconds.
  pub estimated_duration: Option<f64>,
}

impl RenderTask {
  pub fn new<I, S>(name: impl Into<String>, engine: EngineKind, input_files: I, output_path: impl Into<PathBuf>) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      id: Uuid::new_v4().to_string(),
      name: name.into(),
      engine,
      input_files: input_files.into_iter().map(Into::into).collect(),
      output_path: output_path.into(),
      parameters: BTreeMap::new(),
      priority: TaskPriority::default(),
      status: TaskStatus::Pending,
      created_at: Utc::now(),
      started_at: None,
      completed_at: None,
      worker_id: None,
      progress: 0.0,
      error_message: None,
      dependencies: Vec::new(),
      estimated_duration: None,
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = id.into();
    self
  }

  pub fn with_priority(mut self, priority: TaskPriority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.parameters.insert(key.into(), value.into());
    self
  }

  pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.dependencies = dependencies.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
    self.estimated_duration = Some(duration.as_secs_f64());
    self
  }

  pub fn input_files(&self) -> &[String] {
    &self.input_files
  }

  pub fn output_path(&self) -> &Path {
    &self.output_path
  }

  /// Only cloud staging and its fallback rewrite input locations.
  pub(crate) fn replace_input_files(&mut self, input_files: Vec<String>) {
    self.input_files = input_files;
  }

  /// `parameters["timeout"]` in seconds, if positive.
  pub fn timeout(&self, default: Duration) -> Duration {
    self.parameters
      .get("timeout")
      .and_then(Value::as_f64)
      .filter(|secs| *secs > 0.0)
      .map(Duration::from_secs_f64)
      .unwrap_or(default)
  }

  pub fn parameter_str(&self, key: &str) -> Option<&str> {
    self.parameters.get(key).and_then(Value::as_str)
  }

  pub fn parameter_u64(&self, key: &str) -> Option<u64> {
    self.parameters.get(key).and_then(|v| {
      v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
  }
}

/// Static description of what one engine implementation can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCapabilities {
  pub render_modes: Vec<String>,
  pub output_formats: Vec<String>,
  pub max_resolution: (u32, u32),
  pub supports_gpu: bool,
}

impl EngineCapabilities {
  pub fn accepts(&self, task: &RenderTask, gpu_count: u32) -> bool {
    if let Some(format) = task.parameter_str("output_format") {
      if !self.output_formats.iter().any(|f| f.eq_ignore_ascii_case(format)) {
        return false;
      }
    }
    let (max_x, max_y) = self.max_resolution;
    if task.parameter_u64("resolution_x").is_some_and(|x| x > u64::from(max_x)) {
      return false;
    }
    if task.parameter_u64("resolution_y").is_some_and(|y| y > u64::from(max_y)) {
      return false;
    }
    if let Some(mode) = task.parameter_str("engine") {
      if !self.render_modes.is_empty() && !self.render_modes.iter().any(|m| m.eq_ignore_ascii_case(mode)) {
        return false;
      }
    }
    match task.parameter_str("device") {
      Some(device) if !device.eq_ignore_ascii_case("cpu") => self.supports_gpu && gpu_count > 0,
      _ => true,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResult {
  pub task_id: String,
  pub success: bool,
  pub output_files: Vec<String>,
  /// Wall-clock seconds spent executing.
  pub processing_time: f64,
  pub worker_id: String,
  #[serde(default)]
  pub metrics: BTreeMap<String, Value>,
  pub error_message: Option<String>,
}

impl RenderResult {
  pub fn success(task_id: impl Into<String>, output_files: Vec<String>, elapsed: Duration) -> Self {
    Self {
      task_id: task_id.into(),
      success: true,
      output_files,
      processing_time: elapsed.as_secs_f64(),
      worker_id: String::new(),
      metrics: BTreeMap::new(),
      error_message: None,
    }
  }

  pub fn failure(task_id: impl Into<String>, error: impl Into<String>, elapsed: Duration) -> Self {
    Self {
      task_id: task_id.into(),
      success: false,
      output_files: Vec::new(),
      processing_time: elapsed.as_secs_f64(),
      worker_id: String::new(),
      metrics: BTreeMap::new(),
      error_message: Some(error.into()),
    }
  }

  pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.metrics.insert(key.into(), value.into());
    self
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
  Master,
  #[default]
  Worker,
  Render,
  Storage,
  LoadBalancer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
  #[default]
  Online,
  Offline,
}

impl WorkerStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerStatus::Online => "online",
      WorkerStatus::Offline => "offline",
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapacity {
  pub cpu_cores: u32,
  pub memory_gb: f64,
  pub gpu_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
  pub id: String,
  pub address: String,
  #[serde(default)]
  pub role: NodeRole,
  #[serde(default)]
  pub capacity: HardwareCapacity,
  pub supported_engines: BTreeSet<EngineKind>,
  #[serde(default)]
  pub capabilities: BTreeMap<EngineKind, EngineCapabilities>,
  #[serde(default)]
  pub current_tasks: Vec<String>,
  pub max_concurrent_tasks: usize,
  #[serde(default = "Utc::now")]
  pub last_heartbeat: DateTime<Utc>,
  #[serde(default)]
  pub status: WorkerStatus,
  #[serde(default)]
  pub load_score: f64,
}

impl WorkerNode {
  pub fn new(id: impl Into<String>, address: impl Into<String>, max_concurrent_tasks: usize) -> Self {
    Self {
      id: id.into(),
      address: address.into(),
      role: NodeRole::Worker,
      capacity: HardwareCapacity::default(),
      supported_engines: BTreeSet::new(),
      capabilities: BTreeMap::new(),
      current_tasks: Vec::new(),
      max_concurrent_tasks,
      last_heartbeat: Utc::now(),
      status: WorkerStatus::Online,
      load_score: 0.0,
    }
  }

  pub fn with_engine(mut self, engine: EngineKind) -> Self {
    self.supported_engines.insert(engine);
    self
  }

  pub fn with_capacity(mut self, capacity: HardwareCapacity) -> Self {
    self.capacity = capacity;
    self
  }

  pub fn is_online(&self) -> bool {
    self.status == WorkerStatus::Online
  }

  pub fn has_spare_capacity(&self) -> bool {
    self.current_tasks.len() < self.max_concurrent_tasks
  }

  /// Engine support plus, when the worker published a descriptor for the
  /// engine, the task's format/resolution/device requirements.
  pub fn can_run(&self, task: &RenderTask) -> bool {
    if !self.supported_engines.contains(&task.engine) {
      return false;
    }
    self.capabilities
      .get(&task.engine)
      .is_none_or(|caps| caps.accepts(task, self.capacity.gpu_count))
  }

  pub fn task_ratio(&self) -> f64 {
    if self.max_concurrent_tasks == 0 {
      return 1.0;
    }
    self.current_tasks.len() as f64 / self.max_concurrent_tasks as f64
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
  pub cpu_cores: u32,
  pub memory_gb: f64,
  pub gpu_count: u32,
  pub engines: Vec<EngineKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
  pub worker_id: String,
  pub address: String,
  pub timestamp: DateTime<Utc>,
  pub current_tasks: usize,
  pub system_info: SystemInfo,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn status_only_moves_forward() {
    assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Queued));
    assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Processing));
    assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
    assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
    assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));

    assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Cancelled));
    assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Queued));
    assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
    assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Queued));
  }

  #[test]
  fn only_pre_dispatch_states_are_cancellable() {
    assert!(TaskStatus::Pending.is_cancellable());
    assert!(TaskStatus::Queued.is_cancellable());
    assert!(!TaskStatus::Processing.is_cancellable());
    assert!(!TaskStatus::Completed.is_cancellable());
  }

  #[test]
  fn priority_scan_order_is_highest_first() {
    let ranks: Vec<i16> = TaskPriority::DESCENDING.iter().map(|p| p.rank()).collect();
    assert_eq!(ranks, vec![3, 2, 1, 0]);
    assert_eq!(TaskPriority::from_rank(2), Some(TaskPriority::High));
    assert_eq!(TaskPriority::from_rank(7), None);
  }

  #[test]
  fn timeout_parameter_overrides_default() {
    let task = RenderTask::new("shot", EngineKind::Blender, ["a.blend"], "/tmp/out");
    assert_eq!(task.timeout(Duration::from_secs(5)), Duration::from_secs(5));

    let task = task.with_parameter("timeout", 2.5);
    assert_eq!(task.timeout(Duration::from_secs(5)), Duration::from_millis(2500));

    let task = task.with_parameter("timeout", -1);
    assert_eq!(task.timeout(Duration::from_secs(5)), Duration::from_secs(5));
  }

  #[test]
  fn priority_serializes_uppercase() {
    let task = RenderTask::new("shot", EngineKind::UnrealEngine, ["a"], "/tmp/out")
      .with_priority(TaskPriority::Urgent);
    let value = serde_json::to_value(&task).unwrap();
    assert_eq!(value["priority"], json!("URGENT"));
    assert_eq!(value["engine"], json!("unreal_engine"));
    assert_eq!(value["status"], json!("pending"));
  }

  #[test]
  fn capabilities_filter_format_resolution_and_device() {
    let caps = EngineCapabilities {
      render_modes: vec!["CYCLES".into()],
      output_formats: vec!["PNG".into(), "EXR".into()],
      max_resolution: (4096, 4096),
      supports_gpu: true,
    };
    let base = RenderTask::new("shot", EngineKind::Blender, ["a"], "/tmp/out");

    assert!(caps.accepts(&base.clone().with_parameter("output_format", "png"), 0));
    assert!(!caps.accepts(&base.clone().with_parameter("output_format", "MP4"), 0));
    assert!(!caps.accepts(&base.clone().with_parameter("resolution_x", 8192), 0));
    assert!(!caps.accepts(&base.clone().with_parameter("engine", "EEVEE"), 0));
    assert!(!caps.accepts(&base.clone().with_parameter("device", "CUDA"), 0));
    assert!(caps.accepts(&base.clone().with_parameter("device", "CUDA"), 1));
    assert!(caps.accepts(&base.with_parameter("device", "CPU"), 0));
  }

  #[test]
  fn worker_capacity_ratio() {
    let mut node = WorkerNode::new("w1", "10.0.0.1:7000", 4).with_engine(EngineKind::Blender);
    assert!(node.has_spare_capacity());
    node.current_tasks = vec!["a".into(), "b".into(), "c".into(), "d".into()];
    assert!(!node.has_spare_capacity());
    assert_eq!(node.task_ratio(), 1.0);

    let zero = WorkerNode::new("w0", "10.0.0.2:7000", 0);
    assert!(!zero.has_spare_capacity());
    assert_eq!(zero.task_ratio(), 1.0);
  }

  #[test]
  fn worker_without_descriptor_runs_any_task_for_its_engine() {
    let node = WorkerNode::new("w1", "host:1", 1).with_engine(EngineKind::Custom);
    let task = RenderTask::new("shot", EngineKind::Custom, ["a"], "/tmp/out")
      .with_parameter("output_format", "WEIRD");
    assert!(node.can_run(&task));

    let other = RenderTask::new("shot", EngineKind::Unity, ["a"], "/tmp/out");
    assert!(!node.can_run(&other));
  }
}
