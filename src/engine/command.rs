use std::path::Path;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::engine::process;
use crate::engine::RenderEngine;
use crate::models::{EngineCapabilities, EngineKind, RenderResult, RenderTask};

/// Runs an arbitrary program. Arguments are templates:
/// `{input}` first input, `{inputs}` (whole argument) every input,
/// `{work_dir}`, `{output}`, `{task_id}`. The program must write
/// `render_*` files into `{work_dir}`.
pub struct CommandEngine {
  kind: EngineKind,
  program: String,
  args: Vec<String>,
  capabilities: EngineCapabilities,
  default_timeout: Duration,
}

impl CommandEngine {
  pub fn new(kind: EngineKind, program: impl Into<String>, args: Vec<String>, default_timeout: Duration) -> Self {
    Self {
      kind,
      program: program.into(),
      args,
      capabilities: EngineCapabilities {
        render_modes: Vec::new(),
        output_formats: ["PNG", "JPEG", "EXR", "MP4", "MOV"].into_iter().map(String::from).collect(),
        max_resolution: (16384, 16384),
        supports_gpu: false,
      },
      default_timeout,
    }
  }

  /// Whitespace-separated `program arg...`; `None` when blank.
  pub fn from_template(kind: EngineKind, template: &str, default_timeout: Duration) -> Option<Self> {
    let mut parts = template.split_whitespace().map(String::from);
    let program = parts.next()?;
    Some(Self::new(kind, program, parts.collect(), default_timeout))
  }

  pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
    self.capabilities = capabilities;
    self
  }

  pub fn expand_args(&self, task: &RenderTask, work_dir: &Path) -> Vec<String> {
    let first = task.input_files().first().cloned().unwrap_or_default();
    let work = work_dir.display().to_string();
    let output = task.output_path().display().to_string();

    let mut expanded = Vec::with_capacity(self.args.len());
    for arg in &self.args {
      if arg == "{inputs}" {
        expanded.extend(task.input_files().iter().cloned());
        continue;
      }
      expanded.push(
        arg.replace("{input}", &first)
          .replace("{work_dir}", &work)
          .replace("{output}", &output)
          .replace("{task_id}", &task.id),
      );
    }
    expanded
  }
}

#[async_trait]
impl RenderEngine for CommandEngine {
  fn kind(&self) -> EngineKind {
    self.kind
  }

  fn capabilities(&self) -> EngineCapabilities {
    self.capabilities.clone()
  }

  async fn execute(&self, task: &RenderTask, work_dir: &Path) -> RenderResult {
    let started = Instant::now();
    let timeout = task.timeout(self.default_timeout);

    let mut command = Command::new(&self.program);
    command.args(self.expand_args(task, work_dir)).current_dir(work_dir);
    info!(task_id = %task.id, program = %self.program, engine = %self.kind, "starting command render");

    let outcome = process::run_tool(command, &self.program, timeout).await;
    process::collect_result(task, work_dir, started, outcome).await
  }
}
