use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::engine::process::{self, OUTPUT_PREFIX};
use crate::engine::RenderEngine;
use crate::models::{EngineCapabilities, EngineKind, RenderResult, RenderTask};

/// Drives Blender in background mode. The first input is the scene file;
/// further inputs are assets the scene references.
pub struct BlenderEngine {
  binary: PathBuf,
  default_timeout: Duration,
}

impl BlenderEngine {
  pub fn new(binary: impl Into<PathBuf>, default_timeout: Duration) -> Self {
    Self {
      binary: binary.into(),
      default_timeout,
    }
  }

  pub fn command_args(&self, task: &RenderTask, work_dir: &Path) -> Vec<String> {
    let mut args = vec!["-b".to_string()];
    if let Some(scene) = task.input_files().first() {
      args.push(scene.clone());
    }

    if let (Some(x), Some(y)) = (task.parameter_u64("resolution_x"), task.parameter_u64("resolution_y")) {
      args.push("--python-expr".into());
      args.push(format!(
        "import bpy; r = bpy.context.scene.render; r.resolution_x = {x}; r.resolution_y = {y}; r.resolution_percentage = 100"
      ));
    }
    if let Some(script) = task.parameter_str("script") {
      args.push("-P".into());
      args.push(script.to_string());
    }

    args.push("-o".into());
    args.push(work_dir.join(format!("{OUTPUT_PREFIX}####")).display().to_string());
    args.push("-E".into());
    args.push(task.parameter_str("engine").unwrap_or("CYCLES").to_uppercase());
    if let Some(format) = task.parameter_str("output_format") {
      args.push("-F".into());
      args.push(format.to_uppercase());
    }

    match (task.parameter_u64("frame_start"), task.parameter_u64("frame_end")) {
      (Some(start), Some(end)) => {
        args.extend(["-s".into(), start.to_string(), "-e".into(), end.to_string(), "-a".into()]);
      }
      _ => {
        args.push("-f".into());
        args.push(task.parameter_u64("frame").unwrap_or(1).to_string());
      }
    }

    let mut cycles = Vec::new();
    if let Some(samples) = task.parameter_u64("samples") {
      cycles.extend(["--cycles-samples".to_string(), samples.to_string()]);
    }
    if let Some(device) = task.parameter_str("device") {
      cycles.extend(["--cycles-device".to_string(), device.to_uppercase()]);
    }
    if !cycles.is_empty() {
      args.push("--".into());
      args.extend(cycles);
    }
    args
  }
}

#[async_trait]
impl RenderEngine for BlenderEngine {
  fn kind(&self) -> EngineKind {
    EngineKind::Blender
  }

  fn capabilities(&self) -> EngineCapabilities {
    EngineCapabilities {
      render_modes: vec!["CYCLES".into(), "EEVEE".into()],
      output_formats: ["PNG", "JPEG", "EXR", "MP4", "AVI"].into_iter().map(String::from).collect(),
      max_resolution: (8192, 8192),
      supports_gpu: true,
    }
  }

  async fn execute(&self, task: &RenderTask, work_dir: &Path) -> RenderResult {
    let started = Instant::now();
    let timeout = task.timeout(self.default_timeout);
    let program = self.binary.display().to_string();

    let mut command = Command::new(&self.binary);
    command.args(self.command_args(task, work_dir)).current_dir(work_dir);
    info!(task_id = %task.id, program = %program, timeout_secs = timeout.as_secs(), "starting blender render");

    let outcome = process::run_tool(command, &program, timeout).await;
    process::collect_result(task, work_dir, started, outcome).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn engine() -> BlenderEngine {
    BlenderEngine::new("blender", Duration::from_secs(60))
  }

  #[test]
  fn builds_single_frame_command() {
    let task = RenderTask::new("shot", EngineKind::Blender, ["/scenes/a.blend"], "/out");
    let args = engine().command_args(&task, Path::new("/work"));
    assert_eq!(args, vec!["-b", "/scenes/a.blend", "-o", "/work/render_####", "-E", "CYCLES", "-f", "1"]);
  }

  #[test]
  fn builds_animation_command_with_cycles_options() {
    let task = RenderTask::new("shot", EngineKind::Blender, ["/scenes/a.blend", "/tex/wood.png"], "/out")
      .with_parameter("engine", "eevee")
      .with_parameter("resolution_x", 1920)
      .with_parameter("resolution_y", 1080)
      .with_parameter("frame_start", 10)
      .with_parameter("frame_end", 20)
      .with_parameter("samples", 64)
      .with_parameter("device", "cuda")
      .with_parameter("output_format", "exr");
    let args = engine().command_args(&task, Path::new("/work"));

    assert_eq!(&args[..2], &["-b", "/scenes/a.blend"]);
    assert_eq!(args[2], "--python-expr");
    assert!(args[3].contains("resolution_x = 1920"));
    let tail: Vec<&str> = args[4..].iter().map(String::as_str).collect();
    assert_eq!(
      tail,
      vec![
        "-o", "/work/render_####", "-E", "EEVEE", "-F", "EXR", "-s", "10", "-e", "20", "-a",
        "--", "--cycles-samples", "64", "--cycles-device", "CUDA",
      ]
    );
  }

  #[tokio::test]
  async fn missing_binary_fails_without_output() {
    let out = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let task = RenderTask::new("shot", EngineKind::Blender, ["a.blend"], out.path().join("final"));
    let engine = BlenderEngine::new("/nonexistent/blender", Duration::from_secs(5));

    let result = engine.execute(&task, work.path()).await;
    assert!(!result.success);
    assert!(result.error_message.unwrap().contains("failed to start"));
    assert!(!out.path().join("final").exists());
  }

  #[tokio::test]
  async fn validate_requires_existing_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let scene = dir.path().join("a.blend");
    std::fs::write(&scene, b"BLENDER").unwrap();

    let ok = RenderTask::new("shot", EngineKind::Blender, [scene.display().to_string()], dir.path().join("out"));
    assert!(engine().validate(&ok).await);
    assert!(dir.path().join("out").is_dir());

    let missing = RenderTask::new("shot", EngineKind::Blender, ["/nope/a.blend"], dir.path().join("out"));
    assert!(!engine().validate(&missing).await);
  }
}
