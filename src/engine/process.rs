use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::models::{RenderResult, RenderTask};

/// Renderers write frames as `render_*` inside the working directory.
pub const OUTPUT_PREFIX: &str = "render_";

const DIAGNOSTIC_LIMIT: usize = 4000;

#[derive(Debug)]
pub struct ToolOutput {
  pub code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

pub async fn validate_paths(task: &RenderTask) -> bool {
  for input in task.input_files() {
    if !tokio::fs::try_exists(input).await.unwrap_or(false) {
      debug!(task_id = %task.id, input = %input, "input not reachable");
      return false;
    }
  }
  let output = task.output_path();
  if output.as_os_str().is_empty() {
    return false;
  }
  tokio::fs::create_dir_all(output).await.is_ok()
}

/// Runs `command` to completion. The child is killed when the timeout fires.
pub async fn run_tool(mut command: Command, program: &str, timeout: Duration) -> Result<ToolOutput, ToolError> {
  command
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let child = command.spawn().map_err(|source| ToolError::Spawn {
    program: program.to_string(),
    source,
  })?;

  let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
    Err(_) => return Err(ToolError::Timeout(timeout)),
    Ok(Err(source)) => {
      return Err(ToolError::Spawn {
        program: program.to_string(),
        source,
      })
    }
    Ok(Ok(output)) => output,
  };

  let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
  let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
  if output.status.success() {
    Ok(ToolOutput {
      code: output.status.code(),
      stdout,
      stderr,
    })
  } else {
    Err(ToolError::Exit {
      code: output.status.code(),
      stderr: tail(if stderr.trim().is_empty() { &stdout } else { &stderr }, DIAGNOSTIC_LIMIT),
    })
  }
}

/// Copies every `render_*` file from `work_dir` into `output_dir`. Either all
/// files land or none do.
pub async fn publish_outputs(work_dir: &Path, output_dir: &Path) -> io::Result<Vec<String>> {
  let mut produced: Vec<PathBuf> = Vec::new();
  let mut entries = tokio::fs::read_dir(work_dir).await?;
  while let Some(entry) = entries.next_entry().await? {
    let is_output = entry.file_name().to_string_lossy().starts_with(OUTPUT_PREFIX);
    if is_output && entry.file_type().await?.is_file() {
      produced.push(entry.path());
    }
  }
  if produced.is_empty() {
    return Err(io::Error::new(io::ErrorKind::NotFound, "no output produced"));
  }
  produced.sort();

  tokio::fs::create_dir_all(output_dir).await?;
  let mut published: Vec<PathBuf> = Vec::with_capacity(produced.len());
  for source in &produced {
    let Some(name) = source.file_name() else { continue };
    let target = output_dir.join(name);
    if let Err(e) = tokio::fs::copy(source, &target).await {
      for done in published.iter().chain(std::iter::once(&target)) {
        let _ = tokio::fs::remove_file(done).await;
      }
      return Err(e);
    }
    published.push(target);
  }
  Ok(published.into_iter().map(|p| p.display().to_string()).collect())
}

/// Turns a tool run into a result, publishing outputs only on success.
pub async fn collect_result(
  task: &RenderTask,
  work_dir: &Path,
  started: Instant,
  outcome: Result<ToolOutput, ToolError>,
) -> RenderResult {
  match outcome {
    Ok(output) => match publish_outputs(work_dir, task.output_path()).await {
      Ok(files) => RenderResult::success(&task.id, files, started.elapsed())
        .with_metric("return_code", output.code)
        .with_metric("stdout", tail(&output.stdout, DIAGNOSTIC_LIMIT))
        .with_metric("stderr", tail(&output.stderr, DIAGNOSTIC_LIMIT)),
      Err(e) => {
        warn!(task_id = %task.id, error = %e, "render produced no usable output");
        RenderResult::failure(&task.id, format!("output not published: {e}"), started.elapsed())
          .with_metric("return_code", output.code)
      }
    },
    Err(e) => {
      let code = match &e {
        ToolError::Exit { code, .. } => *code,
        _ => None,
      };
      RenderResult::failure(&task.id, e.to_string(), started.elapsed()).with_metric("return_code", code)
    }
  }
}

pub fn tail(text: &str, max: usize) -> String {
  let start = text.len().saturating_sub(max);
  let start = (start..=text.len())
    .find(|i| text.is_char_boundary(*i))
    .unwrap_or(text.len());
  text[start..].to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio_test::assert_ok;

  #[tokio::test]
  async fn publish_copies_only_render_files() {
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::write(work.path().join("render_0001.png"), b"a").unwrap();
    std::fs::write(work.path().join("render_0002.png"), b"b").unwrap();
    std::fs::write(work.path().join("scratch.tmp"), b"c").unwrap();

    let files = assert_ok!(publish_outputs(work.path(), &out.path().join("shots")).await);
    assert_eq!(files.len(), 2);
    assert!(files[0].ends_with("render_0001.png"));
    assert!(out.path().join("shots/render_0002.png").exists());
    assert!(!out.path().join("shots/scratch.tmp").exists());
  }

  #[tokio::test]
  async fn publish_without_output_is_an_error() {
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let err = publish_outputs(work.path(), out.path()).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
  }

  #[tokio::test]
  async fn run_tool_reports_timeout() {
    let mut command = Command::new("sh");
    command.args(["-c", "sleep 5"]);
    let err = run_tool(command, "sh", Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, ToolError::Timeout(_)));
    assert!(err.to_string().contains("timeout"));
  }

  #[tokio::test]
  async fn run_tool_captures_failure_diagnostics() {
    let mut command = Command::new("sh");
    command.args(["-c", "echo broken scene >&2; exit 3"]);
    match run_tool(command, "sh", Duration::from_secs(5)).await {
      Err(ToolError::Exit { code, stderr }) => {
        assert_eq!(code, Some(3));
        assert!(stderr.contains("broken scene"));
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
  }

  #[tokio::test]
  async fn missing_program_is_a_spawn_error() {
    let command = Command::new("definitely-not-a-renderer-binary");
    let err = run_tool(command, "definitely-not-a-renderer-binary", Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, ToolError::Spawn { .. }));
  }

  #[test]
  fn tail_respects_char_boundaries() {
    assert_eq!(tail("hello", 10), "hello");
    assert_eq!(tail("hello", 3), "llo");
    assert_eq!(tail("héllo", 4), "llo");
  }
}
