use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::TaskStatus;

/// Rejections raised synchronously by `Orchestrator::submit`. A task that
/// fails validation never touches the queue.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
  #[error("task id must not be empty")]
  MissingId,

  #[error("task id '{0}' contains characters outside [A-Za-z0-9_.-]")]
  InvalidId(String),

  #[error("task '{0}' is already known to the scheduler")]
  DuplicateId(String),

  #[error("task has no input files")]
  NoInputs,

  #[error("input file is not resolvable: {0}")]
  UnresolvableInput(String),

  #[error("output path must not be empty")]
  MissingOutput,

  #[error("output directory cannot be created: {0}")]
  UnwritableOutput(PathBuf),

  #[error("unknown prerequisite task '{0}'")]
  UnknownDependency(String),

  #[error("staging failed and no input of task '{0}' is available locally")]
  NoLocalInputs(String),

  #[error("task could not be queued: {0}")]
  NotQueued(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
  #[error("unknown task '{0}'")]
  UnknownTask(String),

  #[error("task '{0}' is already queued or was run before")]
  DuplicateTask(String),

  #[error("task '{id}' cannot move from {from} to {to}")]
  InvalidTransition {
    id: String,
    from: TaskStatus,
    to: TaskStatus,
  },
}

/// Failures of the external tool an engine drives.
#[derive(Debug, Error)]
pub enum ToolError {
  #[error("failed to start '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("timeout after {}s", .0.as_secs_f64())]
  Timeout(Duration),

  #[error("exited with status {code:?}: {stderr}")]
  Exit {
    code: Option<i32>,
    stderr: String,
  },
}
