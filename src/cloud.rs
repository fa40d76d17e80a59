use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use serde_json::json;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{info, warn};

use crate::messaging::RemoteWorkQueue;
use crate::models::RenderTask;
use crate::storage::{is_remote_ref, ObjectStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: usize,
  pub base_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(1),
    }
  }
}

impl RetryPolicy {
  /// Delays between attempts: base, 2 * base, 4 * base, ...
  pub fn delays(&self) -> impl Iterator<Item = Duration> {
    let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
    ExponentialBackoff::from_millis(2)
      .factor(base_ms)
      .map(|delay| delay / 2)
      .take(self.max_attempts.saturating_sub(1))
  }
}

/// Uploads a task's inputs and hands it to the remote work queue.
pub struct CloudStager {
  storage: Arc<dyn ObjectStorage>,
  remote_queue: Option<Arc<dyn RemoteWorkQueue>>,
  retry: RetryPolicy,
  prefix: String,
}

impl CloudStager {
  pub fn new(storage: Arc<dyn ObjectStorage>, retry: RetryPolicy) -> Self {
    Self {
      storage,
      remote_queue: None,
      retry,
      prefix: "renders".into(),
    }
  }

  pub fn with_remote_queue(mut self, queue: Arc<dyn RemoteWorkQueue>) -> Self {
    self.remote_queue = Some(queue);
    self
  }

  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into().trim_matches('/').to_string();
    self
  }

  pub fn storage(&self) -> Arc<dyn ObjectStorage> {
    self.storage.clone()
  }

  pub fn remote_queue(&self) -> Option<Arc<dyn RemoteWorkQueue>> {
    self.remote_queue.clone()
  }

  pub fn remote_key(&self, task_id: &str, input: &str) -> String {
    let file_name = Path::new(input)
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| input.to_string());
    if self.prefix.is_empty() {
      format!("{task_id}/{file_name}")
    } else {
      format!("{}/{task_id}/{file_name}", self.prefix)
    }
  }

  /// Returns the staged copy; the original is left untouched so the caller
  /// can fall back to it.
  pub async fn stage(&self, task: &RenderTask) -> Result<RenderTask> {
    let mut staged = task.clone();
    let mut references = Vec::with_capacity(task.input_files().len());
    for input in task.input_files() {
      if is_remote_ref(input) {
        references.push(input.clone());
        continue;
      }
      let key = self.remote_key(&task.id, input);
      let reference = self
        .with_retry("upload", &task.id, || self.storage.upload(Path::new(input), &key))
        .await
        .with_context(|| format!("failed to upload {input}"))?;
      references.push(reference);
    }
    staged.replace_input_files(references);
    staged.parameters.insert("remote_bucket".into(), json!(self.storage.bucket()));
    staged.parameters.insert("task_id".into(), json!(task.id));

    if let Some(queue) = &self.remote_queue {
      let payload = serde_json::to_vec(&staged)?;
      self
        .with_retry("send", &task.id, || queue.send(&payload))
        .await
        .context("failed to hand task to remote queue")?;
    }
    info!(task_id = %task.id, inputs = staged.input_files().len(), "task staged to remote storage");
    Ok(staged)
  }

  async fn with_retry<T, F, Fut>(&self, op: &'static str, task_id: &str, mut action: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let attempts = AtomicUsize::new(0);
    let max_attempts = self.retry.max_attempts.max(1);
    Retry::spawn(self.retry.delays(), || {
      let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
      let pending = action();
      async move {
        pending.await.map_err(|e| {
          warn!(op, task_id, attempt, max_attempts, error = %e, "remote operation failed");
          e
        })
      }
    })
    .await
  }
}

/// Local-execution fallback: drops every remote-style input reference.
pub fn strip_remote_inputs(task: &mut RenderTask) -> usize {
  let before = task.input_files().len();
  let local: Vec<String> = task.input_files().iter().filter(|i| !is_remote_ref(i)).cloned().collect();
  let stripped = before - local.len();
  if stripped > 0 {
    task.replace_input_files(local);
  }
  stripped
}
