use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{bail, Context, Result};

use crate::models::DEFAULT_RENDER_TIMEOUT;

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  pub database_url: Option<String>,
  pub rabbitmq_url: Option<String>,
  pub render_queue: String,
  pub storage: Option<StorageConfig>,
  pub worker: WorkerConfig,
  pub scheduler: SchedulerConfig,
  pub blender_bin: String,
  pub custom_command: Option<String>,
  pub render_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
  pub bucket: String,
  pub region: String,
  pub access_key_id: Option<String>,
  pub secret_access_key: Option<String>,
  pub endpoint_url: Option<String>,
  pub prefix: String,
}

/// Upper bound on concurrent tasks for one worker.
pub const MAX_WORKER_TASKS: usize = tokio::sync::Semaphore::MAX_PERMITS;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub id: String,
  pub address: String,
  pub max_tasks: usize,
  pub gpu_count: u32,
  pub work_dir: PathBuf,
  pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// Sleep when the queue is empty.
  pub idle_delay: Duration,
  /// Sleep when no worker can take the next task.
  pub no_worker_backoff: Duration,
  pub heartbeat_interval: Duration,
  pub heartbeat_timeout: Duration,
  pub heartbeat_check: Duration,
  pub retry_attempts: usize,
  pub retry_base_delay: Duration,
  pub store_timeout: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      idle_delay: Duration::from_millis(1000),
      no_worker_backoff: Duration::from_millis(5000),
      heartbeat_interval: Duration::from_secs(30),
      heartbeat_timeout: Duration::from_secs(60),
      heartbeat_check: Duration::from_secs(10),
      retry_attempts: 3,
      retry_base_delay: Duration::from_millis(1000),
      store_timeout: Duration::from_millis(2000),
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let parse = |key: &str, default: u64| -> Result<u64> { parse_or(&get, key, default) };

    let storage = get("S3_BUCKET").map(|bucket| StorageConfig {
      bucket,
      region: get("AWS_REGION").unwrap_or_else(|| "us-east-1".into()),
      access_key_id: get("AWS_ACCESS_KEY_ID"),
      secret_access_key: get("AWS_SECRET_ACCESS_KEY"),
      endpoint_url: get("S3_ENDPOINT_URL"),
      prefix: get("S3_PREFIX").unwrap_or_else(|| "renders".into()).trim_matches('/').to_string(),
    });

    let heartbeat_interval = Duration::from_secs(parse("HEARTBEAT_INTERVAL_SECS", 30)?);
    let max_tasks = parse_or(&get, "WORKER_MAX_TASKS", 4usize)?;
    if max_tasks > MAX_WORKER_TASKS {
      bail!("invalid value for WORKER_MAX_TASKS: {max_tasks} exceeds {MAX_WORKER_TASKS}");
    }
    let worker = WorkerConfig {
      id: get("WORKER_ID").unwrap_or_else(|| "local".into()),
      address: get("WORKER_ADDRESS").unwrap_or_else(|| "127.0.0.1:0".into()),
      max_tasks,
      gpu_count: parse_or(&get, "WORKER_GPUS", 0u32)?,
      work_dir: get("WORK_DIR").map(PathBuf::from).unwrap_or_else(|| env::temp_dir().join("renderfarm")),
      heartbeat_interval,
    };

    let scheduler = SchedulerConfig {
      idle_delay: Duration::from_millis(parse("SCHEDULER_IDLE_MS", 1000)?),
      no_worker_backoff: Duration::from_millis(parse("SCHEDULER_BACKOFF_MS", 5000)?),
      heartbeat_interval,
      heartbeat_timeout: Duration::from_secs(parse("HEARTBEAT_TIMEOUT_SECS", 60)?),
      heartbeat_check: Duration::from_secs(parse("HEARTBEAT_CHECK_SECS", 10)?),
      retry_attempts: parse_or(&get, "RETRY_ATTEMPTS", 3usize)?,
      retry_base_delay: Duration::from_millis(parse("RETRY_BASE_DELAY_MS", 1000)?),
      store_timeout: Duration::from_millis(parse("STORE_TIMEOUT_MS", 2000)?),
    };

    Ok(Self {
      server_port: parse_or(&get, "SERVER_PORT", 8080u16)?,
      database_url: get("DATABASE_URL"),
      rabbitmq_url: get("RABBITMQ_URL"),
      render_queue: get("RENDER_QUEUE").unwrap_or_else(|| "render_queue".into()),
      storage,
      worker,
      scheduler,
      blender_bin: get("BLENDER_BIN").unwrap_or_else(|| "blender".into()),
      custom_command: get("RENDER_CUSTOM_COMMAND"),
      render_timeout: Duration::from_secs(parse("RENDER_TIMEOUT_SECS", DEFAULT_RENDER_TIMEOUT.as_secs())?),
    })
  }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
  G: Fn(&str) -> Option<String>,
{
  match get(key) {
    Some(raw) => raw.parse().with_context(|| format!("invalid value for {key}: '{raw}'")),
    None => Ok(default),
  }
}
