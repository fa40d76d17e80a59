use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, Pool, Postgres, Row};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::events::RenderEvent;
use crate::models::{RenderTask, TaskPriority, TaskStatus, WorkerNode};
use crate::task_queue::{QueuePosition, QueueStats, QueueStore};

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>> {
  let pool = PgPoolOptions::new()
    .max_connections(10)
    .connect(database_url)
    .await
    .context("failed to connect to database")?;

  MIGRATOR.run(&pool).await.context("failed to run database migrations")?;
  info!("Database migrations complete");
  Ok(pool)
}

/// Queue entries and task records in Postgres. Claims use `SKIP LOCKED` so
/// several orchestrators can pop from the same table.
#[derive(Clone)]
pub struct PgTaskStore {
  pool: Pool<Postgres>,
}

impl PgTaskStore {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }

  async fn upsert<'e, E>(executor: E, task: &RenderTask) -> Result<()>
  where
    E: sqlx::Executor<'e, Database = Postgres>,
  {
    sqlx::query(
      "INSERT INTO render_tasks (id, record, status, priority, worker_id, progress, updated_at)
       VALUES ($1, $2, $3, $4, $5, $6, NOW())
       ON CONFLICT (id) DO UPDATE
       SET record = EXCLUDED.record, status = EXCLUDED.status, priority = EXCLUDED.priority,
           worker_id = EXCLUDED.worker_id, progress = EXCLUDED.progress, updated_at = NOW()",
    )
    .bind(&task.id)
    .bind(serde_json::to_value(task)?)
    .bind(task.status.as_str())
    .bind(task.priority.rank())
    .bind(task.worker_id.as_deref())
    .bind(task.progress)
    .execute(executor)
    .await?;
    Ok(())
  }
}

#[async_trait]
impl QueueStore for PgTaskStore {
  async fn push(&self, task: &RenderTask, position: QueuePosition) -> Result<()> {
    let mut tx = self.pool.begin().await?;
    Self::upsert(&mut *tx, task).await?;
    sqlx::query("DELETE FROM render_queue WHERE task_id = $1")
      .bind(&task.id)
      .execute(&mut *tx)
      .await?;
    match position {
      QueuePosition::Back => {
        sqlx::query("INSERT INTO render_queue (task_id, priority) VALUES ($1, $2)")
          .bind(&task.id)
          .bind(task.priority.rank())
          .execute(&mut *tx)
          .await?;
      }
      QueuePosition::Front => {
        sqlx::query(
          "INSERT INTO render_queue (seq, task_id, priority)
           SELECT COALESCE(MIN(seq), 1) - 1, $1, $2 FROM render_queue",
        )
        .bind(&task.id)
        .bind(task.priority.rank())
        .execute(&mut *tx)
        .await?;
      }
    }
    tx.commit().await?;
    Ok(())
  }

  async fn pop_next(&self, min_priority: TaskPriority) -> Result<Option<RenderTask>> {
    let row = sqlx::query(
      "WITH next AS (
         SELECT q.seq FROM render_queue q
         JOIN render_tasks t ON t.id = q.task_id
         WHERE t.status = $1 AND q.priority >= $2
         ORDER BY q.priority DESC, q.seq ASC
         LIMIT 1
         FOR UPDATE OF q SKIP LOCKED
       ), claimed AS (
         DELETE FROM render_queue q USING next WHERE q.seq = next.seq RETURNING q.task_id
       )
       SELECT t.record FROM render_tasks t JOIN claimed c ON c.task_id = t.id",
    )
    .bind(TaskStatus::Queued.as_str())
    .bind(min_priority.rank())
    .fetch_optional(&self.pool)
    .await?;

    match row {
      Some(row) => {
        let record: Value = row.try_get("record")?;
        Ok(Some(serde_json::from_value(record).context("corrupt task record")?))
      }
      None => Ok(None),
    }
  }

  async fn update(&self, task: &RenderTask) -> Result<()> {
    Self::upsert(&self.pool, task).await
  }

  async fn withdraw(&self, task_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM render_queue WHERE task_id = $1")
      .bind(task_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn delete(&self, task_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM render_tasks WHERE id = $1")
      .bind(task_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn counts(&self) -> Result<QueueStats> {
    let rows = sqlx::query(
      "SELECT q.priority, COUNT(*) AS n FROM render_queue q
       JOIN render_tasks t ON t.id = q.task_id
       WHERE t.status = $1
       GROUP BY q.priority",
    )
    .bind(TaskStatus::Queued.as_str())
    .fetch_all(&self.pool)
    .await?;

    let mut stats = QueueStats::default();
    for row in rows {
      let rank: i16 = row.try_get("priority")?;
      let count: i64 = row.try_get("n")?;
      if let Some(priority) = TaskPriority::from_rank(rank) {
        stats.add(priority, usize::try_from(count).unwrap_or(0));
      }
    }
    Ok(stats)
  }
}

pub async fn record_event(pool: &Pool<Postgres>, event: &RenderEvent) -> Result<()> {
  sqlx::query("INSERT INTO task_events (kind, task_id, worker_id, payload) VALUES ($1, $2, $3, $4)")
    .bind(event.kind())
    .bind(event.task_id())
    .bind(event.worker_id())
    .bind(serde_json::to_value(event)?)
    .execute(pool)
    .await?;
  Ok(())
}

pub async fn upsert_worker(pool: &Pool<Postgres>, worker: &WorkerNode) -> Result<()> {
  sqlx::query(
    "INSERT INTO worker_nodes (id, address, status, current_tasks, max_concurrent_tasks, snapshot, last_heartbeat)
     VALUES ($1, $2, $3, $4, $5, $6, $7)
     ON CONFLICT (id) DO UPDATE
     SET address = EXCLUDED.address, status = EXCLUDED.status, current_tasks = EXCLUDED.current_tasks,
         max_concurrent_tasks = EXCLUDED.max_concurrent_tasks, snapshot = EXCLUDED.snapshot,
         last_heartbeat = EXCLUDED.last_heartbeat",
  )
  .bind(&worker.id)
  .bind(&worker.address)
  .bind(worker.status.as_str())
  .bind(i32::try_from(worker.current_tasks.len()).unwrap_or(i32::MAX))
  .bind(i32::try_from(worker.max_concurrent_tasks).unwrap_or(i32::MAX))
  .bind(serde_json::to_value(worker)?)
  .bind(worker.last_heartbeat)
  .execute(pool)
  .await?;
  Ok(())
}

async fn touch_worker(pool: &Pool<Postgres>, worker_id: &str, status: &str, current_tasks: Option<usize>, at: DateTime<Utc>) -> Result<()> {
  sqlx::query(
    "UPDATE worker_nodes
     SET status = $2, current_tasks = COALESCE($3, current_tasks), last_heartbeat = GREATEST(last_heartbeat, $4)
     WHERE id = $1",
  )
  .bind(worker_id)
  .bind(status)
  .bind(current_tasks.map(|n| i32::try_from(n).unwrap_or(i32::MAX)))
  .bind(at)
  .execute(pool)
  .await?;
  Ok(())
}

async fn persist(pool: &Pool<Postgres>, event: &RenderEvent) -> Result<()> {
  match event {
    // Heartbeats are frequent; they refresh the worker row only.
    RenderEvent::WorkerHeartbeat { heartbeat } => {
      return touch_worker(pool, &heartbeat.worker_id, "online", Some(heartbeat.current_tasks), heartbeat.timestamp).await;
    }
    RenderEvent::WorkerRegistered { worker } => upsert_worker(pool, worker).await?,
    RenderEvent::WorkerDisconnected { worker_id } => touch_worker(pool, worker_id, "offline", None, Utc::now()).await?,
    _ => {}
  }
  record_event(pool, event).await
}

/// Writes the event stream to `task_events` and `worker_nodes` until the
/// sender side is dropped. Write failures are logged and skipped.
pub async fn record_events(pool: Pool<Postgres>, mut events: broadcast::Receiver<RenderEvent>) {
  loop {
    match events.recv().await {
      Ok(event) => {
        if let Err(e) = persist(&pool, &event).await {
          warn!(event = event.kind(), error = %e, "failed to record event");
        }
      }
      Err(RecvError::Lagged(skipped)) => warn!(skipped, "event recorder lagging, events dropped"),
      Err(RecvError::Closed) => break,
    }
  }
  debug!("event recorder stopped");
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkerRow {
  pub id: String,
  pub address: String,
  pub status: String,
  pub current_tasks: i32,
  pub max_concurrent_tasks: i32,
  pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
  pub id: String,
  pub status: String,
  pub priority: i16,
  pub worker_id: Option<String>,
  pub progress: f64,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
  pub kind: String,
  pub task_id: Option<String>,
  pub worker_id: Option<String>,
  pub created_at: DateTime<Utc>,
}

pub async fn list_workers(pool: &Pool<Postgres>) -> Result<Vec<WorkerRow>> {
  Ok(
    sqlx::query_as::<_, WorkerRow>(
      "SELECT id, address, status, current_tasks, max_concurrent_tasks, last_heartbeat
       FROM worker_nodes ORDER BY id",
    )
    .fetch_all(pool)
    .await?,
  )
}

pub async fn list_active_tasks(pool: &Pool<Postgres>, limit: i64) -> Result<Vec<TaskRow>> {
  Ok(
    sqlx::query_as::<_, TaskRow>(
      "SELECT id, status, priority, worker_id, progress, updated_at
       FROM render_tasks WHERE status = $1 ORDER BY updated_at DESC LIMIT $2",
    )
    .bind(TaskStatus::Processing.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?,
  )
}

/// Next queued tasks in dispatch order.
pub async fn list_queued_tasks(pool: &Pool<Postgres>, limit: i64) -> Result<Vec<TaskRow>> {
  Ok(
    sqlx::query_as::<_, TaskRow>(
      "SELECT t.id, t.status, t.priority, t.worker_id, t.progress, t.updated_at
       FROM render_queue q JOIN render_tasks t ON t.id = q.task_id
       WHERE t.status = $1
       ORDER BY q.priority DESC, q.seq ASC LIMIT $2",
    )
    .bind(TaskStatus::Queued.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?,
  )
}

pub async fn list_recent_events(pool: &Pool<Postgres>, limit: i64) -> Result<Vec<EventRow>> {
  Ok(
    sqlx::query_as::<_, EventRow>(
      "SELECT kind, task_id, worker_id, created_at FROM task_events ORDER BY id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?,
  )
}
