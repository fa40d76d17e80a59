use std::sync::Arc;
use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber;
use renderfarm::cloud::{CloudStager, RetryPolicy};
use renderfarm::config::Config;
use renderfarm::database::{record_events, setup_database, PgTaskStore};
use renderfarm::engine::{BlenderEngine, CommandEngine, EngineRegistry};
use renderfarm::messaging::RabbitWorkQueue;
use renderfarm::models::EngineKind;
use renderfarm::orchestrator::Orchestrator;
use renderfarm::routes::routes;
use renderfarm::storage::ObjectStoreStorage;
use renderfarm::task_queue::TaskQueue;

fn engines(config: &Config) -> EngineRegistry {
  let mut registry = EngineRegistry::new().with(Arc::new(BlenderEngine::new(&config.blender_bin, config.render_timeout)));
  if let Some(template) = &config.custom_command {
    match CommandEngine::from_template(EngineKind::Custom, template, config.render_timeout) {
      Some(engine) => {
        registry.register(Arc::new(engine));
      }
      None => warn!("RENDER_CUSTOM_COMMAND is empty, custom engine disabled"),
    }
  }
  registry
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;

  let db_pool = match &config.database_url {
    Some(url) => Some(setup_database(url).await?),
    None => {
      info!("DATABASE_URL not set, queue stays in-process");
      None
    }
  };

  let stager = match &config.storage {
    Some(storage_config) => {
      let storage = Arc::new(ObjectStoreStorage::s3(storage_config).context("failed to configure object storage")?);
      let retry = RetryPolicy {
        max_attempts: config.scheduler.retry_attempts,
        base_delay: config.scheduler.retry_base_delay,
      };
      let mut stager = CloudStager::new(storage, retry).with_prefix(&storage_config.prefix);
      if let Some(url) = &config.rabbitmq_url {
        match RabbitWorkQueue::connect(url, &config.render_queue).await {
          Ok(queue) => stager = stager.with_remote_queue(Arc::new(queue)),
          Err(e) => warn!(error = %e, "remote work queue unavailable, staging to storage only"),
        }
      }
      Some(stager)
    }
    None => {
      info!("S3_BUCKET not set, rendering locally only");
      None
    }
  };

  let mut builder = Orchestrator::builder(engines(&config))
    .config(config.scheduler.clone())
    .work_root(&config.worker.work_dir);
  if let Some(pool) = &db_pool {
    builder = builder.queue(TaskQueue::with_store(Arc::new(PgTaskStore::new(pool.clone())), config.scheduler.store_timeout));
  }
  if let Some(stager) = stager {
    builder = builder.stager(stager);
  }
  let orchestrator = builder.build();

  if let Some(pool) = db_pool {
    tokio::spawn(record_events(pool, orchestrator.subscribe()));
  }

  orchestrator.register_local_worker(config.worker.clone()).await;
  orchestrator.start();

  let api = routes(orchestrator.clone());
  let (addr, server) = warp::serve(api).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!(error = %e, "failed to listen for ctrl-c");
    }
  });
  info!("Serving render farm API on {}", addr);
  server.await;

  orchestrator.stop();
  info!("Shut down");
  Ok(())
}
