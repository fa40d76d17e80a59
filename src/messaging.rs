use anyhow::{bail, Result};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, info};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;
const PERSISTENT: u8 = 2;

/// External execution fabric that accepts serialized tasks.
#[async_trait]
pub trait RemoteWorkQueue: Send + Sync {
  async fn send(&self, payload: &[u8]) -> Result<()>;
  async fn depth(&self) -> Result<u64>;
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub struct RabbitWorkQueue {
  channel: Channel,
  queue: String,
}

impl RabbitWorkQueue {
  pub async fn connect(rabbitmq_url: &str, queue: &str) -> Result<Self> {
    let channel = create_rabbit_channel(rabbitmq_url).await?;
    Self::new(channel, queue).await
  }

  pub async fn new(channel: Channel, queue: &str) -> Result<Self> {
    channel.confirm_select(ConfirmSelectOptions::default()).await?;
    channel
      .queue_declare(
        queue,
        QueueDeclareOptions { durable: true, ..Default::default() },
        FieldTable::default(),
      )
      .await?;
    info!(queue, "render queue declared");
    Ok(Self {
      channel,
      queue: queue.to_string(),
    })
  }
}

#[async_trait]
impl RemoteWorkQueue for RabbitWorkQueue {
  async fn send(&self, payload: &[u8]) -> Result<()> {
    let confirm = self
      .channel
      .basic_publish(
        "",
        &self.queue,
        BasicPublishOptions::default(),
        payload,
        BasicProperties::default().with_delivery_mode(PERSISTENT),
      )
      .await?
      .await?;
    if confirm.is_nack() {
      bail!("broker rejected message for {}", self.queue);
    }
    debug!(queue = %self.queue, bytes = payload.len(), "published");
    Ok(())
  }

  async fn depth(&self) -> Result<u64> {
    let queue = self
      .channel
      .queue_declare(
        &self.queue,
        QueueDeclareOptions { passive: true, ..Default::default() },
        FieldTable::default(),
      )
      .await?;
    Ok(u64::from(queue.message_count()))
  }
}
