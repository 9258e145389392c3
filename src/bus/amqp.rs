//! AMQP (RabbitMQ) broker adapter.
//!
//! Owns the connection pool and the queue topology. Channels are not
//! safe for concurrent use, so every consumer task takes its own via
//! [`Broker::channel`].

use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ConnectionProperties, ExchangeKind};
use tracing::{info, warn};

use super::{BusError, Result};

/// Connection attempts made before startup fails.
const CONNECT_ATTEMPTS: usize = 10;
/// Fixed delay between connection attempts.
const CONNECT_DELAY: Duration = Duration::from_secs(2);

/// Broker handle backed by a connection pool.
pub struct Broker {
    pool: Pool,
}

impl Broker {
    /// Connect to the broker, verifying a pooled connection eagerly so a
    /// dead broker fails startup instead of the first delivery.
    pub async fn connect(url: &str) -> Result<Self> {
        let manager = Manager::new(url.to_string(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BusError::Connection(format!("failed to create pool: {e}")))?;

        (|| async { pool.get().await })
            .retry(
                ConstantBuilder::default()
                    .with_delay(CONNECT_DELAY)
                    .with_max_times(CONNECT_ATTEMPTS - 1),
            )
            .notify(|err: &PoolError, _| {
                warn!(error = %err, "failed to connect to RabbitMQ, retrying in 2s");
            })
            .await?;

        info!(url = %url, "connected to RabbitMQ");
        Ok(Self { pool })
    }

    /// Open a fresh channel from a pooled connection.
    pub async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await?;
        Ok(conn.create_channel().await?)
    }
}

/// Declare a durable queue wired to its own dead-letter path:
/// a fanout exchange `<queue>.dlx`, a durable queue `<queue>.dlq` bound
/// to it, and the main queue pointing at the exchange via
/// `x-dead-letter-exchange`.
pub async fn declare_queue_with_dlx(channel: &Channel, queue: &str) -> Result<()> {
    let dlx = format!("{queue}.dlx");
    let dlq = format!("{queue}.dlq");

    channel
        .exchange_declare(
            &dlx,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            &dlq,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            &dlq,
            &dlx,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(dlx.into()),
    );
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;

    Ok(())
}

/// Start consuming a queue with manual acknowledgement.
pub async fn consume(channel: &Channel, queue: &str) -> Result<lapin::Consumer> {
    Ok(channel
        .basic_consume(
            queue,
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?)
}
