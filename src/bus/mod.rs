//! Broker plumbing: connection pool, queue topology, retry routing, and
//! the consumer loop.

pub mod amqp;
pub mod consumer;
pub mod retry;

pub use amqp::Broker;
pub use consumer::QueueConsumer;
pub use retry::RetryPolicy;

/// Errors from the broker layer.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_lapin::PoolError),
}

pub type Result<T> = std::result::Result<T, BusError>;
