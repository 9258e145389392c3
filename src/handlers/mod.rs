//! Write handlers: one per logical queue.

pub mod chat;
pub mod message;

pub use chat::CreateChatHandler;
pub use message::{CreateMessageHandler, UpdateMessageHandler};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::WriteError;

/// A handler for one logical queue's command payload.
///
/// The consumer loop owns parsing and acknowledgement; implementations
/// only apply the command. Returned errors drive the retry path except
/// for terminal kinds (see [`WriteError::is_terminal`]).
#[async_trait]
pub trait QueueHandler: Send + Sync + 'static {
    /// Queue this handler consumes.
    const QUEUE: &'static str;

    /// Wire payload of the queue.
    type Payload: DeserializeOwned + Send;

    async fn handle(&self, payload: Self::Payload) -> Result<(), WriteError>;

    /// One-line success description for the consumer's ack log.
    fn describe(payload: &Self::Payload) -> String;
}
