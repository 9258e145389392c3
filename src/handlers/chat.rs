//! Chat creation.

use async_trait::async_trait;
use tracing::warn;

use super::QueueHandler;
use crate::error::WriteError;
use crate::model::CreateChat;
use crate::storage::redis::CHAT_CHANGES;
use crate::storage::{Counters, Db};

/// Applies `create_chats` commands: an idempotent insert keyed on
/// `(token, number)`, then a change-set mark for the reconciler.
pub struct CreateChatHandler {
    db: Db,
    counters: Counters,
}

impl CreateChatHandler {
    pub fn new(db: Db, counters: Counters) -> Self {
        Self { db, counters }
    }
}

#[async_trait]
impl QueueHandler for CreateChatHandler {
    const QUEUE: &'static str = "create_chats";
    type Payload = CreateChat;

    async fn handle(&self, msg: CreateChat) -> Result<(), WriteError> {
        self.db
            .insert_chat(&msg.token, msg.chat_number, msg.creator_id)
            .await
            .map_err(WriteError::from)?;

        // The row is persisted; a lost mark only delays reconciliation
        // until the next write to the same application.
        if let Err(err) = self.counters.set_add(CHAT_CHANGES, &msg.token).await {
            warn!(token = %msg.token, error = %err, "failed to mark chat change");
        }

        Ok(())
    }

    fn describe(payload: &CreateChat) -> String {
        format!(
            "created chat {} for application {}",
            payload.chat_number, payload.token
        )
    }
}
