//! Message creation and body updates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::QueueHandler;
use crate::error::WriteError;
use crate::model::{CreateMessage, MessageDocument, UpdateMessage};
use crate::search::SearchIndex;
use crate::storage::redis::{message_change_member, MESSAGE_CHANGES};
use crate::storage::{Counters, Db};

/// Applies `create_messages` commands: idempotent insert keyed on
/// `(token, chat_number, number)`, best-effort search indexing, and a
/// change-set mark for the reconciler.
pub struct CreateMessageHandler {
    db: Db,
    counters: Counters,
    search: Option<Arc<SearchIndex>>,
}

impl CreateMessageHandler {
    pub fn new(db: Db, counters: Counters, search: Option<Arc<SearchIndex>>) -> Self {
        Self {
            db,
            counters,
            search,
        }
    }
}

#[async_trait]
impl QueueHandler for CreateMessageHandler {
    const QUEUE: &'static str = "create_messages";
    type Payload = CreateMessage;

    async fn handle(&self, msg: CreateMessage) -> Result<(), WriteError> {
        let created_at = parse_message_date(&msg.date);

        let id = self
            .db
            .insert_message(
                &msg.token,
                msg.chat_number,
                msg.message_number,
                &msg.body,
                msg.sender_id,
                created_at,
            )
            .await
            .map_err(WriteError::from)?;

        if let Some(search) = &self.search {
            let sender_name = match self.db.sender_name(msg.sender_id).await {
                Ok(name) => name,
                Err(err) => {
                    warn!(sender_id = msg.sender_id, error = %err, "failed to resolve sender name");
                    None
                }
            };

            let doc = MessageDocument {
                id: id as i64,
                token: msg.token.clone(),
                chat_number: msg.chat_number,
                number: msg.message_number,
                body: msg.body.clone(),
                sender_id: msg.sender_id,
                sender_name,
                created_at,
            };

            // The row is authoritative; index failures are logged for
            // out-of-band reindexing and never fail the delivery.
            match search.index_message(&doc).await {
                Ok(()) => debug!(doc_id = %doc.doc_id(), "indexed message"),
                Err(err) => {
                    warn!(doc_id = %doc.doc_id(), error = %err, "failed to index message")
                }
            }
        }

        let member = message_change_member(&msg.token, msg.chat_number);
        if let Err(err) = self.counters.set_add(MESSAGE_CHANGES, &member).await {
            warn!(member = %member, error = %err, "failed to mark message change");
        }

        Ok(())
    }

    fn describe(payload: &CreateMessage) -> String {
        format!(
            "created message {} in chat {} for application {}",
            payload.message_number, payload.chat_number, payload.token
        )
    }
}

/// Applies `update_messages` commands. A zero-row update surfaces as
/// [`WriteError::NotFound`] so the retry path can wait out a create
/// still in flight on the other queue.
pub struct UpdateMessageHandler {
    db: Db,
    search: Option<Arc<SearchIndex>>,
}

impl UpdateMessageHandler {
    pub fn new(db: Db, search: Option<Arc<SearchIndex>>) -> Self {
        Self { db, search }
    }
}

#[async_trait]
impl QueueHandler for UpdateMessageHandler {
    const QUEUE: &'static str = "update_messages";
    type Payload = UpdateMessage;

    async fn handle(&self, msg: UpdateMessage) -> Result<(), WriteError> {
        let rows = self
            .db
            .update_message_body(&msg.token, msg.chat_number, msg.message_number, &msg.body)
            .await
            .map_err(WriteError::from)?;

        if rows == 0 {
            return Err(WriteError::NotFound);
        }

        if let Some(search) = &self.search {
            if let Err(err) = search
                .update_message(&msg.token, msg.chat_number, msg.message_number, &msg.body)
                .await
            {
                warn!(
                    token = %msg.token,
                    chat_number = msg.chat_number,
                    number = msg.message_number,
                    error = %err,
                    "failed to update message in search index"
                );
            }
        }

        Ok(())
    }

    fn describe(payload: &UpdateMessage) -> String {
        format!(
            "updated message {} in chat {} for application {}",
            payload.message_number, payload.chat_number, payload.token
        )
    }
}

/// Parse the producer's RFC 3339 timestamp, substituting the current
/// clock for malformed values.
fn parse_message_date(date: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(date)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
