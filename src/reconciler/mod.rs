//! Counter reconciliation.
//!
//! Drains the change-sets every 10 seconds and propagates the KV
//! counters into the denormalised count columns with batched CASE
//! updates. Runs once immediately at startup and once more during
//! graceful shutdown.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::storage::redis::{
    chat_counter_key, message_counter_key, CHAT_CHANGES, MESSAGE_CHANGES,
};
use crate::storage::{ChatCountUpdate, Counters, Db, MessageCountUpdate, StorageError};

/// Time between reconciliation passes.
const SYNC_PERIOD: Duration = Duration::from_secs(10);
/// Members per batched CASE update.
const BATCH_SIZE: usize = 100;

/// Periodic change-set drain into the relational store.
pub struct CountReconciler {
    db: Db,
    counters: Counters,
}

impl CountReconciler {
    pub fn new(db: Db, counters: Counters) -> Self {
        Self { db, counters }
    }

    /// Reconcile until cancellation, then run one final drain so counts
    /// settle before the process exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SYNC_PERIOD);
        info!("starting counter reconciler (every 10 seconds)");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reconciler shutting down, running final drain");
                    self.sync().await;
                    info!("final drain completed");
                    return;
                }
                // First tick completes immediately.
                _ = ticker.tick() => self.sync().await,
            }
        }
    }

    /// One reconciliation pass over both change classes.
    pub async fn sync(&self) {
        if let Err(err) = self.sync_chat_counts().await {
            error!(error = %err, "failed to sync chat counts");
        }
        if let Err(err) = self.sync_message_counts().await {
            error!(error = %err, "failed to sync message counts");
        }
    }

    async fn sync_chat_counts(&self) -> Result<(), StorageError> {
        let tokens = self.counters.set_members(CHAT_CHANGES).await?;
        if tokens.is_empty() {
            return Ok(());
        }

        // Drain before applying: members re-added while the batches run
        // survive to the next tick.
        // TODO: RENAME to a unique working key before enumerating; adds
        // landing between SMEMBERS and DEL are dropped until the next
        // write re-marks them.
        if let Err(err) = self.counters.delete(CHAT_CHANGES).await {
            warn!(error = %err, "failed to clear chat change-set");
        }

        let mut rows = 0u64;
        let mut applied = 0usize;
        for batch in tokens.chunks(BATCH_SIZE) {
            let mut updates = Vec::with_capacity(batch.len());
            for token in batch {
                match self.counters.get_int(&chat_counter_key(token)).await {
                    Ok(Some(count)) => updates.push(ChatCountUpdate {
                        token: token.clone(),
                        count,
                    }),
                    Ok(None) => warn!(token = %token, "chat counter missing, skipping"),
                    Err(err) => {
                        warn!(token = %token, error = %err, "failed to read chat counter")
                    }
                }
            }
            rows += self.db.batch_update_chats_count(&updates).await?;
            applied += updates.len();
        }

        if applied > 0 {
            info!(applied, rows, "synced chat counts");
        }
        Ok(())
    }

    async fn sync_message_counts(&self) -> Result<(), StorageError> {
        let members = self.counters.set_members(MESSAGE_CHANGES).await?;
        if members.is_empty() {
            return Ok(());
        }

        if let Err(err) = self.counters.delete(MESSAGE_CHANGES).await {
            warn!(error = %err, "failed to clear message change-set");
        }

        let mut rows = 0u64;
        let mut applied = 0usize;
        for batch in members.chunks(BATCH_SIZE) {
            let mut updates = Vec::with_capacity(batch.len());
            for member in batch {
                let Some((token, chat_number)) = parse_message_change(member) else {
                    warn!(member = %member, "malformed change member, skipping");
                    continue;
                };
                match self
                    .counters
                    .get_int(&message_counter_key(token, chat_number))
                    .await
                {
                    Ok(Some(count)) => updates.push(MessageCountUpdate {
                        token: token.to_string(),
                        chat_number,
                        count,
                    }),
                    Ok(None) => warn!(member = %member, "message counter missing, skipping"),
                    Err(err) => {
                        warn!(member = %member, error = %err, "failed to read message counter")
                    }
                }
            }
            rows += self.db.batch_update_messages_count(&updates).await?;
            applied += updates.len();
        }

        if applied > 0 {
            info!(applied, rows, "synced message counts");
        }
        Ok(())
    }
}

/// Split a `message_changes` member into its token and chat number.
fn parse_message_change(member: &str) -> Option<(&str, i64)> {
    let (token, chat_number) = member.split_once(':')?;
    let chat_number = chat_number.parse().ok()?;
    Some((token, chat_number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_change_members() {
        assert_eq!(parse_message_change("abc:3"), Some(("abc", 3)));
        assert_eq!(parse_message_change("abc:0"), Some(("abc", 0)));
    }

    #[test]
    fn rejects_malformed_members() {
        assert_eq!(parse_message_change("abc"), None);
        assert_eq!(parse_message_change("abc:"), None);
        assert_eq!(parse_message_change("abc:x"), None);
        assert_eq!(parse_message_change(""), None);
    }

    #[test]
    fn member_splits_on_first_colon() {
        // Tokens are URL-safe and never contain a colon; the first-colon
        // split keeps trailing garbage out of the token.
        assert_eq!(parse_message_change("abc:3:junk"), None);
    }
}
