//! MySQL adapter: pooled connections and the write-path statements.
//!
//! Every statement binds user-derived values through `?` placeholders.
//! The batch CASE statement text is a pure function of the batch size;
//! no token byte ever appears in statement text.

use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tracing::{info, warn};

use super::StorageError;
use crate::config::DatabaseConfig;

/// Connection attempts made before startup fails.
const CONNECT_ATTEMPTS: usize = 10;
/// Fixed delay between connection attempts.
const CONNECT_DELAY: Duration = Duration::from_secs(2);

/// One pending `applications.chats_count` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCountUpdate {
    pub token: String,
    pub count: i64,
}

/// One pending `chats.messages_count` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCountUpdate {
    pub token: String,
    pub chat_number: i64,
    pub count: i64,
}

/// Handle on the relational store.
#[derive(Clone)]
pub struct Db {
    pool: MySqlPool,
}

impl Db {
    /// Connect to MySQL with the pool sized for the write-path load.
    ///
    /// Retries for [`CONNECT_ATTEMPTS`] with a fixed [`CONNECT_DELAY`];
    /// exhausting the attempts is a fatal startup error.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(3306)
            .username(&config.username)
            .password(&config.password)
            .database(&config.name);

        let pool = (|| async {
            MySqlPoolOptions::new()
                .max_connections(50)
                .min_connections(25)
                .max_lifetime(Duration::from_secs(5 * 60))
                .idle_timeout(Duration::from_secs(2 * 60))
                .connect_with(options.clone())
                .await
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(CONNECT_DELAY)
                .with_max_times(CONNECT_ATTEMPTS - 1),
        )
        .notify(|err: &sqlx::Error, _| {
            warn!(error = %err, "failed to connect to MySQL, retrying in 2s");
        })
        .await?;

        info!(host = %config.host, database = %config.name, "connected to MySQL");
        Ok(Self { pool })
    }

    /// Insert a chat row. Duplicate `(token, number)` surfaces as a
    /// database error the caller classifies.
    pub async fn insert_chat(
        &self,
        token: &str,
        number: i64,
        creator_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO chats (token, number, creator_id, created_at, updated_at) \
             VALUES (?, ?, ?, NOW(), NOW())",
        )
        .bind(token)
        .bind(number)
        .bind(creator_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a message row and return its generated id.
    pub async fn insert_message(
        &self,
        token: &str,
        chat_number: i64,
        number: i64,
        body: &str,
        sender_id: i64,
        created_at: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO messages (token, chat_number, number, body, creator_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(token)
        .bind(chat_number)
        .bind(number)
        .bind(body)
        .bind(sender_id)
        .bind(created_at)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id())
    }

    /// Update a message body in place, returning the affected row count.
    /// Zero rows means the create has not landed yet.
    pub async fn update_message_body(
        &self,
        token: &str,
        chat_number: i64,
        number: i64,
        body: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE messages SET body = ?, updated_at = NOW() \
             WHERE token = ? AND chat_number = ? AND number = ?",
        )
        .bind(body)
        .bind(token)
        .bind(chat_number)
        .bind(number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Resolve a sender's display name for search denormalisation.
    pub async fn sender_name(&self, sender_id: i64) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT name FROM users WHERE id = ?")
            .bind(sender_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Apply a batch of `chats_count` values in one statement.
    /// Empty input is a no-op. Returns the affected row count.
    pub async fn batch_update_chats_count(
        &self,
        updates: &[ChatCountUpdate],
    ) -> Result<u64, sqlx::Error> {
        if updates.is_empty() {
            return Ok(0);
        }

        let sql = chats_count_sql(updates.len());
        let mut query = sqlx::query(&sql);
        for update in updates {
            query = query.bind(&update.token).bind(update.count);
        }
        for update in updates {
            query = query.bind(&update.token);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Apply a batch of `messages_count` values in one statement.
    /// Empty input is a no-op. Returns the affected row count.
    pub async fn batch_update_messages_count(
        &self,
        updates: &[MessageCountUpdate],
    ) -> Result<u64, sqlx::Error> {
        if updates.is_empty() {
            return Ok(0);
        }

        let sql = messages_count_sql(updates.len());
        let mut query = sqlx::query(&sql);
        for update in updates {
            query = query
                .bind(&update.token)
                .bind(update.chat_number)
                .bind(update.count);
        }
        for update in updates {
            query = query.bind(&update.token).bind(update.chat_number);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// Statement text for an N-row `chats_count` batch. Placeholders only.
fn chats_count_sql(n: usize) -> String {
    let whens = vec!["WHEN ? THEN ?"; n].join(" ");
    let tokens = vec!["?"; n].join(", ");
    format!(
        "UPDATE applications SET chats_count = CASE token {whens} END \
         WHERE token IN ({tokens})"
    )
}

/// Statement text for an N-row `messages_count` batch. Placeholders only.
fn messages_count_sql(n: usize) -> String {
    let whens = vec!["WHEN token = ? AND number = ? THEN ?"; n].join(" ");
    let conditions = vec!["(token = ? AND number = ?)"; n].join(" OR ");
    format!("UPDATE chats SET messages_count = CASE {whens} END WHERE {conditions}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chats_count_sql_shape() {
        assert_eq!(
            chats_count_sql(1),
            "UPDATE applications SET chats_count = CASE token WHEN ? THEN ? END \
             WHERE token IN (?)"
        );
        assert_eq!(
            chats_count_sql(2),
            "UPDATE applications SET chats_count = CASE token \
             WHEN ? THEN ? WHEN ? THEN ? END WHERE token IN (?, ?)"
        );
    }

    #[test]
    fn messages_count_sql_shape() {
        assert_eq!(
            messages_count_sql(1),
            "UPDATE chats SET messages_count = CASE \
             WHEN token = ? AND number = ? THEN ? END \
             WHERE (token = ? AND number = ?)"
        );
    }

    #[test]
    fn chats_count_placeholder_arity() {
        // N CASE pairs plus N IN values: 3N placeholders.
        for n in [1, 3, 100] {
            let sql = chats_count_sql(n);
            assert_eq!(sql.matches('?').count(), 3 * n);
        }
    }

    #[test]
    fn messages_count_placeholder_arity() {
        // N (token, number, count) triples plus N (token, number) pairs: 5N.
        for n in [1, 3, 100] {
            let sql = messages_count_sql(n);
            assert_eq!(sql.matches('?').count(), 5 * n);
        }
    }

    #[test]
    fn statement_text_never_contains_token_bytes() {
        // The builders take only the batch size, so a hostile token can
        // never reach statement text; it travels through binds alone.
        let updates = vec![
            ChatCountUpdate {
                token: "xyz'; DROP TABLE applications; --".into(),
                count: 10,
            },
            ChatCountUpdate {
                token: "normal_token".into(),
                count: 3,
            },
        ];
        let sql = chats_count_sql(updates.len());
        assert!(!sql.contains("DROP"));
        assert!(!sql.contains('\''));
        assert!(!sql.contains("xyz"));
        assert!(!sql.contains("normal_token"));
    }
}
