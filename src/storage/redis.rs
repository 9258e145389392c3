//! Redis adapter: approximate counters and change-set membership.
//!
//! Key structure:
//! - `chat_counter:<token>` - integer, chats per application
//! - `message_counter:<token>:<chat_number>` - integer, messages per chat
//! - `chat_changes` - set of tokens with a possibly stale chats_count
//! - `message_changes` - set of `<token>:<chat_number>` members with a
//!   possibly stale messages_count
//!
//! Counters are maintained by the upstream producer; this service only
//! reads them and tracks change-set membership.

use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tracing::{info, warn};

use super::StorageError;

/// Change-set of application tokens with stale `chats_count`.
pub const CHAT_CHANGES: &str = "chat_changes";
/// Change-set of `<token>:<chat_number>` members with stale `messages_count`.
pub const MESSAGE_CHANGES: &str = "message_changes";

/// Counter key for chats per application.
pub fn chat_counter_key(token: &str) -> String {
    format!("chat_counter:{token}")
}

/// Counter key for messages per chat.
pub fn message_counter_key(token: &str, chat_number: i64) -> String {
    format!("message_counter:{token}:{chat_number}")
}

/// Member format for the `message_changes` set.
pub fn message_change_member(token: &str, chat_number: i64) -> String {
    format!("{token}:{chat_number}")
}

/// Handle on the counter store.
#[derive(Clone)]
pub struct Counters {
    conn: ConnectionManager,
}

impl Counters {
    /// Connect and verify with a PING; retried 10 times, 2 s apart.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = Client::open(url)?;

        let mut conn = (|| async { ConnectionManager::new(client.clone()).await })
            .retry(
                ConstantBuilder::default()
                    .with_delay(Duration::from_secs(2))
                    .with_max_times(9),
            )
            .notify(|err: &RedisError, _| {
                warn!(error = %err, "failed to connect to Redis, retrying in 2s");
            })
            .await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("connected to Redis");
        Ok(Self { conn })
    }

    /// Idempotent set-membership add.
    pub async fn set_add(&self, set_key: &str, member: &str) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(set_key, member).await?;
        Ok(())
    }

    /// Enumerate all members of a set.
    pub async fn set_members(&self, set_key: &str) -> Result<Vec<String>, RedisError> {
        let mut conn = self.conn.clone();
        conn.smembers(set_key).await
    }

    /// Delete a key. Draining a set this way is not atomic with the
    /// preceding read; see the reconciler for the consequences.
    pub async fn delete(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    /// Read an integer counter. Absent keys read as `None`.
    pub async fn get_int(&self, key: &str) -> Result<Option<i64>, RedisError> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_key_formats() {
        assert_eq!(chat_counter_key("abc"), "chat_counter:abc");
        assert_eq!(message_counter_key("abc", 3), "message_counter:abc:3");
        assert_eq!(message_change_member("abc", 3), "abc:3");
    }
}

/// Integration tests requiring a running Redis instance.
#[cfg(test)]
mod integration_tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string())
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn set_add_is_idempotent() {
        let counters = Counters::connect(&redis_url()).await.unwrap();
        counters.delete("test:changes").await.unwrap();

        counters.set_add("test:changes", "abc").await.unwrap();
        counters.set_add("test:changes", "abc").await.unwrap();

        let members = counters.set_members("test:changes").await.unwrap();
        assert_eq!(members, vec!["abc".to_string()]);

        counters.delete("test:changes").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn absent_counter_reads_as_none() {
        let counters = Counters::connect(&redis_url()).await.unwrap();
        counters.delete("test:absent_counter").await.unwrap();
        assert_eq!(counters.get_int("test:absent_counter").await.unwrap(), None);
    }
}
