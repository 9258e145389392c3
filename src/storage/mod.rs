//! Storage adapters: the authoritative relational store and the
//! counter/change-set KV store.

pub mod mysql;
pub mod redis;

pub use self::mysql::{ChatCountUpdate, Db, MessageCountUpdate};
pub use self::redis::Counters;

/// Errors raised while connecting to or operating a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// True when `err` is a MySQL duplicate-key violation (error 1062).
///
/// The unique keys on `(token, number)` and `(token, chat_number, number)`
/// turn at-least-once replays into this error; callers treat it as an
/// idempotent success, not a retriable failure.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .is_some_and(|e| e.number() == 1062),
        _ => false,
    }
}
