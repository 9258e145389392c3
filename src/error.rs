//! Error taxonomy for the write path.
//!
//! The consumer loop keys its ack/retry/dead-letter decision off these
//! variants, so the split between terminal and retriable kinds is load
//! bearing; see `bus::consumer`.

use crate::storage::is_unique_violation;

/// A failure while applying a queue command.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The target row does not exist yet. Retriable: the create command
    /// may still be in flight on another queue.
    #[error("target row not found")]
    NotFound,

    /// The row already exists. Terminal: the command was already applied
    /// and the delivery is an at-least-once replay.
    #[error("duplicate key, command already applied")]
    Duplicate,

    /// Relational store failure (connection, deadlock, timeout). Retriable.
    #[error("store error: {0}")]
    Store(sqlx::Error),
}

impl WriteError {
    /// True when the delivery should be acked as an idempotent replay
    /// rather than sent through the retry path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteError::Duplicate)
    }
}

impl From<sqlx::Error> for WriteError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            WriteError::Duplicate
        } else {
            WriteError::Store(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_terminal() {
        assert!(WriteError::Duplicate.is_terminal());
        assert!(!WriteError::NotFound.is_terminal());
        assert!(!WriteError::Store(sqlx::Error::PoolClosed).is_terminal());
    }

    #[test]
    fn non_database_errors_stay_transient() {
        let err = WriteError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, WriteError::Store(_)));
    }
}
