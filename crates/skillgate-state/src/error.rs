//! Error types for skillgate-state

use thiserror::Error;

/// Errors raised while connecting to or initialising the backing database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by [`crate::GovernanceStore`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A security hash string is not 64 lowercase hex characters.
    #[error("invalid security hash: {digest}")]
    InvalidDigest { digest: String },

    /// Receipts are append-only; an invocation id can be written once.
    #[error("receipt already recorded for invocation {invocation_id}")]
    DuplicateReceipt { invocation_id: String },

    /// A stored row could not be mapped back to a domain record.
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: String, reason: String },

    /// Backend-specific failure (query, transaction, connection).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
