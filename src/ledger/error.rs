//! Error types for the sync ledger module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Failed to open or create the database file.
    #[error("Failed to open ledger database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a database migration.
    #[error("Ledger migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Ledger query failed: {0}")]
    Query(String),

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Ledger schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// No provider row exists for the given account.
    #[error("Unknown provider account {0:?}")]
    UnknownProvider(String),

    /// A provider row already exists for the given account.
    #[error("Provider account {0:?} already exists")]
    DuplicateProvider(String),

    /// No file entry row exists for the given id.
    #[error("Unknown file entry {0}")]
    UnknownEntry(i64),
}

impl LedgerError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
