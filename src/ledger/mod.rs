//! Sync ledger module for persistent sync state.
//!
//! This module provides SQLite-based bookkeeping for cloud-to-local file
//! sync. Per provider it tracks a change cursor and, per file, what the
//! remote and local sides looked like the last time the two were
//! reconciled, enabling:
//! - Incremental passes that only consult the provider's change log
//! - Skip-by-ledger decisions (no remote download when nothing moved)
//! - Detection of local deletions between passes
//! - Atomic commit of a whole sync pass

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{LedgerStore, SqliteLedger};
pub use error::LedgerError;
pub use types::{
    EntryKey, ExecOp, FileEntry, MergeOp, ProviderRecord, DEFAULT_SYNC_INTERVAL_SECS,
    NEVER_SYNCED,
};
