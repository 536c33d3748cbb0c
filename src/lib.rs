//! psafe-sync — cloud-to-local sync engine for password safe files.
//!
//! Mirrors a provider account's password safe files into a local artifact
//! directory. Each pass lists the remote side (a full listing on the first
//! pass, the provider's change log afterwards), reconciles the observations
//! against a SQLite ledger of what both sides looked like after the last
//! pass, downloads or purges what moved, and commits every ledger mutation
//! of the pass in a single transaction. Remote uploads are out of scope;
//! the remote copy is authoritative.

#![warn(clippy::all)]

pub mod artifact;
pub mod executor;
pub mod ledger;
pub mod reconcile;
pub mod remote;
pub mod syncer;

pub use artifact::{ArtifactError, ArtifactStore, DirArtifactStore};
pub use executor::{ExecutionOutcome, TransferExecutor};
pub use ledger::{FileEntry, LedgerError, LedgerStore, ProviderRecord, SqliteLedger};
pub use reconcile::{Observation, ObservationSet, SyncAction, SyncPlan};
pub use remote::{ByteStream, FileDescriptor, RemoteError, RemoteStore};
pub use syncer::{SyncConfig, SyncError, SyncReport, Syncer};
