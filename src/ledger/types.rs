//! Record types stored in the sync ledger, plus the mutation ops a sync
//! pass stages before committing.

/// Cursor value for a provider that has never completed a sync pass.
///
/// A provider at this cursor gets a full listing; any successful pass moves
/// the cursor to a real change position and it never returns here.
pub const NEVER_SYNCED: i64 = -1;

/// Default scheduling hint recorded for new providers, in seconds.
///
/// The engine itself never schedules; the host application reads this.
pub const DEFAULT_SYNC_INTERVAL_SECS: i64 = 900;

/// Stored sentinel for an absent modification time.
///
/// Modification-time columns are `NOT NULL`; the store maps this value to
/// `None` at the row boundary.
pub(crate) const MOD_TIME_ABSENT: i64 = -1;

/// One synced provider account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    /// Ledger row id.
    pub id: i64,
    /// Unique account identifier, e.g. the provider account email.
    pub account: String,
    /// Last fully-synced change position, or [`NEVER_SYNCED`].
    pub cursor: i64,
    /// Scheduling hint for the host application.
    pub sync_interval_secs: i64,
}

impl ProviderRecord {
    /// True until the provider's first successful sync pass commits.
    pub fn never_synced(&self) -> bool {
        self.cursor == NEVER_SYNCED
    }
}

/// One tracked file: the local side and the remote side of the mirror.
///
/// An entry exists from the moment either side first observes the file
/// until a purge removes it. Modification times are opaque epoch
/// milliseconds reported by the remote store; the engine only compares
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Ledger row id.
    pub id: i64,
    /// Owning provider row id.
    pub provider_id: i64,
    /// On-disk artifact name, once a fetch has completed.
    pub local_artifact: Option<String>,
    /// Title recorded at the last local write.
    pub local_title: Option<String>,
    /// Modification time recorded at the last local write.
    pub local_mod_time: Option<i64>,
    /// The user deleted the local copy; the next pass purges it.
    pub local_deleted: bool,
    /// Provider-assigned file id.
    pub remote_id: Option<String>,
    /// Title at the last remote observation.
    pub remote_title: Option<String>,
    /// Modification time at the last remote observation.
    pub remote_mod_time: Option<i64>,
    /// The remote side was tombstoned (deleted or no longer eligible).
    pub remote_deleted: bool,
}

/// Identifies a file within one pass: either a persisted row, or the i-th
/// entry added by the same pass's merge ops (which has no row id until the
/// pass commits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Existing(i64),
    Added(usize),
}

/// A remote-side ledger mutation staged by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOp {
    /// Rewrite an entry's remote side and clear its remote-deleted flag.
    UpdateRemote {
        entry_id: i64,
        remote_id: String,
        title: String,
        mod_time: i64,
    },
    /// Flag an entry's remote side as deleted.
    MarkRemoteDeleted { entry_id: i64 },
    /// Create an entry for a newly observed remote file; the local side
    /// starts empty. Ops of this kind are numbered in order as
    /// [`EntryKey::Added`].
    AddRemote {
        remote_id: String,
        title: String,
        mod_time: i64,
    },
}

/// A local-side ledger mutation staged by the transfer executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOp {
    /// Record a completed fetch: artifact name, title and modification time
    /// taken from the remote side; clears the local-deleted flag.
    SetLocal {
        key: EntryKey,
        artifact: String,
        title: String,
        mod_time: i64,
    },
    /// Drop the entry after a completed purge.
    Remove { key: EntryKey },
}
