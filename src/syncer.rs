//! Sync orchestrator.
//!
//! One [`Syncer::run_sync`] call is one pass for one account: pick full or
//! incremental listing by the stored cursor, build the observation set,
//! reconcile it against the ledger snapshot, execute the plan, and commit
//! every ledger mutation together with the new cursor in one transaction.
//! Listing failures abort the pass with nothing committed; per-file
//! transfer failures are isolated by the executor and the pass still
//! commits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;

use crate::artifact::ArtifactStore;
use crate::executor::TransferExecutor;
use crate::ledger::{LedgerError, LedgerStore, ProviderRecord};
use crate::reconcile::{reconcile, Observation, ObservationSet, SnapshotEntry};
use crate::remote::{RemoteError, RemoteStore};

/// Errors that abort a sync pass.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No provider is registered for the account.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    /// A listing call failed; nothing was committed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The ledger failed; the pass transaction rolled back.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Internal synchronization failure (a poisoned lock).
    #[error("Lock error: {0}")]
    Lock(String),
}

/// Sync behavior knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Extension a remote file must carry to take part in sync, without
    /// the leading dot.
    pub extension: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            extension: "psafe3".to_string(),
        }
    }
}

/// What one committed pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub account: String,
    /// Cursor committed by this pass.
    pub cursor: i64,
    /// Whether this pass ran the full-listing strategy.
    pub full_sync: bool,
    pub fetched: usize,
    pub purged: usize,
    /// Files whose transfer failed and were left for the next pass.
    pub failed: usize,
}

/// Drives sync passes against injected collaborators.
///
/// All collaborators arrive through the constructor; the syncer owns no
/// ambient state. A `Syncer` can be shared across tasks: passes for
/// different accounts run concurrently, passes for the same account are
/// serialized.
pub struct Syncer {
    ledger: Arc<dyn LedgerStore>,
    remote: Arc<dyn RemoteStore>,
    artifacts: Arc<dyn ArtifactStore>,
    executor: TransferExecutor,
    config: SyncConfig,
    /// One lock per account, created on first use.
    locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl Syncer {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        remote: Arc<dyn RemoteStore>,
        artifacts: Arc<dyn ArtifactStore>,
        config: SyncConfig,
    ) -> Self {
        let executor = TransferExecutor::new(remote.clone(), artifacts.clone());
        Self {
            ledger,
            remote,
            artifacts,
            executor,
            config,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Register a new account. Fails if the account already has a provider
    /// row.
    pub async fn register_account(&self, account: &str) -> Result<ProviderRecord, SyncError> {
        Ok(self.ledger.create_provider(account).await?)
    }

    /// Remove an account: delete every synced artifact, then the ledger
    /// rows. Serialized against passes for the same account.
    pub async fn remove_account(&self, account: &str) -> Result<(), SyncError> {
        let lock = self.pass_lock(account)?;
        let _guard = lock.lock_owned().await;

        let entries = self.ledger.list_entries(account).await?;
        for entry in &entries {
            if let Some(name) = entry.local_artifact.as_deref() {
                if let Err(e) = self.artifacts.delete(name).await {
                    tracing::warn!(artifact = %name, error = %e, "Could not delete artifact");
                }
            }
        }
        self.ledger.delete_provider(account, &|_| {}).await?;

        // Dropped only after a successful delete, so a failed removal keeps
        // serializing against the same lock. A re-registered account gets a
        // fresh one.
        self.locks
            .lock()
            .map_err(|e| SyncError::Lock(e.to_string()))?
            .remove(account);

        tracing::info!(account = %account, entries = entries.len(), "Removed account");
        Ok(())
    }

    /// Run one sync pass for an account.
    pub async fn run_sync(&self, account: &str) -> Result<SyncReport, SyncError> {
        let lock = self.pass_lock(account)?;
        let _guard = lock.lock_owned().await;

        let provider = self
            .ledger
            .provider(account)
            .await?
            .ok_or_else(|| SyncError::UnknownProvider(account.to_string()))?;

        let full = provider.never_synced();
        tracing::info!(
            account = %account,
            cursor = provider.cursor,
            full,
            "Starting sync pass"
        );

        // Listing phase. Any failure here surfaces to the caller with the
        // ledger untouched.
        let (observations, new_cursor) = if full {
            self.full_listing().await?
        } else {
            self.changes_since(provider.cursor).await?
        };

        // Snapshot with on-disk probes so reconciliation stays pure.
        let entries = self.ledger.list_entries(account).await?;
        let mut snapshot = Vec::with_capacity(entries.len());
        for entry in entries {
            let artifact_present = match entry.local_artifact.as_deref() {
                Some(name) => match self.artifacts.exists(name).await {
                    Ok(present) => present,
                    Err(e) => {
                        tracing::warn!(
                            artifact = %name,
                            error = %e,
                            "Could not probe artifact, assuming missing"
                        );
                        false
                    }
                },
                None => false,
            };
            snapshot.push(SnapshotEntry {
                entry,
                artifact_present,
            });
        }

        let plan = reconcile(&snapshot, &observations);
        let (fetch, purge, noop) = plan.counts();
        tracing::debug!(
            observations = observations.len(),
            fetch,
            purge,
            noop,
            "Reconciled"
        );

        let outcome = self.executor.execute(&plan.files).await;

        self.ledger
            .commit_pass(provider.id, &plan.merges, &outcome.ops, new_cursor)
            .await?;

        let report = SyncReport {
            account: account.to_string(),
            cursor: new_cursor,
            full_sync: full,
            fetched: outcome.fetched,
            purged: outcome.purged,
            failed: outcome.failed,
        };
        tracing::info!(
            account = %account,
            cursor = report.cursor,
            fetched = report.fetched,
            purged = report.purged,
            failed = report.failed,
            "Sync pass finished"
        );
        Ok(report)
    }

    /// Full-listing strategy: capture the change marker, then page through
    /// every eligible file.
    async fn full_listing(&self) -> Result<(ObservationSet, i64), SyncError> {
        // Captured before listing so anything that changes while we page
        // lands after the recorded cursor and is seen by the next
        // incremental pass.
        let marker = self.remote.current_change_marker().await?;

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.remote.list_files(page_token.as_deref()).await?;
            tracing::debug!(files = page.files.len(), "Full listing page");
            files.extend(
                page.files
                    .into_iter()
                    .filter(|f| f.is_eligible(&self.config.extension)),
            );
            match page.next_page {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok((ObservationSet::full(files), marker))
    }

    /// Incremental strategy: page through changes strictly after the
    /// cursor. Deleted or no-longer-eligible files become tombstones. The
    /// returned cursor never regresses.
    async fn changes_since(&self, cursor: i64) -> Result<(ObservationSet, i64), SyncError> {
        let mut observations = Vec::new();
        let mut max_seen = cursor;
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .remote
                .list_changes(cursor, page_token.as_deref())
                .await?;
            tracing::debug!(changes = page.changes.len(), "Change page");
            for change in page.changes {
                max_seen = max_seen.max(change.change_id);
                let observation = match change.file {
                    Some(desc) if desc.is_eligible(&self.config.extension) => {
                        Observation::Seen(desc)
                    }
                    _ => Observation::Tombstone {
                        remote_id: change.remote_id,
                    },
                };
                observations.push(observation);
            }
            match page.next_page {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok((ObservationSet::delta(observations), max_seen))
    }

    fn pass_lock(&self, account: &str) -> Result<Arc<TokioMutex<()>>, SyncError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| SyncError::Lock(e.to_string()))?;
        Ok(locks.entry(account.to_string()).or_default().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    use bytes::Bytes;
    use futures_util::stream;
    use futures_util::StreamExt;
    use tokio::sync::Semaphore;

    use crate::artifact::{ArtifactError, DirArtifactStore};
    use crate::ledger::{FileEntry, SqliteLedger, NEVER_SYNCED};
    use crate::remote::{ByteStream, ChangePage, FileDescriptor, FilePage, RemoteChange};

    const ACCOUNT: &str = "user@example.com";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[derive(Clone, Copy)]
    enum ListingFailure {
        None,
        Network,
        Auth,
    }

    /// Two-way gate for pinning a pass inside a listing call.
    struct ListingGate {
        entered: Semaphore,
        open: Semaphore,
    }

    impl ListingGate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entered: Semaphore::new(0),
                open: Semaphore::new(0),
            })
        }

        /// Wait until a listing call has reached the gate.
        async fn wait_entered(&self) {
            self.entered.acquire().await.unwrap().forget();
        }

        /// Let all current and future listing calls through.
        fn release(&self) {
            self.open.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    struct FakeDrive {
        page_size: usize,
        marker: StdMutex<i64>,
        files: StdMutex<Vec<FileDescriptor>>,
        changes: StdMutex<Vec<RemoteChange>>,
        contents: StdMutex<HashMap<String, Bytes>>,
        listing_failure: StdMutex<ListingFailure>,
        listing_gate: StdMutex<Option<Arc<ListingGate>>>,
        listings_entered: StdMutex<usize>,
        trashed: StdMutex<Vec<String>>,
    }

    impl FakeDrive {
        fn new(page_size: usize) -> Self {
            Self {
                page_size,
                marker: StdMutex::new(0),
                files: StdMutex::new(Vec::new()),
                changes: StdMutex::new(Vec::new()),
                contents: StdMutex::new(HashMap::new()),
                listing_failure: StdMutex::new(ListingFailure::None),
                listing_gate: StdMutex::new(None),
                listings_entered: StdMutex::new(0),
                trashed: StdMutex::new(Vec::new()),
            }
        }

        fn gate_listings(&self, gate: Arc<ListingGate>) {
            *self.listing_gate.lock().unwrap() = Some(gate);
        }

        fn listings_entered(&self) -> usize {
            *self.listings_entered.lock().unwrap()
        }

        /// Counts the call and parks on the gate when one is installed.
        async fn enter_listing(&self) {
            let gate = {
                *self.listings_entered.lock().unwrap() += 1;
                self.listing_gate.lock().unwrap().clone()
            };
            if let Some(gate) = gate {
                gate.entered.add_permits(1);
                let _permit = gate.open.acquire().await.unwrap();
            }
        }

        fn set_marker(&self, marker: i64) {
            *self.marker.lock().unwrap() = marker;
        }

        fn add_file(&self, desc: FileDescriptor, content: &[u8]) {
            self.contents
                .lock()
                .unwrap()
                .insert(desc.id.clone(), Bytes::copy_from_slice(content));
            self.files.lock().unwrap().push(desc);
        }

        fn update_content(&self, id: &str, content: &[u8]) {
            self.contents
                .lock()
                .unwrap()
                .insert(id.to_string(), Bytes::copy_from_slice(content));
        }

        fn record_change(&self, change_id: i64, remote_id: &str, file: Option<FileDescriptor>) {
            self.changes.lock().unwrap().push(RemoteChange {
                change_id,
                remote_id: remote_id.to_string(),
                file,
            });
        }

        fn fail_listings_with(&self, failure: ListingFailure) {
            *self.listing_failure.lock().unwrap() = failure;
        }

        fn trash_calls(&self) -> Vec<String> {
            self.trashed.lock().unwrap().clone()
        }

        fn listing_error(&self) -> Option<RemoteError> {
            match *self.listing_failure.lock().unwrap() {
                ListingFailure::None => None,
                ListingFailure::Network => {
                    Some(RemoteError::Network("connection reset".to_string()))
                }
                ListingFailure::Auth => Some(RemoteError::Auth("token expired".to_string())),
            }
        }

        fn page<T: Clone>(&self, items: &[T], token: Option<&str>) -> (Vec<T>, Option<String>) {
            let offset: usize = token.and_then(|t| t.parse().ok()).unwrap_or(0);
            let end = (offset + self.page_size).min(items.len());
            let next = if end < items.len() {
                Some(end.to_string())
            } else {
                None
            };
            (items[offset..end].to_vec(), next)
        }
    }

    #[async_trait::async_trait]
    impl RemoteStore for FakeDrive {
        async fn current_change_marker(&self) -> Result<i64, RemoteError> {
            self.enter_listing().await;
            if let Some(e) = self.listing_error() {
                return Err(e);
            }
            Ok(*self.marker.lock().unwrap())
        }

        async fn list_files(&self, page_token: Option<&str>) -> Result<FilePage, RemoteError> {
            self.enter_listing().await;
            if let Some(e) = self.listing_error() {
                return Err(e);
            }
            let files = self.files.lock().unwrap().clone();
            let (files, next_page) = self.page(&files, page_token);
            Ok(FilePage { files, next_page })
        }

        async fn list_changes(
            &self,
            since: i64,
            page_token: Option<&str>,
        ) -> Result<ChangePage, RemoteError> {
            self.enter_listing().await;
            if let Some(e) = self.listing_error() {
                return Err(e);
            }
            let changes: Vec<RemoteChange> = self
                .changes
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.change_id > since)
                .cloned()
                .collect();
            let (changes, next_page) = self.page(&changes, page_token);
            Ok(ChangePage { changes, next_page })
        }

        async fn fetch_content(&self, remote_id: &str) -> Result<ByteStream, RemoteError> {
            match self.contents.lock().unwrap().get(remote_id) {
                Some(bytes) => {
                    let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(bytes.clone())];
                    Ok(stream::iter(chunks).boxed())
                }
                None => Err(RemoteError::NotFound(remote_id.to_string())),
            }
        }

        async fn trash(&self, remote_id: &str) -> Result<(), RemoteError> {
            self.trashed.lock().unwrap().push(remote_id.to_string());
            Ok(())
        }
    }

    /// Artifact store that fails the first N writes, for failure-isolation
    /// tests.
    struct FailingArtifacts {
        inner: DirArtifactStore,
        remaining_failures: StdMutex<usize>,
    }

    #[async_trait::async_trait]
    impl ArtifactStore for FailingArtifacts {
        async fn write(&self, name: &str, content: ByteStream) -> Result<(), ArtifactError> {
            {
                let mut remaining = self.remaining_failures.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ArtifactError::Io(std::io::Error::other("disk full")));
                }
            }
            self.inner.write(name, content).await
        }

        async fn delete(&self, name: &str) -> Result<(), ArtifactError> {
            self.inner.delete(name).await
        }

        async fn exists(&self, name: &str) -> Result<bool, ArtifactError> {
            self.inner.exists(name).await
        }

        async fn set_mod_time(&self, name: &str, mod_time: i64) -> Result<(), ArtifactError> {
            self.inner.set_mod_time(name, mod_time).await
        }
    }

    fn desc(id: &str, title: &str, mod_time: i64) -> FileDescriptor {
        FileDescriptor {
            id: id.to_string(),
            title: title.to_string(),
            extension: "psafe3".to_string(),
            mod_time,
            trashed: false,
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("psafe_sync")
            .join("syncer_tests")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    struct Fixture {
        syncer: Syncer,
        ledger: Arc<SqliteLedger>,
        drive: Arc<FakeDrive>,
        artifacts: Arc<DirArtifactStore>,
    }

    async fn fixture(name: &str, page_size: usize) -> Fixture {
        init_tracing();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let drive = Arc::new(FakeDrive::new(page_size));
        let artifacts = Arc::new(DirArtifactStore::open(&test_dir(name)).await.unwrap());
        let syncer = Syncer::new(
            ledger.clone(),
            drive.clone(),
            artifacts.clone(),
            SyncConfig::default(),
        );
        syncer.register_account(ACCOUNT).await.unwrap();
        Fixture {
            syncer,
            ledger,
            drive,
            artifacts,
        }
    }

    fn entry_by_remote_id(entries: &[FileEntry], remote_id: &str) -> FileEntry {
        entries
            .iter()
            .find(|e| e.remote_id.as_deref() == Some(remote_id))
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_sync_fetches_every_eligible_file() {
        let fx = fixture("full_sync", 1).await;
        fx.drive.set_marker(7);
        fx.drive.add_file(desc("rem-a", "personal", 1_000), b"personal vault");
        fx.drive.add_file(desc("rem-b", "work", 2_000), b"work vault");

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert!(report.full_sync);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.cursor, 7);
        assert_eq!(fx.ledger.get_cursor(ACCOUNT).await.unwrap(), 7);

        let entries = fx.ledger.list_entries(ACCOUNT).await.unwrap();
        assert_eq!(entries.len(), 2);
        let a = entry_by_remote_id(&entries, "rem-a");
        assert_eq!(a.local_title.as_deref(), Some("personal.psafe3"));
        assert_eq!(a.local_mod_time, Some(1_000));
        assert!(!a.local_deleted);

        let artifact = a.local_artifact.unwrap();
        let content = std::fs::read(fx.artifacts.path(&artifact)).unwrap();
        assert_eq!(content, b"personal vault");
        let meta = std::fs::metadata(fx.artifacts.path(&artifact)).unwrap();
        assert_eq!(
            meta.modified().unwrap(),
            std::time::UNIX_EPOCH + std::time::Duration::from_millis(1_000)
        );
    }

    #[tokio::test]
    async fn test_full_sync_skips_ineligible_files() {
        let fx = fixture("skip_ineligible", 10).await;
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"vault");
        fx.drive.add_file(
            FileDescriptor {
                trashed: true,
                ..desc("rem-trash", "old", 500)
            },
            b"trashed",
        );
        fx.drive.add_file(
            FileDescriptor {
                extension: "txt".to_string(),
                ..desc("rem-txt", "notes", 600)
            },
            b"notes",
        );

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert_eq!(report.fetched, 1);
        let entries = fx.ledger.list_entries(ACCOUNT).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].remote_id.as_deref(), Some("rem-a"));
    }

    #[tokio::test]
    async fn test_second_pass_is_incremental_and_idle() {
        let fx = fixture("idle", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");

        let first = fx.syncer.run_sync(ACCOUNT).await.unwrap();
        assert!(first.full_sync);
        assert_eq!(first.cursor, 10);

        // No changes recorded: the incremental pass does nothing and keeps
        // the cursor.
        let second = fx.syncer.run_sync(ACCOUNT).await.unwrap();
        assert!(!second.full_sync);
        assert_eq!(second.fetched + second.purged + second.failed, 0);
        assert_eq!(second.cursor, 10);
    }

    #[tokio::test]
    async fn test_replayed_change_is_a_no_op() {
        let fx = fixture("replay", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.syncer.run_sync(ACCOUNT).await.unwrap();
        let before = fx.ledger.list_entries(ACCOUNT).await.unwrap();

        // Providers may deliver a change the pass already applied. It must
        // merge into the existing row and download nothing.
        fx.drive.record_change(11, "rem-a", Some(desc("rem-a", "vault", 1_000)));

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert_eq!(report.fetched + report.purged + report.failed, 0);
        assert_eq!(report.cursor, 11);
        let after = fx.ledger.list_entries(ACCOUNT).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before[0].id);
        assert_eq!(after[0].local_mod_time, Some(1_000));
    }

    #[tokio::test]
    async fn test_incremental_fetches_changed_file() {
        let fx = fixture("incremental", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.syncer.run_sync(ACCOUNT).await.unwrap();

        fx.drive.update_content("rem-a", b"v2");
        fx.drive.record_change(11, "rem-a", Some(desc("rem-a", "vault", 5_000)));

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert!(!report.full_sync);
        assert_eq!(report.fetched, 1);
        assert_eq!(report.cursor, 11);

        let entries = fx.ledger.list_entries(ACCOUNT).await.unwrap();
        let a = entry_by_remote_id(&entries, "rem-a");
        assert_eq!(a.local_mod_time, Some(5_000));
        assert_eq!(a.remote_mod_time, Some(5_000));
        let content = std::fs::read(fx.artifacts.path(&a.local_artifact.unwrap())).unwrap();
        assert_eq!(content, b"v2");
    }

    #[tokio::test]
    async fn test_incremental_tombstone_purges_file() {
        let fx = fixture("tombstone", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.syncer.run_sync(ACCOUNT).await.unwrap();

        let entries = fx.ledger.list_entries(ACCOUNT).await.unwrap();
        let artifact = entries[0].local_artifact.clone().unwrap();
        assert!(fx.artifacts.exists(&artifact).await.unwrap());

        fx.drive.record_change(11, "rem-a", None);

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert_eq!(report.purged, 1);
        assert_eq!(report.cursor, 11);
        assert!(fx.ledger.list_entries(ACCOUNT).await.unwrap().is_empty());
        assert!(!fx.artifacts.exists(&artifact).await.unwrap());
        // The remote copy was already gone; no trash call was made.
        assert!(fx.drive.trash_calls().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_new_file_is_fetched() {
        let fx = fixture("new_file", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.syncer.run_sync(ACCOUNT).await.unwrap();

        fx.drive.update_content("rem-b", b"fresh");
        fx.drive.record_change(12, "rem-b", Some(desc("rem-b", "second", 3_000)));

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(report.cursor, 12);
        let entries = fx.ledger.list_entries(ACCOUNT).await.unwrap();
        assert_eq!(entries.len(), 2);
        let b = entry_by_remote_id(&entries, "rem-b");
        assert_eq!(b.remote_title.as_deref(), Some("second.psafe3"));
        assert!(b.local_artifact.is_some());
    }

    #[tokio::test]
    async fn test_file_turning_ineligible_is_purged_without_trash() {
        let fx = fixture("turned_ineligible", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.syncer.run_sync(ACCOUNT).await.unwrap();

        // The file still exists remotely but was renamed to another
        // extension; it must be purged locally and never trashed remotely.
        fx.drive.record_change(
            11,
            "rem-a",
            Some(FileDescriptor {
                extension: "txt".to_string(),
                ..desc("rem-a", "vault", 4_000)
            }),
        );

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert_eq!(report.purged, 1);
        assert!(fx.ledger.list_entries(ACCOUNT).await.unwrap().is_empty());
        assert!(fx.drive.trash_calls().is_empty());
    }

    #[tokio::test]
    async fn test_local_deletion_trashes_remote() {
        let fx = fixture("local_delete", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.syncer.run_sync(ACCOUNT).await.unwrap();

        let entries = fx.ledger.list_entries(ACCOUNT).await.unwrap();
        fx.ledger.mark_local_deleted(entries[0].id).await.unwrap();

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert_eq!(report.purged, 1);
        assert!(fx.ledger.list_entries(ACCOUNT).await.unwrap().is_empty());
        assert_eq!(fx.drive.trash_calls(), vec!["rem-a".to_string()]);
    }

    #[tokio::test]
    async fn test_transfer_failure_still_commits_pass() {
        init_tracing();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let drive = Arc::new(FakeDrive::new(10));
        let inner = DirArtifactStore::open(&test_dir("fail_commit")).await.unwrap();
        let artifacts = Arc::new(FailingArtifacts {
            inner,
            remaining_failures: StdMutex::new(1),
        });
        let syncer = Syncer::new(
            ledger.clone(),
            drive.clone(),
            artifacts,
            SyncConfig::default(),
        );
        syncer.register_account(ACCOUNT).await.unwrap();

        drive.set_marker(5);
        drive.add_file(desc("rem-a", "first", 1_000), b"a");
        drive.add_file(desc("rem-b", "second", 2_000), b"b");

        // The first write fails; the pass still succeeds and commits.
        let report = syncer.run_sync(ACCOUNT).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cursor, 5);
        assert_eq!(ledger.get_cursor(ACCOUNT).await.unwrap(), 5);

        let entries = ledger.list_entries(ACCOUNT).await.unwrap();
        assert_eq!(entries.len(), 2);
        // The failed entry kept its remote-only state for the next pass
        let failed = entry_by_remote_id(&entries, "rem-a");
        assert!(failed.local_artifact.is_none());
        assert!(failed.local_mod_time.is_none());
        let ok = entry_by_remote_id(&entries, "rem-b");
        assert!(ok.local_artifact.is_some());
    }

    #[tokio::test]
    async fn test_failed_entry_is_retried_next_pass() {
        init_tracing();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let drive = Arc::new(FakeDrive::new(10));
        let dir = test_dir("retry");
        let failing = Arc::new(FailingArtifacts {
            inner: DirArtifactStore::open(&dir).await.unwrap(),
            remaining_failures: StdMutex::new(1),
        });
        let syncer = Syncer::new(
            ledger.clone(),
            drive.clone(),
            failing,
            SyncConfig::default(),
        );
        syncer.register_account(ACCOUNT).await.unwrap();

        drive.set_marker(5);
        drive.add_file(desc("rem-a", "vault", 1_000), b"a");
        let report = syncer.run_sync(ACCOUNT).await.unwrap();
        assert_eq!(report.failed, 1);

        // A healthy store on the next pass: the entry still has no local
        // side, so it is fetched again without any new remote change.
        let healthy = Arc::new(DirArtifactStore::open(&dir).await.unwrap());
        let syncer = Syncer::new(ledger.clone(), drive, healthy, SyncConfig::default());
        let report = syncer.run_sync(ACCOUNT).await.unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(report.failed, 0);
        let entries = ledger.list_entries(ACCOUNT).await.unwrap();
        assert!(entries[0].local_artifact.is_some());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_without_commit() {
        let fx = fixture("abort_network", 2).await;
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.drive.fail_listings_with(ListingFailure::Network);

        let result = fx.syncer.run_sync(ACCOUNT).await;
        assert!(matches!(result, Err(SyncError::Remote(RemoteError::Network(_)))));

        // Nothing committed: still never-synced, no entries.
        assert_eq!(fx.ledger.get_cursor(ACCOUNT).await.unwrap(), NEVER_SYNCED);
        assert!(fx.ledger.list_entries(ACCOUNT).await.unwrap().is_empty());

        // Once the network recovers the same pass goes through.
        fx.drive.fail_listings_with(ListingFailure::None);
        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();
        assert_eq!(report.fetched, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_without_commit() {
        let fx = fixture("abort_auth", 2).await;
        fx.drive.fail_listings_with(ListingFailure::Auth);

        let result = fx.syncer.run_sync(ACCOUNT).await;
        assert!(matches!(result, Err(SyncError::Remote(RemoteError::Auth(_)))));
        assert_eq!(fx.ledger.get_cursor(ACCOUNT).await.unwrap(), NEVER_SYNCED);
    }

    #[tokio::test]
    async fn test_unknown_account_is_an_error() {
        let fx = fixture("unknown", 2).await;
        let result = fx.syncer.run_sync("nobody@example.com").await;
        assert!(matches!(result, Err(SyncError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let fx = fixture("monotonic", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();
        assert_eq!(report.cursor, 10);

        // Idle pass: cursor holds.
        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();
        assert_eq!(report.cursor, 10);

        // New change: cursor advances to the largest change id seen.
        fx.drive.record_change(12, "rem-a", Some(desc("rem-a", "vault", 2_000)));
        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();
        assert_eq!(report.cursor, 12);
    }

    #[tokio::test]
    async fn test_change_pagination_collects_all_pages() {
        let fx = fixture("change_pages", 1).await;
        fx.drive.set_marker(10);
        fx.syncer.run_sync(ACCOUNT).await.unwrap();

        for (i, id) in ["rem-a", "rem-b", "rem-c"].iter().enumerate() {
            fx.drive.update_content(id, b"content");
            fx.drive
                .record_change(11 + i as i64, id, Some(desc(id, id, 1_000)));
        }

        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.cursor, 13);
        assert_eq!(fx.ledger.list_entries(ACCOUNT).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_same_account_passes_are_serialized() {
        init_tracing();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let drive = Arc::new(FakeDrive::new(10));
        let artifacts = Arc::new(DirArtifactStore::open(&test_dir("serialized")).await.unwrap());
        let syncer = Arc::new(Syncer::new(
            ledger,
            drive.clone(),
            artifacts,
            SyncConfig::default(),
        ));
        syncer.register_account(ACCOUNT).await.unwrap();
        drive.set_marker(5);
        drive.add_file(desc("rem-a", "vault", 1_000), b"v1");

        let gate = ListingGate::new();
        drive.gate_listings(gate.clone());

        let first = tokio::spawn({
            let syncer = syncer.clone();
            async move { syncer.run_sync(ACCOUNT).await }
        });
        // The first pass now holds the account lock, parked inside its
        // listing call.
        gate.wait_entered().await;
        assert_eq!(drive.listings_entered(), 1);

        let second = tokio::spawn({
            let syncer = syncer.clone();
            async move { syncer.run_sync(ACCOUNT).await }
        });
        // Give the second pass plenty of chances to run; it must park on
        // the account lock without reaching the remote store.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(drive.listings_entered(), 1);

        gate.release();
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        // The second pass ran after the first committed: it saw the stored
        // cursor and went incremental instead of repeating the full listing.
        assert!(first.full_sync);
        assert_eq!(first.fetched, 1);
        assert!(!second.full_sync);
        assert_eq!(second.cursor, 5);
        assert_eq!(second.fetched, 0);
    }

    #[tokio::test]
    async fn test_remove_account_purges_everything() {
        let fx = fixture("remove_account", 2).await;
        fx.drive.set_marker(10);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.syncer.run_sync(ACCOUNT).await.unwrap();

        let entries = fx.ledger.list_entries(ACCOUNT).await.unwrap();
        let artifact = entries[0].local_artifact.clone().unwrap();
        assert!(fx.artifacts.exists(&artifact).await.unwrap());

        fx.syncer.remove_account(ACCOUNT).await.unwrap();

        assert!(fx.ledger.provider(ACCOUNT).await.unwrap().is_none());
        assert!(!fx.artifacts.exists(&artifact).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_account_drops_its_pass_lock() {
        let fx = fixture("drop_lock", 2).await;
        fx.drive.set_marker(5);
        fx.drive.add_file(desc("rem-a", "vault", 1_000), b"v1");
        fx.syncer.run_sync(ACCOUNT).await.unwrap();
        assert!(fx.syncer.locks.lock().unwrap().contains_key(ACCOUNT));

        fx.syncer.remove_account(ACCOUNT).await.unwrap();
        assert!(!fx.syncer.locks.lock().unwrap().contains_key(ACCOUNT));

        // Re-registering starts over with a fresh lock and a full sync.
        fx.syncer.register_account(ACCOUNT).await.unwrap();
        let report = fx.syncer.run_sync(ACCOUNT).await.unwrap();
        assert!(report.full_sync);
        assert_eq!(report.fetched, 1);
    }

    #[tokio::test]
    async fn test_register_account_twice_fails() {
        let fx = fixture("register_twice", 2).await;
        let result = fx.syncer.register_account(ACCOUNT).await;
        assert!(matches!(
            result,
            Err(SyncError::Ledger(LedgerError::DuplicateProvider(_)))
        ));
    }
}
