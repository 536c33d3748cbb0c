//! Ledger store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use super::error::LedgerError;
use super::schema;
use super::types::{
    EntryKey, ExecOp, FileEntry, MergeOp, ProviderRecord, DEFAULT_SYNC_INTERVAL_SECS,
    MOD_TIME_ABSENT, NEVER_SYNCED,
};

/// Trait for sync ledger operations.
///
/// This trait is object-safe and can be used with `Arc<dyn LedgerStore>` for
/// shared access across async tasks. Mutations staged by a sync pass go
/// through [`LedgerStore::commit_pass`]; the per-entry methods exist for the
/// host application (registering local writes and deletions) and for
/// inspection.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create a provider row for an account.
    ///
    /// New providers start at the [`NEVER_SYNCED`] cursor with the default
    /// sync interval. An existing row for the same account is an error, not
    /// an upsert.
    async fn create_provider(&self, account: &str) -> Result<ProviderRecord, LedgerError>;

    /// Delete a provider and every file entry under it.
    ///
    /// `purge` is invoked for each entry before its row is deleted, so the
    /// caller can remove the on-disk artifact. All row deletions happen in
    /// one transaction.
    async fn delete_provider(
        &self,
        account: &str,
        purge: &(dyn for<'a> Fn(&'a FileEntry) + Send + Sync),
    ) -> Result<(), LedgerError>;

    /// Look up a provider by account.
    async fn provider(&self, account: &str) -> Result<Option<ProviderRecord>, LedgerError>;

    /// All providers, ordered by account.
    async fn list_providers(&self) -> Result<Vec<ProviderRecord>, LedgerError>;

    /// The provider's sync cursor. Unknown accounts are an error — a caller
    /// must never confuse "no such provider" with "never synced".
    async fn get_cursor(&self, account: &str) -> Result<i64, LedgerError>;

    /// Overwrite the provider's sync cursor.
    async fn set_cursor(&self, account: &str, cursor: i64) -> Result<(), LedgerError>;

    /// All file entries under a provider, in no particular order.
    async fn list_entries(&self, account: &str) -> Result<Vec<FileEntry>, LedgerError>;

    /// Look up a single file entry by row id.
    async fn entry(&self, entry_id: i64) -> Result<Option<FileEntry>, LedgerError>;

    /// Create an entry for a newly observed remote file; the local side
    /// starts empty. Returns the new entry id.
    async fn add_remote_file(
        &self,
        account: &str,
        remote_id: &str,
        title: &str,
        mod_time: i64,
    ) -> Result<i64, LedgerError>;

    /// Rewrite an entry's remote side and clear its remote-deleted flag.
    async fn update_remote_file(
        &self,
        entry_id: i64,
        remote_id: &str,
        title: &str,
        mod_time: i64,
    ) -> Result<(), LedgerError>;

    /// Flag an entry's remote side as deleted.
    async fn mark_remote_deleted(&self, entry_id: i64) -> Result<(), LedgerError>;

    /// Rewrite an entry's local side after a completed fetch and clear its
    /// local-deleted flag.
    async fn update_local_file(
        &self,
        entry_id: i64,
        artifact: &str,
        title: &str,
        mod_time: i64,
    ) -> Result<(), LedgerError>;

    /// Flag an entry's local side as deleted (the user removed the local
    /// copy; the next pass purges the entry).
    async fn mark_local_deleted(&self, entry_id: i64) -> Result<(), LedgerError>;

    /// Delete a file entry row.
    async fn remove_entry(&self, entry_id: i64) -> Result<(), LedgerError>;

    /// Apply a whole sync pass — merge ops, executor ops and the cursor
    /// update — in one transaction.
    ///
    /// Nothing of a pass touches the database before this call, so a pass
    /// that dies earlier leaves the ledger exactly as it was. `Added` keys
    /// in `execs` refer to `AddRemote` merge ops of the same pass, in
    /// order.
    async fn commit_pass(
        &self,
        provider_id: i64,
        merges: &[MergeOp],
        execs: &[ExecOp],
        cursor: i64,
    ) -> Result<(), LedgerError>;
}

/// SQLite implementation of the sync ledger.
pub struct SqliteLedger {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    /// Open runs on spawn_blocking; individual statements are short enough
    /// to run on the async thread under the lock.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open or create a ledger database at the given path.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| LedgerError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            configure(&conn)?;
            schema::migrate(&conn)?;

            Ok::<_, LedgerError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory ledger. Intended for tests — both this crate's and
    /// a host application's.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| LedgerError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        configure(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|e| LedgerError::Query(e.to_string()))
    }
}

/// Connection pragmas applied on every open.
fn configure(conn: &Connection) -> Result<(), LedgerError> {
    // Enable WAL mode for better concurrent read/write performance
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(LedgerError::Migration)?;

    // Use NORMAL synchronous mode for better performance
    // (still safe with WAL mode)
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(LedgerError::Migration)?;

    // files.provider_id references providers.id
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(LedgerError::Migration)?;

    Ok(())
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn create_provider(&self, account: &str) -> Result<ProviderRecord, LedgerError> {
        let conn = self.lock()?;

        let inserted = conn.execute(
            "INSERT INTO providers (account, cursor, sync_interval_secs) VALUES (?1, ?2, ?3)",
            rusqlite::params![account, NEVER_SYNCED, DEFAULT_SYNC_INTERVAL_SECS],
        );

        match inserted {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                tracing::debug!(account = %account, id, "Created provider");
                Ok(ProviderRecord {
                    id,
                    account: account.to_string(),
                    cursor: NEVER_SYNCED,
                    sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
                })
            }
            Err(rusqlite::Error::SqliteFailure(f, _))
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(LedgerError::DuplicateProvider(account.to_string()))
            }
            Err(e) => Err(LedgerError::query(e)),
        }
    }

    async fn delete_provider(
        &self,
        account: &str,
        purge: &(dyn for<'a> Fn(&'a FileEntry) + Send + Sync),
    ) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        conn.execute("BEGIN TRANSACTION", [])
            .map_err(LedgerError::query)?;

        let result = (|| {
            let provider = provider_by_account(&conn, account)?
                .ok_or_else(|| LedgerError::UnknownProvider(account.to_string()))?;

            let entries = entries_for_provider(&conn, provider.id)?;
            for entry in &entries {
                purge(entry);
            }

            conn.execute(
                "DELETE FROM files WHERE provider_id = ?1",
                [provider.id],
            )
            .map_err(LedgerError::query)?;
            conn.execute("DELETE FROM providers WHERE id = ?1", [provider.id])
                .map_err(LedgerError::query)?;

            tracing::debug!(
                account = %account,
                entries = entries.len(),
                "Deleted provider"
            );
            Ok::<_, LedgerError>(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", []).map_err(LedgerError::query)?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    async fn provider(&self, account: &str) -> Result<Option<ProviderRecord>, LedgerError> {
        let conn = self.lock()?;
        provider_by_account(&conn, account)
    }

    async fn list_providers(&self) -> Result<Vec<ProviderRecord>, LedgerError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare("SELECT id, account, cursor, sync_interval_secs FROM providers ORDER BY account")
            .map_err(LedgerError::query)?;

        let providers = stmt
            .query_map([], |row| Ok(row_to_provider(row)))
            .map_err(LedgerError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::query)?;

        Ok(providers)
    }

    async fn get_cursor(&self, account: &str) -> Result<i64, LedgerError> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT cursor FROM providers WHERE account = ?1",
            [account],
            |row| row.get(0),
        )
        .optional()
        .map_err(LedgerError::query)?
        .ok_or_else(|| LedgerError::UnknownProvider(account.to_string()))
    }

    async fn set_cursor(&self, account: &str, cursor: i64) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE providers SET cursor = ?1 WHERE account = ?2",
                rusqlite::params![cursor, account],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(LedgerError::UnknownProvider(account.to_string()));
        }
        Ok(())
    }

    async fn list_entries(&self, account: &str) -> Result<Vec<FileEntry>, LedgerError> {
        let conn = self.lock()?;

        let provider = provider_by_account(&conn, account)?
            .ok_or_else(|| LedgerError::UnknownProvider(account.to_string()))?;

        entries_for_provider(&conn, provider.id)
    }

    async fn entry(&self, entry_id: i64) -> Result<Option<FileEntry>, LedgerError> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT id, provider_id, local_artifact, local_title, local_mod_time, local_deleted, remote_id, remote_title, remote_mod_time, remote_deleted FROM files WHERE id = ?1",
            [entry_id],
            |row| Ok(row_to_file_entry(row)),
        )
        .optional()
        .map_err(LedgerError::query)
    }

    async fn add_remote_file(
        &self,
        account: &str,
        remote_id: &str,
        title: &str,
        mod_time: i64,
    ) -> Result<i64, LedgerError> {
        let conn = self.lock()?;

        let provider = provider_by_account(&conn, account)?
            .ok_or_else(|| LedgerError::UnknownProvider(account.to_string()))?;

        conn.execute(
            "INSERT INTO files (provider_id, remote_id, remote_title, remote_mod_time) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![provider.id, remote_id, title, mod_time],
        )
        .map_err(LedgerError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn update_remote_file(
        &self,
        entry_id: i64,
        remote_id: &str,
        title: &str,
        mod_time: i64,
    ) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE files SET remote_id = ?1, remote_title = ?2, remote_mod_time = ?3, remote_deleted = 0 WHERE id = ?4",
                rusqlite::params![remote_id, title, mod_time, entry_id],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(LedgerError::UnknownEntry(entry_id));
        }
        Ok(())
    }

    async fn mark_remote_deleted(&self, entry_id: i64) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE files SET remote_deleted = 1 WHERE id = ?1",
                [entry_id],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(LedgerError::UnknownEntry(entry_id));
        }
        Ok(())
    }

    async fn update_local_file(
        &self,
        entry_id: i64,
        artifact: &str,
        title: &str,
        mod_time: i64,
    ) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE files SET local_artifact = ?1, local_title = ?2, local_mod_time = ?3, local_deleted = 0 WHERE id = ?4",
                rusqlite::params![artifact, title, mod_time, entry_id],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(LedgerError::UnknownEntry(entry_id));
        }
        Ok(())
    }

    async fn mark_local_deleted(&self, entry_id: i64) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE files SET local_deleted = 1 WHERE id = ?1",
                [entry_id],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(LedgerError::UnknownEntry(entry_id));
        }
        Ok(())
    }

    async fn remove_entry(&self, entry_id: i64) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute("DELETE FROM files WHERE id = ?1", [entry_id])
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(LedgerError::UnknownEntry(entry_id));
        }
        Ok(())
    }

    async fn commit_pass(
        &self,
        provider_id: i64,
        merges: &[MergeOp],
        execs: &[ExecOp],
        cursor: i64,
    ) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        conn.execute("BEGIN TRANSACTION", [])
            .map_err(LedgerError::query)?;

        let result = (|| {
            // Row ids assigned to AddRemote ops, in op order; Added exec
            // keys index into this.
            let mut added_ids: Vec<i64> = Vec::new();

            for op in merges {
                match op {
                    MergeOp::UpdateRemote {
                        entry_id,
                        remote_id,
                        title,
                        mod_time,
                    } => {
                        let mut stmt = conn
                            .prepare_cached(
                                "UPDATE files SET remote_id = ?1, remote_title = ?2, remote_mod_time = ?3, remote_deleted = 0 WHERE id = ?4",
                            )
                            .map_err(LedgerError::query)?;
                        stmt.execute(rusqlite::params![remote_id, title, mod_time, entry_id])
                            .map_err(LedgerError::query)?;
                    }
                    MergeOp::MarkRemoteDeleted { entry_id } => {
                        let mut stmt = conn
                            .prepare_cached("UPDATE files SET remote_deleted = 1 WHERE id = ?1")
                            .map_err(LedgerError::query)?;
                        stmt.execute([entry_id]).map_err(LedgerError::query)?;
                    }
                    MergeOp::AddRemote {
                        remote_id,
                        title,
                        mod_time,
                    } => {
                        let mut stmt = conn
                            .prepare_cached(
                                "INSERT INTO files (provider_id, remote_id, remote_title, remote_mod_time) VALUES (?1, ?2, ?3, ?4)",
                            )
                            .map_err(LedgerError::query)?;
                        stmt.execute(rusqlite::params![provider_id, remote_id, title, mod_time])
                            .map_err(LedgerError::query)?;
                        added_ids.push(conn.last_insert_rowid());
                    }
                }
            }

            for op in execs {
                let entry_id = match op {
                    ExecOp::SetLocal { key, .. } | ExecOp::Remove { key } => match key {
                        EntryKey::Existing(id) => *id,
                        EntryKey::Added(i) => added_ids.get(*i).copied().ok_or_else(|| {
                            LedgerError::Query(format!(
                                "pass references added entry {} but only {} were added",
                                i,
                                added_ids.len()
                            ))
                        })?,
                    },
                };

                match op {
                    ExecOp::SetLocal {
                        artifact,
                        title,
                        mod_time,
                        ..
                    } => {
                        let mut stmt = conn
                            .prepare_cached(
                                "UPDATE files SET local_artifact = ?1, local_title = ?2, local_mod_time = ?3, local_deleted = 0 WHERE id = ?4",
                            )
                            .map_err(LedgerError::query)?;
                        stmt.execute(rusqlite::params![artifact, title, mod_time, entry_id])
                            .map_err(LedgerError::query)?;
                    }
                    ExecOp::Remove { .. } => {
                        let mut stmt = conn
                            .prepare_cached("DELETE FROM files WHERE id = ?1")
                            .map_err(LedgerError::query)?;
                        stmt.execute([entry_id]).map_err(LedgerError::query)?;
                    }
                }
            }

            let rows = conn
                .execute(
                    "UPDATE providers SET cursor = ?1 WHERE id = ?2",
                    rusqlite::params![cursor, provider_id],
                )
                .map_err(LedgerError::query)?;
            if rows == 0 {
                return Err(LedgerError::Query(format!(
                    "no provider row {} to commit cursor to",
                    provider_id
                )));
            }

            Ok::<_, LedgerError>(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", []).map_err(LedgerError::query)?;
                tracing::debug!(
                    provider_id,
                    merges = merges.len(),
                    execs = execs.len(),
                    cursor,
                    "Committed sync pass"
                );
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }
}

fn provider_by_account(
    conn: &Connection,
    account: &str,
) -> Result<Option<ProviderRecord>, LedgerError> {
    conn.query_row(
        "SELECT id, account, cursor, sync_interval_secs FROM providers WHERE account = ?1",
        [account],
        |row| Ok(row_to_provider(row)),
    )
    .optional()
    .map_err(LedgerError::query)
}

fn entries_for_provider(
    conn: &Connection,
    provider_id: i64,
) -> Result<Vec<FileEntry>, LedgerError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT id, provider_id, local_artifact, local_title, local_mod_time, local_deleted, remote_id, remote_title, remote_mod_time, remote_deleted FROM files WHERE provider_id = ?1",
        )
        .map_err(LedgerError::query)?;

    let entries = stmt
        .query_map([provider_id], |row| Ok(row_to_file_entry(row)))
        .map_err(LedgerError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerError::query)?;

    Ok(entries)
}

/// Convert a database row to a ProviderRecord.
fn row_to_provider(row: &rusqlite::Row<'_>) -> ProviderRecord {
    ProviderRecord {
        id: row.get(0).unwrap_or_default(),
        account: row.get(1).unwrap_or_default(),
        cursor: row.get(2).unwrap_or(NEVER_SYNCED),
        sync_interval_secs: row.get(3).unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
    }
}

/// Convert a database row to a FileEntry, mapping mod-time sentinels to None.
fn row_to_file_entry(row: &rusqlite::Row<'_>) -> FileEntry {
    let local_mod_time: i64 = row.get(4).unwrap_or(MOD_TIME_ABSENT);
    let remote_mod_time: i64 = row.get(8).unwrap_or(MOD_TIME_ABSENT);

    FileEntry {
        id: row.get(0).unwrap_or_default(),
        provider_id: row.get(1).unwrap_or_default(),
        local_artifact: row.get(2).ok().flatten(),
        local_title: row.get(3).ok().flatten(),
        local_mod_time: (local_mod_time != MOD_TIME_ABSENT).then_some(local_mod_time),
        local_deleted: row.get(5).unwrap_or(false),
        remote_id: row.get(6).ok().flatten(),
        remote_title: row.get(7).ok().flatten(),
        remote_mod_time: (remote_mod_time != MOD_TIME_ABSENT).then_some(remote_mod_time),
        remote_deleted: row.get(9).unwrap_or(false),
    }
}
