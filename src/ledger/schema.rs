//! Ledger schema definitions and migrations.

use rusqlite::Connection;

use super::error::LedgerError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema DDL for version 1.
///
/// Modification-time columns keep a `-1` sentinel instead of NULL so the
/// stored layout matches what older installs already hold.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS providers (
    id INTEGER PRIMARY KEY,
    account TEXT NOT NULL UNIQUE,
    cursor INTEGER NOT NULL DEFAULT -1,
    sync_interval_secs INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    provider_id INTEGER NOT NULL REFERENCES providers(id),
    local_artifact TEXT,
    local_title TEXT,
    local_mod_time INTEGER NOT NULL DEFAULT -1,
    local_deleted INTEGER NOT NULL DEFAULT 0,
    remote_id TEXT,
    remote_title TEXT,
    remote_mod_time INTEGER NOT NULL DEFAULT -1,
    remote_deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_files_provider ON files(provider_id);
CREATE INDEX IF NOT EXISTS idx_files_remote_id ON files(remote_id);
"#;

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the database schema.
///
/// This function is idempotent and safe to call on both new and existing databases.
pub(crate) fn migrate(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(LedgerError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        // Fresh database — apply full schema
        conn.execute_batch(SCHEMA_V1)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized ledger schema at version {}", SCHEMA_VERSION);
    } else if current_version < SCHEMA_VERSION {
        // Run incremental migrations
        for version in (current_version + 1)..=SCHEMA_VERSION {
            migrate_to_version(conn, version)?;
        }
    }

    Ok(())
}

/// Apply migration for a specific version.
fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    // Future migrations go here, e.g.:
    // match version {
    //     2 => { conn.execute_batch("ALTER TABLE files ADD COLUMN new_field TEXT")?; }
    //     _ => {}
    // }
    // For now, version 1 just applies the base schema
    if version != SCHEMA_VERSION {
        tracing::warn!(
            "Unexpected schema version {}, applying base schema",
            version
        );
    }
    conn.execute_batch(SCHEMA_V1)?;
    set_schema_version(conn, version)?;
    tracing::info!("Migrated ledger to schema version {}", version);
    Ok(())
}
