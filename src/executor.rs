//! Transfer executor — carries out the reconciler's decisions.
//!
//! Fetches stream remote content into the artifact store and stamp the
//! recorded modification time; purges delete the local artifact, trash the
//! remote copy when it still exists, and drop the entry. Every outcome is
//! staged as an [`ExecOp`] for the pass commit; nothing touches the ledger
//! here. One file's failure never aborts the pass — the entry simply keeps
//! its old state and is retried next time.

use std::sync::Arc;

use thiserror::Error;

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::ledger::types::MOD_TIME_ABSENT;
use crate::ledger::{EntryKey, ExecOp};
use crate::reconcile::{PlannedFile, SyncAction};
use crate::remote::{RemoteError, RemoteStore};

/// Why a single file's transfer failed. Never propagates past the
/// executor; it only feeds the log line and the failure count.
#[derive(Error, Debug)]
enum TransferError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Planned fetch carries no remote id")]
    MissingRemoteId,
}

/// Result of executing one plan.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// Staged ledger updates for the entries that succeeded.
    pub ops: Vec<ExecOp>,
    pub fetched: usize,
    pub purged: usize,
    pub failed: usize,
}

/// Executes planned fetches and purges against the injected collaborators.
pub struct TransferExecutor {
    remote: Arc<dyn RemoteStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl TransferExecutor {
    pub fn new(remote: Arc<dyn RemoteStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { remote, artifacts }
    }

    /// Run every non-`NoAction` file of the plan, in order, isolating
    /// failures per file.
    pub async fn execute(&self, plan: &[PlannedFile]) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();

        for file in plan {
            match file.action {
                SyncAction::NoAction => {}
                SyncAction::FetchRemote => match self.fetch(file).await {
                    Ok(op) => {
                        outcome.ops.push(op);
                        outcome.fetched += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            title = %file.title,
                            error = %e,
                            "Fetch failed, entry left for next pass"
                        );
                        outcome.failed += 1;
                    }
                },
                SyncAction::Purge => match self.purge(file).await {
                    Ok(op) => {
                        outcome.ops.push(op);
                        outcome.purged += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            title = %file.title,
                            error = %e,
                            "Purge failed, entry left for next pass"
                        );
                        outcome.failed += 1;
                    }
                },
            }
        }

        outcome
    }

    async fn fetch(&self, file: &PlannedFile) -> Result<ExecOp, TransferError> {
        let Some(remote_id) = file.remote_id.as_deref() else {
            return Err(TransferError::MissingRemoteId);
        };
        let name = artifact_name(file.key, file.local_artifact.as_deref(), remote_id);

        let content = self.remote.fetch_content(remote_id).await?;
        self.artifacts.write(&name, content).await?;

        if let Some(mod_time) = file.remote_mod_time {
            // A failed stamp is not worth failing the fetch over; the next
            // pass sees remote mod > local mod and re-fetches at worst.
            if let Err(e) = self.artifacts.set_mod_time(&name, mod_time).await {
                tracing::warn!(artifact = %name, error = %e, "Could not set artifact mod time");
            }
        }

        tracing::debug!(title = %file.title, artifact = %name, "Fetched remote file");
        Ok(ExecOp::SetLocal {
            key: file.key,
            artifact: name,
            title: file.title.clone(),
            mod_time: file.remote_mod_time.unwrap_or(MOD_TIME_ABSENT),
        })
    }

    async fn purge(&self, file: &PlannedFile) -> Result<ExecOp, TransferError> {
        if let Some(artifact) = file.local_artifact.as_deref() {
            self.artifacts.delete(artifact).await?;
        }

        if !file.remote_deleted {
            if let Some(remote_id) = file.remote_id.as_deref() {
                match self.remote.trash(remote_id).await {
                    Ok(()) => {}
                    // Already gone remotely; nothing left to trash.
                    Err(RemoteError::NotFound(_)) => {
                        tracing::debug!(remote_id = %remote_id, "Remote file already gone");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        tracing::debug!(title = %file.title, "Purged file");
        Ok(ExecOp::Remove { key: file.key })
    }
}

/// Artifact name for a fetch. A recorded name wins so retries overwrite
/// in place; otherwise existing entries derive from the ledger row id and
/// brand-new entries from the remote id, which has no row id yet.
fn artifact_name(key: EntryKey, local_artifact: Option<&str>, remote_id: &str) -> String {
    if let Some(name) = local_artifact {
        return name.to_string();
    }
    match key {
        EntryKey::Existing(id) => format!("syncfile-{}", id),
        EntryKey::Added(_) => format!("syncfile-{}", base32_encode(remote_id.as_bytes())),
    }
}

/// Base32 (RFC 4648 alphabet, no padding) of a remote id. Remote ids may
/// contain characters that are invalid in file names; this keeps the
/// derived artifact name flat and filesystem-safe.
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut acc: u64 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        acc = (acc << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((acc >> bits) & 0x1F) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((acc << (5 - bits)) & 0x1F) as usize] as char);
    }
    out
}
