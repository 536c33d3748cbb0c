//! Reconciler — the pure decision core of a sync pass.
//!
//! Given a snapshot of the ledger and a set of remote observations, compute
//! which ledger merges to stage and what to do with every file: fetch it,
//! purge it, or leave it alone. No I/O happens here; the orchestrator probes
//! artifact presence up front and the executor carries the decisions out.

use std::collections::HashMap;

use crate::ledger::{EntryKey, FileEntry, MergeOp};
use crate::remote::FileDescriptor;

/// One remote fact learned during listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The file exists remotely with this metadata.
    Seen(FileDescriptor),
    /// The file is gone remotely, or stopped matching the eligibility
    /// filter and must be treated as gone.
    Tombstone { remote_id: String },
}

impl Observation {
    pub fn remote_id(&self) -> &str {
        match self {
            Observation::Seen(desc) => &desc.id,
            Observation::Tombstone { remote_id } => remote_id,
        }
    }
}

/// The observations of one listing phase, deduplicated by remote id.
///
/// Built once per pass and passed by reference from then on; nothing
/// mutates it after construction. An exhaustive set comes from a full
/// listing and cannot contain tombstones — absence from it means "not
/// observed", never "deleted". A delta set comes from the change log and
/// may contain tombstones.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    observations: Vec<Observation>,
    exhaustive: bool,
}

impl ObservationSet {
    /// Exhaustive set from a full listing.
    pub fn full(files: Vec<FileDescriptor>) -> Self {
        Self {
            observations: dedupe(files.into_iter().map(Observation::Seen).collect()),
            exhaustive: true,
        }
    }

    /// Delta set from the change log. Later observations of the same
    /// remote id win, matching change-log order.
    pub fn delta(observations: Vec<Observation>) -> Self {
        Self {
            observations: dedupe(observations),
            exhaustive: false,
        }
    }

    pub fn is_exhaustive(&self) -> bool {
        self.exhaustive
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }
}

/// Keep one observation per remote id, last one winning, first position
/// kept so the output order stays deterministic.
fn dedupe(observations: Vec<Observation>) -> Vec<Observation> {
    let mut out: Vec<Observation> = Vec::with_capacity(observations.len());
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for obs in observations {
        match by_id.get(obs.remote_id()) {
            Some(&i) => out[i] = obs,
            None => {
                by_id.insert(obs.remote_id().to_string(), out.len());
                out.push(obs);
            }
        }
    }
    out
}

/// One ledger entry plus the on-disk probe of its artifact, taken before
/// reconciliation so the decision function stays pure.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub entry: FileEntry,
    pub artifact_present: bool,
}

/// What to do with one file this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Download the remote content into the local artifact.
    FetchRemote,
    /// Remove the local artifact, trash the remote copy if it still
    /// exists, and drop the entry.
    Purge,
    /// Leave the file alone.
    NoAction,
}

/// A classified file: the merged view the executor needs, plus its action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub key: EntryKey,
    pub action: SyncAction,
    /// Display title after the merge; remote title when one exists.
    pub title: String,
    pub remote_id: Option<String>,
    pub remote_mod_time: Option<i64>,
    pub remote_deleted: bool,
    pub local_artifact: Option<String>,
}

/// Output of one reconciliation: ledger merges to stage, and every file of
/// the provider with its classified action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub merges: Vec<MergeOp>,
    pub files: Vec<PlannedFile>,
}

impl SyncPlan {
    /// (fetch, purge, no-action) counts, for logs and reports.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut fetch = 0;
        let mut purge = 0;
        let mut noop = 0;
        for file in &self.files {
            match file.action {
                SyncAction::FetchRemote => fetch += 1,
                SyncAction::Purge => purge += 1,
                SyncAction::NoAction => noop += 1,
            }
        }
        (fetch, purge, noop)
    }
}

/// Merged per-entry view fed to classification.
struct View {
    key: EntryKey,
    local_artifact: Option<String>,
    local_title: Option<String>,
    local_mod_time: Option<i64>,
    local_deleted: bool,
    remote_id: Option<String>,
    remote_title: Option<String>,
    remote_mod_time: Option<i64>,
    remote_deleted: bool,
    artifact_present: bool,
}

/// Merge observations into the ledger snapshot and classify every entry.
///
/// Entries whose remote id appears in the set get their remote side
/// rewritten (or tombstoned); observations matching no entry become new
/// entries with only the remote side populated; entries absent from the
/// set keep their recorded remote side and are still classified, so a
/// local deletion gets acted on even when the remote reported nothing.
pub fn reconcile(snapshot: &[SnapshotEntry], observations: &ObservationSet) -> SyncPlan {
    let mut merges: Vec<MergeOp> = Vec::new();
    let mut views: Vec<View> = Vec::new();

    // Index observations by remote id; entries consume their match.
    let mut index: HashMap<&str, &Observation> = observations
        .iter()
        .map(|obs| (obs.remote_id(), obs))
        .collect();

    for snap in snapshot {
        let entry = &snap.entry;
        let mut remote_title = entry.remote_title.clone();
        let mut remote_mod_time = entry.remote_mod_time;
        let mut remote_deleted = entry.remote_deleted;

        if let Some(remote_id) = entry.remote_id.as_deref() {
            match index.remove(remote_id) {
                Some(Observation::Seen(desc)) => {
                    merges.push(MergeOp::UpdateRemote {
                        entry_id: entry.id,
                        remote_id: desc.id.clone(),
                        title: desc.file_name(),
                        mod_time: desc.mod_time,
                    });
                    remote_title = Some(desc.file_name());
                    remote_mod_time = Some(desc.mod_time);
                    remote_deleted = false;
                }
                Some(Observation::Tombstone { .. }) => {
                    merges.push(MergeOp::MarkRemoteDeleted { entry_id: entry.id });
                    remote_deleted = true;
                }
                None => {}
            }
        }

        views.push(View {
            key: EntryKey::Existing(entry.id),
            local_artifact: entry.local_artifact.clone(),
            local_title: entry.local_title.clone(),
            local_mod_time: entry.local_mod_time,
            local_deleted: entry.local_deleted,
            remote_id: entry.remote_id.clone(),
            remote_title,
            remote_mod_time,
            remote_deleted,
            artifact_present: snap.artifact_present,
        });
    }

    // Unconsumed non-tombstone observations are files the ledger has never
    // seen. A tombstone for an unknown id has nothing to act on.
    let mut added = 0usize;
    for obs in observations.iter() {
        if index.remove(obs.remote_id()).is_none() {
            continue;
        }
        match obs {
            Observation::Seen(desc) => {
                merges.push(MergeOp::AddRemote {
                    remote_id: desc.id.clone(),
                    title: desc.file_name(),
                    mod_time: desc.mod_time,
                });
                views.push(View {
                    key: EntryKey::Added(added),
                    local_artifact: None,
                    local_title: None,
                    local_mod_time: None,
                    local_deleted: false,
                    remote_id: Some(desc.id.clone()),
                    remote_title: Some(desc.file_name()),
                    remote_mod_time: Some(desc.mod_time),
                    remote_deleted: false,
                    artifact_present: false,
                });
                added += 1;
            }
            Observation::Tombstone { remote_id } => {
                tracing::debug!(remote_id = %remote_id, "Tombstone for untracked file, ignoring");
            }
        }
    }

    let files = views
        .into_iter()
        .map(|view| {
            let action = classify(&view);
            PlannedFile {
                key: view.key,
                action,
                title: view
                    .remote_title
                    .or(view.local_title)
                    .unwrap_or_default(),
                remote_id: view.remote_id,
                remote_mod_time: view.remote_mod_time,
                remote_deleted: view.remote_deleted,
                local_artifact: view.local_artifact,
            }
        })
        .collect();

    SyncPlan { merges, files }
}

/// Is the remote side considered newer than the local one?
///
/// True when the remote mod time is strictly greater, or when there is
/// nothing usable locally: no recorded artifact name, or a recorded
/// artifact missing on disk.
fn remote_newer(view: &View) -> bool {
    if view.remote_id.is_none() {
        return false;
    }
    if view.remote_mod_time.unwrap_or(i64::MIN) > view.local_mod_time.unwrap_or(i64::MIN) {
        return true;
    }
    if view.local_artifact.is_none() {
        return true;
    }
    if !view.artifact_present {
        return true;
    }
    false
}

fn classify(view: &View) -> SyncAction {
    if remote_newer(view) {
        if view.remote_deleted {
            SyncAction::Purge
        } else if view.local_deleted {
            // Both sides changed since the last sync. No resolution policy
            // is defined, so leave the file alone.
            SyncAction::NoAction
        } else {
            SyncAction::FetchRemote
        }
    } else if view.local_mod_time.unwrap_or(i64::MIN) > view.remote_mod_time.unwrap_or(i64::MIN) {
        if view.local_deleted {
            SyncAction::Purge
        } else if view.remote_deleted {
            // Both sides changed since the last sync; see above.
            SyncAction::NoAction
        } else {
            // Pushing local changes to the remote store is not supported.
            SyncAction::NoAction
        }
    } else if view.remote_deleted || view.local_deleted {
        SyncAction::Purge
    } else {
        // Equal timestamps mean already in sync; never re-download on a tie.
        SyncAction::NoAction
    }
}
