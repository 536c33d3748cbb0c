//! Local artifact store.
//!
//! Synced copies of remote files live as flat "artifacts" in one directory;
//! the engine addresses them by name only and the ledger remembers which
//! name belongs to which file entry. The [`ArtifactStore`] trait keeps the
//! transfer executor testable without touching a real filesystem, and
//! [`DirArtifactStore`] is the production implementation.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::remote::ByteStream;

/// Errors from the artifact store.
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// Local filesystem failure. The sync pass skips the affected file and
    /// carries on.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The remote byte stream failed mid-transfer. A transport failure,
    /// not a local one; reported against the transfer, not the disk.
    #[error("Stream error: {0}")]
    Stream(std::io::Error),
    /// A blocking filesystem task failed to run.
    #[error("Task join error: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}

/// Trait for the local side of a sync pass.
///
/// This trait is object-safe and can be used with `Arc<dyn ArtifactStore>`.
/// Artifact names are engine-generated flat names, never paths.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write an artifact from a content stream, replacing any previous
    /// version. The replacement is atomic: a crash mid-write never leaves a
    /// half-written artifact under the final name.
    async fn write(&self, name: &str, content: ByteStream) -> Result<(), ArtifactError>;

    /// Delete an artifact. Deleting a name that does not exist is fine —
    /// the user may have removed the file by hand already.
    async fn delete(&self, name: &str) -> Result<(), ArtifactError>;

    /// Whether an artifact currently exists on disk.
    async fn exists(&self, name: &str) -> Result<bool, ArtifactError>;

    /// Stamp an artifact with a modification time in epoch milliseconds.
    async fn set_mod_time(&self, name: &str, mod_time: i64) -> Result<(), ArtifactError>;
}

/// Artifact store backed by a single directory.
#[derive(Debug, Clone)]
pub struct DirArtifactStore {
    dir: PathBuf,
}

impl DirArtifactStore {
    /// Create a store over `dir`, creating the directory if needed.
    pub async fn open(dir: &Path) -> Result<Self, ArtifactError> {
        fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Full path of an artifact name inside this store.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn part_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.part", name))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for DirArtifactStore {
    async fn write(&self, name: &str, content: ByteStream) -> Result<(), ArtifactError> {
        let final_path = self.path(name);
        let part_path = self.part_path(name);

        // Always start fresh; a .part left by an interrupted pass is garbage.
        let _ = fs::remove_file(&part_path).await;

        if let Err(e) = copy_stream(&part_path, content).await {
            let _ = fs::remove_file(&part_path).await;
            return Err(e);
        }

        fs::rename(&part_path, &final_path).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ArtifactError> {
        match fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArtifactError::Io(e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, ArtifactError> {
        Ok(fs::try_exists(self.path(name)).await?)
    }

    async fn set_mod_time(&self, name: &str, mod_time: i64) -> Result<(), ArtifactError> {
        let path = self.path(name);
        tokio::task::spawn_blocking(move || set_file_mtime_millis(&path, mod_time)).await??;
        Ok(())
    }
}

/// Copy a content stream into the staging file.
async fn copy_stream(part_path: &Path, mut content: ByteStream) -> Result<(), ArtifactError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part_path)
        .await?;

    while let Some(chunk) = content.next().await {
        let chunk = chunk.map_err(ArtifactError::Stream)?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(())
}

/// Set the modification and access times of a file to the given epoch
/// milliseconds via `std::fs::File::set_times`.
///
/// Timestamps before 1970 are applied where the platform can represent
/// them and clamp to the epoch otherwise.
fn set_file_mtime_millis(path: &Path, mod_time: i64) -> std::io::Result<()> {
    let time = if mod_time >= 0 {
        UNIX_EPOCH + Duration::from_millis(mod_time as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_millis(mod_time.unsigned_abs()))
            .unwrap_or(UNIX_EPOCH)
    };
    let times = std::fs::FileTimes::new()
        .set_modified(time)
        .set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}
