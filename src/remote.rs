//! Remote store abstraction.
//!
//! The sync engine never talks to a cloud provider directly; it goes through
//! the [`RemoteStore`] trait. A concrete implementation (WebDAV, a vendor
//! REST API, ...) lives in the host application. Tests use in-memory fakes.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Content stream returned by [`RemoteStore::fetch_content`].
///
/// Chunk errors are transport failures, not local ones; the artifact store
/// keeps them separate from its own I/O errors so the caller can tell a
/// dropped connection from a full disk.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Errors from the remote store.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transient transport failure. During a listing call this aborts the
    /// pass without committing anything; during one file's transfer it only
    /// fails that file.
    #[error("Network error: {0}")]
    Network(String),
    /// Credentials rejected or expired. Aborts a listing; retrying without
    /// re-authentication will not help.
    #[error("Authentication error: {0}")]
    Auth(String),
    /// The referenced file no longer exists remotely. It can vanish between
    /// listing and fetch; the pass skips the file instead of aborting.
    #[error("Remote file not found: {0}")]
    NotFound(String),
    /// The provider answered but the response was unusable.
    #[error("API response error: {reason} (code: {code})")]
    ApiResponse { reason: String, code: String },
}

/// Metadata for one remote file as reported by a listing or change entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Provider-assigned stable identifier.
    pub id: String,
    /// Display title, without the extension.
    pub title: String,
    /// File extension, without the leading dot; empty when the provider
    /// reports none.
    pub extension: String,
    /// Modification time in epoch milliseconds.
    pub mod_time: i64,
    /// Whether the file sits in the provider's trash.
    pub trashed: bool,
}

impl FileDescriptor {
    /// Whether this file takes part in sync: not trashed and carrying
    /// exactly the configured extension. Matching is case-sensitive, so a
    /// file renamed to an upper-cased extension drops out of sync.
    pub fn is_eligible(&self, extension: &str) -> bool {
        !self.trashed && self.extension == extension
    }

    /// Title and extension joined back into a file name.
    pub fn file_name(&self) -> String {
        if self.extension.is_empty() {
            self.title.clone()
        } else {
            format!("{}.{}", self.title, self.extension)
        }
    }
}

/// One page of a full listing.
#[derive(Debug, Clone)]
pub struct FilePage {
    pub files: Vec<FileDescriptor>,
    /// Token for the next page, or None on the last page.
    pub next_page: Option<String>,
}

/// One entry of the provider's change log.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    /// Position in the change log. Strictly increasing per provider.
    pub change_id: i64,
    /// The file the change concerns.
    pub remote_id: String,
    /// Current metadata, or None when the file was removed.
    pub file: Option<FileDescriptor>,
}

/// One page of the change log.
#[derive(Debug, Clone)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    /// Token for the next page, or None on the last page.
    pub next_page: Option<String>,
}

/// Trait for the cloud side of a sync pass.
///
/// This trait is object-safe and can be used with `Arc<dyn RemoteStore>`.
/// All listing calls paginate: pass `None` for the first page and the
/// returned `next_page` token for the rest.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// The provider's current change-log position.
    ///
    /// A full sync captures this *before* listing so that changes landing
    /// during the listing fall after the recorded cursor and are picked up
    /// by the next incremental pass.
    async fn current_change_marker(&self) -> Result<i64, RemoteError>;

    /// One page of the full file listing. The listing reflects files that
    /// currently exist; removals never show up here.
    async fn list_files(&self, page_token: Option<&str>) -> Result<FilePage, RemoteError>;

    /// One page of changes strictly after `since`.
    async fn list_changes(
        &self,
        since: i64,
        page_token: Option<&str>,
    ) -> Result<ChangePage, RemoteError>;

    /// Stream the content of a remote file.
    async fn fetch_content(&self, remote_id: &str) -> Result<ByteStream, RemoteError>;

    /// Move a remote file to the provider's trash.
    async fn trash(&self, remote_id: &str) -> Result<(), RemoteError>;
}
