//! Remote file API seam.
//!
//! Every transport that can read and mutate a host's files implements
//! [`RemoteFileClient`].  The cache and filesystem layers only ever see
//! this trait; [`kudu::KuduClient`] is the HTTP binding used in production.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::errors::RemoteResult;

pub mod kudu;
#[cfg(test)]
pub mod memory;

/// Listing `mime` value that marks a directory.
pub const DIRECTORY_MIME: &str = "inode/directory";

// ---------------------------------------------------------------------------
// Types returned by client operations
// ---------------------------------------------------------------------------

/// One entry of a remote directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    /// Raw remote path, in the host's own convention.
    pub path: String,
    pub mime: String,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl ListingEntry {
    pub fn is_directory(&self) -> bool {
        self.mime == DIRECTORY_MIME
    }
}

/// File content together with the version tag it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContents {
    pub data: Bytes,
    pub etag: String,
}

/// Options for [`RemoteFileClient::delete_item`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub recursive: bool,
    /// Delete only if the remote tag still matches; `None` deletes
    /// unconditionally.
    pub if_match: Option<String>,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Remote file operations, addressed by canonical path.
///
/// A path with a trailing `/` names a directory; `put_file` on such a path
/// creates the directory.
#[async_trait]
pub trait RemoteFileClient: Send + Sync {
    /// List the immediate contents of a directory.
    async fn list_directory(&self, path: &str) -> RemoteResult<Vec<ListingEntry>>;

    /// Read a file and the version tag it was read at.
    async fn get_file(&self, path: &str) -> RemoteResult<FileContents>;

    /// Write a file, conditioned on `etag` when given.  Returns the new tag.
    ///
    /// A stale tag fails with [`crate::errors::RemoteError::StaleVersion`].
    async fn put_file(&self, path: &str, content: Bytes, etag: Option<&str>)
    -> RemoteResult<String>;

    /// Delete a file or directory (directories carry the trailing `/`).
    async fn delete_item(&self, path: &str, options: &DeleteOptions) -> RemoteResult<()>;

    /// A short description used in log lines.
    fn description(&self) -> String;
}
