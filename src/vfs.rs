//! Filesystem provider over remote app hosts.
//!
//! [`RemoteFs`] answers the standard provider operations for URIs of the
//! form `<scheme>:/<host-id>/<canonical-path>`.  Reads go through the
//! [`DirectoryCache`]; mutations go straight to the host's file client and
//! then force a refresh of the parent directory.
//!
//! Writes use optimistic concurrency: the version tag seen by the last
//! read (or write) of a path is sent back with the next write, and a
//! remote that has moved on rejects it with
//! [`RemoteError::StaleVersion`].  Conflicts are never retried here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::cache::{DirectoryCache, Entry, EntryKind};
use crate::client::DeleteOptions;
use crate::config::Config;
use crate::errors::{RemoteError, RemoteResult};
use crate::host::HostRegistry;
use crate::path;
use crate::uri::{self, RemoteAddress};

/// Metadata returned by [`RemoteFs::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: EntryKind,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// Handle returned by [`RemoteFs::watch`].  Never fires; dropping it
/// unsubscribes.
#[derive(Debug)]
pub struct WatchSubscription {
    uri: String,
}

impl WatchSubscription {
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

pub struct RemoteFs {
    scheme: String,
    hosts: Arc<HostRegistry>,
    cache: DirectoryCache,
    /// Last known version tag per resource key.
    etags: Mutex<HashMap<String, String>>,
    read_only: bool,
}

impl RemoteFs {
    pub fn new(hosts: Arc<HostRegistry>, config: &Config) -> Self {
        Self {
            scheme: config.scheme.clone(),
            hosts,
            cache: DirectoryCache::new(config.listing_policy(), config.translator()),
            etags: Mutex::new(HashMap::new()),
            read_only: config.read_only,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn hosts(&self) -> &Arc<HostRegistry> {
        &self.hosts
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.cache
    }

    /// URI of `path` on host `host_id` under this adapter's scheme.
    pub fn uri_for(&self, host_id: &str, path: &str) -> String {
        uri::format(&self.scheme, host_id, path)
    }

    fn address(&self, uri: &str) -> RemoteResult<RemoteAddress> {
        uri::parse(&self.scheme, uri, &self.hosts)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn stat(&self, uri: &str) -> RemoteResult<FileStat> {
        let addr = self.address(uri)?;
        let entry = self.cache.resolve(&addr.host, &addr.path).await?;
        let meta = entry.meta();
        Ok(FileStat {
            kind: entry.kind(),
            size: meta.size,
            created: meta.created,
            modified: meta.modified,
        })
    }

    /// `(name, kind)` pairs, filtered and sorted by the listing policy.
    pub async fn read_directory(&self, uri: &str) -> RemoteResult<Vec<(String, EntryKind)>> {
        let addr = self.address(uri)?;
        let entries = self.cache.list(&addr.host, &addr.path).await?;
        Ok(entries
            .iter()
            .map(|e| (e.name().to_string(), e.kind()))
            .collect())
    }

    pub async fn read_file(&self, uri: &str) -> RemoteResult<Bytes> {
        let addr = self.address(uri)?;
        let contents = addr.host.client().get_file(&addr.path).await?;
        self.record_etag(&addr, contents.etag)?;
        Ok(contents.data)
    }

    /// Version tag recorded for `uri` by the last read or write.
    pub fn known_etag(&self, uri: &str) -> Option<String> {
        let addr = self.address(uri).ok()?;
        self.etags.lock().ok()?.get(&addr.key()).cloned()
    }

    /// Always succeeds; change notifications are not delivered.
    pub fn watch(&self, uri: &str) -> WatchSubscription {
        WatchSubscription {
            uri: uri.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Write `content`, conditioned on the last known tag of `uri`.
    pub async fn write_file(&self, uri: &str, content: Bytes) -> RemoteResult<()> {
        self.ensure_writable(uri)?;
        let addr = self.address(uri)?;
        if addr.path.is_empty() {
            return Err(RemoteError::PermissionDenied(format!("{uri}: host root")));
        }

        let known = self.etag_of(&addr)?;
        debug!(
            host = addr.host.id(),
            path = %addr.path,
            conditional = known.is_some(),
            "writing remote file"
        );
        let etag = addr
            .host
            .client()
            .put_file(&addr.path, content, known.as_deref())
            .await?;
        self.record_etag(&addr, etag)?;
        self.invalidate_parent(&addr).await;
        Ok(())
    }

    pub async fn create_directory(&self, uri: &str) -> RemoteResult<()> {
        self.ensure_writable(uri)?;
        let addr = self.address(uri)?;
        if addr.path.is_empty() {
            return Err(RemoteError::PermissionDenied(format!("{uri}: host root")));
        }

        let marker = format!("{}/", addr.path);
        addr.host
            .client()
            .put_file(&marker, Bytes::new(), None)
            .await?;
        self.invalidate_parent(&addr).await;
        Ok(())
    }

    /// Delete a file or directory.  Files are deleted conditionally on
    /// their current tag; non-recursive deletes of non-empty directories
    /// are left for the remote to reject.
    pub async fn delete(&self, uri: &str, recursive: bool) -> RemoteResult<()> {
        self.ensure_writable(uri)?;
        let addr = self.address(uri)?;
        if addr.path.is_empty() {
            return Err(RemoteError::PermissionDenied(format!("{uri}: host root")));
        }

        let client = addr.host.client();
        match self.cache.resolve(&addr.host, &addr.path).await? {
            Entry::File(_) => {
                let current = client.get_file(&addr.path).await?;
                let options = DeleteOptions {
                    recursive,
                    if_match: Some(current.etag),
                };
                client.delete_item(&addr.path, &options).await?;
            }
            Entry::Directory(_) => {
                let options = DeleteOptions {
                    recursive,
                    if_match: None,
                };
                client
                    .delete_item(&format!("{}/", addr.path), &options)
                    .await?;
            }
        }

        self.forget_etag(&addr)?;
        self.invalidate_parent(&addr).await;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        Err(RemoteError::NotImplemented(format!("rename {from} -> {to}")))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_writable(&self, uri: &str) -> RemoteResult<()> {
        if self.read_only {
            return Err(RemoteError::PermissionDenied(format!(
                "{uri}: filesystem is read-only"
            )));
        }
        Ok(())
    }

    fn etag_of(&self, addr: &RemoteAddress) -> RemoteResult<Option<String>> {
        Ok(self.lock_etags()?.get(&addr.key()).cloned())
    }

    fn record_etag(&self, addr: &RemoteAddress, etag: String) -> RemoteResult<()> {
        let mut etags = self.lock_etags()?;
        if etag.is_empty() {
            etags.remove(&addr.key());
        } else {
            etags.insert(addr.key(), etag);
        }
        Ok(())
    }

    fn forget_etag(&self, addr: &RemoteAddress) -> RemoteResult<()> {
        self.lock_etags()?.remove(&addr.key());
        Ok(())
    }

    fn lock_etags(&self) -> RemoteResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.etags
            .lock()
            .map_err(|e| RemoteError::Internal(format!("etag table poisoned: {e}")))
    }

    /// Refresh the parent listing after a successful mutation.  The
    /// mutation already happened, so a failed refresh is only logged.
    async fn invalidate_parent(&self, addr: &RemoteAddress) {
        let Some(parent) = path::parent_of(&addr.path) else {
            return;
        };
        if let Err(e) = self.cache.invalidate(&addr.host, parent).await {
            warn!(
                host = addr.host.id(),
                path = parent,
                "refreshing directory after mutation failed: {e}"
            );
        }
    }
}
