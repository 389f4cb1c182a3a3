//! Directory cache.
//!
//! Each host gets a lazily populated tree rooted at its home directory.
//! A directory node is in exactly one of three states:
//!
//! ```text
//! Empty ──refresh──▶ Refreshing(shared) ──ok──▶ Populated(snapshot)
//!                          │                          │
//!                          └──err──▶ previous state   └──invalidate──▶ Refreshing
//! ```
//!
//! Concurrent callers that need the children of a `Refreshing` node all
//! await the same shared outcome, so one listing request serves all of
//! them.  The refresh runs as its own task and swaps the new snapshot in
//! under the node lock: readers see the old children or the new ones,
//! never a mix.  Abandoning the wait does not abort the remote call.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use glob_match::glob_match;
use tracing::{debug, error};

use crate::errors::{RemoteError, RemoteResult};
use crate::host::RemoteHost;
use crate::path::{self, PathTranslator};

/// Trace artifact the remote host keeps open for itself.
pub const TRACE_PENDING_ENTRY: &str = "LogFiles-kudu-trace_pending.xml";

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata of one remote object as of the listing that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMeta {
    pub name: String,
    /// Canonical path.
    pub path: String,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum Entry {
    File(EntryMeta),
    Directory(Arc<DirectoryNode>),
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::File(_) => EntryKind::File,
            Entry::Directory(_) => EntryKind::Directory,
        }
    }

    pub fn meta(&self) -> &EntryMeta {
        match self {
            Entry::File(meta) => meta,
            Entry::Directory(dir) => dir.meta(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }
}

/// Immutable snapshot of a directory's immediate contents.
#[derive(Debug, Default)]
pub struct Children {
    entries: HashMap<String, Entry>,
}

impl Children {
    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }
}

type RefreshOutcome = RemoteResult<Arc<Children>>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

enum ChildrenState {
    Empty,
    Refreshing {
        ticket: u64,
        previous: Option<Arc<Children>>,
        outcome: SharedRefresh,
    },
    Populated(Arc<Children>),
}

pub struct DirectoryNode {
    meta: EntryMeta,
    state: Mutex<ChildrenState>,
    tickets: AtomicU64,
}

impl fmt::Debug for DirectoryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.lock().as_deref() {
            Ok(ChildrenState::Empty) => "empty",
            Ok(ChildrenState::Refreshing { .. }) => "refreshing",
            Ok(ChildrenState::Populated(_)) => "populated",
            Err(_) => "poisoned",
        };
        f.debug_struct("DirectoryNode")
            .field("meta", &self.meta)
            .field("state", &state)
            .finish()
    }
}

impl DirectoryNode {
    fn new(meta: EntryMeta) -> Self {
        Self {
            meta,
            state: Mutex::new(ChildrenState::Empty),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn lock(&self) -> RemoteResult<MutexGuard<'_, ChildrenState>> {
        self.state.lock().map_err(|e| {
            RemoteError::Internal(format!("directory '{}' poisoned: {e}", self.meta.path))
        })
    }

    /// The current snapshot, if one has been fetched.
    pub fn cached_children(&self) -> Option<Arc<Children>> {
        match &*self.state.lock().ok()? {
            ChildrenState::Populated(children) => Some(Arc::clone(children)),
            ChildrenState::Refreshing { previous, .. } => previous.clone(),
            ChildrenState::Empty => None,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(
            self.state.lock().as_deref(),
            Ok(ChildrenState::Refreshing { .. })
        )
    }

    /// Swap a finished refresh in, unless a newer one has superseded it.
    fn install(&self, ticket: u64, outcome: &RefreshOutcome) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let ChildrenState::Refreshing {
            ticket: current,
            previous,
            ..
        } = &mut *state
        else {
            return;
        };
        if *current != ticket {
            return;
        }
        let next = match outcome {
            Ok(children) => ChildrenState::Populated(Arc::clone(children)),
            Err(_) => previous.take().map_or(ChildrenState::Empty, ChildrenState::Populated),
        };
        *state = next;
    }
}

// ---------------------------------------------------------------------------
// Listing policy
// ---------------------------------------------------------------------------

/// Which entries a listing shows and in what order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPolicy {
    /// Glob patterns of names excluded from listings.
    pub hidden: Vec<String>,
    /// Synthetic action entry that always sorts first.
    pub pinned: Option<String>,
}

impl Default for ListingPolicy {
    fn default() -> Self {
        Self {
            hidden: vec![TRACE_PENDING_ENTRY.to_string()],
            pinned: None,
        }
    }
}

impl ListingPolicy {
    pub fn is_hidden(&self, name: &str) -> bool {
        self.hidden.iter().any(|pattern| glob_match(pattern, name))
    }

    /// Pinned entry first, then case-insensitive name order.
    pub fn sort_by_name<T>(&self, items: &mut [T], name: impl Fn(&T) -> &str) {
        let pinned = self.pinned.as_deref();
        items.sort_by(|a, b| {
            let (a, b) = (name(a), name(b));
            let a_pinned = Some(a) == pinned;
            let b_pinned = Some(b) == pinned;
            b_pinned
                .cmp(&a_pinned)
                .then_with(|| a.to_lowercase().cmp(&b.to_lowercase()))
                .then_with(|| a.cmp(b))
        });
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Per-host directory trees, owned by one filesystem adapter for its
/// lifetime.  Roots are created on first use and never evicted.
pub struct DirectoryCache {
    roots: Mutex<HashMap<String, Arc<DirectoryNode>>>,
    policy: Arc<ListingPolicy>,
    translator: Arc<PathTranslator>,
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new(ListingPolicy::default(), PathTranslator::default())
    }
}

impl DirectoryCache {
    pub fn new(policy: ListingPolicy, translator: PathTranslator) -> Self {
        Self {
            roots: Mutex::new(HashMap::new()),
            policy: Arc::new(policy),
            translator: Arc::new(translator),
        }
    }

    pub fn policy(&self) -> &ListingPolicy {
        &self.policy
    }

    pub fn host_count(&self) -> usize {
        self.roots.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// The root directory of `host`, created on first lookup.
    pub fn root(&self, host: &RemoteHost) -> RemoteResult<Arc<DirectoryNode>> {
        let mut roots = self
            .roots
            .lock()
            .map_err(|e| RemoteError::Internal(format!("root registry poisoned: {e}")))?;
        let root = roots
            .entry(host.id().to_string())
            .or_insert_with(|| Arc::new(DirectoryNode::new(EntryMeta::default())));
        Ok(Arc::clone(root))
    }

    /// Walk `target` segment by segment from the host root.
    pub async fn resolve(&self, host: &Arc<RemoteHost>, target: &str) -> RemoteResult<Entry> {
        let mut current = Entry::Directory(self.root(host)?);
        let mut walked = String::new();

        for segment in path::segments(target) {
            let Entry::Directory(dir) = &current else {
                return Err(RemoteError::NotADirectory(walked));
            };
            let child = self.get_child(host, dir, segment).await?;
            walked = path::join(&walked, segment);
            current = child.ok_or_else(|| RemoteError::NotFound(walked.clone()))?;
        }

        Ok(current)
    }

    /// Look up `name` in `dir`, fetching the listing if it was never fetched.
    pub async fn get_child(
        &self,
        host: &Arc<RemoteHost>,
        dir: &Arc<DirectoryNode>,
        name: &str,
    ) -> RemoteResult<Option<Entry>> {
        let children = self.children(host, dir).await?;
        Ok(children.get(name).cloned())
    }

    /// The children snapshot of `dir`; fetched (or joined) when not populated.
    pub async fn children(
        &self,
        host: &Arc<RemoteHost>,
        dir: &Arc<DirectoryNode>,
    ) -> RemoteResult<Arc<Children>> {
        if let ChildrenState::Populated(children) = &*dir.lock()? {
            return Ok(Arc::clone(children));
        }
        self.refresh(host, dir).await
    }

    /// Refresh `dir`, joining a refresh that is already in flight.
    pub async fn refresh(
        &self,
        host: &Arc<RemoteHost>,
        dir: &Arc<DirectoryNode>,
    ) -> RemoteResult<Arc<Children>> {
        self.start_refresh(host, dir, false)?.await
    }

    /// Sorted, filtered listing of the directory at `target`.
    pub async fn list(&self, host: &Arc<RemoteHost>, target: &str) -> RemoteResult<Vec<Entry>> {
        let Entry::Directory(dir) = self.resolve(host, target).await? else {
            return Err(RemoteError::NotADirectory(target.to_string()));
        };
        let children = self.children(host, &dir).await?;
        let mut entries: Vec<Entry> = children.entries().cloned().collect();
        self.policy.sort_by_name(&mut entries, Entry::name);
        Ok(entries)
    }

    /// Force a fresh listing of the directory at `target` if it is cached.
    ///
    /// Always starts a new remote listing, superseding one already in
    /// flight: that one may have been issued before the mutation that
    /// triggered this call.  Directories never fetched are left alone.
    pub async fn invalidate(&self, host: &Arc<RemoteHost>, target: &str) -> RemoteResult<()> {
        let Some(dir) = self.find_cached(host, target) else {
            debug!(host = host.id(), path = target, "invalidate: directory not cached");
            return Ok(());
        };
        self.start_refresh(host, &dir, true)?.await?;
        Ok(())
    }

    /// Walk `target` through already-fetched snapshots only.
    fn find_cached(&self, host: &RemoteHost, target: &str) -> Option<Arc<DirectoryNode>> {
        let mut current = self.root(host).ok()?;
        for segment in path::segments(target) {
            let children = current.cached_children()?;
            let Some(Entry::Directory(next)) = children.get(segment) else {
                return None;
            };
            let next = Arc::clone(next);
            current = next;
        }
        let known = current.cached_children().is_some() || current.is_refreshing();
        known.then_some(current)
    }

    fn start_refresh(
        &self,
        host: &Arc<RemoteHost>,
        dir: &Arc<DirectoryNode>,
        force: bool,
    ) -> RemoteResult<SharedRefresh> {
        let mut state = dir.lock()?;

        if !force && let ChildrenState::Refreshing { outcome, .. } = &*state {
            debug!(
                host = host.id(),
                path = %dir.meta.path,
                "joining in-flight directory refresh"
            );
            return Ok(outcome.clone());
        }

        let previous = match &*state {
            ChildrenState::Empty => None,
            ChildrenState::Refreshing { previous, .. } => previous.clone(),
            ChildrenState::Populated(children) => Some(Arc::clone(children)),
        };
        let ticket = dir.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(host = host.id(), path = %dir.meta.path, ticket, "refreshing directory");

        let task = tokio::spawn({
            let dir = Arc::clone(dir);
            let host = Arc::clone(host);
            let policy = Arc::clone(&self.policy);
            let translator = Arc::clone(&self.translator);
            async move {
                let outcome = fetch_children(&host, &dir.meta.path, &policy, &translator).await;
                dir.install(ticket, &outcome);
                outcome
            }
        });

        let outcome = async move {
            task.await
                .unwrap_or_else(|e| Err(RemoteError::Internal(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared();

        *state = ChildrenState::Refreshing {
            ticket,
            previous,
            outcome: outcome.clone(),
        };
        Ok(outcome)
    }
}

/// List `dir_path` remotely and build a filtered children snapshot.
async fn fetch_children(
    host: &RemoteHost,
    dir_path: &str,
    policy: &ListingPolicy,
    translator: &PathTranslator,
) -> RefreshOutcome {
    let listing = host.client().list_directory(dir_path).await?;
    let mut entries = HashMap::with_capacity(listing.len());

    for item in listing {
        if policy.is_hidden(&item.name) {
            continue;
        }
        let canonical = if item.path.is_empty() {
            path::join(dir_path, &item.name)
        } else {
            translator.canonicalize(&item.path).inspect_err(|e| {
                error!(host = host.id(), path = dir_path, "listing returned {e}");
            })?
        };
        let is_directory = item.is_directory();
        let meta = EntryMeta {
            name: item.name.clone(),
            path: canonical,
            size: item.size,
            created: item.created,
            modified: item.modified,
        };
        let entry = if is_directory {
            Entry::Directory(Arc::new(DirectoryNode::new(meta)))
        } else {
            Entry::File(meta)
        };
        entries.insert(item.name, entry);
    }

    Ok(Arc::new(Children { entries }))
}
