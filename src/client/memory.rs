//! In-memory [`RemoteFileClient`] used by the test suites.
//!
//! It mimics the remote file API closely enough to exercise the cache and
//! the filesystem adapter: listings report paths the way a Linux host does
//! (`/home/<canonical>`), writes and deletes honour version tags, and every
//! call is counted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{DIRECTORY_MIME, DeleteOptions, FileContents, ListingEntry, RemoteFileClient};
use crate::errors::{RemoteError, RemoteResult};
use crate::path;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { data: Bytes, etag: String },
}

#[derive(Debug, Default, Clone)]
pub struct CallCounts {
    pub list: HashMap<String, usize>,
    pub get: usize,
    pub put: usize,
    pub delete: usize,
}

impl CallCounts {
    pub fn lists_of(&self, path: &str) -> usize {
        self.list.get(path).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.list.values().sum::<usize>() + self.get + self.put + self.delete
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    next_tag: u64,
    calls: CallCounts,
    list_failure: Option<RemoteError>,
}

impl State {
    fn new_tag(&mut self) -> String {
        self.next_tag += 1;
        format!("\"{}\"", self.next_tag)
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut current = path::parent_of(path);
        while let Some(dir) = current {
            if !dir.is_empty() {
                self.nodes.entry(dir.to_string()).or_insert(Node::Dir);
            }
            current = path::parent_of(dir);
        }
    }
}

pub struct MemoryClient {
    state: Mutex<State>,
    list_delay: Option<Duration>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            list_delay: None,
        }
    }

    /// Make every listing take `delay`, so concurrent callers overlap.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    pub fn with_dir(self, dir: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let dir = path::normalize(dir);
            state.ensure_parents(&dir);
            state.nodes.insert(dir, Node::Dir);
        }
        self
    }

    pub fn with_file(self, file: &str, data: &str) -> Self {
        self.write_behind(file, data);
        self
    }

    /// Change a file as another writer would, bumping its tag.
    pub fn write_behind(&self, file: &str, data: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let file = path::normalize(file);
        state.ensure_parents(&file);
        let etag = state.new_tag();
        state.nodes.insert(
            file,
            Node::File {
                data: Bytes::from(data.to_string()),
                etag: etag.clone(),
            },
        );
        etag
    }

    pub fn fail_listings(&self, failure: Option<RemoteError>) {
        self.state.lock().unwrap().list_failure = failure;
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn etag_of(&self, file: &str) -> Option<String> {
        match self.state.lock().unwrap().nodes.get(file) {
            Some(Node::File { etag, .. }) => Some(etag.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().nodes.contains_key(path)
    }
}

fn lock(state: &Mutex<State>) -> RemoteResult<std::sync::MutexGuard<'_, State>> {
    state
        .lock()
        .map_err(|e| RemoteError::Internal(format!("memory client poisoned: {e}")))
}

#[async_trait]
impl RemoteFileClient for MemoryClient {
    async fn list_directory(&self, dir: &str) -> RemoteResult<Vec<ListingEntry>> {
        let dir = path::normalize(dir);
        {
            let mut state = lock(&self.state)?;
            *state.calls.list.entry(dir.clone()).or_default() += 1;
        }
        match self.list_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let state = lock(&self.state)?;
        if let Some(failure) = &state.list_failure {
            return Err(failure.clone());
        }
        match state.nodes.get(&dir) {
            Some(Node::Dir) => {}
            Some(Node::File { .. }) => return Err(RemoteError::NotADirectory(dir)),
            None if dir.is_empty() => {}
            None => return Err(RemoteError::NotFound(dir)),
        }

        Ok(state
            .nodes
            .iter()
            .filter(|(key, _)| path::parent_of(key) == Some(dir.as_str()))
            .map(|(key, node)| match node {
                Node::Dir => ListingEntry {
                    name: path::file_name(key).to_string(),
                    path: format!("/home/{key}/"),
                    mime: DIRECTORY_MIME.to_string(),
                    ..Default::default()
                },
                Node::File { data, .. } => ListingEntry {
                    name: path::file_name(key).to_string(),
                    path: format!("/home/{key}"),
                    mime: "text/plain".to_string(),
                    size: data.len() as u64,
                    ..Default::default()
                },
            })
            .collect())
    }

    async fn get_file(&self, file: &str) -> RemoteResult<FileContents> {
        let mut state = lock(&self.state)?;
        state.calls.get += 1;
        match state.nodes.get(file) {
            Some(Node::File { data, etag }) => Ok(FileContents {
                data: data.clone(),
                etag: etag.clone(),
            }),
            Some(Node::Dir) => Err(RemoteError::Http(format!("{file} is a directory"))),
            None => Err(RemoteError::NotFound(file.to_string())),
        }
    }

    async fn put_file(
        &self,
        target: &str,
        content: Bytes,
        etag: Option<&str>,
    ) -> RemoteResult<String> {
        let mut state = lock(&self.state)?;
        state.calls.put += 1;

        if target.ends_with('/') {
            let dir = path::normalize(target);
            state.ensure_parents(&dir);
            state.nodes.insert(dir, Node::Dir);
            return Ok(String::new());
        }

        let file = path::normalize(target);
        if let Some(expected) = etag {
            let current = match state.nodes.get(&file) {
                Some(Node::File { etag, .. }) => Some(etag.as_str()),
                _ => None,
            };
            if current != Some(expected) {
                return Err(RemoteError::StaleVersion(file));
            }
        }

        state.ensure_parents(&file);
        let new_tag = state.new_tag();
        state.nodes.insert(
            file,
            Node::File {
                data: content,
                etag: new_tag.clone(),
            },
        );
        Ok(new_tag)
    }

    async fn delete_item(&self, target: &str, options: &DeleteOptions) -> RemoteResult<()> {
        let mut state = lock(&self.state)?;
        state.calls.delete += 1;
        let target = path::normalize(target);

        let file_tag = match state.nodes.get(&target) {
            None => return Err(RemoteError::NotFound(target)),
            Some(Node::File { etag, .. }) => Some(etag.clone()),
            Some(Node::Dir) => None,
        };

        match file_tag {
            Some(etag) => {
                if let Some(expected) = &options.if_match
                    && *expected != etag
                {
                    return Err(RemoteError::StaleVersion(target));
                }
            }
            None => {
                let prefix = format!("{target}/");
                let has_children = state.nodes.keys().any(|k| k.starts_with(&prefix));
                if has_children && !options.recursive {
                    return Err(RemoteError::Http(format!("{target}: directory not empty")));
                }
                state.nodes.retain(|k, _| !k.starts_with(&prefix));
            }
        }
        state.nodes.remove(&target);
        Ok(())
    }

    fn description(&self) -> String {
        "memory".to_string()
    }
}
