//! Host handles and the registry that resolves them.
//!
//! A [`HostHandle`] is everything needed to reach one remote app instance:
//! its identifier (a resource id, unique per host), the management
//! endpoint that serves the file API and the tunnel, and the publishing
//! credentials for basic authentication.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::client::RemoteFileClient;
use crate::errors::{RemoteError, RemoteResult};

#[derive(Clone, PartialEq, Eq)]
pub struct HostHandle {
    /// Opaque host identity; may contain `/`.
    pub id: String,
    /// Management endpoint host name (file API and tunnel).
    pub scm_host: String,
    /// Public site host name, used by keep-alive probes.
    pub site_host: Option<String>,
    pub username: String,
    pub password: String,
}

impl HostHandle {
    pub fn new(
        id: impl Into<String>,
        scm_host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            scm_host: scm_host.into(),
            site_host: None,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn with_site_host(mut self, site_host: impl Into<String>) -> Self {
        self.site_host = Some(site_host.into());
        self
    }
}

// Credentials never end up in logs.
impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("id", &self.id)
            .field("scm_host", &self.scm_host)
            .field("site_host", &self.site_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A registered host: its handle plus the client that talks to it.
pub struct RemoteHost {
    handle: HostHandle,
    client: Arc<dyn RemoteFileClient>,
}

impl RemoteHost {
    pub fn new(handle: HostHandle, client: Arc<dyn RemoteFileClient>) -> Self {
        Self { handle, client }
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn handle(&self) -> &HostHandle {
        &self.handle
    }

    pub fn client(&self) -> &Arc<dyn RemoteFileClient> {
        &self.client
    }
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("handle", &self.handle)
            .field("client", &self.client.description())
            .finish()
    }
}

/// The set of hosts an adapter instance can address.
#[derive(Default)]
pub struct HostRegistry {
    hosts: RwLock<Vec<Arc<RemoteHost>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a host.
    pub fn register(
        &self,
        handle: HostHandle,
        client: Arc<dyn RemoteFileClient>,
    ) -> RemoteResult<Arc<RemoteHost>> {
        let host = Arc::new(RemoteHost::new(handle, client));
        let mut hosts = self
            .hosts
            .write()
            .map_err(|e| RemoteError::Internal(format!("host registry poisoned: {e}")))?;
        hosts.retain(|h| h.id() != host.id());
        hosts.push(Arc::clone(&host));
        Ok(host)
    }

    pub fn get(&self, id: &str) -> Option<Arc<RemoteHost>> {
        let hosts = self.hosts.read().ok()?;
        hosts.iter().find(|h| h.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split `address` (`<host-id>/<rest>`, leading slashes ignored) into
    /// the registered host and the remainder.
    ///
    /// Host ids may contain `/`, so the longest registered id that ends on a
    /// segment boundary wins.
    pub fn resolve_prefix<'a>(
        &self,
        address: &'a str,
    ) -> RemoteResult<(Arc<RemoteHost>, &'a str)> {
        let address = address.trim_start_matches('/');
        let hosts = self
            .hosts
            .read()
            .map_err(|e| RemoteError::Internal(format!("host registry poisoned: {e}")))?;

        let mut best: Option<(&Arc<RemoteHost>, &'a str)> = None;
        for host in hosts.iter() {
            let id = host.id().trim_matches('/');
            if id.is_empty() {
                continue;
            }
            let Some(rest) = address.strip_prefix(id) else {
                continue;
            };
            if !(rest.is_empty() || rest.starts_with('/')) {
                continue;
            }
            if best.is_none_or(|(b, _)| b.id().trim_matches('/').len() < id.len()) {
                best = Some((host, rest));
            }
        }

        best.map(|(host, rest)| (Arc::clone(host), rest))
            .ok_or_else(|| RemoteError::Unavailable(format!("unknown host in '{address}'")))
    }
}
