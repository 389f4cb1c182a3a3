//! HTTP binding of the remote file API.
//!
//! The management endpoint of an app host exposes its home directory under
//! `https://<scm-host>/api/vfs/`:
//!
//! | Operation        | Request                                   |
//! |------------------|-------------------------------------------|
//! | list directory   | `GET /api/vfs/<path>/`                    |
//! | read file        | `GET /api/vfs/<path>` (tag in `ETag`)     |
//! | write file       | `PUT /api/vfs/<path>` + `If-Match`        |
//! | create directory | `PUT /api/vfs/<path>/`                    |
//! | delete           | `DELETE /api/vfs/<path>[/]` + `If-Match`  |
//!
//! Every request authenticates with the host's publishing credentials.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{CACHE_CONTROL, ETAG, IF_MATCH};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{DeleteOptions, FileContents, ListingEntry, RemoteFileClient};
use crate::errors::{RemoteError, RemoteResult};
use crate::host::HostHandle;
use crate::path;
use crate::tunnel::keepalive::LivenessProbe;

const USER_AGENT: &str = concat!("apphost-remote/", env!("CARGO_PKG_VERSION"));

/// `If-Match` value for unconditional writes.
const ANY_VERSION: &str = "*";

/// Listing entry as serialized by the remote file API.
#[derive(Debug, Deserialize)]
struct VfsEntry {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mtime: Option<String>,
    #[serde(default)]
    crtime: Option<String>,
    #[serde(default)]
    mime: String,
    #[serde(default)]
    path: String,
}

impl From<VfsEntry> for ListingEntry {
    fn from(entry: VfsEntry) -> Self {
        ListingEntry {
            name: entry.name,
            path: entry.path,
            mime: entry.mime,
            size: entry.size,
            created: entry.crtime.as_deref().and_then(parse_timestamp),
            modified: entry.mtime.as_deref().and_then(parse_timestamp),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub struct KuduClient {
    http: reqwest::Client,
    vfs_base: Url,
    site_url: Option<Url>,
    username: String,
    password: String,
}

impl KuduClient {
    /// Client for `handle`'s management endpoint over HTTPS.
    pub fn new(handle: &HostHandle) -> RemoteResult<Self> {
        let scm = parse_url(&format!("https://{}/", handle.scm_host))?;
        let site = handle
            .site_host
            .as_deref()
            .map(|h| parse_url(&format!("https://{h}/")))
            .transpose()?;
        Self::with_endpoints(handle, scm, site)
    }

    /// Client for explicit endpoints (plain HTTP proxies, local emulators).
    pub fn with_endpoints(
        handle: &HostHandle,
        scm: Url,
        site: Option<Url>,
    ) -> RemoteResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Internal(format!("failed to build HTTP client: {e}")))?;
        let vfs_base = scm
            .join("api/vfs/")
            .map_err(|e| RemoteError::Internal(format!("invalid endpoint {scm}: {e}")))?;

        Ok(Self {
            http,
            vfs_base,
            site_url: site,
            username: handle.username.clone(),
            password: handle.password.clone(),
        })
    }

    /// URL of `path` under the VFS root; `directory` appends the trailing `/`.
    fn vfs_url(&self, target: &str, directory: bool) -> RemoteResult<Url> {
        let mut url = self.vfs_base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                RemoteError::Internal(format!("endpoint {} cannot be a base", self.vfs_base))
            })?;
            segments.pop_if_empty();
            for segment in path::segments(target) {
                segments.push(segment);
            }
            if directory {
                segments.push("");
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header(CACHE_CONTROL, "no-cache")
    }

    async fn send(&self, target: &str, request: RequestBuilder) -> RemoteResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::from_http(target, e))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(RemoteError::from_status(status.as_u16(), target))
        }
    }
}

fn parse_url(raw: &str) -> RemoteResult<Url> {
    Url::parse(raw).map_err(|e| RemoteError::Unavailable(format!("invalid host '{raw}': {e}")))
}

fn etag_of(response: &Response) -> String {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl RemoteFileClient for KuduClient {
    async fn list_directory(&self, dir: &str) -> RemoteResult<Vec<ListingEntry>> {
        let url = self.vfs_url(dir, true)?;
        debug!(%url, "listing remote directory");
        let response = self.send(dir, self.request(Method::GET, url)).await?;
        let entries: Vec<VfsEntry> = response
            .json()
            .await
            .map_err(|e| RemoteError::Http(format!("{dir}: invalid listing: {e}")))?;
        Ok(entries.into_iter().map(ListingEntry::from).collect())
    }

    async fn get_file(&self, file: &str) -> RemoteResult<FileContents> {
        let url = self.vfs_url(file, false)?;
        let response = self.send(file, self.request(Method::GET, url)).await?;
        let etag = etag_of(&response);
        let data = response
            .bytes()
            .await
            .map_err(|e| RemoteError::from_http(file, e))?;
        Ok(FileContents { data, etag })
    }

    async fn put_file(
        &self,
        target: &str,
        content: Bytes,
        etag: Option<&str>,
    ) -> RemoteResult<String> {
        let url = self.vfs_url(target, target.ends_with('/'))?;
        let request = self
            .request(Method::PUT, url)
            .header(IF_MATCH, etag.unwrap_or(ANY_VERSION))
            .body(content);
        let response = self.send(target, request).await?;
        Ok(etag_of(&response))
    }

    async fn delete_item(&self, target: &str, options: &DeleteOptions) -> RemoteResult<()> {
        let mut url = self.vfs_url(target, target.ends_with('/'))?;
        if options.recursive {
            url.query_pairs_mut().append_pair("recursive", "true");
        }
        let request = self
            .request(Method::DELETE, url)
            .header(IF_MATCH, options.if_match.as_deref().unwrap_or(ANY_VERSION));
        self.send(target, request).await?;
        Ok(())
    }

    fn description(&self) -> String {
        self.vfs_base.host_str().unwrap_or_default().to_string()
    }
}

#[async_trait]
impl LivenessProbe for KuduClient {
    /// Any HTTP response counts as alive; only transport failures do not.
    async fn probe(&self) -> RemoteResult<()> {
        let url = match &self.site_url {
            Some(site) => site.clone(),
            None => self
                .vfs_base
                .join("/")
                .map_err(|e| RemoteError::Internal(e.to_string()))?,
        };
        self.http
            .get(url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(format!("{url}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KuduClient {
        let handle = HostHandle::new("app", "app.scm.example.net", "$app", "pw")
            .with_site_host("app.example.net");
        KuduClient::new(&handle).unwrap()
    }

    #[test]
    fn vfs_url_for_file() {
        let url = client().vfs_url("site/wwwroot/app.js", false).unwrap();
        assert_eq!(
            url.as_str(),
            "https://app.scm.example.net/api/vfs/site/wwwroot/app.js"
        );
    }

    #[test]
    fn vfs_url_for_directory_has_trailing_slash() {
        let url = client().vfs_url("site/wwwroot", true).unwrap();
        assert_eq!(url.as_str(), "https://app.scm.example.net/api/vfs/site/wwwroot/");
    }

    #[test]
    fn vfs_url_for_root() {
        let url = client().vfs_url("", true).unwrap();
        assert_eq!(url.as_str(), "https://app.scm.example.net/api/vfs/");
    }

    #[test]
    fn vfs_url_escapes_segments() {
        let url = client().vfs_url("site/my file#1.txt", false).unwrap();
        assert_eq!(
            url.as_str(),
            "https://app.scm.example.net/api/vfs/site/my%20file%231.txt"
        );
    }

    #[test]
    fn listing_entry_from_wire() {
        let raw = r#"[{
            "name": "wwwroot",
            "size": 0,
            "mtime": "2024-03-01T10:15:30.1234567+00:00",
            "crtime": "2023-12-24T08:00:00+00:00",
            "mime": "inode/directory",
            "href": "https://app.scm.example.net/api/vfs/site/wwwroot/",
            "path": "C:\\home\\site\\wwwroot"
        }, {
            "name": "app.js",
            "size": 42,
            "mtime": "not a date",
            "mime": "application/javascript",
            "path": "/home/site/wwwroot/app.js"
        }]"#;
        let entries: Vec<VfsEntry> = serde_json::from_str(raw).unwrap();
        let entries: Vec<ListingEntry> = entries.into_iter().map(ListingEntry::from).collect();

        assert!(entries[0].is_directory());
        assert_eq!(entries[0].path, r"C:\home\site\wwwroot");
        assert!(entries[0].modified.is_some());
        assert!(entries[0].created.is_some());

        assert!(!entries[1].is_directory());
        assert_eq!(entries[1].size, 42);
        assert!(entries[1].modified.is_none());
        assert!(entries[1].created.is_none());
    }

    #[test]
    fn description_is_endpoint_host() {
        assert_eq!(client().description(), "app.scm.example.net");
    }
}
