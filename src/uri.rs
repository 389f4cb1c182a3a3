//! Addressing scheme for remote files.
//!
//! ```text
//! <scheme>:/<host-id>/<canonical-path>
//! apphost:/subscriptions/…/sites/myapp/site/wwwroot/app.js
//! ```
//!
//! The host id is resolved against a [`HostRegistry`]; the remainder is a
//! canonical path (see [`crate::path`]).

use std::sync::Arc;

use crate::errors::{RemoteError, RemoteResult};
use crate::host::{HostRegistry, RemoteHost};
use crate::path;

/// Default URI scheme.
pub const DEFAULT_SCHEME: &str = "apphost";

/// A resolved address: the host it lives on and its canonical path.
#[derive(Debug, Clone)]
pub struct RemoteAddress {
    pub host: Arc<RemoteHost>,
    pub path: String,
}

impl RemoteAddress {
    /// Key identifying this resource across hosts.
    pub fn key(&self) -> String {
        format!("{}/{}", self.host.id().trim_matches('/'), self.path)
    }
}

/// Format a URI for `path` on host `host_id`.
pub fn format(scheme: &str, host_id: &str, path: &str) -> String {
    let host_id = host_id.trim_matches('/');
    let path = path::normalize(path);
    if path.is_empty() {
        format!("{scheme}:/{host_id}")
    } else {
        format!("{scheme}:/{host_id}/{path}")
    }
}

/// Parse `uri` and resolve its host through `registry`.
///
/// A wrong scheme or an unregistered host fails with
/// [`RemoteError::Unavailable`].
pub fn parse(scheme: &str, uri: &str, registry: &HostRegistry) -> RemoteResult<RemoteAddress> {
    let rest = uri
        .split_once(':')
        .filter(|(s, _)| s.eq_ignore_ascii_case(scheme))
        .map(|(_, rest)| rest)
        .ok_or_else(|| RemoteError::Unavailable(format!("not a {scheme}: URI: '{uri}'")))?;

    let (host, remainder) = registry.resolve_prefix(rest)?;
    Ok(RemoteAddress {
        host,
        path: path::normalize(remainder),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryClient;
    use crate::host::HostHandle;

    const RESOURCE_ID: &str = "/subscriptions/abc/resourceGroups/rg/providers/Microsoft.Web/sites/app";

    fn registry() -> HostRegistry {
        let registry = HostRegistry::new();
        registry
            .register(
                HostHandle::new(RESOURCE_ID, "app.scm.test", "$app", "pw"),
                Arc::new(MemoryClient::new()),
            )
            .unwrap();
        registry
    }

    #[test]
    fn format_nested_path() {
        assert_eq!(
            format("apphost", RESOURCE_ID, "site/wwwroot/app.js"),
            "apphost:/subscriptions/abc/resourceGroups/rg/providers/Microsoft.Web/sites/app/site/wwwroot/app.js"
        );
    }

    #[test]
    fn format_root() {
        assert_eq!(format("apphost", "mysite", ""), "apphost:/mysite");
    }

    #[test]
    fn parse_resolves_host_and_path() {
        let registry = registry();
        let uri = format("apphost", RESOURCE_ID, "site/wwwroot/app.js");
        let addr = parse("apphost", &uri, &registry).unwrap();
        assert_eq!(addr.host.id(), RESOURCE_ID);
        assert_eq!(addr.path, "site/wwwroot/app.js");
    }

    #[test]
    fn parse_root_and_extra_slashes() {
        let registry = registry();
        let uri = format!("apphost:///{}/", RESOURCE_ID.trim_start_matches('/'));
        let addr = parse("apphost", &uri, &registry).unwrap();
        assert_eq!(addr.path, "");
    }

    #[test]
    fn parse_scheme_is_case_insensitive() {
        let registry = registry();
        let uri = format("AppHost", RESOURCE_ID, "site");
        assert!(parse("apphost", &uri, &registry).is_ok());
    }

    #[test]
    fn parse_wrong_scheme_is_unavailable() {
        let registry = registry();
        let uri = format("file", RESOURCE_ID, "site");
        let err = parse("apphost", &uri, &registry).unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
    }

    #[test]
    fn parse_unknown_host_is_unavailable() {
        let registry = registry();
        let err = parse("apphost", "apphost:/nope/site", &registry).unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
    }

    #[test]
    fn key_includes_host() {
        let registry = registry();
        let uri = format("apphost", RESOURCE_ID, "site/a.txt");
        let addr = parse("apphost", &uri, &registry).unwrap();
        assert!(addr.key().ends_with("sites/app/site/a.txt"));
    }
}
