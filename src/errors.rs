use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("malformed remote path: {0}")]
    MalformedPath(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote host unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict: {0} was modified remotely")]
    StaleVersion(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("tunnel: {0}")]
    Tunnel(String),

    #[error("socket: {0}")]
    Socket(String),

    #[error("http: {0}")]
    Http(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Classify a non-success HTTP status from the remote file API.
    pub fn from_status(status: u16, path: &str) -> Self {
        match status {
            404 => RemoteError::NotFound(path.to_string()),
            401 | 403 => RemoteError::PermissionDenied(path.to_string()),
            409 | 412 => RemoteError::StaleVersion(path.to_string()),
            _ => RemoteError::Http(format!("{path}: unexpected status {status}")),
        }
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_http(path: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), path);
        }
        if err.is_connect() || err.is_timeout() {
            RemoteError::Unavailable(format!("{path}: {err}"))
        } else {
            RemoteError::Http(format!("{path}: {err}"))
        }
    }

    /// `true` for failures that end a tunnel session.
    pub fn is_tunnel_fatal(&self) -> bool {
        matches!(self, RemoteError::Tunnel(_) | RemoteError::Socket(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            RemoteError::from_status(404, "site/a"),
            RemoteError::NotFound("site/a".into())
        );
        assert!(matches!(
            RemoteError::from_status(403, "x"),
            RemoteError::PermissionDenied(_)
        ));
        assert!(matches!(
            RemoteError::from_status(412, "x"),
            RemoteError::StaleVersion(_)
        ));
        assert!(matches!(
            RemoteError::from_status(500, "x"),
            RemoteError::Http(_)
        ));
    }

    #[test]
    fn tunnel_fatal_variants() {
        assert!(RemoteError::Tunnel("closed".into()).is_tunnel_fatal());
        assert!(RemoteError::Socket("reset".into()).is_tunnel_fatal());
        assert!(!RemoteError::NotFound("x".into()).is_tunnel_fatal());
    }
}
