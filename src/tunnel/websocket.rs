//! WebSocket upstream for the debug tunnel.
//!
//! The management host exposes the tunnel at a fixed path and speaks plain
//! binary frames: one frame per chunk in each direction.  Authentication
//! is HTTP basic with the host's publishing credentials on the upgrade
//! request, which also carries cache-defeating headers.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use super::{UpstreamChannel, UpstreamConnector, UpstreamSink};
use crate::errors::{RemoteError, RemoteResult};
use crate::host::HostHandle;

const USER_AGENT: &str = concat!("apphost-remote/", env!("CARGO_PKG_VERSION"));

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketConnector {
    url: String,
    authorization: String,
}

impl WebSocketConnector {
    /// Connector for `wss://<scm-host><path>`.
    pub fn new(handle: &HostHandle, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self::with_url(format!("wss://{}{path}", handle.scm_host), handle)
    }

    /// Connector for an explicit URL (`ws://` or `wss://`).
    pub fn with_url(url: impl Into<String>, handle: &HostHandle) -> Self {
        Self {
            url: url.into(),
            authorization: basic_auth(&handle.username, &handle.password),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self) -> RemoteResult<Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RemoteError::Tunnel(format!("invalid tunnel URL {}: {e}", self.url)))?;
        let authorization = HeaderValue::from_str(&self.authorization)
            .map_err(|e| RemoteError::Tunnel(format!("invalid credentials: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(header::AUTHORIZATION, authorization);
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        Ok(request)
    }
}

fn basic_auth(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

#[async_trait]
impl UpstreamConnector for WebSocketConnector {
    async fn connect(&self) -> RemoteResult<UpstreamChannel> {
        let request = self.request()?;
        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| RemoteError::Tunnel(format!("{}: {e}", self.url)))?;
        debug!(url = %self.url, status = %response.status(), "tunnel upgraded");

        let (sink, frames) = ws.split();
        let stream = futures_util::stream::unfold(frames, |mut frames| async move {
            loop {
                match frames.next().await? {
                    Ok(Message::Binary(data)) => return Some((Ok(data), frames)),
                    Ok(Message::Text(text)) => {
                        return Some((Ok(Bytes::copy_from_slice(text.as_bytes())), frames));
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "upstream sent close frame");
                        return None;
                    }
                    Ok(_) => continue,
                    Err(e) => return Some((Err(RemoteError::Tunnel(e.to_string())), frames)),
                }
            }
        })
        .boxed();

        Ok(UpstreamChannel {
            sink: Box::new(WebSocketSink { inner: sink }),
            stream,
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl UpstreamSink for WebSocketSink {
    async fn send(&mut self, message: Bytes) -> RemoteResult<()> {
        self.inner
            .send(Message::Binary(message))
            .await
            .map_err(|e| RemoteError::Tunnel(format!("send failed: {e}")))
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.inner
            .close()
            .await
            .map_err(|e| RemoteError::Tunnel(format!("close failed: {e}")))
    }
}
