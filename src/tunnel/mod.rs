//! Debug tunnel proxy.
//!
//! A [`TunnelProxy`] listens on a local TCP port and relays every accepted
//! connection over one shared, message-framed upstream channel:
//!
//! ```text
//! debugger A ─┐                              ┌─ message per local chunk
//! debugger B ─┼─ 127.0.0.1:<port> ═ proxy ═══╡
//! debugger C ─┘                              └─ every upstream message is
//!                                               written to A, B and C
//! ```
//!
//! Lifecycle: `Idle → Starting → Relaying → Closed(ok | error)`.  States
//! only move forward; a closed proxy is never reopened.  The listener, the
//! local sockets and the upstream channel belong to one [`Session`] that is
//! torn down exactly once, however many triggers fire.

pub mod keepalive;
#[cfg(test)]
pub mod memory;
pub mod websocket;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{RemoteError, RemoteResult};

/// Largest chunk read from a local socket in one go; each read becomes one
/// upstream message.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Depth of the queue between local socket readers and the relay loop.
const LOCAL_EVENT_QUEUE: usize = 64;

/// Upstream messages buffered per local socket.  A socket that falls this
/// far behind fails the session.
const LOCAL_WRITE_QUEUE: usize = 256;

/// Upper bound on closing the upstream during teardown.
const UPSTREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Upstream abstraction
// ---------------------------------------------------------------------------

/// Inbound upstream messages; the stream ending means a clean close.
pub type UpstreamStream = BoxStream<'static, RemoteResult<Bytes>>;

/// Outbound half of the upstream channel.
#[async_trait]
pub trait UpstreamSink: Send {
    /// Send one message.
    async fn send(&mut self, message: Bytes) -> RemoteResult<()>;

    /// Close the channel.
    async fn close(&mut self) -> RemoteResult<()>;
}

pub struct UpstreamChannel {
    pub sink: Box<dyn UpstreamSink>,
    pub stream: UpstreamStream,
}

/// Opens the upstream channel for a tunnel session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> RemoteResult<UpstreamChannel>;

    /// Endpoint description for log lines.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Starting,
    Relaying { local_addr: SocketAddr },
    Closed(RemoteResult<()>),
}

impl TunnelState {
    pub fn is_closed(&self) -> bool {
        matches!(self, TunnelState::Closed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            TunnelState::Idle => "idle",
            TunnelState::Starting => "starting",
            TunnelState::Relaying { .. } => "relaying",
            TunnelState::Closed(Ok(())) => "closed",
            TunnelState::Closed(Err(_)) => "failed",
        }
    }
}

/// Publishes state changes; refuses to leave `Closed`.
struct StateCell {
    tx: watch::Sender<TunnelState>,
}

impl StateCell {
    fn get(&self) -> TunnelState {
        self.tx.borrow().clone()
    }

    /// Apply `next` if the current state satisfies `allowed`.
    fn advance(&self, next: TunnelState, allowed: impl FnOnce(&TunnelState) -> bool) -> bool {
        let mut from = "";
        let changed = self.tx.send_if_modified(|current| {
            if current.is_closed() || !allowed(current) {
                return false;
            }
            from = current.label();
            *current = next.clone();
            true
        });
        if changed {
            match &next {
                TunnelState::Closed(Err(e)) => error!(from, "tunnel failed: {e}"),
                TunnelState::Relaying { local_addr } => {
                    info!(from, %local_addr, "tunnel relaying")
                }
                other => info!(from, to = other.label(), "tunnel state changed"),
            }
        }
        changed
    }

    fn close(&self, outcome: RemoteResult<()>) -> bool {
        self.advance(TunnelState::Closed(outcome), |_| true)
    }
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

pub struct TunnelProxy {
    listen: SocketAddr,
    connector: Arc<dyn UpstreamConnector>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelProxy {
    /// A proxy that will listen on `listen` (port `0` lets the OS choose).
    pub fn new(listen: SocketAddr, connector: Arc<dyn UpstreamConnector>) -> Self {
        let (tx, _) = watch::channel(TunnelState::Idle);
        Self {
            listen,
            connector,
            state: Arc::new(StateCell { tx }),
            cancel: CancellationToken::new(),
            relay: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.tx.subscribe()
    }

    /// Bind the listener and open the upstream concurrently, then start
    /// relaying.  Returns the bound local address.
    ///
    /// Fails if the proxy was already started or disposed.  On failure the
    /// proxy is `Closed` with the error.
    pub async fn start(&self) -> RemoteResult<SocketAddr> {
        if !self
            .state
            .advance(TunnelState::Starting, |s| *s == TunnelState::Idle)
        {
            return Err(RemoteError::Tunnel(format!(
                "cannot start a {} tunnel",
                self.state().label()
            )));
        }
        debug!(listen = %self.listen, upstream = %self.connector.describe(), "starting tunnel");

        let established = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.state.close(Ok(()));
                return Err(RemoteError::Tunnel("disposed while starting".into()));
            }
            result = establish(self.listen, self.connector.as_ref()) => result,
        };
        let session = match established {
            Ok(session) => session,
            Err(e) => {
                self.state.close(Err(e.clone()));
                return Err(e);
            }
        };

        let mut relay = self.relay.lock().await;
        if self.cancel.is_cancelled() {
            session.teardown().await;
            self.state.close(Ok(()));
            return Err(RemoteError::Tunnel("disposed while starting".into()));
        }

        let local_addr = session.local_addr;
        self.state
            .advance(TunnelState::Relaying { local_addr }, |s| *s == TunnelState::Starting);

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        *relay = Some(tokio::spawn(async move {
            let mut session = session;
            let outcome = session.run(&cancel).await;
            session.teardown().await;
            state.close(outcome);
        }));

        Ok(local_addr)
    }

    /// Resolve with the local address once relaying, or with the terminal
    /// error if the proxy closes first.
    pub async fn wait_ready(&self) -> RemoteResult<SocketAddr> {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, TunnelState::Relaying { .. } | TunnelState::Closed(_)))
            .await
            .map_err(|_| RemoteError::Internal("tunnel state channel dropped".into()))?;
        match &*state {
            TunnelState::Relaying { local_addr } => Ok(*local_addr),
            TunnelState::Closed(Err(e)) => Err(e.clone()),
            TunnelState::Closed(Ok(())) => {
                Err(RemoteError::Tunnel("tunnel closed before it was ready".into()))
            }
            other => Err(RemoteError::Internal(format!(
                "unexpected tunnel state {}",
                other.label()
            ))),
        }
    }

    /// Resolve with the terminal outcome.
    pub async fn wait_closed(&self) -> RemoteResult<()> {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(TunnelState::is_closed)
            .await
            .map_err(|_| RemoteError::Internal("tunnel state channel dropped".into()))?;
        match &*state {
            TunnelState::Closed(outcome) => outcome.clone(),
            _ => Ok(()),
        }
    }

    /// Stop relaying and release every resource.  Safe to call at any
    /// time, any number of times.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let relay = self.relay.lock().await.take();
        if let Some(handle) = relay
            && let Err(e) = handle.await
        {
            self.state
                .close(Err(RemoteError::Internal(format!("relay task failed: {e}"))));
        }
        self.state.close(Ok(()));
    }
}

impl Drop for TunnelProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn establish(
    listen: SocketAddr,
    connector: &dyn UpstreamConnector,
) -> RemoteResult<Session> {
    let bind = async {
        TcpListener::bind(listen)
            .await
            .map_err(|e| RemoteError::Socket(format!("cannot listen on {listen}: {e}")))
    };
    let (listener, upstream) = tokio::try_join!(bind, connector.connect())?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| RemoteError::Socket(format!("listener address: {e}")))?;
    Ok(Session::new(listener, local_addr, upstream))
}

// ---------------------------------------------------------------------------
// Relay session
// ---------------------------------------------------------------------------

enum LocalEvent {
    Data(Bytes),
    Eof(u64),
    Failed(u64, std::io::Error),
}

/// Resources owned while relaying.  [`Session::teardown`] consumes it.
struct Session {
    listener: TcpListener,
    local_addr: SocketAddr,
    sink: Box<dyn UpstreamSink>,
    upstream: UpstreamStream,
    /// Outbound queue of each open local socket.
    writers: HashMap<u64, mpsc::Sender<Bytes>>,
    pumps: JoinSet<()>,
    events_tx: mpsc::Sender<LocalEvent>,
    events_rx: mpsc::Receiver<LocalEvent>,
    next_id: u64,
}

impl Session {
    fn new(listener: TcpListener, local_addr: SocketAddr, upstream: UpstreamChannel) -> Self {
        let (events_tx, events_rx) = mpsc::channel(LOCAL_EVENT_QUEUE);
        Self {
            listener,
            local_addr,
            sink: upstream.sink,
            upstream: upstream.stream,
            writers: HashMap::new(),
            pumps: JoinSet::new(),
            events_tx,
            events_rx,
            next_id: 0,
        }
    }

    async fn run(&mut self, cancel: &CancellationToken) -> RemoteResult<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("tunnel disposed");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => return Err(RemoteError::Socket(format!("accept failed: {e}"))),
                },
                message = self.upstream.next() => match message {
                    Some(Ok(data)) => self.broadcast(data)?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        info!("upstream closed the tunnel");
                        return Ok(());
                    }
                },
                Some(event) = self.events_rx.recv() => match event {
                    LocalEvent::Data(data) => tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("tunnel disposed during upstream send");
                            return Ok(());
                        }
                        sent = self.sink.send(data) => sent?,
                    },
                    LocalEvent::Eof(id) => {
                        info!(connection = id, "local connection ended");
                        return Ok(());
                    }
                    LocalEvent::Failed(id, e) => {
                        return Err(RemoteError::Socket(format!("connection {id}: {e}")));
                    }
                },
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection = id, "set_nodelay: {e}");
        }
        let (reader, writer) = stream.into_split();
        let (queue_tx, queue_rx) = mpsc::channel(LOCAL_WRITE_QUEUE);
        self.writers.insert(id, queue_tx);
        self.pumps.spawn(pump_local(id, reader, self.events_tx.clone()));
        self.pumps
            .spawn(drain_local(id, writer, queue_rx, self.events_tx.clone()));
        info!(connection = id, %peer, "local connection accepted");
    }

    /// Queue one upstream message for every open local socket.  Never
    /// waits on a socket; write errors come back as [`LocalEvent::Failed`].
    fn broadcast(&self, data: Bytes) -> RemoteResult<()> {
        for (id, queue) in &self.writers {
            match queue.try_send(data.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    return Err(RemoteError::Socket(format!("connection {id} stopped reading")));
                }
                // The writer already failed and reported it.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(())
    }

    async fn teardown(mut self) {
        self.pumps.abort_all();
        let sockets = self.writers.len();
        self.writers.clear();
        match tokio::time::timeout(UPSTREAM_CLOSE_TIMEOUT, self.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("closing upstream: {e}"),
            Err(_) => warn!("closing upstream timed out"),
        }
        debug!(sockets, local_addr = %self.local_addr, "tunnel resources released");
    }
}

/// Forward reads from one local socket to the relay loop.
async fn pump_local(id: u64, mut reader: OwnedReadHalf, events: mpsc::Sender<LocalEvent>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => LocalEvent::Eof(id),
            Ok(n) => LocalEvent::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => LocalEvent::Failed(id, e),
        };
        let last = !matches!(event, LocalEvent::Data(_));
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}

/// Write queued upstream messages to one local socket.
async fn drain_local(
    id: u64,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<LocalEvent>,
) {
    while let Some(data) = queue.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            let _ = events.send(LocalEvent::Failed(id, e)).await;
            return;
        }
    }
}
