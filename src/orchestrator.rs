//! Remote debugging session setup.
//!
//! Attaching a debugger to a hosted app runs these steps in order:
//!
//! 1. pick a local port (caller-supplied or OS-assigned),
//! 2. make sure the host has remote debugging enabled (this may restart it),
//! 3. keep the host awake while it comes back, if configured,
//! 4. start the tunnel proxy and wait until it relays,
//! 5. hand the local address to the debugger.
//!
//! A failure at any step tears the proxy down.  The whole sequence can be
//! bounded by [`Config::attach_deadline`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::kudu::KuduClient;
use crate::config::Config;
use crate::errors::{RemoteError, RemoteResult};
use crate::host::HostHandle;
use crate::tunnel::keepalive::{KeepAlive, LivenessProbe};
use crate::tunnel::websocket::WebSocketConnector;
use crate::tunnel::{TunnelProxy, TunnelState, UpstreamConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsOutcome {
    AlreadyEnabled,
    /// Settings were changed; the host restarts to apply them.
    Updated,
}

/// Host-side configuration needed before a debugger can attach.
#[async_trait]
pub trait RemoteSettings: Send + Sync {
    async fn ensure_remote_debugging(&self, host: &HostHandle) -> RemoteResult<SettingsOutcome>;
}

/// The debugger that connects to the local end of the tunnel.
#[async_trait]
pub trait DebuggerAttach: Send + Sync {
    async fn attach(&self, local_addr: SocketAddr) -> RemoteResult<()>;
}

pub struct RemoteDebugOrchestrator {
    host: HostHandle,
    config: Config,
    settings: Arc<dyn RemoteSettings>,
    attacher: Arc<dyn DebuggerAttach>,
    connector: Arc<dyn UpstreamConnector>,
    probe: Arc<dyn LivenessProbe>,
}

impl RemoteDebugOrchestrator {
    pub fn new(
        host: HostHandle,
        config: Config,
        settings: Arc<dyn RemoteSettings>,
        attacher: Arc<dyn DebuggerAttach>,
    ) -> RemoteResult<Self> {
        let connector = Arc::new(WebSocketConnector::new(&host, &config.tunnel.path));
        let probe = Arc::new(KuduClient::new(&host)?);
        Ok(Self {
            host,
            config,
            settings,
            attacher,
            connector,
            probe,
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Set up a tunnel and attach the debugger to it.
    ///
    /// `port` overrides the configured local port.
    pub async fn attach(&self, port: Option<u16>) -> RemoteResult<AttachedSession> {
        match self.config.attach_deadline() {
            Some(deadline) => tokio::time::timeout(deadline, self.attach_steps(port))
                .await
                .map_err(|_| {
                    RemoteError::Tunnel(format!("debugger not attached within {deadline:?}"))
                })?,
            None => self.attach_steps(port).await,
        }
    }

    async fn attach_steps(&self, port: Option<u16>) -> RemoteResult<AttachedSession> {
        let mut listen = self.config.tunnel.listen_addr();
        if let Some(port) = port {
            listen.set_port(port);
        }
        if listen.port() == 0 {
            listen.set_port(free_port(listen).await?);
        }
        info!(host = %self.host.id, %listen, "attaching debugger");

        match self.settings.ensure_remote_debugging(&self.host).await? {
            SettingsOutcome::AlreadyEnabled => info!("remote debugging already enabled"),
            SettingsOutcome::Updated => info!("remote debugging enabled; host is restarting"),
        }

        let keepalive = self
            .config
            .keepalive
            .enabled
            .then(|| KeepAlive::from_config(Arc::clone(&self.probe), &self.config.keepalive));

        let proxy = TunnelProxy::new(listen, Arc::clone(&self.connector));
        let ready = match proxy.start().await {
            Ok(_) => proxy.wait_ready().await,
            Err(e) => Err(e),
        };
        if let Some(keepalive) = keepalive {
            let probes = keepalive.stop().await;
            info!(probes, "keep-alive stopped");
        }

        let local_addr = match ready {
            Ok(addr) => addr,
            Err(e) => {
                proxy.dispose().await;
                return Err(e);
            }
        };

        if let Err(e) = self.attacher.attach(local_addr).await {
            warn!(%local_addr, "debugger failed to attach: {e}");
            proxy.dispose().await;
            return Err(e);
        }
        info!(%local_addr, "debugger attached");

        Ok(AttachedSession { proxy, local_addr })
    }
}

/// Bind `addr` with port `0` and release it, returning the port the OS chose.
async fn free_port(addr: SocketAddr) -> RemoteResult<u16> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RemoteError::Socket(format!("cannot allocate a port on {addr}: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| RemoteError::Socket(format!("listener address: {e}")))?
        .port();
    Ok(port)
}

/// A debugger attached through a running tunnel.
pub struct AttachedSession {
    proxy: TunnelProxy,
    local_addr: SocketAddr,
}

impl AttachedSession {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> TunnelState {
        self.proxy.state()
    }

    /// Wait until the tunnel ends.  A failure was already logged by the
    /// tunnel; it is returned here without logging it again.
    pub async fn wait(&self) -> RemoteResult<()> {
        let outcome = self.proxy.wait_closed().await;
        let fatal = outcome.as_ref().err().is_some_and(RemoteError::is_tunnel_fatal);
        debug!(ok = outcome.is_ok(), fatal, "debug session ended");
        outcome
    }

    pub async fn detach(self) {
        self.proxy.dispose().await;
    }
}
