//! In-memory upstream channel for tunnel tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{UpstreamChannel, UpstreamConnector, UpstreamSink};
use crate::errors::{RemoteError, RemoteResult};

/// The test's side of the channel.
pub struct MemoryUpstream {
    /// Messages the "remote" sends into the tunnel.
    pub inbound: mpsc::UnboundedSender<RemoteResult<Bytes>>,
    /// Messages the tunnel sent to the "remote".
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
    /// How many times the tunnel closed its sink.
    pub closes: Arc<AtomicUsize>,
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<Bytes>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl UpstreamSink for MemorySink {
    async fn send(&mut self, message: Bytes) -> RemoteResult<()> {
        self.outbound
            .send(message)
            .map_err(|_| RemoteError::Tunnel("upstream receiver dropped".into()))
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryConnector {
    channel: Mutex<Option<UpstreamChannel>>,
    failure: Option<RemoteError>,
    delay: Option<Duration>,
    connects: AtomicUsize,
}

/// A connector that hands out one in-memory channel.
pub fn memory_upstream() -> (MemoryConnector, MemoryUpstream) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));

    let stream = futures_util::stream::unfold(inbound_rx, |mut rx| async move {
        rx.recv().await.map(|message| (message, rx))
    })
    .boxed();
    let sink = MemorySink {
        outbound: outbound_tx,
        closes: Arc::clone(&closes),
    };

    let connector = MemoryConnector {
        channel: Mutex::new(Some(UpstreamChannel {
            sink: Box::new(sink),
            stream,
        })),
        failure: None,
        delay: None,
        connects: AtomicUsize::new(0),
    };
    let upstream = MemoryUpstream {
        inbound: inbound_tx,
        outbound: outbound_rx,
        closes,
    };
    (connector, upstream)
}

impl MemoryConnector {
    /// A connector whose handshake always fails with `failure`.
    pub fn failing(failure: RemoteError) -> Self {
        Self {
            channel: Mutex::new(None),
            failure: Some(failure),
            delay: None,
            connects: AtomicUsize::new(0),
        }
    }

    /// Make the handshake take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for MemoryConnector {
    async fn connect(&self) -> RemoteResult<UpstreamChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        self.channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RemoteError::Tunnel("memory upstream already used".into()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
