//! Keep-alive for hosts that idle out while a tunnel is being set up.
//!
//! Probes the host immediately, then again after
//! [`KeepAliveConfig::retry_interval`] if the probe failed or
//! [`KeepAliveConfig::steady_interval`] if it succeeded, until stopped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::KeepAliveConfig;
use crate::errors::RemoteResult;

/// Something that can tell whether a host is awake.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self) -> RemoteResult<()>;
}

pub struct KeepAlive {
    cancel: CancellationToken,
    task: Option<JoinHandle<u64>>,
}

impl KeepAlive {
    pub fn from_config(probe: Arc<dyn LivenessProbe>, config: &KeepAliveConfig) -> Self {
        Self::spawn(probe, config.retry_interval(), config.steady_interval())
    }

    pub fn spawn(probe: Arc<dyn LivenessProbe>, retry: Duration, steady: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(probe, retry, steady, cancel.clone()));
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop probing.  Returns the number of probes issued.
    pub async fn stop(mut self) -> u64 {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    probe: Arc<dyn LivenessProbe>,
    retry: Duration,
    steady: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut probes = 0;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = probe.probe() => outcome,
        };
        probes += 1;
        let delay = match outcome {
            Ok(()) => {
                debug!(probes, "keep-alive probe succeeded");
                steady
            }
            Err(e) => {
                warn!(probes, "keep-alive probe failed: {e}");
                retry
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    probes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RemoteError;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fails the first `failures` probes, then succeeds.
    struct FlakyProbe {
        failures: u64,
        calls: AtomicU64,
    }

    #[async_trait]
    impl LivenessProbe for FlakyProbe {
        async fn probe(&self) -> RemoteResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(RemoteError::Unavailable("sleeping".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn retries_fast_then_settles() {
        let probe = Arc::new(FlakyProbe {
            failures: 2,
            calls: AtomicU64::new(0),
        });
        let keepalive = KeepAlive::spawn(
            probe.clone(),
            Duration::from_millis(5),
            Duration::from_secs(3600),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while probe.calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(keepalive.stop().await, 3);
    }

    #[tokio::test]
    async fn drop_stops_probing() {
        let probe = Arc::new(FlakyProbe {
            failures: u64::MAX,
            calls: AtomicU64::new(0),
        });
        let keepalive = KeepAlive::spawn(
            probe.clone(),
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(keepalive);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let after_drop = probe.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), after_drop);
    }
}
