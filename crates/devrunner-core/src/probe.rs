//! TCP port liveness probing.
//!
//! A successful connect only proves that *some* process has the port bound;
//! readiness of the supervised server is approximated by exactly that.

use crate::config::PortBinding;
use backon::{ConstantBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Outcome of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    Cancelled,
    /// The watched process went away before the port opened
    Exited,
}

#[derive(Debug)]
enum Miss {
    Closed,
    Exited,
}

#[derive(Debug, Clone)]
pub struct PortProbe {
    connect_timeout: Duration,
}

impl Default for PortProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

impl PortProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub async fn is_open(&self, binding: &PortBinding) -> bool {
        let connect = TcpStream::connect((binding.host.as_str(), binding.port));
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                trace!(%binding, error = %e, "Port probe refused");
                false
            }
            Err(_) => {
                trace!(%binding, "Port probe timed out");
                false
            }
        }
    }

    /// Poll at a fixed interval, giving up after `max_attempts` probes
    pub async fn wait_until_open(
        &self,
        binding: &PortBinding,
        max_attempts: u32,
        interval: Duration,
    ) -> bool {
        let never = CancellationToken::new();
        self.wait_for_readiness(binding, max_attempts, interval, &never, || async { true })
            .await
            == Readiness::Ready
    }

    /// Like [`wait_until_open`](Self::wait_until_open), but also stops when
    /// `cancel` fires or `still_alive` reports the process is gone
    pub async fn wait_for_readiness<F, Fut>(
        &self,
        binding: &PortBinding,
        max_attempts: u32,
        interval: Duration,
        cancel: &CancellationToken,
        still_alive: F,
    ) -> Readiness
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let attempt = || {
            let open = self.is_open(binding);
            let alive = still_alive();
            async move {
                if open.await {
                    Ok(())
                } else if !alive.await {
                    Err(Miss::Exited)
                } else {
                    Err(Miss::Closed)
                }
            }
        };

        let backoff = ConstantBuilder::default()
            .with_delay(interval)
            .with_max_times(max_attempts.saturating_sub(1) as usize);

        let probing = attempt
            .retry(backoff)
            .when(|miss| matches!(miss, Miss::Closed))
            .notify(|_, delay| trace!(%binding, ?delay, "Port not open yet"));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%binding, "Readiness wait cancelled");
                Readiness::Cancelled
            }
            result = probing => match result {
                Ok(()) => Readiness::Ready,
                Err(Miss::Exited) => Readiness::Exited,
                Err(Miss::Closed) => Readiness::TimedOut,
            },
        }
    }

    /// Wait until nothing accepts connections on the binding
    pub async fn wait_until_closed(
        &self,
        binding: &PortBinding,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_open(binding).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, PortBinding) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, PortBinding::new("127.0.0.1", port))
    }

    async fn free_binding() -> PortBinding {
        let (listener, binding) = listener().await;
        drop(listener);
        binding
    }

    #[tokio::test]
    async fn test_is_open_tracks_listener() {
        let probe = PortProbe::default();
        let (listener, binding) = listener().await;
        assert!(probe.is_open(&binding).await);

        drop(listener);
        assert!(!probe.is_open(&binding).await);
    }

    #[tokio::test]
    async fn test_wait_until_open_gives_up() {
        let probe = PortProbe::new(Duration::from_millis(50));
        let binding = free_binding().await;
        let started = tokio::time::Instant::now();
        assert!(
            !probe
                .wait_until_open(&binding, 3, Duration::from_millis(20))
                .await
        );
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_wait_until_open_sees_late_listener() {
        let probe = PortProbe::new(Duration::from_millis(50));
        let binding = free_binding().await;
        let addr = format!("{}:{}", binding.host, binding.port);

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            TcpListener::bind(addr).await.unwrap()
        });

        assert!(
            probe
                .wait_until_open(&binding, 50, Duration::from_millis(20))
                .await
        );
        drop(late.await.unwrap());
    }

    #[tokio::test]
    async fn test_readiness_observes_cancellation() {
        let probe = PortProbe::new(Duration::from_millis(50));
        let binding = free_binding().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let outcome = probe
            .wait_for_readiness(&binding, 1_000, Duration::from_millis(20), &cancel, || async {
                true
            })
            .await;
        assert_eq!(outcome, Readiness::Cancelled);
    }

    #[tokio::test]
    async fn test_readiness_stops_when_process_exits() {
        let probe = PortProbe::new(Duration::from_millis(50));
        let binding = free_binding().await;
        let checks = Arc::new(AtomicU32::new(0));
        let counter = checks.clone();

        let outcome = probe
            .wait_for_readiness(
                &binding,
                100,
                Duration::from_millis(10),
                &CancellationToken::new(),
                move || {
                    let counter = counter.clone();
                    async move { counter.fetch_add(1, Ordering::SeqCst) < 2 }
                },
            )
            .await;
        assert_eq!(outcome, Readiness::Exited);
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_until_closed() {
        let probe = PortProbe::new(Duration::from_millis(50));
        let (listener, binding) = listener().await;
        assert!(
            !probe
                .wait_until_closed(&binding, Duration::from_millis(60), Duration::from_millis(20))
                .await
        );
        drop(listener);
        assert!(
            probe
                .wait_until_closed(&binding, Duration::ZERO, Duration::from_millis(20))
                .await
        );
    }
}
