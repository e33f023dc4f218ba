//! Whether, and how, a connection the peer dropped is re-established.
//!
//! The policy only decides and drives the retry loop; replaying setup (a
//! WebSocket handshake, for example) is up to the connection that owns it.

use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, info};

use crate::{config::ReconnectConfig, Error};

#[derive(Debug)]
pub(crate) struct ReconnectPolicy {
    config: ReconnectConfig,
    client_close: AtomicBool,
    was_connected: AtomicBool,
}

impl ReconnectPolicy {
    pub(crate) fn new(config: ReconnectConfig) -> ReconnectPolicy {
        ReconnectPolicy {
            config,
            client_close: AtomicBool::new(false),
            was_connected: AtomicBool::new(false),
        }
    }

    /// Record a successful connect.
    pub(crate) fn connected(&self) {
        self.was_connected.store(true, Ordering::Release);
    }

    pub(crate) fn was_connected(&self) -> bool {
        self.was_connected.load(Ordering::Acquire)
    }

    /// Record that the owner asked for the connection to be closed. A
    /// connection closed this way is never re-established.
    pub(crate) fn client_closed(&self) {
        self.client_close.store(true, Ordering::Release);
    }

    pub(crate) fn is_client_closed(&self) -> bool {
        self.client_close.load(Ordering::Acquire)
    }

    pub(crate) fn auto_reconnect(&self) -> bool {
        self.config.auto_reconnect
    }

    pub(crate) fn should_reconnect(&self, closed: bool) -> bool {
        self.config.auto_reconnect && closed && !self.is_client_closed() && self.was_connected()
    }

    /// Call `connect` until it succeeds, sleeping on the backoff schedule
    /// between failed attempts.
    ///
    /// Only connect failures are retried. Gives up early once the owner has
    /// requested a close, and returns the last connect error (or
    /// `ConnectionLost`) when attempts run out.
    pub(crate) async fn run<F, Fut>(&self, mut connect: F) -> crate::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<()>>,
    {
        let max = self.config.max_attempts;
        let mut last_error = None;

        for attempt in 0..max {
            if self.is_client_closed() {
                debug!("close requested, abandoning reconnect");
                break;
            }
            info!("attempting reconnect, attempt {} of {}", attempt + 1, max);
            match connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connect() => {
                    if attempt + 1 < max {
                        let delay = self.config.backoff.delay(attempt);
                        debug!("reconnect failed, trying again in {:?}: {}", delay, e);
                        tokio::time::sleep(delay).await;
                    } else {
                        debug!("reconnect failed: {}", e);
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(Error::connection_lost))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::config::Backoff;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            auto_reconnect: true,
            max_attempts,
            backoff: Backoff::new(Duration::from_millis(1), 2.0, Duration::from_millis(4)),
        })
    }

    fn refused() -> Error {
        Error::connect(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
    }

    #[test]
    fn should_reconnect_requires_previous_connect() {
        let policy = policy(3);
        assert!(!policy.should_reconnect(true));
        policy.connected();
        assert!(policy.should_reconnect(true));
        assert!(!policy.should_reconnect(false));
        policy.client_closed();
        assert!(!policy.should_reconnect(true));
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let policy = policy(3);
        let calls = AtomicU32::new(0);
        let err = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            })
            .await
            .unwrap_err();
        assert!(err.is_connect());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_success() {
        let policy = policy(5);
        let calls = AtomicU32::new(0);
        policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(refused())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_close_abandons_loop() {
        let policy = policy(5);
        policy.client_closed();
        let err = policy.run(|| async { Ok(()) }).await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let policy = policy(5);
        let calls = AtomicU32::new(0);
        let err = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::misuse("wrong state")) }
            })
            .await
            .unwrap_err();
        assert!(err.is_misuse());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
