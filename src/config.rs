//! This module provides builders for configuring transports, reconnection,
//! HTTP/1.1 exchanges and WebSocket sessions.

use std::time::Duration;

use crate::Error;

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(250);
pub(crate) const READ_BUF_LIMIT: usize = 64 * 1024;
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const WRITE_BUF_LIMIT: usize = 64 * 1024;
pub(crate) const MIN_BUF_LIMIT: usize = 1024;
pub(crate) const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const TLS_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(250);

pub(crate) const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
pub(crate) const BACKOFF_FACTOR: f64 = 1.618;
pub(crate) const BACKOFF_MAX: Duration = Duration::from_secs(60);
pub(crate) const MAX_RECONNECT_ATTEMPTS: u32 = 5;

pub(crate) const MAX_CONNECTIONS: usize = 50;
pub(crate) const ACQUIRE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const MAX_BUFFERED_MESSAGES: usize = 1000;
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(20);
pub(crate) const PING_TIMEOUT: Duration = Duration::from_secs(20);
pub(crate) const MAX_FRAME_SIZE: usize = 16 << 20;
pub(crate) const MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Socket-level settings for a single transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) flush_timeout: Option<Duration>,
    pub(crate) tls_handshake_timeout: Option<Duration>,
    pub(crate) tls_shutdown_timeout: Duration,
    pub(crate) happy_eyeballs_delay: Option<Duration>,
    pub(crate) read_buf_limit: usize,
    pub(crate) write_buf_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout: Some(CONNECT_TIMEOUT),
            flush_timeout: Some(FLUSH_TIMEOUT),
            tls_handshake_timeout: Some(TLS_HANDSHAKE_TIMEOUT),
            tls_shutdown_timeout: TLS_SHUTDOWN_TIMEOUT,
            happy_eyeballs_delay: Some(HAPPY_EYEBALLS_DELAY),
            read_buf_limit: READ_BUF_LIMIT,
            write_buf_limit: WRITE_BUF_LIMIT,
        }
    }
}

impl TransportConfig {
    /// Reading pauses once more than twice this many bytes are buffered.
    pub fn read_buf_limit(&self) -> usize {
        self.read_buf_limit
    }

    /// Writers wait for the outbound buffer to drain above this many bytes.
    pub fn write_buf_limit(&self) -> usize {
        self.write_buf_limit
    }

    fn validate(&self) -> crate::Result<()> {
        if !(MIN_BUF_LIMIT..=READ_BUF_LIMIT).contains(&self.read_buf_limit) {
            return Err(Error::builder(format!(
                "read_buf_limit must be between {MIN_BUF_LIMIT} and {READ_BUF_LIMIT} bytes"
            )));
        }
        if self.write_buf_limit < MIN_BUF_LIMIT {
            return Err(Error::builder(format!(
                "write_buf_limit must be at least {MIN_BUF_LIMIT} bytes"
            )));
        }
        let timeouts = [
            ("connect_timeout", self.connect_timeout),
            ("flush_timeout", self.flush_timeout),
            ("tls_handshake_timeout", self.tls_handshake_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout == Some(Duration::ZERO) {
                return Err(Error::builder(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

/// The delay schedule between reconnect attempts:
/// `min(max, initial * factor ^ attempt)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub(crate) initial: Duration,
    pub(crate) factor: f64,
    pub(crate) max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: BACKOFF_INITIAL,
            factor: BACKOFF_FACTOR,
            max: BACKOFF_MAX,
        }
    }
}

impl Backoff {
    /// Create a schedule.
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Backoff {
        Backoff {
            initial,
            factor,
            max,
        }
    }

    /// The delay to wait before attempt number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn validate(&self) -> crate::Result<()> {
        if self.initial.is_zero() || self.max.is_zero() {
            return Err(Error::builder("backoff delays must be greater than zero"));
        }
        if !(self.factor.is_finite() && self.factor > 0.0) {
            return Err(Error::builder("backoff factor must be a positive number"));
        }
        Ok(())
    }
}

/// Settings for automatic reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub(crate) auto_reconnect: bool,
    pub(crate) max_attempts: u32,
    pub(crate) backoff: Backoff,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            auto_reconnect: true,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

/// Settings for the HTTP/1.1 exchange engine.
#[derive(Debug, Clone)]
pub struct Http1Config {
    pub(crate) chunk_size: usize,
    pub(crate) keepalive_timeout: Option<Duration>,
}

impl Default for Http1Config {
    fn default() -> Self {
        Http1Config {
            chunk_size: CHUNK_SIZE,
            keepalive_timeout: None,
        }
    }
}

/// Everything a single connection needs: transport, reconnect and HTTP/1.1
/// settings.
///
/// Use [`ConnectionConfig::builder`] to change the defaults.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub(crate) transport: TransportConfig,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) http1: Http1Config,
}

impl ConnectionConfig {
    /// Start from the defaults.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            config: ConnectionConfig::default(),
        }
    }

    /// The transport settings.
    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }
}

/// Builder for `ConnectionConfig`.
#[must_use]
#[derive(Debug)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Bound on establishing the connection, TLS handshake included.
    ///
    /// Default is 5 seconds. `None` waits indefinitely.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.transport.connect_timeout = timeout;
        self
    }

    /// Bound on flushing buffered writes when the transport is closed.
    ///
    /// Default is 5 seconds.
    pub fn flush_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.transport.flush_timeout = timeout;
        self
    }

    /// Bound on the TLS handshake alone.
    ///
    /// Default is 3 seconds.
    pub fn tls_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.transport.tls_handshake_timeout = timeout;
        self
    }

    /// Grace period for the peer to acknowledge a TLS close before the
    /// socket is aborted.
    ///
    /// Default is 250 milliseconds.
    pub fn tls_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.tls_shutdown_timeout = timeout;
        self
    }

    /// Delay before racing the fallback address family. `None` tries
    /// addresses one after the other.
    ///
    /// Default is 250 milliseconds.
    pub fn happy_eyeballs_delay(mut self, delay: Option<Duration>) -> Self {
        self.config.transport.happy_eyeballs_delay = delay;
        self
    }

    /// Read backpressure threshold. Reading pauses above twice this many
    /// buffered bytes and resumes below it.
    ///
    /// Default is 64 KiB; must be between 1 KiB and 64 KiB.
    pub fn read_buf_limit(mut self, limit: usize) -> Self {
        self.config.transport.read_buf_limit = limit;
        self
    }

    /// Write high-water mark.
    ///
    /// Default is 64 KiB; must be at least 1 KiB.
    pub fn write_buf_limit(mut self, limit: usize) -> Self {
        self.config.transport.write_buf_limit = limit;
        self
    }

    /// Whether a connection closed by the peer is re-established on next use.
    ///
    /// Default is true.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.auto_reconnect = enabled;
        self
    }

    /// Upper bound on reconnect attempts.
    ///
    /// Default is 5.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Delay schedule between reconnect attempts.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.reconnect.backoff = backoff;
        self
    }

    /// Size of the slices request bodies are written in, and of each socket
    /// read.
    ///
    /// Default is 64 KiB.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.http1.chunk_size = size;
        self
    }

    /// How long an idle connection stays reusable after its last response.
    ///
    /// Default is `None`, which keeps idle connections forever.
    pub fn keepalive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.http1.keepalive_timeout = timeout;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> crate::Result<ConnectionConfig> {
        self.config.transport.validate()?;
        self.config.reconnect.backoff.validate()?;
        if self.config.reconnect.max_attempts == 0 {
            return Err(Error::builder("max_reconnect_attempts must be greater than zero"));
        }
        if self.config.http1.chunk_size == 0 {
            return Err(Error::builder("chunk_size must be greater than zero"));
        }
        Ok(self.config)
    }
}

/// Settings for a WebSocket session.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub(crate) close_handshake_timeout: Duration,
    pub(crate) max_buffered_messages: usize,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) ping_timeout: Duration,
    pub(crate) max_frame_size: usize,
    pub(crate) max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            close_handshake_timeout: CLOSE_HANDSHAKE_TIMEOUT,
            max_buffered_messages: MAX_BUFFERED_MESSAGES,
            ping_interval: Some(PING_INTERVAL),
            ping_timeout: PING_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl WebSocketConfig {
    /// Start from the defaults.
    pub fn builder() -> WebSocketConfigBuilder {
        WebSocketConfigBuilder {
            config: WebSocketConfig::default(),
        }
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.max_buffered_messages == 0 {
            return Err(Error::builder("max_buffered_messages must be greater than zero"));
        }
        if self.ping_interval == Some(Duration::ZERO) || self.ping_timeout.is_zero() {
            return Err(Error::builder("keepalive intervals must be greater than zero"));
        }
        if self.max_frame_size == 0 || self.max_message_size == 0 {
            return Err(Error::builder("websocket size limits must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for `WebSocketConfig`.
#[must_use]
#[derive(Debug)]
pub struct WebSocketConfigBuilder {
    config: WebSocketConfig,
}

impl WebSocketConfigBuilder {
    /// How long [`aclose`](crate::WebSocket::aclose) waits for the server's
    /// close frame before dropping the connection.
    ///
    /// Default is 5 seconds.
    pub fn close_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_handshake_timeout = timeout;
        self
    }

    /// Number of unread messages at which the session stops reading from
    /// the socket. Reading resumes once half of them have been consumed.
    ///
    /// Default is 1000.
    pub fn max_buffered_messages(mut self, limit: usize) -> Self {
        self.config.max_buffered_messages = limit;
        self
    }

    /// Interval between keepalive pings. `None` disables keepalive.
    ///
    /// Default is 20 seconds.
    pub fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// How long to wait for the pong answering a keepalive ping.
    ///
    /// Default is 20 seconds.
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    /// Largest accepted frame payload.
    ///
    /// Default is 16 MiB.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Largest accepted message after reassembly.
    ///
    /// Default is 64 MiB.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> crate::Result<WebSocketConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let backoff = Backoff::default();
        let mut last = Duration::ZERO;
        for attempt in 0..32 {
            let delay = backoff.delay(attempt);
            assert!(delay >= last, "attempt {attempt} went backwards");
            assert!(delay <= BACKOFF_MAX);
            last = delay;
        }
        assert_eq!(backoff.delay(0), BACKOFF_INITIAL);
        assert_eq!(backoff.delay(31), BACKOFF_MAX);
    }

    #[test]
    fn backoff_growth() {
        let backoff = Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
    }

    #[test]
    fn read_buf_limit_bounds() {
        let err = ConnectionConfig::builder()
            .read_buf_limit(512)
            .build()
            .unwrap_err();
        assert!(err.is_builder());

        let err = ConnectionConfig::builder()
            .read_buf_limit(128 * 1024)
            .build()
            .unwrap_err();
        assert!(err.is_builder());

        let config = ConnectionConfig::builder()
            .read_buf_limit(1024)
            .build()
            .unwrap();
        assert_eq!(config.transport().read_buf_limit(), 1024);
    }

    #[test]
    fn write_buf_limit_floor() {
        assert!(ConnectionConfig::builder()
            .write_buf_limit(100)
            .build()
            .unwrap_err()
            .is_builder());
    }

    #[test]
    fn zero_attempts_rejected() {
        assert!(ConnectionConfig::builder()
            .max_reconnect_attempts(0)
            .build()
            .is_err());
    }

    #[test]
    fn websocket_limits_must_be_positive() {
        assert!(WebSocketConfig::builder()
            .max_buffered_messages(0)
            .build()
            .unwrap_err()
            .is_builder());
        assert!(WebSocketConfig::builder()
            .ping_interval(Some(Duration::ZERO))
            .build()
            .is_err());
        let config = WebSocketConfig::builder()
            .ping_interval(None)
            .max_buffered_messages(4)
            .build()
            .unwrap();
        assert_eq!(config.max_buffered_messages, 4);
        assert!(config.ping_interval.is_none());
    }
}
