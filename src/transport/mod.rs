//! Flow-controlled byte transport over a single TCP or TLS connection.
//!
//! A [`Transport`] moves through `Closed -> Connecting -> Connected ->
//! Closing -> Closed`. Each successful connect spawns a fresh socket driver;
//! after it closes, the transport can be connected again.

mod link;

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use log::{debug, info};
use parking_lot::Mutex;

use self::link::{Link, LinkConfig};
use crate::{
    config::TransportConfig,
    connect,
    tls::{self, TlsConnector},
    Error, Origin,
};

/// Lifecycle of a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No socket. The initial and terminal state.
    Closed,
    /// A connect attempt is in progress.
    Connecting,
    /// The socket is open in both directions.
    Connected,
    /// A close was requested; buffered writes are being flushed.
    Closing,
}

/// An async, buffered byte stream to one origin.
pub struct Transport {
    origin: Origin,
    tls: Option<TlsConnector>,
    config: TransportConfig,
    lifecycle: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    link: Option<Arc<Link>>,
    connecting: bool,
}

impl Transport {
    /// Create a closed transport to `origin`.
    ///
    /// Secure origins get a default TLS connector when `tls` is `None`.
    ///
    /// # Errors
    ///
    /// A builder error if `tls` is given for a plaintext origin.
    pub fn new(
        origin: Origin,
        config: TransportConfig,
        tls: Option<TlsConnector>,
    ) -> crate::Result<Transport> {
        let tls = tls::for_origin(&origin, tls)?;
        Ok(Transport::from_parts(origin, tls, config))
    }

    // `tls` is `Some` exactly when the origin is secure.
    pub(crate) fn from_parts(
        origin: Origin,
        tls: Option<TlsConnector>,
        config: TransportConfig,
    ) -> Transport {
        Transport {
            origin,
            tls,
            config,
            lifecycle: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot::default()),
        }
    }

    /// The origin this transport connects to.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TransportState {
        let slot = self.slot.lock();
        if slot.connecting {
            return TransportState::Connecting;
        }
        slot.link
            .as_ref()
            .map(|link| link.state())
            .unwrap_or(TransportState::Closed)
    }

    /// Establish the socket, and the TLS session for secure origins.
    ///
    /// # Errors
    ///
    /// `ConnectTimeout` if `connect_timeout` elapses, `Connect` wrapping the
    /// I/O failure otherwise, and a misuse error if the transport is not
    /// closed. Dropping the returned future abandons the half-open socket.
    pub async fn connect(&self) -> crate::Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let state = self.state();
        if state != TransportState::Closed {
            return Err(Error::misuse(format!(
                "invalid state to establish connection: {state:?}"
            )));
        }

        let _connecting = ConnectingGuard::start(&self.slot);
        let dial = connect::connect(&self.origin, self.tls.as_ref(), &self.config);
        let io = match self.config.connect_timeout {
            Some(dur) => match tokio::time::timeout(dur, dial).await {
                Ok(res) => res,
                Err(_) => {
                    debug!("connect to {} timed out after {:?}", self.origin, dur);
                    return Err(Error::connect_timeout());
                }
            },
            None => dial.await,
        }
        .map_err(Error::connect)?;

        let link = Link::spawn(
            io,
            LinkConfig {
                over_tls: self.tls.is_some(),
                read_buf_limit: self.config.read_buf_limit,
                write_buf_limit: self.config.write_buf_limit,
                flush_timeout: self.config.flush_timeout,
                tls_shutdown_timeout: self.config.tls_shutdown_timeout,
            },
        );
        self.slot.lock().link = Some(link);
        info!("connection to {} opened", self.origin);
        Ok(())
    }

    /// Wait for buffered data and return up to `max` bytes of it.
    ///
    /// # Errors
    ///
    /// - `Eof` once the peer has half-closed and the buffer is empty. The
    ///   connection stays open.
    /// - `ReadTimeout` if nothing arrives within `timeout`. The connection
    ///   stays open.
    /// - the recorded connection-lost error once the transport is closed.
    /// - misuse if another task is already waiting to read.
    pub async fn read(&self, max: usize, timeout: Option<Duration>) -> crate::Result<Bytes> {
        let link = self.link()?;
        let read = link.read(max);
        match timeout {
            Some(dur) => tokio::time::timeout(dur, read)
                .await
                .map_err(|_| Error::read_timeout())?,
            None => read.await,
        }
    }

    /// Queue `data` for sending, waiting while the outbound buffer is above
    /// its high-water mark.
    ///
    /// # Errors
    ///
    /// `WriteTimeout` if the buffer does not drain within `timeout` (the
    /// data stays queued), or the recorded connection-lost error.
    pub async fn write(&self, data: &[u8], timeout: Option<Duration>) -> crate::Result<()> {
        let link = self.link()?;
        let write = async {
            if link.is_writing_paused() {
                link.wait_drained().await?;
            }
            match link.write(data) {
                Ok(true) => link.wait_drained().await,
                Ok(false) => Ok(()),
                Err(e) if e.is_closing() => {
                    link.wait_closed().await;
                    Err(link.exception().unwrap_or_else(Error::connection_lost))
                }
                Err(e) => Err(e),
            }
        };
        match timeout {
            Some(dur) => tokio::time::timeout(dur, write)
                .await
                .map_err(|_| Error::write_timeout())?,
            None => write.await,
        }
    }

    /// Queue `data` without waiting for the buffer to drain.
    pub(crate) fn write_nowait(&self, data: &[u8]) -> crate::Result<()> {
        self.link()?.write(data).map(|_| ())
    }

    /// Take already-buffered bytes without waiting.
    pub(crate) fn try_read(&self, max: usize) -> Option<crate::Result<Bytes>> {
        match self.link() {
            Ok(link) => link.try_read(max),
            Err(e) => Some(Err(e)),
        }
    }

    /// Request a graceful close and return immediately.
    ///
    /// Buffered writes are flushed for up to `flush_timeout`; the socket is
    /// then shut down and aborted if the peer has not finished closing
    /// within the TLS shutdown timeout (or a short grace period for
    /// plaintext). Calling it again has no effect.
    pub fn close(&self) {
        if let Some(link) = self.slot.lock().link.clone() {
            link.close();
        }
    }

    /// Close and wait until the transport is closed. Every concurrent caller
    /// returns once the same close completes.
    pub async fn aclose(&self) {
        let link = {
            let _lifecycle = self.lifecycle.lock().await;
            match self.slot.lock().link.clone() {
                Some(link) => {
                    link.close();
                    link
                }
                None => return,
            }
        };
        link.wait_closed().await;
    }

    /// Tear the connection down immediately.
    pub fn abort(&self) {
        if let Some(link) = self.slot.lock().link.clone() {
            link.abort();
        }
    }

    /// Wait until the transport reaches `Closed`.
    pub async fn closed(&self) {
        let link = self.slot.lock().link.clone();
        if let Some(link) = link {
            link.wait_closed().await;
        }
    }

    /// Wait until a requested close has flushed the outbound buffer.
    pub async fn wait_flushed(&self) {
        let link = self.slot.lock().link.clone();
        if let Some(link) = link {
            link.wait_flushed().await;
        }
    }

    /// The error recorded when the connection was lost, if it was.
    pub fn exception(&self) -> Option<Error> {
        self.slot.lock().link.as_ref().and_then(|link| link.exception())
    }

    /// Whether the peer has finished sending and everything it sent has
    /// been read.
    pub fn at_eof(&self) -> bool {
        self.slot.lock().link.as_ref().map_or(false, |link| link.at_eof())
    }

    /// Number of received bytes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.slot.lock().link.as_ref().map_or(0, |link| link.buffered())
    }

    /// Whether socket reads are paused because too much data is buffered.
    pub fn is_reading_paused(&self) -> bool {
        self.slot
            .lock()
            .link
            .as_ref()
            .map_or(false, |link| link.is_reading_paused())
    }

    /// Number of bytes queued but not yet handed to the socket.
    pub fn write_buffer_size(&self) -> usize {
        self.slot
            .lock()
            .link
            .as_ref()
            .map_or(0, |link| link.write_buffer_size())
    }

    /// Whether this transport runs over TLS.
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    fn link(&self) -> crate::Result<Arc<Link>> {
        self.slot
            .lock()
            .link
            .clone()
            .ok_or_else(Error::connection_lost)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("origin", &self.origin)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(link) = self.slot.get_mut().link.take() {
            if link.state() != TransportState::Closed {
                debug!("aborting transport on drop");
                link.abort();
            }
        }
    }
}

struct ConnectingGuard<'a> {
    slot: &'a Mutex<Slot>,
}

impl<'a> ConnectingGuard<'a> {
    fn start(slot: &'a Mutex<Slot>) -> ConnectingGuard<'a> {
        slot.lock().connecting = true;
        ConnectingGuard { slot }
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().connecting = false;
    }
}
