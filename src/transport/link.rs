//! One socket lifetime: the shared buffers and the reader/writer tasks
//! driving a connected stream until it is closed or aborted.

use std::{
    cmp,
    future::Future,
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Notify,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::TransportState;
use crate::{connect::BoxIo, tls, Error};

/// Grace period before aborting a plaintext socket whose peer has not
/// acknowledged our close.
const PLAINTEXT_CLOSE_GRACE: Duration = Duration::from_millis(100);

pub(crate) struct Link {
    shared: Mutex<Shared>,
    read_ready: Notify,
    resume_reading: Notify,
    drained: Notify,
    write_ready: Notify,
    closed: Notify,
    flushed: Notify,
    reader_done: Notify,
    abort: CancellationToken,
    over_tls: bool,
    read_buf_limit: usize,
    write_high: usize,
    write_low: usize,
}

struct Shared {
    state: TransportState,
    buffer: BytesMut,
    eof: bool,
    read_paused: bool,
    reader_waiting: bool,
    outbound: BytesMut,
    pending: usize,
    write_paused: bool,
    flushed: bool,
    reader_finished: bool,
    exception: Option<Error>,
}

pub(crate) struct LinkConfig {
    pub(crate) over_tls: bool,
    pub(crate) read_buf_limit: usize,
    pub(crate) write_buf_limit: usize,
    pub(crate) flush_timeout: Option<Duration>,
    pub(crate) tls_shutdown_timeout: Duration,
}

impl Link {
    /// Take ownership of a connected stream and start driving it.
    pub(crate) fn spawn(io: BoxIo, config: LinkConfig) -> Arc<Link> {
        let link = Arc::new(Link {
            shared: Mutex::new(Shared {
                state: TransportState::Connected,
                buffer: BytesMut::new(),
                eof: false,
                read_paused: false,
                reader_waiting: false,
                outbound: BytesMut::new(),
                pending: 0,
                write_paused: false,
                flushed: false,
                reader_finished: false,
                exception: None,
            }),
            read_ready: Notify::new(),
            resume_reading: Notify::new(),
            drained: Notify::new(),
            write_ready: Notify::new(),
            closed: Notify::new(),
            flushed: Notify::new(),
            reader_done: Notify::new(),
            abort: CancellationToken::new(),
            over_tls: config.over_tls,
            read_buf_limit: config.read_buf_limit,
            write_high: config.write_buf_limit,
            write_low: config.write_buf_limit / 4,
        });

        let (rd, wr) = tokio::io::split(io);
        let grace = if config.over_tls {
            config.tls_shutdown_timeout
        } else {
            PLAINTEXT_CLOSE_GRACE
        };
        tokio::spawn(read_loop(link.clone(), rd));
        tokio::spawn(write_loop(link.clone(), wr, config.flush_timeout, grace));
        link
    }

    pub(crate) fn state(&self) -> TransportState {
        self.shared.lock().state
    }

    pub(crate) fn exception(&self) -> Option<Error> {
        self.shared.lock().exception.clone()
    }

    pub(crate) fn at_eof(&self) -> bool {
        let shared = self.shared.lock();
        shared.eof && shared.buffer.is_empty()
    }

    pub(crate) fn buffered(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub(crate) fn is_reading_paused(&self) -> bool {
        self.shared.lock().read_paused
    }

    pub(crate) fn write_buffer_size(&self) -> usize {
        self.shared.lock().pending
    }

    // ===== reading =====

    pub(crate) async fn read(&self, max: usize) -> crate::Result<Bytes> {
        let _reader = ReaderSlot::acquire(self)?;
        loop {
            let notified = self.read_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let closing = {
                let mut shared = self.shared.lock();
                if let Some(res) = self.poll_buffer(&mut shared, max) {
                    return res;
                }
                shared.state == TransportState::Closing
            };

            if closing {
                self.wait_closed().await;
                continue;
            }
            notified.await;
        }
    }

    /// Take buffered data without waiting. `None` means the caller has to
    /// wait for more.
    pub(crate) fn try_read(&self, max: usize) -> Option<crate::Result<Bytes>> {
        let mut shared = self.shared.lock();
        match self.poll_buffer(&mut shared, max) {
            Some(res) => Some(res),
            None if shared.state == TransportState::Closing => Some(Err(Error::closing())),
            None => None,
        }
    }

    fn poll_buffer(&self, shared: &mut Shared, max: usize) -> Option<crate::Result<Bytes>> {
        if !shared.buffer.is_empty() {
            let n = cmp::min(max, shared.buffer.len());
            let data = shared.buffer.split_to(n).freeze();
            if shared.read_paused && shared.buffer.len() < self.read_buf_limit {
                shared.read_paused = false;
                self.resume_reading.notify_waiters();
                debug!("resumed reading");
            }
            return Some(Ok(data));
        }
        if shared.eof {
            return Some(Err(Error::eof()));
        }
        match shared.state {
            TransportState::Closed => Some(Err(terminal(shared))),
            _ => None,
        }
    }

    fn data_received(&self, data: &[u8]) {
        let mut shared = self.shared.lock();
        shared.buffer.extend_from_slice(data);
        if !shared.read_paused && shared.buffer.len() > 2 * self.read_buf_limit {
            shared.read_paused = true;
            debug!("paused reading with {} bytes buffered", shared.buffer.len());
        }
        drop(shared);
        self.read_ready.notify_waiters();
    }

    fn eof_received(&self) {
        {
            let mut shared = self.shared.lock();
            shared.eof = true;
            shared.reader_finished = true;
        }
        debug!("EOF received");
        self.read_ready.notify_waiters();
        self.reader_done.notify_waiters();
        if self.over_tls {
            self.connection_lost(None);
        }
    }

    async fn wait_resumed(&self) -> bool {
        loop {
            let resumed = self.resume_reading.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();
            if !self.shared.lock().read_paused {
                return true;
            }
            tokio::select! {
                _ = resumed => {}
                _ = self.abort.cancelled() => return false,
            }
        }
    }

    // ===== writing =====

    /// Queue bytes for the writer task. Returns whether the caller should
    /// wait for the buffer to drain.
    pub(crate) fn write(&self, data: &[u8]) -> crate::Result<bool> {
        let mut shared = self.shared.lock();
        match shared.state {
            TransportState::Closed => return Err(terminal(&shared)),
            TransportState::Closing => return Err(Error::closing()),
            _ => {}
        }
        shared.outbound.extend_from_slice(data);
        shared.pending += data.len();
        if !shared.write_paused && shared.pending > self.write_high {
            shared.write_paused = true;
            debug!("paused writing with {} bytes pending", shared.pending);
        }
        let paused = shared.write_paused;
        drop(shared);
        self.write_ready.notify_one();
        Ok(paused)
    }

    pub(crate) fn is_writing_paused(&self) -> bool {
        self.shared.lock().write_paused
    }

    pub(crate) async fn wait_drained(&self) -> crate::Result<()> {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let shared = self.shared.lock();
                if shared.state == TransportState::Closed {
                    return Err(terminal(&shared));
                }
                if !shared.write_paused {
                    return Ok(());
                }
            }
            drained.await;
        }
    }

    fn take_outbound(&self) -> (Bytes, bool) {
        let mut shared = self.shared.lock();
        let chunk = shared.outbound.split().freeze();
        (chunk, shared.state == TransportState::Closing)
    }

    fn bytes_sent(&self, n: usize) {
        let mut shared = self.shared.lock();
        shared.pending = shared.pending.saturating_sub(n);
        trace!("flushed {} bytes, {} pending", n, shared.pending);
        if shared.write_paused && shared.pending <= self.write_low {
            shared.write_paused = false;
            drop(shared);
            debug!("resumed writing");
            self.drained.notify_waiters();
        }
    }

    // ===== lifecycle =====

    /// Request a graceful shutdown. Returns immediately.
    pub(crate) fn close(&self) {
        {
            let mut shared = self.shared.lock();
            if matches!(shared.state, TransportState::Closed | TransportState::Closing) {
                return;
            }
            shared.state = TransportState::Closing;
        }
        debug!("closing transport");
        self.write_ready.notify_one();
        // Callers blocked on reads or drains observe the transition.
        self.read_ready.notify_waiters();
        self.drained.notify_waiters();
    }

    /// Tear the socket down now. The state is `Closed` when this returns.
    pub(crate) fn abort(&self) {
        if self.state() == TransportState::Closed {
            return;
        }
        debug!("transport aborted");
        self.connection_lost(None);
    }

    pub(crate) async fn wait_closed(&self) {
        loop {
            let closed = self.closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.state() == TransportState::Closed {
                return;
            }
            closed.await;
        }
    }

    pub(crate) async fn wait_flushed(&self) {
        loop {
            let flushed = self.flushed.notified();
            tokio::pin!(flushed);
            flushed.as_mut().enable();
            {
                let shared = self.shared.lock();
                if shared.flushed || shared.state == TransportState::Closed {
                    return;
                }
            }
            flushed.await;
        }
    }

    async fn wait_reader_done(&self) {
        loop {
            let done = self.reader_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();
            if self.shared.lock().reader_finished {
                return;
            }
            done.await;
        }
    }

    fn transport_flushed(&self) {
        self.shared.lock().flushed = true;
        debug!("transport buffer flushed");
        self.flushed.notify_waiters();
    }

    /// Record the terminal error once and wake everyone waiting on this link.
    fn connection_lost(&self, err: Option<std::io::Error>) {
        {
            let mut shared = self.shared.lock();
            if shared.state == TransportState::Closed {
                return;
            }
            let err = match err {
                Some(e) => Error::connection_lost_with(e),
                None => Error::connection_lost(),
            };
            shared.state = TransportState::Closed;
            shared.exception = Some(err);
            shared.read_paused = false;
            shared.write_paused = false;
            shared.reader_finished = true;
        }
        self.abort.cancel();
        self.read_ready.notify_waiters();
        self.drained.notify_waiters();
        self.resume_reading.notify_waiters();
        self.reader_done.notify_waiters();
        self.flushed.notify_waiters();
        self.closed.notify_waiters();
        info!("transport closed");
    }
}

fn terminal(shared: &Shared) -> Error {
    shared
        .exception
        .clone()
        .unwrap_or_else(Error::connection_lost)
}

struct ReaderSlot<'a> {
    link: &'a Link,
}

impl<'a> ReaderSlot<'a> {
    fn acquire(link: &'a Link) -> crate::Result<ReaderSlot<'a>> {
        let mut shared = link.shared.lock();
        if shared.reader_waiting {
            return Err(Error::misuse(
                "cannot read while another task is waiting for data",
            ));
        }
        shared.reader_waiting = true;
        Ok(ReaderSlot { link })
    }
}

impl Drop for ReaderSlot<'_> {
    fn drop(&mut self) {
        self.link.shared.lock().reader_waiting = false;
    }
}

async fn read_loop(link: Arc<Link>, mut rd: ReadHalf<BoxIo>) {
    let mut buf = vec![0u8; link.read_buf_limit];
    loop {
        if !link.wait_resumed().await {
            link.connection_lost(None);
            return;
        }
        let res = tokio::select! {
            res = rd.read(&mut buf) => res,
            _ = link.abort.cancelled() => {
                link.connection_lost(None);
                return;
            }
        };
        match res {
            Ok(0) => return link.eof_received(),
            Ok(n) => link.data_received(&buf[..n]),
            Err(e) if link.over_tls && tls::is_benign_close(&e) => {
                debug!("peer closed tls stream: {e}");
                return link.eof_received();
            }
            Err(e) => {
                debug!("read error: {e}");
                return link.connection_lost(Some(e));
            }
        }
    }
}

async fn write_loop(
    link: Arc<Link>,
    mut wr: WriteHalf<BoxIo>,
    flush_timeout: Option<Duration>,
    grace: Duration,
) {
    let mut flush_deadline: Option<Instant> = None;
    loop {
        let wake = link.write_ready.notified();
        let (chunk, closing) = link.take_outbound();
        if closing && flush_deadline.is_none() {
            flush_deadline = flush_timeout.map(|t| Instant::now() + t);
        }

        if chunk.is_empty() {
            if closing {
                break;
            }
            tokio::select! {
                _ = wake => continue,
                _ = link.abort.cancelled() => return link.connection_lost(None),
            }
        }

        if closing {
            debug!("flushing {} bytes", chunk.len());
        }
        tokio::select! {
            res = wr.write_all(&chunk) => match res {
                Ok(()) => link.bytes_sent(chunk.len()),
                Err(e) => {
                    debug!("write error: {e}");
                    return link.connection_lost(Some(e));
                }
            },
            _ = sleep_until(flush_deadline) => {
                debug!("flush timed out, aborting");
                return link.connection_lost(None);
            }
            _ = link.abort.cancelled() => return link.connection_lost(None),
        }
    }

    link.transport_flushed();
    tokio::select! {
        _ = async {
            let _ = wr.shutdown().await;
            link.wait_reader_done().await;
        } => {}
        _ = tokio::time::sleep(grace) => debug!("peer did not finish closing, aborting"),
        _ = link.abort.cancelled() => {}
    }
    link.connection_lost(None);
}

fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => futures_util::future::pending().await,
        }
    }
}
