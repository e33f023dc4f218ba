//! WebSocket sessions over an upgraded [`HttpConnection`].
//!
//! A session runs up to three background tasks once the handshake succeeds:
//! a receive loop that parses frames, answers pings and reassembles
//! messages; an optional keepalive that pings the server; and a watcher that
//! fails the session if the [`WebSocket`] handle is dropped while open.

mod frame;
mod handshake;
mod message;

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, AUTHORIZATION, COOKIE, SEC_WEBSOCKET_PROTOCOL};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tungstenite::protocol::frame::{
    coding::{CloseCode, Control, Data, OpCode},
    CloseFrame, Frame,
};

use self::frame::FrameCodec;
pub use self::message::Message;
use super::{auth::Auth, http1::HttpConnection, request::Request};
use crate::{
    config::{ConnectionConfig, WebSocketConfig},
    tls::TlsConnector,
    Error,
};

/// Lifecycle of a [`WebSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    /// Not yet opened, or the connection is gone.
    Closed,
    /// The handshake succeeded and messages flow both ways.
    Open,
    /// A close frame has been sent or received.
    Closing,
}

/// A client WebSocket session.
///
/// Messages are received in order by a single consumer through
/// [`recv`](Self::recv); [`send`](Self::send) may be called from any number
/// of tasks. Dropping the handle while the session is open fails the
/// connection.
pub struct WebSocket {
    inner: Arc<Session>,
}

struct Session {
    conn: HttpConnection,
    config: WebSocketConfig,
    shared: Mutex<Shared>,
    message_ready: Notify,
    closed: Notify,
    pong: Notify,
    resume: Notify,
    // Serializes handshake, close and reconnect.
    lifecycle: tokio::sync::Mutex<()>,
    dropped: CancellationToken,
}

struct Shared {
    state: WebSocketState,
    messages: VecDeque<Message>,
    paused: bool,
    receiving: bool,
    close_code: Option<u16>,
    expected_pong: Option<[u8; 4]>,
    pong_received: bool,
    error: Option<Error>,
    subprotocol: Option<String>,
    extensions: Vec<String>,
    replay: Option<Replay>,
}

// What a reconnect sends again.
struct Replay {
    request: Request,
    auth: Option<Arc<dyn Auth>>,
}

struct Partial {
    text: bool,
    data: BytesMut,
}

impl WebSocket {
    /// A builder that connects and performs the handshake in one step.
    pub fn builder() -> WebSocketBuilder {
        WebSocketBuilder::new()
    }

    /// Wrap `conn` in an unopened session. Call
    /// [`handshake`](Self::handshake) to open it.
    ///
    /// # Errors
    ///
    /// A builder error if `config` is invalid.
    pub fn new(conn: HttpConnection, config: WebSocketConfig) -> crate::Result<WebSocket> {
        config.validate()?;
        Ok(WebSocket {
            inner: Arc::new(Session {
                conn,
                config,
                shared: Mutex::new(Shared {
                    state: WebSocketState::Closed,
                    messages: VecDeque::new(),
                    paused: false,
                    receiving: false,
                    close_code: None,
                    expected_pong: None,
                    pong_received: false,
                    error: None,
                    subprotocol: None,
                    extensions: Vec::new(),
                    replay: None,
                }),
                message_ready: Notify::new(),
                closed: Notify::new(),
                pong: Notify::new(),
                resume: Notify::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                dropped: CancellationToken::new(),
            }),
        })
    }

    /// Send the upgrade request and open the session.
    ///
    /// The connection is established first if it never was. Subprotocols
    /// and extensions are offered through the request's
    /// `Sec-WebSocket-Protocol` and `Sec-WebSocket-Extensions` headers.
    ///
    /// # Errors
    ///
    /// - `Handshake` carrying the status if the server did not answer
    ///   `101 Switching Protocols`.
    /// - `RemoteProtocol` if the upgrade headers or accept key are wrong, or
    ///   the server picked something that was not offered.
    /// - misuse if the session is already open.
    ///
    /// The connection is closed on any failure.
    pub async fn handshake(
        &self,
        request: Request,
        auth: Option<Arc<dyn Auth>>,
    ) -> crate::Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.open(request, auth).await
    }

    pub fn state(&self) -> WebSocketState {
        self.inner.shared.lock().state
    }

    /// The connection the session runs on.
    pub fn connection(&self) -> &HttpConnection {
        &self.inner.conn
    }

    /// The subprotocol the server selected, if any.
    pub fn subprotocol(&self) -> Option<String> {
        self.inner.shared.lock().subprotocol.clone()
    }

    /// The extensions the server accepted, as sent in its response.
    pub fn extensions(&self) -> Vec<String> {
        self.inner.shared.lock().extensions.clone()
    }

    /// The status code from the server's close frame, once one arrived.
    /// `1005` means the frame carried no code.
    pub fn close_code(&self) -> Option<u16> {
        self.inner.shared.lock().close_code
    }

    /// Check that messages can be sent.
    ///
    /// # Errors
    ///
    /// `ConnectionClosing` while closing, and the reason the connection went
    /// away once it is closed.
    pub fn ensure_open(&self) -> crate::Result<()> {
        let shared = self.inner.shared.lock();
        match shared.state {
            WebSocketState::Open => Ok(()),
            WebSocketState::Closing => Err(Error::closing()),
            WebSocketState::Closed => Err(self.inner.closed_error(&shared)),
        }
    }

    /// Wait for the next message.
    ///
    /// Messages that arrived before the connection went away are still
    /// returned, in order.
    ///
    /// # Errors
    ///
    /// Once the session is closed and no messages remain: the protocol
    /// error that failed the session, or `ConnectionLost`. Misuse if
    /// another task is already receiving.
    pub async fn recv(&self) -> crate::Result<Message> {
        let _receiving = Receiving::start(&self.inner)?;
        loop {
            let ready = self.inner.message_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut shared = self.inner.shared.lock();
                if let Some(message) = shared.messages.pop_front() {
                    if shared.paused
                        && shared.messages.len() <= self.inner.config.max_buffered_messages / 2
                    {
                        debug!("message backlog drained, resuming reads");
                        shared.paused = false;
                        self.inner.resume.notify_waiters();
                    }
                    return Ok(message);
                }
                if shared.state == WebSocketState::Closed {
                    return Err(self.inner.closed_error(&shared));
                }
            }

            ready.await;
        }
    }

    /// Send a text or binary message as a single masked frame.
    ///
    /// Waits while the outbound buffer is above its high-water mark. If the
    /// server dropped the session and it may be re-opened, the connection
    /// and handshake are re-established first.
    pub async fn send<M: Into<Message>>(&self, message: M) -> crate::Result<()> {
        if self.should_reconnect() {
            let _lifecycle = self.inner.lifecycle.lock().await;
            // Another sender may have reconnected already.
            if self.should_reconnect() {
                debug!("websocket to {} dropped, reconnecting", self.inner.conn.origin());
                self.replay_handshake().await?;
            }
        }
        self.ensure_open()?;
        let frame = match message.into() {
            Message::Text(text) => Frame::message(text.into_bytes(), OpCode::Data(Data::Text), true),
            Message::Binary(data) => {
                Frame::message(data.to_vec(), OpCode::Data(Data::Binary), true)
            }
        };
        let data = frame::encode(frame)?;
        self.inner.conn.transport().write(&data, None).await
    }

    /// Run the closing handshake and wait until the connection is closed.
    ///
    /// Sends a normal close frame and waits up to the close handshake
    /// timeout for the server's reply before closing the transport anyway.
    /// Calling it again, or on a closed session, returns immediately. A
    /// session closed this way is never reconnected.
    pub async fn aclose(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.conn.mark_client_closed();

        let send_close = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                WebSocketState::Closed => return,
                WebSocketState::Open => {
                    shared.state = WebSocketState::Closing;
                    true
                }
                WebSocketState::Closing => false,
            }
        };
        if send_close {
            let frame = Frame::close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            if let Err(e) = self.inner.send_nowait(frame) {
                debug!("could not send close frame: {}", e);
            }
        }

        let mut guard = AbortOnDrop {
            conn: &self.inner.conn,
            armed: true,
        };
        let timeout = self.inner.config.close_handshake_timeout;
        if tokio::time::timeout(timeout, self.inner.wait_closed())
            .await
            .is_err()
        {
            debug!("no close reply within {:?}, closing transport", timeout);
            self.inner.conn.transport().close();
            self.inner.wait_closed().await;
        }
        guard.armed = false;
    }

    /// Whether the server dropped the session and it may be re-opened.
    pub fn should_reconnect(&self) -> bool {
        {
            let shared = self.inner.shared.lock();
            if shared.state != WebSocketState::Closed || shared.replay.is_none() {
                return false;
            }
        }
        self.inner.conn.should_reconnect()
    }

    /// Re-establish the connection and replay the handshake.
    ///
    /// Nothing carries over from the previous connection except messages
    /// that were received but not yet read.
    ///
    /// # Errors
    ///
    /// Misuse if the session cannot be reconnected, otherwise whatever the
    /// reconnect or handshake failed with.
    pub async fn reconnect(&self) -> crate::Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.should_reconnect() {
            return Err(Error::misuse("websocket cannot be reconnected"));
        }
        self.replay_handshake().await
    }

    // Callers hold the lifecycle lock and have checked `should_reconnect`.
    async fn replay_handshake(&self) -> crate::Result<()> {
        let (request, auth) = {
            let shared = self.inner.shared.lock();
            let replay = shared
                .replay
                .as_ref()
                .ok_or_else(|| Error::misuse("websocket was never opened"))?;
            let request = replay
                .request
                .try_clone()
                .ok_or_else(|| Error::misuse("handshake request cannot be replayed"))?;
            (request, replay.auth.clone())
        };

        self.inner.conn.reconnect().await?;
        self.open(request, auth).await
    }

    // Callers hold the lifecycle lock.
    async fn open(&self, mut request: Request, auth: Option<Arc<dyn Auth>>) -> crate::Result<()> {
        let session = &self.inner;
        if session.shared.lock().state != WebSocketState::Closed {
            return Err(Error::misuse("websocket is already open"));
        }
        let mut replay = request
            .try_clone()
            .ok_or_else(|| Error::builder("websocket handshake request cannot stream a body"))?;
        // Credentials are not replayed; the auth flow supplies them again.
        replay.headers_mut().remove(AUTHORIZATION);
        replay.headers_mut().remove(COOKIE);

        if session.conn.is_fresh() {
            session.conn.connect().await?;
        }

        let key = handshake::prepare(&mut request);
        let offered = request.headers().clone();
        let url = request.url().clone();
        let response = session.conn.request(request, auth.clone()).await?;

        let negotiated = handshake::validate(&offered, &key, &response)
            .and_then(|negotiated| Ok((negotiated, session.conn.switch_protocols()?)));
        let (negotiated, trailing) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                drop(response);
                session.conn.aclose().await;
                return Err(e.with_url(url));
            }
        };
        drop(response);

        {
            let mut shared = session.shared.lock();
            shared.state = WebSocketState::Open;
            shared.close_code = None;
            shared.expected_pong = None;
            shared.error = None;
            shared.subprotocol = negotiated.subprotocol;
            shared.extensions = negotiated.extensions;
            shared.replay = Some(Replay {
                request: replay,
                auth,
            });
        }
        info!("websocket to {} open", url);
        self.spawn_tasks(trailing);
        Ok(())
    }

    fn spawn_tasks(&self, trailing: Bytes) {
        let stop = CancellationToken::new();
        let mut codec = FrameCodec::new(self.inner.config.max_frame_size);
        codec.extend(&trailing);

        tokio::spawn(receive_loop(self.inner.clone(), codec, stop.clone()));
        if let Some(interval) = self.inner.config.ping_interval {
            tokio::spawn(keepalive(self.inner.clone(), interval, stop.clone()));
        }
        tokio::spawn(watch_drop(self.inner.clone(), stop));
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        self.inner.dropped.cancel();
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("WebSocket")
            .field("origin", self.inner.conn.origin())
            .field("state", &shared.state)
            .field("subprotocol", &shared.subprotocol)
            .finish()
    }
}

impl Session {
    fn closed_error(&self, shared: &Shared) -> Error {
        shared
            .error
            .clone()
            .or_else(|| self.conn.transport().exception())
            .unwrap_or_else(Error::connection_lost)
    }

    fn send_nowait(&self, frame: Frame) -> crate::Result<()> {
        let data = frame::encode(frame)?;
        self.conn.transport().write_nowait(&data)
    }

    async fn wait_closed(&self) {
        loop {
            let closed = self.closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.shared.lock().state == WebSocketState::Closed {
                return;
            }
            closed.await;
        }
    }

    async fn wait_for_pong(&self) {
        loop {
            let pong = self.pong.notified();
            tokio::pin!(pong);
            pong.as_mut().enable();
            {
                let shared = self.shared.lock();
                if shared.pong_received || shared.state == WebSocketState::Closed {
                    return;
                }
            }
            pong.await;
        }
    }

    // Returns once reads may continue, or the transport is gone.
    async fn wait_resumed(&self) {
        loop {
            let resumed = self.resume.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();
            if !self.shared.lock().paused {
                return;
            }
            tokio::select! {
                _ = resumed => {}
                _ = self.conn.transport().closed() => return,
            }
        }
    }

    async fn receive(&self, codec: &mut FrameCodec) -> crate::Result<()> {
        let transport = self.conn.transport();
        let mut partial = None;
        loop {
            while let Some(frame) = codec.next_frame()? {
                if !self.handle_frame(frame, &mut partial)? {
                    return Ok(());
                }
            }

            self.wait_resumed().await;
            match transport.read(self.conn.chunk_size(), None).await {
                Ok(data) => codec.extend(&data),
                Err(e) => {
                    if e.is_eof() {
                        debug!("server closed the stream without a close frame");
                    } else {
                        trace!("websocket read ended: {}", e);
                    }
                    self.fail().await;
                    return Ok(());
                }
            }
        }
    }

    /// Returns false once the server's close frame has been handled.
    fn handle_frame(&self, frame: Frame, partial: &mut Option<Partial>) -> crate::Result<bool> {
        let opcode = frame.header().opcode;
        let fin = frame.header().is_final;
        match opcode {
            OpCode::Data(Data::Text) | OpCode::Data(Data::Binary) => {
                if partial.is_some() {
                    return Err(Error::remote_protocol(
                        "new message started before the previous one finished",
                    ));
                }
                *partial = Some(Partial {
                    text: opcode == OpCode::Data(Data::Text),
                    data: BytesMut::new(),
                });
                self.append(frame, fin, partial)?;
            }
            OpCode::Data(Data::Continue) => {
                if partial.is_none() {
                    return Err(Error::remote_protocol("continuation frame without a message"));
                }
                self.append(frame, fin, partial)?;
            }
            OpCode::Control(Control::Ping) => {
                trace!("answering ping");
                if let Err(e) = self.send_nowait(Frame::pong(frame.into_data())) {
                    debug!("could not answer ping: {}", e);
                }
            }
            OpCode::Control(Control::Pong) => {
                let mut shared = self.shared.lock();
                if shared.expected_pong.as_ref().map(|p| &p[..]) == Some(frame.payload()) {
                    shared.expected_pong = None;
                    shared.pong_received = true;
                    drop(shared);
                    self.pong.notify_waiters();
                } else {
                    trace!("ignoring unsolicited pong");
                }
            }
            OpCode::Control(Control::Close) => {
                self.handle_close(frame)?;
                return Ok(false);
            }
            OpCode::Data(Data::Reserved(op)) | OpCode::Control(Control::Reserved(op)) => {
                return Err(Error::remote_protocol(format!("reserved opcode {op}")));
            }
        }
        Ok(true)
    }

    fn append(&self, frame: Frame, fin: bool, partial: &mut Option<Partial>) -> crate::Result<()> {
        let Some(message) = partial.as_mut() else {
            return Ok(());
        };
        let limit = self.config.max_message_size;
        if message.data.len() + frame.payload().len() > limit {
            return Err(Error::remote_protocol(format!(
                "message exceeds the {limit} byte limit"
            )));
        }
        message.data.extend_from_slice(frame.payload());
        if !fin {
            return Ok(());
        }

        let Some(Partial { text, data }) = partial.take() else {
            return Ok(());
        };
        let message = if text {
            let text = String::from_utf8(data.to_vec())
                .map_err(|_| Error::remote_protocol("text message is not valid UTF-8"))?;
            Message::Text(text)
        } else {
            Message::Binary(data.freeze())
        };
        self.deliver(message);
        Ok(())
    }

    fn deliver(&self, message: Message) {
        {
            let mut shared = self.shared.lock();
            shared.messages.push_back(message);
            let buffered = shared.messages.len();
            if !shared.paused && buffered > self.config.max_buffered_messages {
                debug!("{} messages buffered, pausing reads", buffered);
                shared.paused = true;
            }
        }
        self.message_ready.notify_waiters();
    }

    fn handle_close(&self, frame: Frame) -> crate::Result<()> {
        let code = frame::parse_close(frame.payload())?.map(|close| close.code);
        debug!("server sent close frame: {:?}", code);

        let reply = {
            let mut shared = self.shared.lock();
            shared.close_code = Some(code.map_or(1005, u16::from));
            if shared.state == WebSocketState::Open {
                shared.state = WebSocketState::Closing;
                true
            } else {
                false
            }
        };
        if reply {
            let echo = Frame::close(code.map(|code| CloseFrame {
                code,
                reason: "".into(),
            }));
            if let Err(e) = self.send_nowait(echo) {
                debug!("could not echo close frame: {}", e);
            }
        }
        self.conn.transport().close();
        Ok(())
    }

    /// Abnormal close: best-effort 1006 frame unless a close frame already
    /// went out, then close the transport once the outbound buffer is
    /// flushed.
    async fn fail(&self) {
        let was_open = {
            let mut shared = self.shared.lock();
            let open = shared.state == WebSocketState::Open;
            if open {
                shared.state = WebSocketState::Closing;
            }
            open
        };
        if was_open {
            let frame = Frame::close(Some(CloseFrame {
                code: CloseCode::Abnormal,
                reason: "".into(),
            }));
            if let Err(e) = self.send_nowait(frame) {
                trace!("could not send abnormal close frame: {}", e);
            }
        }
        self.conn.transport().close();
        self.conn.transport().wait_flushed().await;
    }

    fn connection_lost(&self) {
        {
            let mut shared = self.shared.lock();
            shared.state = WebSocketState::Closed;
            shared.expected_pong = None;
        }
        info!("websocket to {} closed", self.conn.origin());
        self.message_ready.notify_waiters();
        self.closed.notify_waiters();
        self.pong.notify_waiters();
    }
}

async fn receive_loop(session: Arc<Session>, mut codec: FrameCodec, stop: CancellationToken) {
    if let Err(e) = session.receive(&mut codec).await {
        warn!("failing websocket: {}", e);
        session.shared.lock().error = Some(e);
        session.fail().await;
    }
    session.conn.transport().close();
    session.conn.transport().closed().await;
    session.connection_lost();
    stop.cancel();
}

async fn keepalive(session: Arc<Session>, interval: Duration, stop: CancellationToken) {
    let timeout = session.config.ping_timeout;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let payload = rand::random::<u32>().to_be_bytes();
        {
            let mut shared = session.shared.lock();
            if shared.state != WebSocketState::Open {
                return;
            }
            // A pong would queue behind unread messages.
            if shared.paused {
                trace!("reads paused, skipping keepalive ping");
                continue;
            }
            shared.expected_pong = Some(payload);
            shared.pong_received = false;
        }
        if let Err(e) = session.send_nowait(Frame::ping(payload.to_vec())) {
            debug!("could not send keepalive ping: {}", e);
            return;
        }
        trace!("sent keepalive ping");

        tokio::select! {
            _ = stop.cancelled() => return,
            answered = tokio::time::timeout(timeout, session.wait_for_pong()) => {
                if answered.is_err() {
                    warn!("no pong within {:?}, failing websocket", timeout);
                    session.fail().await;
                    return;
                }
            }
        }
    }
}

async fn watch_drop(session: Arc<Session>, stop: CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = session.dropped.cancelled() => {
            debug!("websocket dropped while open");
            session.conn.mark_client_closed();
            session.fail().await;
        }
    }
}

// Single consumer for `recv`.
struct Receiving<'a> {
    session: &'a Session,
}

impl<'a> Receiving<'a> {
    fn start(session: &'a Session) -> crate::Result<Receiving<'a>> {
        let mut shared = session.shared.lock();
        if shared.receiving {
            return Err(Error::misuse("another task is already receiving"));
        }
        shared.receiving = true;
        Ok(Receiving { session })
    }
}

impl Drop for Receiving<'_> {
    fn drop(&mut self) {
        self.session.shared.lock().receiving = false;
    }
}

// Aborts the transport if `aclose` is cancelled mid-handshake.
struct AbortOnDrop<'a> {
    conn: &'a HttpConnection,
    armed: bool,
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.transport().abort();
        }
    }
}

/// A `WebSocketBuilder` connects to a server and opens a session.
#[must_use]
pub struct WebSocketBuilder {
    connection: ConnectionConfig,
    config: WebSocketConfig,
    tls: Option<TlsConnector>,
    protocols: Vec<String>,
    auth: Option<Arc<dyn Auth>>,
}

impl WebSocketBuilder {
    fn new() -> WebSocketBuilder {
        WebSocketBuilder {
            connection: ConnectionConfig::default(),
            config: WebSocketConfig::default(),
            tls: None,
            protocols: Vec::new(),
            auth: None,
        }
    }

    /// Transport, reconnect and HTTP/1.1 settings for the connection.
    pub fn connection_config(mut self, config: ConnectionConfig) -> WebSocketBuilder {
        self.connection = config;
        self
    }

    /// Session settings.
    pub fn config(mut self, config: WebSocketConfig) -> WebSocketBuilder {
        self.config = config;
        self
    }

    /// TLS settings for `wss` origins.
    pub fn tls(mut self, tls: TlsConnector) -> WebSocketBuilder {
        self.tls = Some(tls);
        self
    }

    /// Sets the websocket subprotocols to request, most preferred first.
    pub fn protocols<P, S>(mut self, protocols: P) -> WebSocketBuilder
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Authentication for the handshake request.
    pub fn auth<A: Auth + 'static>(mut self, auth: A) -> WebSocketBuilder {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Connect to the request's origin and perform the handshake.
    pub async fn connect(self, mut request: Request) -> crate::Result<WebSocket> {
        if !self.protocols.is_empty() {
            let value = HeaderValue::from_str(&self.protocols.join(", "))
                .map_err(|e| Error::builder(e).with_url(request.url().clone()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        let conn = HttpConnection::new(request.origin().clone(), self.connection, self.tls)?;
        let ws = WebSocket::new(conn, self.config)?;
        ws.handshake(request, self.auth).await?;
        Ok(ws)
    }
}

impl fmt::Debug for WebSocketBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketBuilder")
            .field("config", &self.config)
            .field("protocols", &self.protocols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Origin, Scheme};

    fn unopened() -> WebSocket {
        let origin = Origin::new(Scheme::Ws, "127.0.0.1", 1);
        let conn = HttpConnection::new(origin, ConnectionConfig::default(), None).unwrap();
        WebSocket::new(conn, WebSocketConfig::default()).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let origin = Origin::new(Scheme::Ws, "127.0.0.1", 1);
        let conn = HttpConnection::new(origin, ConnectionConfig::default(), None).unwrap();
        let config = WebSocketConfig {
            max_buffered_messages: 0,
            ..WebSocketConfig::default()
        };
        assert!(WebSocket::new(conn, config).unwrap_err().is_builder());
    }

    #[tokio::test]
    async fn unopened_session_is_closed() {
        let ws = unopened();
        assert_eq!(ws.state(), WebSocketState::Closed);
        assert!(ws.ensure_open().unwrap_err().is_connection_lost());
        assert!(ws.send("hi").await.unwrap_err().is_connection_lost());
        assert!(ws.recv().await.unwrap_err().is_connection_lost());
        assert!(!ws.should_reconnect());
        ws.aclose().await;
    }

    #[tokio::test]
    async fn reconnect_without_handshake_is_misuse() {
        let ws = unopened();
        assert!(ws.reconnect().await.unwrap_err().is_misuse());
    }
}
