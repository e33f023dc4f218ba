//! HTTP/1.1 request/response exchanges over one reconnectable transport.

pub(crate) mod codec;

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use log::{debug, info, trace};
use parking_lot::Mutex;
use tokio::time::Instant;

use self::codec::{ClientCodec, Event, ResponseHead, State};
use super::{
    auth::{Auth, Decision, NoAuth},
    request::Request,
    response::Response,
};
use crate::{
    config::{ConnectionConfig, Http1Config},
    reconnect::ReconnectPolicy,
    tls::{self, TlsConnector},
    transport::{Transport, TransportState},
    Error, Origin,
};

/// Lifecycle of an [`HttpConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    /// Connected and ready for a request.
    Idle,
    /// A request is in flight, or its response has not been fully read.
    Active,
    /// The connection was handed over to another protocol.
    Switched,
    /// No open transport.
    Closed,
}

/// A single HTTP/1.1 connection to one origin.
///
/// Requests are strictly sequential: a new request can only start once the
/// previous response has been read to the end (or dropped). Cloning the
/// handle is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct HttpConnection {
    inner: Arc<Inner>,
}

struct Inner {
    origin: Origin,
    transport: Transport,
    policy: ReconnectPolicy,
    config: Http1Config,
    exchange: Mutex<Exchange>,
}

struct Exchange {
    state: HttpState,
    codec: Option<ClientCodec>,
    keepalive_expiry: Option<Instant>,
}

impl HttpConnection {
    /// Create an unconnected connection.
    ///
    /// Secure origins get a default TLS connector when `tls` is `None`.
    ///
    /// # Errors
    ///
    /// A builder error if `tls` is given for a plaintext origin.
    pub fn new(
        origin: Origin,
        config: ConnectionConfig,
        tls: Option<TlsConnector>,
    ) -> crate::Result<HttpConnection> {
        let tls = tls::for_origin(&origin, tls)?;
        Ok(HttpConnection {
            inner: Arc::new(Inner {
                transport: Transport::from_parts(origin.clone(), tls, config.transport),
                origin,
                policy: ReconnectPolicy::new(config.reconnect),
                config: config.http1,
                exchange: Mutex::new(Exchange {
                    state: HttpState::Closed,
                    codec: None,
                    keepalive_expiry: None,
                }),
            }),
        })
    }

    /// The origin this connection talks to.
    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn state(&self) -> HttpState {
        let mut ex = self.inner.exchange.lock();
        self.sync_closed(&mut ex);
        ex.state
    }

    /// Open the transport.
    ///
    /// # Errors
    ///
    /// `Connect`/`ConnectTimeout` on failure, misuse if already connected.
    pub async fn connect(&self) -> crate::Result<()> {
        self.establish().await
    }

    /// Close the connection. A connection closed this way is never
    /// re-established.
    pub async fn aclose(&self) {
        self.inner.policy.client_closed();
        self.inner.transport.aclose().await;
    }

    /// Start closing without waiting. Like [`aclose`](Self::aclose), the
    /// connection will not be re-established.
    pub(crate) fn close(&self) {
        self.inner.policy.client_closed();
        self.inner.transport.close();
    }

    /// Record that the owner is closing the connection, before it actually
    /// goes away.
    pub(crate) fn mark_client_closed(&self) {
        self.inner.policy.client_closed();
    }

    /// Bytes read from the transport at a time.
    pub(crate) fn chunk_size(&self) -> usize {
        self.inner.config.chunk_size
    }

    /// Never connected, and not connecting.
    pub(crate) fn is_fresh(&self) -> bool {
        !self.inner.policy.was_connected() && self.inner.transport.state() == TransportState::Closed
    }

    pub(crate) fn ptr_eq(&self, other: &HttpConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the peer dropped the connection and it may be re-established.
    pub fn should_reconnect(&self) -> bool {
        self.inner
            .policy
            .should_reconnect(self.state() == HttpState::Closed)
    }

    /// Re-establish a dropped connection, retrying on the backoff schedule.
    pub async fn reconnect(&self) -> crate::Result<()> {
        self.inner.transport.closed().await;
        info!("reconnecting to {}", self.inner.origin);
        self.inner.policy.run(|| self.establish()).await
    }

    /// Whether a new request could be started now, reconnecting first if
    /// necessary.
    pub fn is_available(&self) -> bool {
        let mut ex = self.inner.exchange.lock();
        self.sync_closed(&mut ex);
        match ex.state {
            HttpState::Idle => !self.is_stale(&ex) || self.inner.policy.auto_reconnect(),
            HttpState::Closed => self.inner.policy.should_reconnect(true),
            HttpState::Active | HttpState::Switched => false,
        }
    }

    /// Send `request` and wait for the response head.
    ///
    /// An expired idle connection is closed first, and a connection the peer
    /// dropped is re-established when reconnection is enabled. With an
    /// [`Auth`], intermediate responses are drained and follow-up requests
    /// are sent on this connection until the flow is done.
    ///
    /// The returned response keeps the connection busy until its body has
    /// been read to the end or the response is dropped.
    ///
    /// # Errors
    ///
    /// Misuse if the connection is busy or `request` targets another origin.
    /// Any failure during the exchange closes the connection.
    pub async fn request(
        &self,
        request: Request,
        auth: Option<Arc<dyn Auth>>,
    ) -> crate::Result<Response> {
        self.expire_keepalive().await;
        if self.should_reconnect() {
            self.reconnect().await?;
        }

        if request.origin() != &self.inner.origin {
            return Err(Error::misuse(format!(
                "request to {} sent on a connection to {}",
                request.origin(),
                self.inner.origin
            ))
            .with_url(request.url().clone()));
        }

        {
            let mut ex = self.inner.exchange.lock();
            self.sync_closed(&mut ex);
            if ex.state != HttpState::Idle {
                return Err(Error::misuse(format!(
                    "invalid state to initiate request: {:?}",
                    ex.state
                )));
            }
            ex.state = HttpState::Active;
        }

        let mut guard = ExchangeGuard {
            conn: self,
            armed: true,
        };
        let auth = auth.unwrap_or_else(|| Arc::new(NoAuth));
        let result = self.send_handling_auth(request, auth).await;
        guard.armed = false;
        result
    }

    async fn establish(&self) -> crate::Result<()> {
        self.inner.transport.connect().await?;
        self.inner.policy.connected();
        let mut ex = self.inner.exchange.lock();
        ex.state = HttpState::Idle;
        ex.codec = Some(ClientCodec::new());
        ex.keepalive_expiry = self
            .inner
            .config
            .keepalive_timeout
            .map(|timeout| Instant::now() + timeout);
        Ok(())
    }

    async fn expire_keepalive(&self) {
        let stale = {
            let ex = self.inner.exchange.lock();
            ex.state == HttpState::Idle && self.is_stale(&ex)
        };
        if stale {
            debug!("closing stale idle connection to {}", self.inner.origin);
            self.inner.transport.aclose().await;
        }
    }

    // An idle connection whose keepalive ran out, or whose peer has hung up.
    fn is_stale(&self, ex: &Exchange) -> bool {
        keepalive_expired(ex) || self.inner.transport.at_eof()
    }

    async fn send_handling_auth(
        &self,
        mut request: Request,
        auth: Arc<dyn Auth>,
    ) -> crate::Result<Response> {
        if let Err(e) = auth.start(&mut request) {
            self.aclose().await;
            return Err(Error::auth(e).with_url(request.url().clone()));
        }

        loop {
            let mut response = self.send_request(&mut request).await?;
            match auth.next(&request, &response) {
                Ok(Decision::Done) => {
                    response.set_release();
                    return Ok(response);
                }
                Ok(Decision::Retry(next)) => {
                    trace!("auth flow requested another request");
                    response.drain().await?;
                    if next.origin() != &self.inner.origin {
                        self.aclose().await;
                        return Err(Error::misuse("auth flow switched origin")
                            .with_url(next.url().clone()));
                    }
                    request = next;
                }
                Err(e) => {
                    drop(response);
                    self.aclose().await;
                    return Err(Error::auth(e).with_url(request.url().clone()));
                }
            }
        }
    }

    async fn send_request(&self, request: &mut Request) -> crate::Result<Response> {
        let ready = self.with_codec(|codec| {
            if codec.is_reusable() {
                codec.start_next_cycle()?;
            }
            if !codec.is_idle() {
                return Err(Error::local_protocol(format!(
                    "cannot initiate request in state ours {:?}, theirs {:?}",
                    codec.our_state(),
                    codec.their_state()
                )));
            }
            Ok(())
        });
        if let Err(e) = ready {
            self.aclose().await;
            return Err(e.with_url(request.url().clone()));
        }

        let timeouts = request.timeouts();
        let exchange = async {
            self.send_request_head(request, timeouts.write).await?;
            self.send_request_body(request, timeouts.write).await?;
            self.receive_response(timeouts.read).await
        };
        match exchange.await {
            Ok(head) => Ok(Response::new(
                head,
                request.url().clone(),
                self.clone(),
                timeouts.read,
            )),
            Err(e) => {
                debug!("request to {} failed: {}", self.inner.origin, e);
                self.aclose().await;
                Err(e.with_url(request.url().clone()))
            }
        }
    }

    async fn send_request_head(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> crate::Result<()> {
        let mut headers = request.headers().clone();
        if !headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&self.inner.origin.authority())
                .map_err(Error::local_protocol)?;
            headers.insert(header::HOST, host);
        }
        if let Some(body) = request.body() {
            if !headers.contains_key(header::CONTENT_LENGTH)
                && !headers.contains_key(header::TRANSFER_ENCODING)
            {
                match body.content_length() {
                    Some(len) => {
                        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                    }
                    None => {
                        headers.insert(
                            header::TRANSFER_ENCODING,
                            HeaderValue::from_static("chunked"),
                        );
                    }
                }
            }
        }

        let head = self.with_codec(|codec| {
            codec.send_request(request.method(), request.target(), &headers)
        })?;
        trace!("sending {} {}", request.method(), request.target());
        self.inner.transport.write(&head, timeout).await
    }

    async fn send_request_body(
        &self,
        request: &mut Request,
        timeout: Option<Duration>,
    ) -> crate::Result<()> {
        if let Some(mut body) = request.body_for_send() {
            while let Some(chunk) = body.next_chunk(self.inner.config.chunk_size).await {
                let chunk = chunk.map_err(Error::body)?;
                let data = self.with_codec(|codec| codec.send_data(&chunk))?;
                if !data.is_empty() {
                    self.inner.transport.write(&data, timeout).await?;
                }
            }
        }
        let tail = self.with_codec(ClientCodec::send_end_of_message)?;
        if !tail.is_empty() {
            self.inner.transport.write(&tail, timeout).await?;
        }
        Ok(())
    }

    async fn receive_response(&self, timeout: Option<Duration>) -> crate::Result<ResponseHead> {
        match self.next_event(timeout).await? {
            Event::Response(head) => {
                trace!("received response {}", head.status);
                Ok(head)
            }
            other => Err(Error::remote_protocol(format!(
                "unexpected {} event while waiting for a response",
                other.name()
            ))),
        }
    }

    /// Next protocol event, reading from the transport as needed.
    async fn next_event(&self, timeout: Option<Duration>) -> crate::Result<Event> {
        loop {
            match self.with_codec(ClientCodec::next_event)? {
                Event::NeedData => {
                    match self
                        .inner
                        .transport
                        .read(self.inner.config.chunk_size, timeout)
                        .await
                    {
                        Ok(data) => self.with_codec(|codec| {
                            codec.receive_data(&data);
                            Ok(())
                        })?,
                        Err(e) if e.is_eof() => self.with_codec(|codec| {
                            codec.receive_eof();
                            Ok(())
                        })?,
                        Err(e) => return Err(e),
                    }
                }
                event => return Ok(event),
            }
        }
    }

    /// Next piece of the response body; `None` once the message is complete.
    pub(crate) async fn next_body_chunk(
        &self,
        timeout: Option<Duration>,
    ) -> crate::Result<Option<Bytes>> {
        match self.next_event(timeout).await? {
            Event::Data(data) => Ok(Some(data)),
            Event::EndOfMessage | Event::Paused => Ok(None),
            other => Err(Error::remote_protocol(format!(
                "unexpected {} event while reading a response body",
                other.name()
            ))),
        }
    }

    /// Finish the current response from bytes that have already arrived,
    /// without waiting. Returns whether the message completed.
    pub(crate) fn drain_buffered(&self) -> bool {
        loop {
            let event = match self.with_codec(ClientCodec::next_event) {
                Ok(event) => event,
                Err(_) => return false,
            };
            match event {
                Event::Data(_) => continue,
                Event::EndOfMessage | Event::Paused => return true,
                Event::Response(_) => return false,
                Event::NeedData => {
                    let fed = match self.inner.transport.try_read(self.inner.config.chunk_size) {
                        Some(Ok(data)) => self.with_codec(|codec| {
                            codec.receive_data(&data);
                            Ok(())
                        }),
                        Some(Err(e)) if e.is_eof() => self.with_codec(|codec| {
                            codec.receive_eof();
                            Ok(())
                        }),
                        _ => return false,
                    };
                    if fed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Called when a response body is complete. `release` returns the
    /// connection to `Idle`; intermediate responses of an auth flow leave it
    /// `Active`.
    pub(crate) fn response_closed(&self, release: bool) {
        let must_close = {
            let mut ex = self.inner.exchange.lock();
            self.sync_closed(&mut ex);
            if let Some(timeout) = self.inner.config.keepalive_timeout {
                ex.keepalive_expiry = Some(Instant::now() + timeout);
            }
            let must_close = ex
                .codec
                .as_ref()
                .map_or(false, |codec| codec.must_close());
            if release && !must_close && ex.state == HttpState::Active {
                ex.state = HttpState::Idle;
            }
            release && must_close
        };
        if must_close {
            debug!("connection to {} must close after this response", self.inner.origin);
            self.inner.transport.close();
        }
    }

    /// Drop a response that was abandoned halfway through its body. The
    /// connection cannot be reused.
    pub(crate) fn discard(&self) {
        debug!("response body abandoned, aborting connection to {}", self.inner.origin);
        self.inner.transport.abort();
    }

    /// Hand the connection over after a `101 Switching Protocols`. Returns
    /// bytes the server sent after the response head.
    pub(crate) fn switch_protocols(&self) -> crate::Result<Bytes> {
        let mut ex = self.inner.exchange.lock();
        let codec = ex
            .codec
            .as_mut()
            .ok_or_else(Error::connection_lost)?;
        if codec.their_state() != State::SwitchedProtocol {
            return Err(Error::remote_protocol("server did not switch protocols"));
        }
        let trailing = codec.take_trailing();
        ex.state = HttpState::Switched;
        Ok(trailing)
    }

    fn with_codec<T>(
        &self,
        f: impl FnOnce(&mut ClientCodec) -> crate::Result<T>,
    ) -> crate::Result<T> {
        let mut ex = self.inner.exchange.lock();
        match ex.codec.as_mut() {
            Some(codec) => f(codec),
            None => Err(self
                .inner
                .transport
                .exception()
                .unwrap_or_else(Error::connection_lost)),
        }
    }

    // The transport closes on its own when the peer goes away; the exchange
    // state follows it lazily.
    fn sync_closed(&self, ex: &mut Exchange) {
        if ex.state != HttpState::Closed && self.inner.transport.state() == TransportState::Closed
        {
            trace!("transport to {} closed", self.inner.origin);
            ex.state = HttpState::Closed;
        }
    }
}

fn keepalive_expired(ex: &Exchange) -> bool {
    ex.keepalive_expiry
        .map_or(false, |expiry| expiry <= Instant::now())
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("origin", &self.inner.origin)
            .field("state", &self.state())
            .finish()
    }
}

// Aborts the connection if the request future is dropped before the
// response head arrives.
struct ExchangeGuard<'a> {
    conn: &'a HttpConnection,
    armed: bool,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("request cancelled mid-exchange");
            self.conn.inner.transport.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheme;

    #[test]
    fn tls_for_plaintext_origin_is_rejected() {
        let origin = Origin::new(Scheme::Http, "example.com", 80);
        let err = HttpConnection::new(
            origin,
            ConnectionConfig::default(),
            Some(TlsConnector::default()),
        )
        .unwrap_err();
        assert!(err.is_builder());
    }

    #[tokio::test]
    async fn unconnected_connection_is_closed_and_unavailable() {
        let origin = Origin::new(Scheme::Http, "127.0.0.1", 1);
        let conn = HttpConnection::new(origin, ConnectionConfig::default(), None).unwrap();
        assert_eq!(conn.state(), HttpState::Closed);
        assert!(!conn.is_available());
        assert!(!conn.should_reconnect());
    }

    #[tokio::test]
    async fn request_on_unconnected_connection_is_misuse() {
        let origin = Origin::new(Scheme::Http, "127.0.0.1", 1);
        let conn = HttpConnection::new(origin, ConnectionConfig::default(), None).unwrap();
        let req = Request::get("http://127.0.0.1:1/").build().unwrap();
        let err = conn.request(req, None).await.unwrap_err();
        assert!(err.is_misuse());
    }
}
