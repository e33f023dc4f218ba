//! A bounded pool of HTTP/1.1 connections shared across origins.
//!
//! Requests are served in arrival order. A request takes an available
//! connection to its origin if there is one, otherwise opens a new one while
//! the pool has room, evicting the least recently used idle connection when
//! it does not. Requests that cannot be served wait until a response
//! completes and frees a slot.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use log::{debug, trace};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{
    auth::Auth,
    http1::{HttpConnection, HttpState},
    request::Request,
    response::Response,
};
use crate::{
    config::{self, ConnectionConfig},
    tls::TlsConnector,
    Error, Origin,
};

/// A pool of connections. Cloning the handle is cheap; all clones share the
/// same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// A `PoolBuilder` can be used to create a `Pool` with custom configuration.
#[must_use]
pub struct PoolBuilder {
    config: Config,
}

struct Config {
    connection: ConnectionConfig,
    tls: Option<TlsConnector>,
    auth: Option<Arc<dyn Auth>>,
    max_connections: usize,
    acquire_timeout: Option<Duration>,
}

struct PoolInner {
    config: Config,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    // Most recently used first.
    connections: Vec<HttpConnection>,
    // Arrival order.
    requests: Vec<RequestStatus>,
    next_id: u64,
    closed: bool,
}

struct RequestStatus {
    id: u64,
    origin: Origin,
    connection: Option<HttpConnection>,
    // Closed to make room for `connection`.
    evicted: Option<HttpConnection>,
    error: Option<Error>,
    ready: Arc<Notify>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    /// Constructs a new `PoolBuilder`.
    ///
    /// This is the same as `Pool::builder()`.
    pub fn new() -> PoolBuilder {
        PoolBuilder {
            config: Config {
                connection: ConnectionConfig::default(),
                tls: None,
                auth: None,
                max_connections: config::MAX_CONNECTIONS,
                acquire_timeout: Some(config::ACQUIRE_CONNECTION_TIMEOUT),
            },
        }
    }

    /// Settings for every connection the pool opens.
    pub fn connection_config(mut self, config: ConnectionConfig) -> PoolBuilder {
        self.config.connection = config;
        self
    }

    /// TLS connector for `https` and `wss` origins. A default connector
    /// with the bundled web PKI roots is used otherwise.
    pub fn tls(mut self, tls: TlsConnector) -> PoolBuilder {
        self.config.tls = Some(tls);
        self
    }

    /// Authentication flow applied to every request.
    pub fn auth<A: Auth + 'static>(mut self, auth: A) -> PoolBuilder {
        self.config.auth = Some(Arc::new(auth));
        self
    }

    /// Upper bound on open connections across all origins.
    ///
    /// Default is 50.
    pub fn max_connections(mut self, max: usize) -> PoolBuilder {
        self.config.max_connections = max;
        self
    }

    /// How long a request waits for a connection.
    ///
    /// Default is 10 seconds. `None` waits indefinitely.
    pub fn acquire_connection_timeout(mut self, timeout: Option<Duration>) -> PoolBuilder {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Returns a `Pool` that uses this `PoolBuilder` configuration.
    pub fn build(self) -> crate::Result<Pool> {
        if self.config.max_connections == 0 {
            return Err(Error::builder("max_connections must be greater than zero"));
        }
        Ok(Pool {
            inner: Arc::new(PoolInner {
                config: self.config,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("connection", &self.config.connection)
            .field("max_connections", &self.config.max_connections)
            .field("acquire_timeout", &self.config.acquire_timeout)
            .finish()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// A pool with the default configuration.
    pub fn new() -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                config: PoolBuilder::new().config,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Creates a `PoolBuilder` to configure a `Pool`.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Send `request` on a pooled connection, using the pool's auth flow.
    pub async fn request(&self, request: Request) -> crate::Result<Response> {
        let auth = self.inner.config.auth.clone();
        self.send(request, auth).await
    }

    /// Send `request` on a pooled connection with a specific auth flow.
    pub async fn request_with_auth(
        &self,
        request: Request,
        auth: Arc<dyn Auth>,
    ) -> crate::Result<Response> {
        self.send(request, Some(auth)).await
    }

    /// Snapshot of the pooled connections, most recently used first.
    pub fn connections(&self) -> Vec<HttpConnection> {
        self.inner.state.lock().connections.clone()
    }

    /// Number of requests waiting for a connection or holding one.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().requests.len()
    }

    /// Close every connection.
    ///
    /// Waiting requests fail with a misuse error. Closing a pool that still
    /// has requests in flight is an error itself, reported after the
    /// connections have been closed.
    pub async fn aclose(&self) -> crate::Result<()> {
        let (connections, in_flight) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            for status in &state.requests {
                status.ready.notify_one();
            }
            (
                std::mem::take(&mut state.connections),
                state.requests.len(),
            )
        };
        debug!("closing pool with {} connections", connections.len());
        futures_util::future::join_all(connections.iter().map(HttpConnection::aclose)).await;

        if in_flight > 0 {
            return Err(Error::misuse(format!(
                "pool closed while {in_flight} requests were still in flight"
            )));
        }
        Ok(())
    }

    async fn send(
        &self,
        request: Request,
        auth: Option<Arc<dyn Auth>>,
    ) -> crate::Result<Response> {
        let (id, ready) = self.inner.enqueue(request.origin().clone())?;
        let guard = StatusGuard {
            pool: &self.inner,
            id,
            armed: true,
        };

        let acquire = self.inner.wait_for_connection(id, ready);
        let (conn, evicted) = match self.inner.config.acquire_timeout {
            Some(dur) => tokio::time::timeout(dur, acquire)
                .await
                .map_err(|_| Error::acquire_timeout().with_url(request.url().clone()))?,
            None => acquire.await,
        }
        .map_err(|e| e.with_url(request.url().clone()))?;

        if let Some(evicted) = evicted {
            trace!("waiting for evicted connection to {} to close", evicted.origin());
            evicted.transport().closed().await;
        }
        if conn.is_fresh() {
            trace!("opening new connection to {}", conn.origin());
            conn.connect()
                .await
                .map_err(|e| e.with_url(request.url().clone()))?;
        }

        let mut response = conn.request(request, auth).await?;

        let pool = Arc::downgrade(&self.inner);
        response.on_close(move || PoolInner::response_closed(&pool, id));
        guard.disarm();
        Ok(response)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("connections", &state.connections.len())
            .field("requests", &state.requests.len())
            .field("max_connections", &self.inner.config.max_connections)
            .finish()
    }
}

impl PoolInner {
    fn enqueue(&self, origin: Origin) -> crate::Result<(u64, Arc<Notify>)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::misuse("pool is closed"));
        }
        let id = state.next_id;
        state.next_id += 1;
        let ready = Arc::new(Notify::new());
        state.requests.push(RequestStatus {
            id,
            origin,
            connection: None,
            evicted: None,
            error: None,
            ready: ready.clone(),
        });
        self.assign_waiting(&mut state);
        Ok((id, ready))
    }

    async fn wait_for_connection(
        &self,
        id: u64,
        ready: Arc<Notify>,
    ) -> crate::Result<(HttpConnection, Option<HttpConnection>)> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(Error::misuse("pool is closed"));
                }
                let status = state
                    .requests
                    .iter_mut()
                    .find(|status| status.id == id)
                    .ok_or_else(|| Error::misuse("request no longer queued"))?;
                if let Some(err) = status.error.take() {
                    return Err(err);
                }
                if let Some(conn) = status.connection.clone() {
                    return Ok((conn, status.evicted.take()));
                }
            }
            ready.notified().await;
        }
    }

    // Hand connections to waiting requests in arrival order. Stops at the
    // first request that cannot be served so later arrivals do not jump the
    // queue.
    fn assign_waiting(&self, state: &mut PoolState) {
        for idx in 0..state.requests.len() {
            if state.requests[idx].connection.is_some() || state.requests[idx].error.is_some() {
                continue;
            }
            match self.attempt_to_acquire(state, idx) {
                Ok(true) => state.requests[idx].ready.notify_one(),
                Ok(false) => break,
                Err(e) => {
                    state.requests[idx].error = Some(e);
                    state.requests[idx].ready.notify_one();
                }
            }
        }
    }

    fn attempt_to_acquire(&self, state: &mut PoolState, idx: usize) -> crate::Result<bool> {
        let origin = state.requests[idx].origin.clone();

        let reusable = state.connections.iter().position(|conn| {
            conn.origin() == &origin && conn.is_available() && !is_bound(state, conn)
        });
        if let Some(pos) = reusable {
            let conn = state.connections.remove(pos);
            trace!("reusing connection to {}", origin);
            state.connections.insert(0, conn.clone());
            state.requests[idx].connection = Some(conn);
            return Ok(true);
        }

        let mut evicted = None;
        if state.connections.len() >= self.config.max_connections {
            let evictable = state.connections.iter().rposition(|conn| {
                !is_bound(state, conn)
                    && matches!(conn.state(), HttpState::Idle | HttpState::Closed)
            });
            if let Some(pos) = evictable {
                let conn = state.connections.remove(pos);
                debug!("evicting connection to {} to make room", conn.origin());
                conn.close();
                evicted = Some(conn);
            }
        }
        if state.connections.len() >= self.config.max_connections {
            return Ok(false);
        }

        let tls = if origin.is_secure() {
            self.config.tls.clone()
        } else {
            None
        };
        let conn = HttpConnection::new(origin, self.config.connection.clone(), tls)?;
        state.connections.insert(0, conn.clone());
        state.requests[idx].connection = Some(conn);
        state.requests[idx].evicted = evicted;
        Ok(true)
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        state.requests.retain(|status| status.id != id);
        self.remove_closed_connections(&mut state);
        if !state.closed {
            self.assign_waiting(&mut state);
        }
    }

    fn response_closed(pool: &Weak<PoolInner>, id: u64) {
        if let Some(pool) = pool.upgrade() {
            trace!("response {} closed", id);
            pool.release(id);
        }
    }

    // Closed connections that will not come back are dropped. Fresh ones
    // bound to a request are about to connect and stay.
    fn remove_closed_connections(&self, state: &mut PoolState) {
        let mut idx = 0;
        while idx < state.connections.len() {
            let conn = &state.connections[idx];
            let dead = conn.state() == HttpState::Closed
                && !conn.should_reconnect()
                && !is_bound(state, conn);
            if dead {
                trace!("removing closed connection to {}", conn.origin());
                state.connections.remove(idx);
            } else {
                idx += 1;
            }
        }
    }
}

fn is_bound(state: &PoolState, conn: &HttpConnection) -> bool {
    state
        .requests
        .iter()
        .any(|status| status.connection.as_ref().map_or(false, |c| c.ptr_eq(conn)))
}

// Unregisters a request that failed or was cancelled before its response
// was handed out.
struct StatusGuard<'a> {
    pool: &'a PoolInner,
    id: u64,
    armed: bool,
}

impl StatusGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_connections_rejected() {
        let err = Pool::builder().max_connections(0).build().unwrap_err();
        assert!(err.is_builder());
    }

    #[tokio::test]
    async fn closed_pool_rejects_requests() {
        let pool = Pool::new();
        pool.aclose().await.unwrap();
        let req = Request::get("http://127.0.0.1:1/").build().unwrap();
        let err = pool.request(req).await.unwrap_err();
        assert!(err.is_misuse());
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_connect_releases_slot() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = Pool::builder().max_connections(1).build().unwrap();
        for _ in 0..2 {
            let req = Request::get(format!("http://{addr}/")).build().unwrap();
            let err = pool.request(req).await.unwrap_err();
            assert!(err.is_connect());
        }
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.connections().is_empty());
    }
}
