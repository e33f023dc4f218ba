#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tether
//!
//! The `tether` crate is an asynchronous HTTP/1.1 and WebSocket client
//! engine built on tokio.
//!
//! - A reconnectable [`Transport`] over TCP or TLS with read and write
//!   backpressure
//! - Sequential HTTP/1.1 exchanges on an [`HttpConnection`], with streamed
//!   request and response bodies
//! - A per-origin connection [`Pool`] with FIFO hand-out and eviction
//! - [`WebSocket`] sessions with keepalive pings and a closing handshake
//!
//! ## Making a GET request
//!
//! For a single request, you can use the [`get`][get] shortcut method.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), tether::Error> {
//! let body = tether::get("http://example.com/")
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {:?}", body);
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, create a [`Pool`]
//! and reuse it, so that keep-alive connections are shared.
//!
//! ## Sending a body
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), tether::Error> {
//! let pool = tether::Pool::new();
//! let request = tether::Request::post("http://example.com/upload")
//!     .header("content-type", "text/plain")
//!     .body("the exact body that is sent")
//!     .build()?;
//! let res = pool.request(request).await?;
//! println!("status = {}", res.status());
//! # Ok(())
//! # }
//! ```
//!
//! Bodies can also be streamed with [`Body::wrap_stream`]; those are sent
//! with chunked transfer encoding.
//!
//! ## WebSocket
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), tether::Error> {
//! let ws = tether::websocket("ws://example.com/chat").await?;
//! ws.send("hello").await?;
//! let reply = ws.recv().await?;
//! println!("reply = {:?}", reply);
//! ws.aclose().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Reconnecting
//!
//! Connections the server dropped are re-established on the next request
//! with exponential backoff, see [`ConnectionConfigBuilder::auto_reconnect`]
//! and [`Backoff`]. A connection closed by the client is never
//! re-established.
//!
//! ## Logging
//!
//! `tether` logs through the [`log`](https://docs.rs/log) facade: connection
//! lifecycle at `info`, protocol decisions at `debug` and per-message detail
//! at `trace`.
//!
//! [get]: ./fn.get.html

pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use url::Url;

mod error;
mod into_url;
mod origin;

pub use self::config::{
    Backoff, ConnectionConfig, ConnectionConfigBuilder, Http1Config, ReconnectConfig,
    TransportConfig, WebSocketConfig, WebSocketConfigBuilder,
};
pub use self::error::{BoxError, Error, Result};
pub use self::into_url::IntoUrl;
pub use self::origin::{Origin, Scheme};
pub use self::tls::TlsConnector;
pub use self::transport::{Transport, TransportState};

/// Shortcut method to quickly make a `GET` request.
///
/// See also the methods on the [`tether::Response`](./struct.Response.html)
/// type.
///
/// **NOTE**: This function creates a new [`Pool`] on each call, and so
/// should not be used if making many requests.
///
/// # Errors
///
/// This function fails if:
///
/// - supplied `Url` cannot be parsed
/// - the connection cannot be established
/// - there was an error while sending request
pub async fn get<T: IntoUrl>(url: T) -> crate::Result<Response> {
    let request = Request::get(url).build()?;
    Pool::new().request(request).await
}

/// Opens a websocket at the specified URL with default settings.
///
/// This is a shorthand for [`WebSocket::builder`] followed by
/// [`connect`](WebSocketBuilder::connect).
pub async fn websocket<T: IntoUrl>(url: T) -> crate::Result<WebSocket> {
    let request = Request::get(url).build()?;
    WebSocket::builder().connect(request).await
}

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Pool>();
    assert_sync::<Pool>();
    assert_clone::<Pool>();

    assert_send::<HttpConnection>();
    assert_sync::<HttpConnection>();

    assert_send::<Request>();
    assert_sync::<Request>();
    assert_send::<Body>();
    assert_sync::<Body>();
    assert_send::<RequestBuilder>();
    assert_send::<Response>();

    fn assert_send_future<F: std::future::Future + Send>(_: F) {}
    let _ = |pool: Pool, request: Request| {
        assert_send_future(async move { pool.request(request).await })
    };
    let _ = |ws: WebSocket| assert_send_future(async move { ws.send("").await });

    assert_send::<WebSocket>();
    assert_sync::<WebSocket>();

    assert_send::<Error>();
    assert_sync::<Error>();
}

pub use self::client::{
    Auth, Body, Decision, HttpConnection, HttpState, Message, NoAuth, Pool, PoolBuilder, Request,
    RequestBuilder, Response, Timeouts, WebSocket, WebSocketBuilder, WebSocketState,
};

mod client;
mod config;
mod connect;
mod reconnect;
pub mod tls;
mod transport;
