use std::{fmt, time::Duration};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use super::http1::{codec::ResponseHead, HttpConnection};

type OnClose = Box<dyn FnOnce() + Send>;

/// A Response to a submitted `Request`.
///
/// The body streams straight off the connection, which stays busy until the
/// body has been read to the end. Dropping a response early finishes it from
/// bytes that have already arrived when possible, and aborts the connection
/// otherwise.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
    body: Incoming,
}

struct Incoming {
    // `None` once the body is complete.
    conn: Option<HttpConnection>,
    read_timeout: Option<Duration>,
    release: bool,
    on_close: Option<OnClose>,
}

impl Response {
    pub(crate) fn new(
        head: ResponseHead,
        url: Url,
        conn: HttpConnection,
        read_timeout: Option<Duration>,
    ) -> Response {
        Response {
            status: head.status,
            version: head.version,
            headers: head.headers,
            url,
            body: Incoming {
                conn: Some(conn),
                read_timeout,
                release: false,
                on_close: None,
            },
        }
    }

    /// Get the `Url` of this `Response`.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the `Headers` of this `Response`.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The value of the `Content-Length` header, if present and valid.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Whether the body has been read to the end.
    pub fn is_complete(&self) -> bool {
        self.body.conn.is_none()
    }

    /// Get the full response text.
    ///
    /// Invalid UTF-8 sequences are replaced with `U+FFFD`.
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Get the full response body as `Bytes`.
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Stream a chunk of the response body.
    ///
    /// When the response body has been exhausted, this will return `None`.
    /// Each wait for data is bounded by the request's read timeout.
    ///
    /// # Errors
    ///
    /// A timeout or protocol failure closes the connection; later calls
    /// return `None`.
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        let Some(conn) = self.body.conn.clone() else {
            return Ok(None);
        };
        match conn.next_body_chunk(self.body.read_timeout).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(e) => {
                self.body.conn = None;
                conn.aclose().await;
                self.run_on_close();
                Err(e.with_url(self.url.clone()))
            }
        }
    }

    /// Convert the response into a `Stream` of `Bytes` from the body.
    pub fn bytes_stream(self) -> impl futures_core::Stream<Item = crate::Result<Bytes>> {
        futures_util::stream::unfold(self, |mut res| async move {
            match res.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), res)),
                Ok(None) => None,
                Err(e) => Some((Err(e), res)),
            }
        })
    }

    /// Read and discard the rest of the body.
    pub(crate) async fn drain(&mut self) -> crate::Result<()> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }

    /// Completing this response returns its connection to `Idle`.
    pub(crate) fn set_release(&mut self) {
        self.body.release = true;
    }

    /// Run `f` once the body is complete or abandoned. Runs immediately if
    /// it already is.
    pub(crate) fn on_close(&mut self, f: impl FnOnce() + Send + 'static) {
        if self.body.conn.is_none() {
            f();
        } else {
            self.body.on_close = Some(Box::new(f));
        }
    }

    fn finish(&mut self) {
        if let Some(conn) = self.body.conn.take() {
            conn.response_closed(self.body.release);
        }
        self.run_on_close();
    }

    fn run_on_close(&mut self) {
        if let Some(f) = self.body.on_close.take() {
            f();
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        if let Some(conn) = self.body.conn.clone() {
            if conn.drain_buffered() {
                self.finish();
            } else {
                self.body.conn = None;
                conn.discard();
                self.run_on_close();
            }
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url().as_str())
            .field("status", &self.status())
            .field("headers", self.headers())
            .finish()
    }
}
