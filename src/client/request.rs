use std::{convert::TryFrom, fmt, time::Duration};

use http::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method,
};
use url::{Position, Url};

use super::body::Body;
use crate::{config, Error, IntoUrl, Origin};

/// Per-request bounds on socket reads and writes.
///
/// Both default to 30 seconds. `None` waits indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on each wait for response data.
    pub read: Option<Duration>,
    /// Bound on each wait for the outbound buffer to drain.
    pub write: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            read: Some(config::REQUEST_TIMEOUT),
            write: Some(config::REQUEST_TIMEOUT),
        }
    }
}

/// A request which can be sent with [`HttpConnection::request`] or
/// [`Pool::request`].
///
/// [`HttpConnection::request`]: crate::HttpConnection::request
/// [`Pool::request`]: crate::Pool::request
pub struct Request {
    method: Method,
    url: Url,
    origin: Origin,
    headers: HeaderMap,
    body: Option<Body>,
    timeouts: Timeouts,
}

/// A builder to construct the properties of a `Request`.
#[must_use = "RequestBuilder does nothing until you 'build' it"]
pub struct RequestBuilder {
    request: crate::Result<Request>,
}

impl Request {
    /// Constructs a new request.
    ///
    /// # Errors
    ///
    /// Fails if the URL has no host, or its scheme is not one of `http`,
    /// `https`, `ws` or `wss`.
    pub fn new(method: Method, url: Url) -> crate::Result<Request> {
        let origin = Origin::from_url(&url)?;
        Ok(Request {
            method,
            url,
            origin,
            headers: HeaderMap::new(),
            body: None,
            timeouts: Timeouts::default(),
        })
    }

    /// Start building a request.
    pub fn builder<U: IntoUrl>(method: Method, url: U) -> RequestBuilder {
        RequestBuilder {
            request: url.into_url().and_then(|url| Request::new(method, url)),
        }
    }

    /// Start building a `GET` request.
    pub fn get<U: IntoUrl>(url: U) -> RequestBuilder {
        Request::builder(Method::GET, url)
    }

    /// Start building a `POST` request.
    pub fn post<U: IntoUrl>(url: U) -> RequestBuilder {
        Request::builder(Method::POST, url)
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The origin the request is addressed to.
    #[inline]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    /// Get the timeouts.
    #[inline]
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Get a mutable reference to the timeouts.
    #[inline]
    pub fn timeouts_mut(&mut self) -> &mut Timeouts {
        &mut self.timeouts
    }

    /// Attempt to clone the request.
    ///
    /// `None` is returned if the request can not be cloned, i.e. if the body is a stream.
    pub fn try_clone(&self) -> Option<Request> {
        let body = match self.body() {
            Some(body) => Some(body.try_clone()?),
            None => None,
        };
        Some(Request {
            method: self.method.clone(),
            url: self.url.clone(),
            origin: self.origin.clone(),
            headers: self.headers.clone(),
            body,
            timeouts: self.timeouts,
        })
    }

    /// The body to put on the wire. Reusable bodies stay in place so the
    /// request can be replayed; streams can only be sent once.
    pub(crate) fn body_for_send(&mut self) -> Option<Body> {
        match self.body {
            Some(ref body) => body.try_clone().or_else(|| self.body.take()),
            None => None,
        }
    }

    /// Path and query, as written on the request line.
    pub(crate) fn target(&self) -> &str {
        match &self.url[Position::BeforePath..Position::AfterQuery] {
            "" => "/",
            target => target,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

impl RequestBuilder {
    /// Assemble a builder starting from an existing `Request`.
    pub fn from_request(request: Request) -> RequestBuilder {
        RequestBuilder {
            request: Ok(request),
        }
    }

    /// Add a `Header` to this Request.
    ///
    /// If the header is already present, the value will be replaced.
    pub fn header<K, V>(self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.header_operation(key, value, true)
    }

    /// Add a `Header` to append to the request.
    ///
    /// The new header is always appended to the request, even if the header already exists.
    pub fn header_append<K, V>(self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.header_operation(key, value, false)
    }

    fn header_operation<K, V>(mut self, key: K, value: V, overwrite: bool) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        if overwrite {
                            req.headers_mut().insert(key, value);
                        } else {
                            req.headers_mut().append(key, value);
                        }
                    }
                    Err(e) => error = Some(Error::builder(e.into())),
                },
                Err(e) => error = Some(Error::builder(e.into())),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of Headers to the existing ones on this Request.
    ///
    /// The headers will be merged in to any already set.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            replace_headers(req.headers_mut(), headers);
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Bound each wait for response data.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.timeouts_mut().read = timeout;
        }
        self
    }

    /// Bound each wait for the outbound buffer to drain.
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.timeouts_mut().write = timeout;
        }
        self
    }

    /// Build a `Request`.
    pub fn build(self) -> crate::Result<Request> {
        self.request
    }

    /// Attempt to clone the RequestBuilder.
    ///
    /// `None` is returned if the RequestBuilder can not be cloned,
    /// i.e. if the request body is a stream.
    pub fn try_clone(&self) -> Option<RequestBuilder> {
        self.request
            .as_ref()
            .ok()
            .and_then(|req| req.try_clone())
            .map(|req| RequestBuilder { request: Ok(req) })
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.request {
            Ok(ref req) => f.debug_tuple("RequestBuilder").field(req).finish(),
            Err(ref err) => f.debug_tuple("RequestBuilder").field(err).finish(),
        }
    }
}

// Merge `src` into `dst`. Names present in `src` replace every value `dst`
// had for them; repeated names in `src` are all kept.
fn replace_headers(dst: &mut HeaderMap, src: HeaderMap) {
    let mut prev_name = None;
    for (key, value) in src {
        match key {
            Some(key) => {
                dst.insert(key.clone(), value);
                prev_name = Some(key);
            }
            None => match prev_name {
                Some(ref key) => {
                    dst.append(key.clone(), value);
                }
                None => unreachable!("HeaderMap::into_iter yielded None first"),
            },
        }
    }
}
