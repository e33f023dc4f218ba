use std::{error::Error as StdError, fmt, io, sync::Arc};

use http::StatusCode;
use url::Url;

/// A `Result` alias where the `Err` case is `tether::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The Errors that may occur while connecting, exchanging messages, or
/// closing a connection.
///
/// Errors are cheap to clone. A transport records the first terminal error it
/// sees and hands the same value to every caller that waits on it afterwards.
#[derive(Clone)]
pub struct Error {
    inner: Arc<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Arc::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn connect_timeout() -> Error {
        Error::new(Kind::ConnectTimeout, Some(TimedOut))
    }

    pub(crate) fn read_timeout() -> Error {
        Error::new(Kind::ReadTimeout, Some(TimedOut))
    }

    pub(crate) fn write_timeout() -> Error {
        Error::new(Kind::WriteTimeout, Some(TimedOut))
    }

    pub(crate) fn acquire_timeout() -> Error {
        Error::new(Kind::AcquireTimeout, Some(TimedOut))
    }

    pub(crate) fn eof() -> Error {
        Error::new(Kind::Eof, None::<Error>)
    }

    /// The peer went away without an underlying cause (clean close or abort).
    pub(crate) fn connection_lost() -> Error {
        Error::new(Kind::ConnectionLost, None::<Error>)
    }

    /// The peer went away because of an I/O failure.
    pub(crate) fn connection_lost_with<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::ConnectionLost, Some(e))
    }

    pub(crate) fn closing() -> Error {
        Error::new(Kind::ConnectionClosing, None::<Error>)
    }

    pub(crate) fn local_protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::LocalProtocol, Some(e))
    }

    pub(crate) fn remote_protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::RemoteProtocol, Some(e))
    }

    pub(crate) fn handshake(status: StatusCode) -> Error {
        Error::new(Kind::Handshake(status), None::<Error>)
    }

    pub(crate) fn misuse<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Misuse, Some(e))
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn auth<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Auth, Some(e))
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Add a url related to this error (overwriting any existing)
    pub fn with_url(self, url: Url) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.url = Some(url);
                inner
            }
            Err(shared) => return Error::new(Kind::Wrapped, Some(Error { inner: shared })).with_url(url),
        };
        Error {
            inner: Arc::new(inner),
        }
    }

    /// Returns true if the error is from a type Builder.
    pub fn is_builder(&self) -> bool {
        matches!(self.kind(), Kind::Builder)
    }

    /// Returns true if the error is related to establishing a connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.kind(), Kind::Connect | Kind::ConnectTimeout)
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(
            self.kind(),
            Kind::ConnectTimeout | Kind::ReadTimeout | Kind::WriteTimeout | Kind::AcquireTimeout
        ) {
            return true;
        }

        let mut source = self.source();

        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }

            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }

            source = err.source();
        }

        false
    }

    /// Returns true if no data arrived within the read timeout.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self.kind(), Kind::ReadTimeout)
    }

    /// Returns true if the write buffer did not drain within the write timeout.
    pub fn is_write_timeout(&self) -> bool {
        matches!(self.kind(), Kind::WriteTimeout)
    }

    /// Returns true if the pool could not hand out a connection in time.
    pub fn is_acquire_timeout(&self) -> bool {
        matches!(self.kind(), Kind::AcquireTimeout)
    }

    /// Returns true if the peer already signalled end-of-stream.
    pub fn is_eof(&self) -> bool {
        matches!(self.kind(), Kind::Eof)
    }

    /// Returns true if the connection is gone, with or without an I/O cause.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self.kind(), Kind::ConnectionLost)
    }

    /// Returns true if the connection was closing when the operation started.
    pub fn is_closing(&self) -> bool {
        matches!(self.kind(), Kind::ConnectionClosing)
    }

    /// Returns true if we tried to send something the protocol does not allow.
    pub fn is_local_protocol(&self) -> bool {
        matches!(self.kind(), Kind::LocalProtocol)
    }

    /// Returns true if the peer violated the protocol.
    pub fn is_remote_protocol(&self) -> bool {
        matches!(self.kind(), Kind::RemoteProtocol)
    }

    /// Returns true if a WebSocket handshake was answered with something
    /// other than `101 Switching Protocols`.
    pub fn is_handshake(&self) -> bool {
        matches!(self.kind(), Kind::Handshake(_))
    }

    /// Returns true if an API was called in a state that does not allow it.
    pub fn is_misuse(&self) -> bool {
        matches!(self.kind(), Kind::Misuse)
    }

    /// Returns true if the error is related to the request body
    pub fn is_body(&self) -> bool {
        matches!(self.kind(), Kind::Body)
    }

    /// Returns true if the error came from an authentication strategy.
    pub fn is_auth(&self) -> bool {
        matches!(self.kind(), Kind::Auth)
    }

    /// Returns true if the error is related to a connection reset.
    pub fn is_connection_reset(&self) -> bool {
        let mut source = self.source();

        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::ConnectionReset {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns the status code, if the error was generated from a failed
    /// WebSocket handshake.
    pub fn status(&self) -> Option<StatusCode> {
        match self.kind() {
            Kind::Handshake(code) => Some(*code),
            _ => None,
        }
    }

    fn kind(&self) -> &Kind {
        match (&self.inner.kind, &self.inner.source) {
            (Kind::Wrapped, Some(source)) => match source.downcast_ref::<Error>() {
                Some(err) => err.kind(),
                None => &self.inner.kind,
            },
            (kind, _) => kind,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("tether::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Connect => f.write_str("error trying to connect")?,
            Kind::ConnectTimeout => f.write_str("connect timed out")?,
            Kind::ReadTimeout => f.write_str("read timed out")?,
            Kind::WriteTimeout => f.write_str("write timed out")?,
            Kind::AcquireTimeout => f.write_str("timed out acquiring a pooled connection")?,
            Kind::Eof => f.write_str("connection is at EOF")?,
            Kind::ConnectionLost => f.write_str("connection lost")?,
            Kind::ConnectionClosing => f.write_str("connection is closing")?,
            Kind::LocalProtocol => f.write_str("local protocol error")?,
            Kind::RemoteProtocol => f.write_str("remote protocol error")?,
            Kind::Handshake(ref code) => write!(f, "invalid websocket handshake ({code})")?,
            Kind::Misuse => f.write_str("invalid use of connection")?,
            Kind::Body => f.write_str("request body error")?,
            Kind::Auth => f.write_str("authentication error")?,
            Kind::Wrapped => f.write_str("error")?,
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({})", url.as_str())?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Connect,
    ConnectTimeout,
    ReadTimeout,
    WriteTimeout,
    AcquireTimeout,
    Eof,
    ConnectionLost,
    ConnectionClosing,
    LocalProtocol,
    RemoteProtocol,
    Handshake(StatusCode),
    Misuse,
    Body,
    Auth,
    Wrapped,
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl StdError for BadScheme {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::ConnectionLost, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::body(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn is_timeout() {
        let err = Error::read_timeout();
        assert!(err.is_timeout());
        assert!(err.is_read_timeout());

        let io = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let nested = Error::connect(io);
        assert!(nested.is_timeout());
        assert!(nested.is_connect());
    }

    #[test]
    fn clones_share_the_recorded_error() {
        let err = Error::connection_lost_with(io::Error::from(io::ErrorKind::ConnectionReset));
        let replay = err.clone();
        assert!(replay.is_connection_lost());
        assert!(replay.is_connection_reset());
        assert!(Arc::ptr_eq(&err.inner, &replay.inner));
    }

    #[test]
    fn with_url_on_shared_error_keeps_kind() {
        let err = Error::closing();
        let _held = err.clone();
        let url = Url::parse("http://example.com/").unwrap();
        let err = err.with_url(url);
        assert!(err.is_closing());
        assert_eq!(err.url().map(Url::as_str), Some("http://example.com/"));
    }

    #[test]
    fn handshake_status() {
        let err = Error::handshake(StatusCode::FORBIDDEN);
        assert!(err.is_handshake());
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
    }
}
