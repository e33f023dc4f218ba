use std::{fmt, pin::Pin};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::TryStreamExt;
use sync_wrapper::SyncStream;

use crate::error::BoxError;

type BoxStream = SyncStream<Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>>;

/// A request body.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Reusable(Bytes),
    Streaming { stream: BoxStream, pending: Bytes },
}

// ===== impl Body =====

impl Body {
    /// An empty body. Sent with `Content-Length: 0`.
    pub fn empty() -> Body {
        Body::reusable(Bytes::new())
    }

    /// Returns a reference to the internal data of the `Body`.
    ///
    /// `None` is returned, if the underlying data is a stream.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.as_ref()),
            Inner::Streaming { .. } => None,
        }
    }

    /// Wrap a futures `Stream` in a box inside `Body`.
    ///
    /// Streamed bodies are sent with `Transfer-Encoding: chunked` unless the
    /// request sets its own `Content-Length`.
    ///
    /// # Example
    ///
    /// ```
    /// # use tether::Body;
    /// # use futures_util;
    /// # fn main() {
    /// let chunks: Vec<Result<_, ::std::io::Error>> = vec![Ok("hello"), Ok(" "), Ok("world")];
    ///
    /// let stream = futures_util::stream::iter(chunks);
    ///
    /// let body = Body::wrap_stream(stream);
    /// # }
    /// ```
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: futures_util::stream::TryStream + Send + 'static,
        S::Error: Into<BoxError>,
        Bytes: From<S::Ok>,
    {
        Body {
            inner: Inner::Streaming {
                stream: SyncStream::new(Box::pin(
                    stream.map_ok(Bytes::from).map_err(Into::into),
                )),
                pending: Bytes::new(),
            },
        }
    }

    #[inline]
    pub(crate) fn reusable(chunk: Bytes) -> Body {
        Body {
            inner: Inner::Reusable(chunk),
        }
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        match self.inner {
            Inner::Reusable(ref bytes) => Some(bytes.len() as u64),
            Inner::Streaming { .. } => None,
        }
    }

    pub(crate) fn try_clone(&self) -> Option<Body> {
        match self.inner {
            Inner::Reusable(ref chunk) => Some(Body::reusable(chunk.clone())),
            Inner::Streaming { .. } => None,
        }
    }

    /// Pull the next piece of the body, at most `chunk_size` bytes long.
    pub(crate) async fn next_chunk(&mut self, chunk_size: usize) -> Option<Result<Bytes, BoxError>> {
        match self.inner {
            Inner::Reusable(ref mut bytes) => {
                if bytes.is_empty() {
                    return None;
                }
                let n = chunk_size.min(bytes.len());
                Some(Ok(bytes.split_to(n)))
            }
            Inner::Streaming {
                ref mut stream,
                ref mut pending,
            } => {
                while pending.is_empty() {
                    match stream.try_next().await {
                        Ok(Some(bytes)) => *pending = bytes,
                        Ok(None) => return None,
                        Err(e) => return Some(Err(e)),
                    }
                }
                let n = chunk_size.min(pending.len());
                Some(Ok(pending.split_to(n)))
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner {
            Inner::Reusable(ref bytes) => f.debug_tuple("Body").field(bytes).finish(),
            Inner::Streaming { .. } => f.debug_tuple("Body").field(&"streaming").finish(),
        }
    }
}

impl Default for Body {
    #[inline]
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(bytes: Bytes) -> Body {
        Body::reusable(bytes)
    }
}

impl From<Vec<u8>> for Body {
    #[inline]
    fn from(vec: Vec<u8>) -> Body {
        Body::reusable(vec.into())
    }
}

impl From<&'static [u8]> for Body {
    #[inline]
    fn from(s: &'static [u8]) -> Body {
        Body::reusable(Bytes::from_static(s))
    }
}

impl From<String> for Body {
    #[inline]
    fn from(s: String) -> Body {
        Body::reusable(s.into())
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(s: &'static str) -> Body {
        s.as_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_bytes() {
        let test_data = b"Test body";
        let body = Body::from(&test_data[..]);
        assert_eq!(body.as_bytes(), Some(&test_data[..]));
        assert_eq!(body.content_length(), Some(9));
    }

    #[test]
    fn streams_are_not_cloneable() {
        let body = Body::wrap_stream(futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
            "a",
        )]));
        assert!(body.try_clone().is_none());
        assert!(body.as_bytes().is_none());
        assert_eq!(body.content_length(), None);
    }

    #[test]
    fn streamed_body_is_sync() {
        fn assert_sync<T: Sync>(_: &T) {}

        let body = Body::wrap_stream(futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
            "a",
        )]));
        assert_sync(&body);
    }

    #[tokio::test]
    async fn reusable_body_is_sliced() {
        let mut body = Body::from("abcdefg");
        let mut chunks = Vec::new();
        while let Some(chunk) = body.next_chunk(3).await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks, vec!["abc", "def", "g"]);
    }

    #[tokio::test]
    async fn stream_items_are_sliced() {
        let items: Vec<Result<&'static str, std::io::Error>> = vec![Ok("hello"), Ok(""), Ok("!")];
        let mut body = Body::wrap_stream(futures_util::stream::iter(items));
        let mut chunks = Vec::new();
        while let Some(chunk) = body.next_chunk(2).await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks, vec!["he", "ll", "o", "!"]);
    }
}
