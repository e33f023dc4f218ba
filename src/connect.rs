use std::{
    error::Error as StdError,
    fmt, io,
    net::SocketAddr,
    time::Duration,
};

use futures_util::future::Either;
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{config::TransportConfig, error::BoxError, tls::TlsConnector, Origin};

/// A byte stream a transport can drive: plain TCP or TLS over TCP.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub(crate) type BoxIo = Box<dyn Io>;

/// Resolve the origin, dial it and run the TLS handshake if one is needed.
///
/// `connect_timeout` is applied by the caller to this whole future.
pub(crate) async fn connect(
    origin: &Origin,
    tls: Option<&TlsConnector>,
    config: &TransportConfig,
) -> Result<BoxIo, ConnectError> {
    let addrs = tokio::net::lookup_host((origin.host(), origin.port()))
        .await
        .map_err(ConnectError::dns)?
        .collect::<Vec<_>>();

    let tcp = ConnectingTcp::new(addrs, config).connect().await?;

    if let Err(_e) = tcp.set_nodelay(true) {
        warn!("tcp set_nodelay error: {_e}");
    }

    let Some(tls) = tls else {
        return Ok(Box::new(tcp));
    };

    debug!("starting tls handshake with {}", origin.host());
    let handshake = tls.connect(origin.host(), tcp);
    let stream = match config.tls_handshake_timeout {
        Some(dur) => match tokio::time::timeout(dur, handshake).await {
            Ok(res) => res,
            Err(e) => Err(io::Error::new(io::ErrorKind::TimedOut, e)),
        },
        None => handshake.await,
    }
    .map_err(ConnectError::m("tls handshake error"))?;
    debug!("tls handshake with {} complete", origin.host());

    Ok(Box::new(stream))
}

// Partition addresses by the family of the first one, the way getaddrinfo
// ordered them.
fn split_by_preference(addrs: Vec<SocketAddr>) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
    let preferring_v6 = addrs.first().map(SocketAddr::is_ipv6).unwrap_or(false);
    addrs
        .into_iter()
        .partition::<Vec<_>, _>(|addr| addr.is_ipv6() == preferring_v6)
}

struct ConnectingTcp {
    preferred: ConnectingTcpRemote,
    fallback: Option<ConnectingTcpFallback>,
}

struct ConnectingTcpFallback {
    delay: Duration,
    remote: ConnectingTcpRemote,
}

struct ConnectingTcpRemote {
    addrs: Vec<SocketAddr>,
}

impl ConnectingTcp {
    fn new(addrs: Vec<SocketAddr>, config: &TransportConfig) -> ConnectingTcp {
        match config.happy_eyeballs_delay {
            Some(delay) => {
                let (preferred, fallback) = split_by_preference(addrs);
                let fallback = if fallback.is_empty() {
                    None
                } else {
                    Some(ConnectingTcpFallback {
                        delay,
                        remote: ConnectingTcpRemote { addrs: fallback },
                    })
                };
                ConnectingTcp {
                    preferred: ConnectingTcpRemote { addrs: preferred },
                    fallback,
                }
            }
            None => ConnectingTcp {
                preferred: ConnectingTcpRemote { addrs },
                fallback: None,
            },
        }
    }

    async fn connect(self) -> Result<TcpStream, ConnectError> {
        match self.fallback {
            None => self.preferred.connect().await,
            Some(fallback) => {
                let preferred_fut = self.preferred.connect();
                futures_util::pin_mut!(preferred_fut);

                let fallback_fut = fallback.remote.connect();
                futures_util::pin_mut!(fallback_fut);

                let fallback_delay = tokio::time::sleep(fallback.delay);
                futures_util::pin_mut!(fallback_delay);

                let (result, future) =
                    match futures_util::future::select(preferred_fut, fallback_delay).await {
                        Either::Left((result, _fallback_delay)) => {
                            (result, Either::Right(fallback_fut))
                        }
                        Either::Right(((), preferred_fut)) => {
                            // Delay is done, start polling both the preferred and the fallback
                            futures_util::future::select(preferred_fut, fallback_fut)
                                .await
                                .factor_first()
                        }
                    };

                if result.is_err() {
                    // Fallback to the remaining future (could be preferred or fallback)
                    // if we get an error
                    future.await
                } else {
                    result
                }
            }
        }
    }
}

impl ConnectingTcpRemote {
    async fn connect(self) -> Result<TcpStream, ConnectError> {
        let mut err = None;
        for addr in self.addrs {
            debug!("connecting to {}", addr);
            match TcpStream::connect(addr).await {
                Ok(tcp) => {
                    debug!("connected to {}", addr);
                    return Ok(tcp);
                }
                Err(e) => {
                    let mut e = ConnectError::new("tcp connect error", e);
                    e.addr = Some(addr);
                    // Only return the first error; assume it's the most relevant.
                    if err.is_none() {
                        err = Some(e);
                    }
                }
            }
        }

        match err {
            Some(e) => Err(e),
            None => Err(ConnectError::new(
                "tcp connect error",
                io::Error::new(io::ErrorKind::NotConnected, "Network unreachable"),
            )),
        }
    }
}

/// Why dialing an origin failed.
pub(crate) struct ConnectError {
    msg: &'static str,
    addr: Option<SocketAddr>,
    cause: Option<BoxError>,
}

impl ConnectError {
    fn new<E>(msg: &'static str, cause: E) -> ConnectError
    where
        E: Into<BoxError>,
    {
        ConnectError {
            msg,
            addr: None,
            cause: Some(cause.into()),
        }
    }

    fn dns<E>(cause: E) -> ConnectError
    where
        E: Into<BoxError>,
    {
        ConnectError::new("dns error", cause)
    }

    fn m<E>(msg: &'static str) -> impl FnOnce(E) -> ConnectError
    where
        E: Into<BoxError>,
    {
        move |cause| ConnectError::new(msg, cause)
    }
}

impl fmt::Debug for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut b = f.debug_tuple("ConnectError");
        b.field(&self.msg);
        if let Some(ref addr) = self.addr {
            b.field(addr);
        }
        if let Some(ref cause) = self.cause {
            b.field(cause);
        }
        b.finish()
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.msg)?;
        if let Some(ref addr) = self.addr {
            write!(f, " ({addr})")?;
        }
        Ok(())
    }
}

impl StdError for ConnectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| &**e as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_prefers_family_of_first_address() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        let v4b: SocketAddr = "10.0.0.1:80".parse().unwrap();

        let (preferred, fallback) = split_by_preference(vec![v6, v4, v4b]);
        assert_eq!(preferred, vec![v6]);
        assert_eq!(fallback, vec![v4, v4b]);

        let (preferred, fallback) = split_by_preference(vec![v4, v6]);
        assert_eq!(preferred, vec![v4]);
        assert_eq!(fallback, vec![v6]);
    }

    #[tokio::test]
    async fn refused_connection_reports_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let origin = Origin::new(crate::Scheme::Http, "127.0.0.1", addr.port());
        let err = connect(&origin, None, &TransportConfig::default())
            .await
            .err()
            .expect("connect should fail");
        assert_eq!(err.addr, Some(addr));
    }

    #[tokio::test]
    async fn connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = Origin::new(crate::Scheme::Http, "127.0.0.1", addr.port());
        let config = TransportConfig::default();
        let (dial, accept) = tokio::join!(
            connect(&origin, None, &config),
            listener.accept()
        );
        assert!(dial.is_ok());
        assert!(accept.is_ok());
    }
}
