//! TLS configuration
//!
//! Secure origins (`https`, `wss`) are connected through a [`TlsConnector`].
//! When none is supplied a standard context is built from the bundled
//! `webpki-roots` trust anchors.

use std::{fmt, io, sync::Arc};

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pub use rustls;

use crate::Error;

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// A TLS context used to wrap TCP connections to secure origins.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Wrap a custom rustls client configuration.
    ///
    /// `http/1.1` is advertised over ALPN when the configuration does not
    /// list any protocol.
    pub fn new(mut config: rustls::ClientConfig) -> TlsConnector {
        if config.alpn_protocols.is_empty() {
            config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        }
        TlsConnector {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        }
    }

    pub(crate) async fn connect(&self, host: &str, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let server_name = rustls::ServerName::try_from(host)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.inner.connect(server_name, tcp).await
    }
}

impl Default for TlsConnector {
    fn default() -> Self {
        TlsConnector::new(default_config())
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

fn default_config() -> rustls::ClientConfig {
    #[allow(unused_mut)]
    let mut roots = rustls::RootCertStore::empty();

    #[cfg(feature = "webpki-roots")]
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Apply the scheme policy: secure origins always get a context, insecure
/// ones must not be given one.
pub(crate) fn for_origin(
    origin: &crate::Origin,
    tls: Option<TlsConnector>,
) -> crate::Result<Option<TlsConnector>> {
    match (origin.is_secure(), tls) {
        (true, Some(tls)) => Ok(Some(tls)),
        (true, None) => Ok(Some(TlsConnector::default())),
        (false, None) => Ok(None),
        (false, Some(_)) => Err(Error::builder(format!(
            "TLS connector supplied for insecure origin {origin}"
        ))),
    }
}

/// A peer that closes the socket around its close_notify is finishing the
/// stream, not failing it.
pub(crate) fn is_benign_close(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return true;
    }
    matches!(
        err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()),
        Some(rustls::Error::AlertReceived(rustls::AlertDescription::CloseNotify))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Origin;

    #[test]
    fn secure_origin_gets_default_context() {
        let origin = Origin::parse("https://example.com").unwrap();
        assert!(for_origin(&origin, None).unwrap().is_some());
    }

    #[test]
    fn insecure_origin_rejects_context() {
        let origin = Origin::parse("http://example.com").unwrap();
        let err = for_origin(&origin, Some(TlsConnector::default())).unwrap_err();
        assert!(err.is_builder());
        assert!(for_origin(&origin, None).unwrap().is_none());
    }

    #[test]
    fn close_notify_is_benign() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::CloseNotify),
        );
        assert!(is_benign_close(&err));
        assert!(is_benign_close(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_benign_close(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
