//! Origins: the `(scheme, host, port)` triple a connection is bound to.

use std::fmt;

use url::Url;

use crate::{error::BadScheme, Error, IntoUrl};

/// The URL schemes a connection can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// Plaintext WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl Scheme {
    /// Whether this scheme runs over TLS.
    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    /// The port used when a URL does not name one.
    pub fn default_port(self) -> u16 {
        if self.is_secure() {
            443
        } else {
            80
        }
    }

    /// The scheme as it appears in a URL.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    fn parse(s: &str) -> Option<Scheme> {
        match s {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(scheme, host, port)` triple. Two origins are equal only if all three
/// parts are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Origin {
    /// Create an origin from its parts.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Origin {
        Origin {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse the origin of a URL.
    ///
    /// # Errors
    ///
    /// Fails if the URL has no host or uses a scheme other than `http`,
    /// `https`, `ws` or `wss`.
    pub fn parse<U: IntoUrl>(url: U) -> crate::Result<Origin> {
        Origin::from_url(&url.into_url()?)
    }

    pub(crate) fn from_url(url: &Url) -> crate::Result<Origin> {
        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| Error::builder(BadScheme).with_url(url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::builder(BadScheme).with_url(url.clone()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Ok(Origin::new(scheme, host, port))
    }

    /// The scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The host, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, defaulted from the scheme if the URL had none.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections to this origin run over TLS.
    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    /// The value of a `Host` header for this origin.
    pub(crate) fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        let origin = Origin::parse("https://example.com/a/b").unwrap();
        assert_eq!(origin, Origin::new(Scheme::Https, "example.com", 443));
        assert!(origin.is_secure());

        let origin = Origin::parse("ws://example.com").unwrap();
        assert_eq!(origin.port(), 80);
        assert!(!origin.is_secure());
    }

    #[test]
    fn equality_needs_all_three_parts() {
        let a = Origin::parse("http://example.com:8080/").unwrap();
        let b = Origin::parse("http://example.com:8080/other?q=1").unwrap();
        let c = Origin::parse("https://example.com:8080/").unwrap();
        let d = Origin::parse("http://example.org:8080/").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn authority_omits_default_port() {
        let origin = Origin::parse("http://example.com:80").unwrap();
        assert_eq!(origin.authority(), "example.com");
        let origin = Origin::parse("http://[::1]:8080").unwrap();
        assert_eq!(origin.host(), "::1");
        assert_eq!(origin.authority(), "[::1]:8080");
        assert_eq!(origin.to_string(), "http://[::1]:8080");
    }
}
