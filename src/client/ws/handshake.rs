//! The HTTP/1.1 upgrade handshake that opens a WebSocket session.

use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, StatusCode,
};
use tungstenite::handshake::{client::generate_key, derive_accept_key};

use crate::{
    client::{http1::codec::connection_has, request::Request, response::Response},
    Error,
};

/// What the server agreed to during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub(crate) subprotocol: Option<String>,
    pub(crate) extensions: Vec<String>,
}

/// Add the upgrade headers to `request` and return the key sent with it.
pub(crate) fn prepare(request: &mut Request) -> String {
    let key = generate_key();
    let headers = request.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        header::SEC_WEBSOCKET_VERSION,
        HeaderValue::from_static("13"),
    );
    // generate_key yields base64, which is always a valid header value.
    if let Ok(value) = HeaderValue::from_str(&key) {
        headers.insert(header::SEC_WEBSOCKET_KEY, value);
    }
    key
}

/// Check the server's answer to an upgrade request.
///
/// `offered` are the headers the request was sent with; any subprotocol or
/// extension the server selects must have been offered there.
pub(crate) fn validate(
    offered: &HeaderMap,
    key: &str,
    response: &Response,
) -> crate::Result<Negotiated> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::handshake(response.status()));
    }

    let headers = response.headers();
    if !connection_has(headers, "upgrade") {
        return Err(Error::remote_protocol("missing connection upgrade header"));
    }
    if !header_eq(headers, header::UPGRADE, "websocket") {
        return Err(Error::remote_protocol("invalid upgrade header"));
    }

    match headers.get(header::SEC_WEBSOCKET_ACCEPT) {
        Some(accept) => {
            if accept.as_bytes() != derive_accept_key(key.as_bytes()).as_bytes() {
                return Err(Error::remote_protocol(format!(
                    "invalid accept key: {accept:?}"
                )));
            }
        }
        None => return Err(Error::remote_protocol("missing accept key")),
    }

    let subprotocol = match headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
        Some(value) => {
            let protocol = value
                .to_str()
                .map_err(|_| Error::remote_protocol("invalid subprotocol header"))?
                .trim();
            if !tokens(offered, header::SEC_WEBSOCKET_PROTOCOL).any(|p| p == protocol) {
                return Err(Error::remote_protocol(format!(
                    "server selected a subprotocol that was not offered: {protocol}"
                )));
            }
            Some(protocol.to_owned())
        }
        None => None,
    };

    let mut extensions = Vec::new();
    for extension in tokens(headers, header::SEC_WEBSOCKET_EXTENSIONS) {
        let name = extension.split(';').next().unwrap_or_default().trim();
        let was_offered = tokens(offered, header::SEC_WEBSOCKET_EXTENSIONS)
            .any(|o| o.split(';').next().unwrap_or_default().trim() == name);
        if !was_offered {
            return Err(Error::remote_protocol(format!(
                "server selected an extension that was not offered: {name}"
            )));
        }
        extensions.push(extension.to_owned());
    }

    Ok(Negotiated {
        subprotocol,
        extensions,
    })
}

/// Comma separated values across every occurrence of `name`.
fn tokens(headers: &HeaderMap, name: HeaderName) -> impl Iterator<Item = &str> {
    headers
        .get_all(name)
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn header_eq(headers: &HeaderMap, key: HeaderName, value: &'static str) -> bool {
    headers
        .get(&key)
        .map_or(false, |header| {
            header.as_bytes().eq_ignore_ascii_case(value.as_bytes())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_sets_upgrade_headers() {
        let mut request = Request::get("ws://example.com/chat").build().unwrap();
        let key = prepare(&mut request);
        let headers = request.headers();
        assert_eq!(headers[header::UPGRADE], "websocket");
        assert_eq!(headers[header::CONNECTION], "Upgrade");
        assert_eq!(headers[header::SEC_WEBSOCKET_VERSION], "13");
        assert_eq!(headers[header::SEC_WEBSOCKET_KEY], key.as_str());
    }

    #[test]
    fn tokens_span_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("chat, superchat"),
        );
        headers.append(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("v2"),
        );
        let all: Vec<_> = tokens(&headers, header::SEC_WEBSOCKET_PROTOCOL).collect();
        assert_eq!(all, ["chat", "superchat", "v2"]);
    }

    #[test]
    fn header_eq_ignores_case() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(header_eq(&headers, header::UPGRADE, "websocket"));
        assert!(!header_eq(&headers, header::CONNECTION, "websocket"));
    }
}
