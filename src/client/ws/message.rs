use std::fmt;

use bytes::Bytes;

/// A complete WebSocket data message.
///
/// Fragmented messages are reassembled before they are handed out, and
/// control frames (ping, pong, close) are handled by the session itself.
#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message. Always valid UTF-8.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

impl Message {
    /// Create a new text message.
    pub fn text<S: Into<String>>(text: S) -> Message {
        Message::Text(text.into())
    }

    /// Create a new binary message.
    pub fn binary<B: Into<Bytes>>(data: B) -> Message {
        Message::Binary(data.into())
    }

    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The text of a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    /// The payload as bytes, whatever the message type.
    pub fn as_payload(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    /// Consume the message and return its payload.
    pub fn into_data(self) -> Bytes {
        match self {
            Message::Text(text) => Bytes::from(text),
            Message::Binary(data) => data,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Message {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Message {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Message {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Message {
        Message::Binary(data.into())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Message::Binary(data) => f
                .debug_tuple("Binary")
                .field(&format_args!("{} bytes", data.len()))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_binary() {
        let text = Message::from("hello");
        assert!(text.is_text());
        assert_eq!(text.as_text(), Some("hello"));
        assert_eq!(text.len(), 5);

        let binary = Message::binary(vec![1, 2, 3]);
        assert!(binary.is_binary());
        assert_eq!(binary.as_text(), None);
        assert_eq!(binary.as_payload(), &[1, 2, 3]);
        assert_eq!(binary.into_data(), Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn debug_hides_binary_payload() {
        let msg = Message::binary(vec![0; 1024]);
        assert_eq!(format!("{msg:?}"), "Binary(1024 bytes)");
    }
}
