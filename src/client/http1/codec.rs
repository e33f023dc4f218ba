//! Sans-I/O HTTP/1.1 client protocol state.
//!
//! [`ClientCodec`] turns request parts into wire bytes and received bytes
//! into [`Event`]s. It never touches a socket; the connection feeds it with
//! [`ClientCodec::receive_data`] and writes whatever it returns.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Version,
};
use log::{debug, trace};

use crate::Error;

pub(crate) const MAX_HEADERS: usize = 100;
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 4096;

/// Where one side of the exchange is in the request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    SendBody,
    Done,
    MustClose,
    SwitchedProtocol,
}

/// Status line and headers of a response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug)]
pub(crate) enum Event {
    Response(ResponseHead),
    Data(Bytes),
    EndOfMessage,
    /// The server's message is complete; nothing more is read until the next
    /// cycle starts.
    Paused,
    NeedData,
}

impl Event {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Event::Response(..) => "Response",
            Event::Data(..) => "Data",
            Event::EndOfMessage => "EndOfMessage",
            Event::Paused => "Paused",
            Event::NeedData => "NeedData",
        }
    }
}

#[derive(Debug)]
enum Encoder {
    Length(u64),
    Chunked,
}

#[derive(Debug)]
enum Decoder {
    Length(u64),
    Chunked(ChunkedState),
    Eof,
}

#[derive(Debug, Clone, Copy)]
enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

enum Chunk {
    Data(Bytes),
    End,
    NeedData,
}

#[derive(Debug)]
pub(crate) struct ClientCodec {
    our_state: State,
    their_state: State,
    method: Option<Method>,
    wants_upgrade: bool,
    keep_alive: bool,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
    buf: BytesMut,
    eof: bool,
}

impl ClientCodec {
    pub(crate) fn new() -> ClientCodec {
        ClientCodec {
            our_state: State::Idle,
            their_state: State::Idle,
            method: None,
            wants_upgrade: false,
            keep_alive: true,
            encoder: None,
            decoder: None,
            buf: BytesMut::new(),
            eof: false,
        }
    }

    pub(crate) fn our_state(&self) -> State {
        self.our_state
    }

    pub(crate) fn their_state(&self) -> State {
        self.their_state
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.our_state == State::Idle && self.their_state == State::Idle
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.our_state == State::Done && self.their_state == State::Done
    }

    pub(crate) fn must_close(&self) -> bool {
        self.our_state == State::MustClose || self.their_state == State::MustClose
    }

    /// Reset both sides to `Idle` after a complete keep-alive exchange.
    /// Bytes the server sent past the end of the last response are kept.
    pub(crate) fn start_next_cycle(&mut self) -> crate::Result<()> {
        if !self.is_reusable() {
            return Err(Error::local_protocol(format!(
                "not in a reusable state: ours {:?}, theirs {:?}",
                self.our_state, self.their_state
            )));
        }
        self.our_state = State::Idle;
        self.their_state = State::Idle;
        self.method = None;
        self.wants_upgrade = false;
        self.keep_alive = true;
        self.encoder = None;
        self.decoder = None;
        Ok(())
    }

    /// Serialize a request head. Framing is taken from the headers:
    /// `Transfer-Encoding: chunked`, then `Content-Length`, otherwise the
    /// request has no body.
    pub(crate) fn send_request(
        &mut self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
    ) -> crate::Result<Bytes> {
        if self.our_state != State::Idle {
            return Err(Error::local_protocol(format!(
                "cannot send a request in state {:?}",
                self.our_state
            )));
        }

        let encoder = if let Some(te) = headers.get_all(header::TRANSFER_ENCODING).iter().last() {
            if !is_chunked(te) {
                return Err(Error::local_protocol(
                    "transfer-encoding must end in chunked",
                ));
            }
            Encoder::Chunked
        } else if headers.contains_key(header::CONTENT_LENGTH) {
            let len = content_length_parse_all(headers)
                .ok_or_else(|| Error::local_protocol("invalid Content-Length header"))?;
            Encoder::Length(len)
        } else {
            Encoder::Length(0)
        };

        if connection_has(headers, "close") {
            self.keep_alive = false;
        }
        self.wants_upgrade = headers.contains_key(header::UPGRADE);
        self.method = Some(method.clone());
        self.encoder = Some(encoder);

        let mut dst = BytesMut::with_capacity(128 + headers.len() * 32);
        dst.put_slice(method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(target.as_bytes());
        dst.put_slice(b" HTTP/1.1\r\n");
        write_headers(headers, &mut dst);
        dst.put_slice(b"\r\n");

        self.our_state = State::SendBody;
        Ok(dst.freeze())
    }

    /// Frame a piece of the request body.
    pub(crate) fn send_data(&mut self, data: &[u8]) -> crate::Result<Bytes> {
        if self.our_state != State::SendBody {
            return Err(Error::local_protocol(format!(
                "cannot send data in state {:?}",
                self.our_state
            )));
        }
        match self.encoder {
            Some(Encoder::Length(ref mut remaining)) => {
                if data.len() as u64 > *remaining {
                    return Err(Error::local_protocol(
                        "too much data for declared Content-Length",
                    ));
                }
                *remaining -= data.len() as u64;
                Ok(Bytes::copy_from_slice(data))
            }
            Some(Encoder::Chunked) => {
                if data.is_empty() {
                    return Ok(Bytes::new());
                }
                let size = format!("{:X}\r\n", data.len());
                let mut dst = BytesMut::with_capacity(size.len() + data.len() + 2);
                dst.put_slice(size.as_bytes());
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
                Ok(dst.freeze())
            }
            None => Err(Error::local_protocol("no request body in progress")),
        }
    }

    /// Finish the request body.
    pub(crate) fn send_end_of_message(&mut self) -> crate::Result<Bytes> {
        if self.our_state != State::SendBody {
            return Err(Error::local_protocol(format!(
                "cannot end a message in state {:?}",
                self.our_state
            )));
        }
        let tail = match self.encoder.take() {
            Some(Encoder::Length(0)) | None => Bytes::new(),
            Some(Encoder::Length(n)) => {
                return Err(Error::local_protocol(format!(
                    "too little data for declared Content-Length, {n} bytes missing"
                )))
            }
            Some(Encoder::Chunked) => Bytes::from_static(b"0\r\n\r\n"),
        };
        self.our_state = self.done_state();
        Ok(tail)
    }

    pub(crate) fn receive_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Record that the server will send nothing more.
    pub(crate) fn receive_eof(&mut self) {
        self.eof = true;
    }

    /// Bytes received beyond the last parsed event. After a protocol switch
    /// these belong to the new protocol.
    pub(crate) fn take_trailing(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub(crate) fn next_event(&mut self) -> crate::Result<Event> {
        match self.their_state {
            State::Idle => self.read_head(),
            State::SendBody => self.read_body(),
            State::Done | State::MustClose | State::SwitchedProtocol => Ok(Event::Paused),
        }
    }

    fn read_head(&mut self) -> crate::Result<Event> {
        loop {
            if self.buf.is_empty() && self.eof {
                return Err(Error::remote_protocol(
                    "server closed the connection without sending a response",
                ));
            }
            let Some((head, len)) = parse_head(&self.buf)? else {
                if self.buf.len() > MAX_HEAD_SIZE {
                    return Err(Error::remote_protocol("response head too large"));
                }
                if self.eof {
                    return Err(Error::remote_protocol(
                        "connection closed in the middle of a response head",
                    ));
                }
                return Ok(Event::NeedData);
            };
            self.buf.advance(len);

            match head.status.as_u16() {
                101 if self.wants_upgrade => {
                    debug!("server switched protocols");
                    self.their_state = State::SwitchedProtocol;
                    self.our_state = State::SwitchedProtocol;
                    self.encoder = None;
                    return Ok(Event::Response(head));
                }
                101 => {
                    return Err(Error::remote_protocol(
                        "101 Switching Protocols without an upgrade request",
                    ))
                }
                100..=199 => {
                    trace!("ignoring informational response: {}", head.status);
                    continue;
                }
                _ => {}
            }

            if !response_keeps_alive(&head) {
                self.keep_alive = false;
            }
            self.decoder = Some(self.decoder_for(&head)?);
            self.their_state = State::SendBody;
            if !self.keep_alive && self.our_state == State::Done {
                self.our_state = State::MustClose;
            }
            return Ok(Event::Response(head));
        }
    }

    fn decoder_for(&mut self, head: &ResponseHead) -> crate::Result<Decoder> {
        // https://tools.ietf.org/html/rfc7230#section-3.3.3
        if matches!(head.status.as_u16(), 204 | 304) || self.method == Some(Method::HEAD) {
            return Ok(Decoder::Length(0));
        }

        if let Some(te) = head.headers.get_all(header::TRANSFER_ENCODING).iter().last() {
            if head.version == Version::HTTP_10 {
                return Err(Error::remote_protocol(
                    "HTTP/1.0 cannot have Transfer-Encoding header",
                ));
            }
            if is_chunked(te) {
                return Ok(Decoder::Chunked(ChunkedState::Size));
            }
            trace!("not chunked, read till eof");
            self.keep_alive = false;
            return Ok(Decoder::Eof);
        }

        if head.headers.contains_key(header::CONTENT_LENGTH) {
            return content_length_parse_all(&head.headers)
                .map(Decoder::Length)
                .ok_or_else(|| Error::remote_protocol("illegal Content-Length header"));
        }

        trace!("neither Transfer-Encoding nor Content-Length");
        self.keep_alive = false;
        Ok(Decoder::Eof)
    }

    fn read_body(&mut self) -> crate::Result<Event> {
        let ClientCodec {
            decoder, buf, eof, ..
        } = self;
        let chunk = match decoder {
            Some(Decoder::Length(0)) => Chunk::End,
            Some(Decoder::Length(remaining)) => {
                if buf.is_empty() {
                    if *eof {
                        return Err(Error::remote_protocol(format!(
                            "connection closed with {remaining} bytes of the response body outstanding"
                        )));
                    }
                    Chunk::NeedData
                } else {
                    let n = bounded(*remaining, buf.len());
                    *remaining -= n as u64;
                    Chunk::Data(buf.split_to(n).freeze())
                }
            }
            Some(Decoder::Eof) => {
                if !buf.is_empty() {
                    Chunk::Data(buf.split().freeze())
                } else if *eof {
                    Chunk::End
                } else {
                    Chunk::NeedData
                }
            }
            Some(Decoder::Chunked(state)) => decode_chunked(state, buf, *eof)?,
            None => return Err(Error::local_protocol("no response body in progress")),
        };

        Ok(match chunk {
            Chunk::Data(data) => Event::Data(data),
            Chunk::NeedData => Event::NeedData,
            Chunk::End => {
                self.decoder = None;
                self.their_state = self.done_state();
                if !self.keep_alive && self.our_state == State::Done {
                    self.our_state = State::MustClose;
                }
                Event::EndOfMessage
            }
        })
    }

    fn done_state(&self) -> State {
        if self.keep_alive {
            State::Done
        } else {
            State::MustClose
        }
    }
}

fn decode_chunked(state: &mut ChunkedState, buf: &mut BytesMut, eof: bool) -> crate::Result<Chunk> {
    loop {
        match *state {
            ChunkedState::Size => {
                let Some(line) = take_line(buf) else {
                    return need_more(buf, eof);
                };
                let line = &line[..line.len() - 2];
                let size = line.split(|b| *b == b';').next().unwrap_or_default();
                let size = std::str::from_utf8(size)
                    .ok()
                    .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                    .ok_or_else(|| Error::remote_protocol("invalid chunk size line"))?;
                *state = if size == 0 {
                    ChunkedState::Trailers
                } else {
                    ChunkedState::Data(size)
                };
            }
            ChunkedState::Data(remaining) => {
                if buf.is_empty() {
                    return need_more(buf, eof);
                }
                let n = bounded(remaining, buf.len());
                let remaining = remaining - n as u64;
                *state = if remaining == 0 {
                    ChunkedState::DataEnd
                } else {
                    ChunkedState::Data(remaining)
                };
                return Ok(Chunk::Data(buf.split_to(n).freeze()));
            }
            ChunkedState::DataEnd => {
                if buf.len() < 2 {
                    return need_more(buf, eof);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(Error::remote_protocol("missing chunk terminator"));
                }
                buf.advance(2);
                *state = ChunkedState::Size;
            }
            ChunkedState::Trailers => {
                let Some(line) = take_line(buf) else {
                    return need_more(buf, eof);
                };
                if line.len() == 2 {
                    return Ok(Chunk::End);
                }
                trace!("ignoring trailer field");
            }
        }
    }
}

fn need_more(buf: &BytesMut, eof: bool) -> crate::Result<Chunk> {
    if buf.len() > MAX_CHUNK_LINE {
        return Err(Error::remote_protocol("chunk line too long"));
    }
    if eof {
        return Err(Error::remote_protocol(
            "connection closed in the middle of a chunked body",
        ));
    }
    Ok(Chunk::NeedData)
}

fn take_line(buf: &mut BytesMut) -> Option<BytesMut> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some(buf.split_to(pos + 2))
}

fn bounded(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}

fn parse_head(buf: &[u8]) -> crate::Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Error::remote_protocol(e)),
    };

    let version = if res.version == Some(1) {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };
    let status = StatusCode::from_u16(res.code.unwrap_or_default()).map_err(Error::remote_protocol)?;
    let mut map = HeaderMap::with_capacity(res.headers.len());
    for h in res.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(Error::remote_protocol)?;
        let value = HeaderValue::from_bytes(h.value).map_err(Error::remote_protocol)?;
        map.append(name, value);
    }

    Ok(Some((
        ResponseHead {
            status,
            version,
            headers: map,
        },
        len,
    )))
}

fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_ref());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
}

fn response_keeps_alive(head: &ResponseHead) -> bool {
    if head.version == Version::HTTP_10 {
        connection_has(&head.headers, "keep-alive")
    } else {
        !connection_has(&head.headers, "close")
    }
}

/// Whether the `Connection` header lists `token`.
pub(crate) fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_chunked(value: &HeaderValue) -> bool {
    value
        .to_str()
        .ok()
        .and_then(|s| s.rsplit(',').next())
        .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length_parse_all(headers: &HeaderMap) -> Option<u64> {
    let mut content_length: Option<u64> = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        for part in value.to_str().ok()?.split(',') {
            let n = part.trim().parse::<u64>().ok()?;
            match content_length {
                Some(prev) if prev != n => return None,
                _ => content_length = Some(n),
            }
        }
    }
    content_length
}
