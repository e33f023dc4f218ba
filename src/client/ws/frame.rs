//! WebSocket frame parsing and serialization on top of tungstenite's frame
//! types. Only the client role is supported: outgoing frames are masked and
//! incoming frames must not be.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use log::trace;
use tungstenite::protocol::frame::{
    coding::{CloseCode, Control, Data, OpCode},
    CloseFrame, Frame, FrameHeader,
};

use crate::Error;

const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Incremental frame decoder.
#[derive(Debug)]
pub(crate) struct FrameCodec {
    buf: BytesMut,
    header: Option<(FrameHeader, u64)>,
    max_frame_size: usize,
}

impl FrameCodec {
    pub(crate) fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec {
            buf: BytesMut::new(),
            header: None,
            max_frame_size,
        }
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The next complete frame, or `None` if more bytes are needed.
    pub(crate) fn next_frame(&mut self) -> crate::Result<Option<Frame>> {
        if self.header.is_none() {
            let mut cursor = Cursor::new(&self.buf[..]);
            let Some((header, len)) =
                FrameHeader::parse(&mut cursor).map_err(Error::remote_protocol)?
            else {
                return Ok(None);
            };
            let consumed = cursor.position() as usize;
            self.check_header(&header, len)?;
            self.buf.advance(consumed);
            self.header = Some((header, len));
        }

        let len = match self.header {
            Some((_, len)) => len as usize,
            None => return Ok(None),
        };
        if self.buf.len() < len {
            return Ok(None);
        }
        let Some((header, _)) = self.header.take() else {
            return Ok(None);
        };
        let payload = self.buf.split_to(len).to_vec();
        trace!("received {} frame of {} bytes", header.opcode, len);
        Ok(Some(Frame::from_payload(header, payload)))
    }

    fn check_header(&self, header: &FrameHeader, len: u64) -> crate::Result<()> {
        if header.mask.is_some() {
            return Err(Error::remote_protocol("server sent a masked frame"));
        }
        if header.rsv1 || header.rsv2 || header.rsv3 {
            return Err(Error::remote_protocol(
                "reserved bits set without a negotiated extension",
            ));
        }
        match header.opcode {
            OpCode::Data(Data::Reserved(op)) | OpCode::Control(Control::Reserved(op)) => {
                return Err(Error::remote_protocol(format!("reserved opcode {op}")));
            }
            OpCode::Control(_) => {
                if !header.is_final {
                    return Err(Error::remote_protocol("fragmented control frame"));
                }
                if len > MAX_CONTROL_PAYLOAD {
                    return Err(Error::remote_protocol("control frame payload too large"));
                }
            }
            OpCode::Data(_) => {}
        }
        if len > self.max_frame_size as u64 {
            return Err(Error::remote_protocol(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

/// Mask and serialize a frame for sending.
pub(crate) fn encode(mut frame: Frame) -> crate::Result<Vec<u8>> {
    frame.header_mut().mask = Some(rand::random());
    let mut out = Vec::with_capacity(frame.len());
    frame.format(&mut out).map_err(Error::local_protocol)?;
    Ok(out)
}

/// Decode the payload of a server close frame. `None` means the frame
/// carried no status code.
pub(crate) fn parse_close(payload: &[u8]) -> crate::Result<Option<CloseFrame<'static>>> {
    match payload {
        [] => Ok(None),
        [_] => Err(Error::remote_protocol("close frame payload of one byte")),
        [hi, lo, reason @ ..] => {
            let code = CloseCode::from(u16::from_be_bytes([*hi, *lo]));
            let reason = std::str::from_utf8(reason)
                .map_err(|_| Error::remote_protocol("close reason is not valid UTF-8"))?;
            Ok(Some(CloseFrame {
                code,
                reason: reason.to_owned().into(),
            }))
        }
    }
}
