use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{FrameError, Result};
use crate::method::Method;
use crate::properties::ContentHeader;

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;

/// Every frame ends with this octet.
pub const FRAME_END: u8 = 0xCE;

/// Frame header: type (1) + channel (2) + size (4) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Header plus frame-end octet. A body frame carries at most
/// `frame_max - FRAME_OVERHEAD` bytes of content.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + 1;

/// Smallest frame size a peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Sent by the client before any frame: "AMQP" 0 0 9 1.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Frame type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Method,
    Header,
    Body,
    Heartbeat,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Method => FRAME_METHOD,
            FrameType::Header => FRAME_HEADER,
            FrameType::Body => FRAME_BODY,
            FrameType::Heartbeat => FRAME_HEARTBEAT,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            FRAME_METHOD => Some(FrameType::Method),
            FRAME_HEADER => Some(FrameType::Header),
            FRAME_BODY => Some(FrameType::Body),
            FRAME_HEARTBEAT => Some(FrameType::Heartbeat),
            _ => None,
        }
    }
}

/// Decoded frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Method(Method),
    /// A well-formed method frame whose (class, method) pair is not in the
    /// registry. The arguments are skipped; the frame boundary is intact,
    /// so the receiver decides what to close.
    UnknownMethod { class_id: u16, method_id: u16 },
    Header(ContentHeader),
    Body(Bytes),
    Heartbeat,
}

/// One AMQP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The channel this frame belongs to; 0 is the connection itself.
    pub channel: u16,
    pub payload: FramePayload,
}

impl Frame {
    pub fn method(channel: u16, method: Method) -> Self {
        Self {
            channel,
            payload: FramePayload::Method(method),
        }
    }

    pub fn header(channel: u16, header: ContentHeader) -> Self {
        Self {
            channel,
            payload: FramePayload::Header(header),
        }
    }

    pub fn body(channel: u16, chunk: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: FramePayload::Body(chunk.into()),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            payload: FramePayload::Heartbeat,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self.payload {
            FramePayload::Method(_) | FramePayload::UnknownMethod { .. } => FrameType::Method,
            FramePayload::Header(_) => FrameType::Header,
            FramePayload::Body(_) => FrameType::Body,
            FramePayload::Heartbeat => FrameType::Heartbeat,
        }
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────┬──────────────┬──────────────┬──────────────┬──────────┐
/// │ Type(1B) │ Channel (2B) │ Size (4B BE) │ Payload      │ End (1B) │
/// │          │ BE           │              │ (Size bytes) │ 0xCE     │
/// └──────────┴──────────────┴──────────────┴──────────────┴──────────┘
/// ```
///
/// Returns the total number of bytes written.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<usize> {
    let start = dst.len();
    dst.reserve(FRAME_OVERHEAD);
    dst.put_u8(frame.frame_type().as_u8());
    dst.put_u16(frame.channel);
    let size_at = dst.len();
    dst.put_u32(0);

    match &frame.payload {
        FramePayload::Method(method) => method.encode(dst)?,
        FramePayload::UnknownMethod {
            class_id,
            method_id,
        } => {
            dst.put_u16(*class_id);
            dst.put_u16(*method_id);
        }
        FramePayload::Header(header) => header.encode(dst)?,
        FramePayload::Body(chunk) => dst.put_slice(chunk),
        FramePayload::Heartbeat => {}
    }

    let payload_len = dst.len() - size_at - 4;
    let size = u32::try_from(payload_len).map_err(|_| FrameError::PayloadTooLarge {
        size: payload_len,
        max: u32::MAX as usize,
    })?;
    dst[size_at..size_at + 4].copy_from_slice(&size.to_be_bytes());
    dst.put_u8(FRAME_END);

    Ok(dst.len() - start)
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. A `max_frame_size`
/// of 0 means no limit.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
    // A broker that rejects our protocol version answers with its own
    // protocol header and closes the socket.
    if src.first() == Some(&b'A') {
        if src.len() < PROTOCOL_HEADER.len() {
            return Ok(None);
        }
        if &src[..4] == b"AMQP" {
            return Err(FrameError::UnsupportedProtocol {
                major: src[5],
                minor: src[6],
                revision: src[7],
            });
        }
    }

    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let kind = src[0];
    let channel = u16::from_be_bytes([src[1], src[2]]);
    let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

    let total = size + FRAME_OVERHEAD;
    if max_frame_size > 0 && total > max_frame_size {
        return Err(FrameError::PayloadTooLarge {
            size: total,
            max: max_frame_size,
        });
    }

    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    if src[total - 1] != FRAME_END {
        return Err(FrameError::MalformedFrame(format!(
            "expected frame end 0x{FRAME_END:02X}, got 0x{:02X}",
            src[total - 1]
        )));
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(size).freeze();
    src.advance(1);

    let payload = match FrameType::from_u8(kind) {
        Some(FrameType::Method) => match Method::decode(payload) {
            Ok(method) => FramePayload::Method(method),
            Err(FrameError::UnknownMethod {
                class_id,
                method_id,
            }) => FramePayload::UnknownMethod {
                class_id,
                method_id,
            },
            Err(err) => return Err(err),
        },
        Some(FrameType::Header) => FramePayload::Header(ContentHeader::decode(payload)?),
        Some(FrameType::Body) => FramePayload::Body(payload),
        Some(FrameType::Heartbeat) => FramePayload::Heartbeat,
        None => {
            return Err(FrameError::MalformedFrame(format!(
                "unknown frame type {kind}"
            )))
        }
    };

    Ok(Some(Frame { channel, payload }))
}

/// Split a message body into chunks that fit a body frame under
/// `frame_max`. An empty body yields no chunks; `frame_max` 0 means one
/// chunk.
pub fn body_chunks(body: &Bytes, frame_max: u32) -> impl Iterator<Item = Bytes> + '_ {
    let chunk = if frame_max == 0 {
        body.len().max(1)
    } else {
        (frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1)
    };
    (0..body.len())
        .step_by(chunk)
        .map(move |start| body.slice(start..(start + chunk).min(body.len())))
}

/// `tokio_util` codec for AMQP frames.
///
/// The maximum frame size starts unlimited so the broker's Connection.Start
/// can always be read, and is tightened with [`set_max_frame_size`] once
/// tuning has been negotiated.
///
/// [`set_max_frame_size`]: AmqpCodec::set_max_frame_size
#[derive(Debug, Clone, Default)]
pub struct AmqpCodec {
    max_frame_size: usize,
}

impl AmqpCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }
}

impl Decoder for AmqpCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let frame = decode_frame(src, self.max_frame_size)?;
        if let Some(frame) = &frame {
            trace!(channel = frame.channel, kind = ?frame.frame_type(), "frame in");
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for AmqpCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        let written = encode_frame(&frame, dst)?;
        if self.max_frame_size > 0 && written > self.max_frame_size {
            dst.truncate(start);
            return Err(FrameError::PayloadTooLarge {
                size: written,
                max: self.max_frame_size,
            });
        }
        trace!(channel = frame.channel, kind = ?frame.frame_type(), size = written, "frame out");
        Ok(())
    }
}
