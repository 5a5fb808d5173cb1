//! AMQP 0-9-1 framing for amqprims.
//!
//! Every unit on the wire is a frame:
//! - A 1-byte frame type (method, content header, content body, heartbeat)
//! - A 2-byte big-endian channel id, 0 being the connection itself
//! - A 4-byte big-endian payload size, the payload, and a `0xCE` end octet
//!
//! Method payloads are marshalled through a static registry of method
//! descriptors, so the codec never needs per-method code.

pub mod codec;
pub mod error;
pub mod method;
pub mod properties;
pub mod types;

pub use codec::{
    body_chunks, decode_frame, encode_frame, AmqpCodec, Frame, FramePayload, FrameType,
    FRAME_END, FRAME_MIN_SIZE, FRAME_OVERHEAD, HEADER_SIZE, PROTOCOL_HEADER,
};
pub use error::{FrameError, Result};
pub use method::{lookup, Arg, FieldKind, FieldSpec, Method, MethodDescriptor, MethodId};
pub use properties::{BasicProperties, ContentHeader, PERSISTENT};
pub use types::{FieldTable, FieldValue};
