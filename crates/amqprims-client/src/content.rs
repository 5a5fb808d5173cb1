//! Content reassembly and splitting.
//!
//! A content-bearing method (Basic.Deliver, Basic.Return, Basic.GetOk) is
//! followed on the same channel by one header frame and zero or more body
//! frames. [`ContentAssembler`] accumulates them into one [`Message`].

use amqprims_frame::{body_chunks, BasicProperties, ContentHeader, Method};
use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// A fully reassembled message together with the method that introduced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub method: Method,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Result of feeding a frame to the assembler.
#[derive(Debug)]
pub enum Feed {
    Incomplete,
    Complete(Message),
}

struct PendingDelivery {
    method: Method,
    expected: Option<u64>,
    properties: BasicProperties,
    body: BytesMut,
}

/// Per-channel reassembly buffer. At most one delivery is in progress.
#[derive(Default)]
pub struct ContentAssembler {
    current: Option<PendingDelivery>,
}

impl ContentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Begin a delivery announced by a content-bearing method.
    pub fn start(&mut self, method: Method) -> Result<()> {
        if let Some(current) = &self.current {
            return Err(Error::ProtocolViolation(format!(
                "{} received while content for {} is incomplete",
                method.name(),
                current.method.name()
            )));
        }
        self.current = Some(PendingDelivery {
            method,
            expected: None,
            properties: BasicProperties::default(),
            body: BytesMut::new(),
        });
        Ok(())
    }

    /// Record the declared body size and properties. A zero-sized body
    /// completes immediately.
    pub fn feed_header(&mut self, header: ContentHeader) -> Result<Feed> {
        let current = self.current.as_mut().ok_or_else(|| {
            Error::ProtocolViolation("content header without a pending delivery".into())
        })?;
        if current.expected.is_some() {
            return Err(Error::ProtocolViolation(format!(
                "second content header for {}",
                current.method.name()
            )));
        }
        if header.class_id != current.method.class_id() {
            return Err(Error::ProtocolViolation(format!(
                "content header class {} does not match {}",
                header.class_id,
                current.method.name()
            )));
        }

        current.expected = Some(header.body_size);
        current.properties = header.properties;
        if let Ok(capacity) = usize::try_from(header.body_size) {
            current.body.reserve(capacity);
        }
        self.complete_if_done()
    }

    /// Append one body chunk.
    pub fn feed_body(&mut self, chunk: Bytes) -> Result<Feed> {
        let current = self.current.as_mut().ok_or_else(|| {
            Error::ProtocolViolation("content body without a pending delivery".into())
        })?;
        let expected = current.expected.ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "content body before header for {}",
                current.method.name()
            ))
        })?;

        let total = current.body.len() as u64 + chunk.len() as u64;
        if total > expected {
            return Err(Error::ProtocolViolation(format!(
                "content body overflow: {total} bytes received, {expected} declared"
            )));
        }
        current.body.extend_from_slice(&chunk);
        self.complete_if_done()
    }

    /// Drop any partial delivery.
    pub fn reset(&mut self) {
        self.current = None;
    }

    fn complete_if_done(&mut self) -> Result<Feed> {
        let done = matches!(
            &self.current,
            Some(current) if current.expected == Some(current.body.len() as u64)
        );
        if !done {
            return Ok(Feed::Incomplete);
        }
        match self.current.take() {
            Some(current) => Ok(Feed::Complete(Message {
                method: current.method,
                properties: current.properties,
                body: current.body.freeze(),
            })),
            None => Ok(Feed::Incomplete),
        }
    }
}

/// Split an outgoing body into chunks that fit body frames under
/// `frame_max`.
pub fn split_body(body: &Bytes, frame_max: u32) -> Vec<Bytes> {
    body_chunks(body, frame_max).collect()
}
