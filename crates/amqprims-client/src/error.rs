use std::sync::Arc;
use std::time::Duration;

use amqprims_frame::FrameError;
use amqprims_transport::TransportError;

pub const REPLY_SUCCESS: u16 = 200;
pub const CONTENT_TOO_LARGE: u16 = 311;
pub const NO_ROUTE: u16 = 312;
pub const NO_CONSUMERS: u16 = 313;
pub const CONNECTION_FORCED: u16 = 320;
pub const INVALID_PATH: u16 = 402;
pub const ACCESS_REFUSED: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const RESOURCE_LOCKED: u16 = 405;
pub const PRECONDITION_FAILED: u16 = 406;
pub const FRAME_ERROR: u16 = 501;
pub const SYNTAX_ERROR: u16 = 502;
pub const COMMAND_INVALID: u16 = 503;
pub const CHANNEL_ERROR: u16 = 504;
pub const UNEXPECTED_FRAME: u16 = 505;
pub const RESOURCE_ERROR: u16 = 506;
pub const NOT_ALLOWED: u16 = 530;
pub const NOT_IMPLEMENTED: u16 = 540;
pub const INTERNAL_ERROR: u16 = 541;

/// Errors surfaced by connections, channels and consumers.
///
/// The type is `Clone` so one terminal error can be handed to every waiter
/// on a channel or connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Bytes from the broker did not form a valid frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A well-formed frame arrived out of sequence.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The broker sent a method this client does not know.
    #[error("unknown method {class_id}.{method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },

    /// The channel was closed, by the broker or locally.
    #[error("channel closed ({code}): {text}")]
    ChannelClosed { code: u16, text: String },

    /// The connection was closed, by the broker or locally.
    #[error("connection closed ({code}): {text}")]
    ConnectionClosed { code: u16, text: String },

    /// The caller supplied an argument that can never be sent.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A caller-specified deadline elapsed. The channel stays usable.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Protocol negotiation or authentication failed.
    #[error("handshake failed: {text}")]
    HandshakeError {
        /// Reply code when the broker closed the connection during the
        /// handshake (403 for rejected credentials).
        code: Option<u16>,
        text: String,
    },

    /// Nothing arrived from the broker for more than two heartbeat
    /// intervals.
    #[error("no traffic from broker for {0:?}, connection considered dead")]
    HeartbeatTimeout(Duration),

    /// Every channel id up to the negotiated limit is in use.
    #[error("no free channel id (channel_max {channel_max})")]
    ChannelAllocationError { channel_max: u16 },

    #[error("transport error: {0}")]
    Transport(Arc<TransportError>),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    pub(crate) fn channel_closed(code: u16, text: impl Into<String>) -> Self {
        Error::ChannelClosed {
            code,
            text: text.into(),
        }
    }

    pub(crate) fn connection_closed(code: u16, text: impl Into<String>) -> Self {
        Error::ConnectionClosed {
            code,
            text: text.into(),
        }
    }

    pub(crate) fn handshake(text: impl Into<String>) -> Self {
        Error::HandshakeError {
            code: None,
            text: text.into(),
        }
    }

    /// The AMQP reply code behind this error, if the broker supplied one.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Error::ChannelClosed { code, .. } | Error::ConnectionClosed { code, .. } => {
                Some(*code)
            }
            Error::HandshakeError { code, .. } => *code,
            _ => None,
        }
    }

    /// Whether this error ends the connection rather than one channel.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed { .. }
                | Error::HeartbeatTimeout(_)
                | Error::HandshakeError { .. }
                | Error::MalformedFrame(_)
                | Error::Transport(_)
                | Error::Io(_)
        )
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::MalformedFrame(reason) => Error::MalformedFrame(reason),
            FrameError::PayloadTooLarge { .. } => Error::MalformedFrame(err.to_string()),
            FrameError::UnknownMethod {
                class_id,
                method_id,
            } => Error::UnknownMethod {
                class_id,
                method_id,
            },
            FrameError::UnsupportedProtocol { .. } => Error::handshake(err.to_string()),
            FrameError::InvalidField { .. } | FrameError::ShortStringTooLong { .. } => {
                Error::ConfigurationError(err.to_string())
            }
            FrameError::Io(io) => Error::Io(Arc::new(io)),
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
