/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The bytes on the wire do not form a valid frame (bad end marker,
    /// unknown frame type, truncated fields, invalid UTF-8).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The declared frame size exceeds the negotiated maximum.
    #[error("frame too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// No method descriptor exists for this (class-id, method-id) pair.
    #[error("unknown method {class_id}.{method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },

    /// The peer answered our protocol header with its own, meaning it does
    /// not speak AMQP 0-9-1.
    #[error("broker requires protocol AMQP {major}-{minor}-{revision}")]
    UnsupportedProtocol { major: u8, minor: u8, revision: u8 },

    /// A method argument does not match the method's field schema.
    #[error("invalid argument for {method}.{field}: {reason}")]
    InvalidField {
        method: &'static str,
        field: &'static str,
        reason: String,
    },

    /// Short strings are length-prefixed by a single octet.
    #[error("short string too long ({len} bytes, max 255)")]
    ShortStringTooLong { len: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

pub(crate) fn truncated(what: &str, need: usize, have: usize) -> FrameError {
    FrameError::MalformedFrame(format!(
        "truncated {what}: need {need} bytes, have {have}"
    ))
}
