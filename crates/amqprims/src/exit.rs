use std::fmt;
use std::io;

use amqprims_client::error::ACCESS_REFUSED;
use amqprims_client::Error;
use amqprims_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => TRANSPORT_ERROR,
        _ => INTERNAL,
    }
}

pub fn io_error(context: &str, err: &io::Error) -> CliError {
    CliError::new(io_code(err), format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: &TransportError) -> CliError {
    let code = match err {
        TransportError::Connect { source, .. } | TransportError::Io(source) => {
            match io_code(source) {
                INTERNAL => TRANSPORT_ERROR,
                code => code,
            }
        }
        TransportError::ConnectTimeout { .. } => TIMEOUT,
        TransportError::Shutdown => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn client_error(context: &str, err: Error) -> CliError {
    let code = match &err {
        Error::Transport(inner) => return transport_error(context, inner),
        Error::Io(inner) => io_code(inner),
        Error::HandshakeError {
            code: Some(ACCESS_REFUSED),
            ..
        } => PERMISSION_DENIED,
        Error::HandshakeError { .. } => FAILURE,
        Error::Timeout(_) | Error::HeartbeatTimeout(_) => TIMEOUT,
        Error::MalformedFrame(_) | Error::ProtocolViolation(_) | Error::UnknownMethod { .. } => {
            DATA_INVALID
        }
        Error::ConfigurationError(_) => USAGE,
        Error::ChannelClosed { .. }
        | Error::ConnectionClosed { .. }
        | Error::ChannelAllocationError { .. } => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}
