use tokio::io::{AsyncRead, AsyncWrite};

/// A connected duplex byte stream the client can speak AMQP over.
///
/// Implemented for every `AsyncRead + AsyncWrite` type that can be moved to
/// the connection's background tasks. The connection splits the stream into
/// a read half (owned by the frame-reading loop) and a write half (owned by
/// the single writer task).
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
