//! Async transport abstraction for the amqprims AMQP client.
//!
//! The client core never touches sockets directly. It consumes any duplex
//! byte stream implementing [`Transport`]: a TCP stream from [`connect`],
//! a TLS stream wrapped by the caller, or an in-memory `tokio::io::duplex`
//! pair in tests.
//!
//! This is the lowest layer of amqprims. Everything else builds on top of it.

pub mod error;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use tcp::{connect, DEFAULT_PORT};
pub use traits::Transport;
