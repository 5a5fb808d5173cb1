//! Async AMQP 0-9-1 client primitives.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-stream abstraction and TCP connector
//! - [`frame`]: frame codec, field tables, method registry and content headers
//! - [`client`]: connections, channels and consumers (behind `client` feature)

/// Re-export transport types.
pub mod transport {
    pub use amqprims_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use amqprims_frame::*;
}

/// Re-export client types (requires `client` feature).
#[cfg(feature = "client")]
pub mod client {
    pub use amqprims_client::*;
}

#[cfg(feature = "client")]
pub use amqprims_client::{Channel, Connection, ConnectionConfig, Error, Result};
