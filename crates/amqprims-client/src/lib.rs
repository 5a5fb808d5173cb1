//! Async AMQP 0-9-1 client core.
//!
//! A [`Connection`] multiplexes numbered [`Channel`]s over one transport.
//! Channels issue synchronous calls one at a time, publish content, and
//! dispatch deliveries to registered consumer callbacks.

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod content;
pub mod error;
mod handshake;
pub mod operations;
pub mod options;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channel::{Channel, ChannelState, Confirmation, Reply, Returned};
pub use config::{ConnectionConfig, Credentials, Tunables};
pub use connection::Connection;
pub use consumer::{Callback, Consumer, ConsumerEnd, Delivery};
pub use content::{split_body, ContentAssembler, Feed, Message};
pub use error::{Error, Result};
pub use operations::{GetMessage, QueueDeclareOk};
pub use options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BindOptions,
    ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeKind, QueueDeclareOptions,
    QueueDeleteOptions,
};

/// Lock a std mutex, ignoring poisoning: state guarded here stays
/// consistent across a panicking consumer callback.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
