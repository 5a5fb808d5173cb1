use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, TransportError};

/// IANA-assigned AMQP port.
pub const DEFAULT_PORT: u16 = 5672;

/// Open a TCP connection to a broker, bounded by `timeout`.
///
/// Nagle is disabled: AMQP RPCs are small request/reply exchanges and
/// batching them only adds latency.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(TransportError::Connect {
                addr: addr.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(TransportError::ConnectTimeout {
                addr: addr.to_string(),
                timeout,
            })
        }
    };

    stream.set_nodelay(true)?;
    debug!(%addr, "connected to broker");
    Ok(stream)
}
