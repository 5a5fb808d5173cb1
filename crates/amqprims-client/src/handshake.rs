use amqprims_frame::method::{self, Arg, MethodId};
use amqprims_frame::{
    AmqpCodec, FieldTable, FieldValue, Frame, FramePayload, Method, PROTOCOL_HEADER,
};
use amqprims_transport::Transport;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::config::{ConnectionConfig, Tunables};
use crate::error::{Error, Result};

const MECHANISM: &str = "PLAIN";

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    pub tunables: Tunables,
    pub server_properties: FieldTable,
}

/// Run the opening handshake: protocol header, Start/StartOk, Tune/TuneOk,
/// Open/OpenOk. Bounded by `config.handshake_timeout`.
pub(crate) async fn handshake<T: Transport>(
    framed: &mut Framed<T, AmqpCodec>,
    config: &ConnectionConfig,
) -> Result<Negotiated> {
    match tokio::time::timeout(config.handshake_timeout, negotiate(framed, config)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(config.handshake_timeout)),
    }
}

async fn negotiate<T: Transport>(
    framed: &mut Framed<T, AmqpCodec>,
    config: &ConnectionConfig,
) -> Result<Negotiated> {
    framed.get_mut().write_all(PROTOCOL_HEADER).await?;
    framed.get_mut().flush().await?;

    let start = expect(framed, &[method::CONNECTION_START]).await?;
    validate_start(&start)?;
    let server_properties = start
        .table("server_properties")
        .cloned()
        .unwrap_or_default();

    let start_ok = Method::with_args(
        method::CONNECTION_START_OK,
        [
            ("client_properties", Arg::Table(client_properties(config))),
            ("mechanism", Arg::from(MECHANISM)),
            (
                "response",
                Arg::LongStr(Bytes::from(config.credentials.plain_response())),
            ),
            ("locale", Arg::from(config.locale.as_str())),
        ],
    )?;
    send(framed, start_ok).await?;

    let tune = expect(
        framed,
        &[method::CONNECTION_TUNE, method::CONNECTION_SECURE],
    )
    .await?;
    if tune.id() == method::CONNECTION_SECURE {
        return Err(Error::handshake(
            "broker sent a SASL challenge; only PLAIN is supported",
        ));
    }

    let offered = Tunables {
        channel_max: tune.short("channel_max").unwrap_or(0),
        frame_max: tune.long("frame_max").unwrap_or(0),
        heartbeat: tune.short("heartbeat").unwrap_or(0),
    };
    let tunables = config.tunables.negotiate(&offered);
    debug!(?offered, negotiated = ?tunables, "connection tuned");

    let tune_ok = Method::with_args(
        method::CONNECTION_TUNE_OK,
        [
            ("channel_max", Arg::Short(tunables.channel_max)),
            ("frame_max", Arg::Long(tunables.frame_max)),
            ("heartbeat", Arg::Short(tunables.heartbeat)),
        ],
    )?;
    send(framed, tune_ok).await?;
    framed
        .codec_mut()
        .set_max_frame_size(tunables.frame_max as usize);

    let open = Method::with_args(
        method::CONNECTION_OPEN,
        [("virtual_host", Arg::from(config.virtual_host.as_str()))],
    )?;
    send(framed, open).await?;
    expect(framed, &[method::CONNECTION_OPEN_OK]).await?;

    debug!(vhost = %config.virtual_host, "connection open");
    Ok(Negotiated {
        tunables,
        server_properties,
    })
}

fn validate_start(start: &Method) -> Result<()> {
    let major = start.octet("version_major").unwrap_or(0);
    let minor = start.octet("version_minor").unwrap_or(0);
    if (major, minor) != (0, 9) {
        return Err(Error::handshake(format!(
            "broker speaks AMQP {major}-{minor}, expected 0-9"
        )));
    }

    let mechanisms = start
        .long_str("mechanisms")
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .unwrap_or_default();
    if !mechanisms.split_whitespace().any(|m| m == MECHANISM) {
        return Err(Error::handshake(format!(
            "broker does not offer {MECHANISM} (offers: {mechanisms})"
        )));
    }
    Ok(())
}

/// Client properties sent in Connection.StartOk.
pub(crate) fn client_properties(config: &ConnectionConfig) -> FieldTable {
    let mut capabilities = FieldTable::new();
    for name in [
        "publisher_confirms",
        "consumer_cancel_notify",
        "authentication_failure_close",
        "basic.nack",
        "connection.blocked",
        "exchange_exchange_bindings",
    ] {
        capabilities.insert(name.to_string(), FieldValue::Boolean(true));
    }

    let mut props = FieldTable::new();
    props.insert("product".into(), FieldValue::from("amqprims"));
    props.insert(
        "version".into(),
        FieldValue::from(env!("CARGO_PKG_VERSION")),
    );
    props.insert("platform".into(), FieldValue::from("Rust"));
    props.insert("capabilities".into(), FieldValue::Table(capabilities));
    if let Some(name) = &config.connection_name {
        props.insert("connection_name".into(), FieldValue::from(name.as_str()));
    }
    props
}

async fn send<T: Transport>(framed: &mut Framed<T, AmqpCodec>, method: Method) -> Result<()> {
    framed.send(Frame::method(0, method)).await?;
    Ok(())
}

/// Read until one of `expected` arrives on channel 0. Heartbeats are
/// skipped; a Connection.Close is answered and turned into an error.
async fn expect<T: Transport>(
    framed: &mut Framed<T, AmqpCodec>,
    expected: &[MethodId],
) -> Result<Method> {
    loop {
        let frame = match framed.next().await {
            Some(frame) => frame?,
            None => {
                return Err(Error::handshake(
                    "broker closed the socket during the handshake",
                ))
            }
        };

        let method = match frame.payload {
            FramePayload::Heartbeat => continue,
            FramePayload::Method(method) if frame.channel == 0 => method,
            _ => {
                return Err(Error::handshake(format!(
                    "unexpected {:?} frame on channel {} during the handshake",
                    frame.frame_type(),
                    frame.channel
                )))
            }
        };

        if method.id() == method::CONNECTION_CLOSE {
            let code = method.short("reply_code").unwrap_or(0);
            let text = method.short_str("reply_text").unwrap_or_default().to_string();
            warn!(code, %text, "broker refused the connection");
            if let Ok(close_ok) = Method::new(method::CONNECTION_CLOSE_OK, Vec::new()) {
                let _ = send(framed, close_ok).await;
            }
            return Err(Error::HandshakeError {
                code: Some(code),
                text,
            });
        }

        if expected.contains(&method.id()) {
            return Ok(method);
        }
        return Err(Error::handshake(format!(
            "unexpected {} during the handshake",
            method.name()
        )));
    }
}
