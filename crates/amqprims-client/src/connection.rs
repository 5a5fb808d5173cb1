//! Connection multiplexer.
//!
//! After the handshake the framed transport is split. A writer task owns
//! the sink and writes batches of frames queued by any task; a batch is
//! written contiguously, so a publish's method, header and body frames are
//! never interleaved with another channel's frames. A reader task owns the
//! stream, routes each inbound frame to its channel, answers channel-0
//! control methods and drives heartbeats.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use amqprims_frame::method::{self, Arg};
use amqprims_frame::{AmqpCodec, FieldTable, Frame, FrameError, FramePayload, Method};
use amqprims_transport::{tcp, Transport};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{short_text, Channel, ChannelShared};
use crate::config::{ConnectionConfig, Tunables};
use crate::error::{
    Error, Result, CHANNEL_ERROR, COMMAND_INVALID, CONNECTION_FORCED, FRAME_ERROR,
    NOT_IMPLEMENTED, REPLY_SUCCESS, UNEXPECTED_FRAME,
};
use crate::handshake::handshake;
use crate::lock;

type Batch = Vec<Frame>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Open,
    /// Connection.Close sent; waiting for CloseOk.
    Closing { code: u16, text: String },
    Closed,
}

struct ChannelTable {
    max_id: u16,
    channels: BTreeMap<u16, Arc<ChannelShared>>,
}

impl ChannelTable {
    /// Lowest free id in `1..=max_id`.
    fn free_id(&self) -> Option<u16> {
        let mut candidate = 1u16;
        for &id in self.channels.keys() {
            if id != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        (candidate <= self.max_id).then_some(candidate)
    }
}

pub(crate) struct ConnectionShared {
    config: ConnectionConfig,
    tunables: Tunables,
    server_properties: FieldTable,
    outbound: mpsc::UnboundedSender<Batch>,
    channels: Mutex<ChannelTable>,
    state: Mutex<State>,
    terminal: watch::Sender<Option<Error>>,
    blocked: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl ConnectionShared {
    fn terminal_error(&self) -> Error {
        self.terminal
            .borrow()
            .clone()
            .unwrap_or_else(|| Error::connection_closed(CONNECTION_FORCED, "connection closed"))
    }

    /// Queue frames for the writer. The frames are written back to back.
    pub(crate) fn send(&self, frames: Batch) -> Result<()> {
        if self.terminal.borrow().is_some() {
            return Err(self.terminal_error());
        }
        self.outbound
            .send(frames)
            .map_err(|_| self.terminal_error())
    }

    fn send_method(&self, method: Method) -> Result<()> {
        self.send(vec![Frame::method(0, method)])
    }

    pub(crate) fn remove_channel(&self, id: u16) {
        if lock(&self.channels).channels.remove(&id).is_some() {
            trace!(channel = id, "channel id released");
        }
    }

    /// Wait while the broker has blocked publishing on this connection.
    pub(crate) async fn wait_unblocked(&self) -> Result<()> {
        let mut blocked = self.blocked.subscribe();
        if *blocked.borrow() {
            debug!("publish waiting for connection to be unblocked");
        }
        blocked
            .wait_for(|blocked| !*blocked)
            .await
            .map_err(|_| self.terminal_error())?;
        Ok(())
    }

    /// Tear the connection down: every channel closes with `reason`, the
    /// tasks stop and the transport is dropped. Runs once.
    pub(crate) fn fail(&self, reason: Error) {
        {
            let mut state = lock(&self.state);
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }
        match &reason {
            Error::ConnectionClosed { code, .. } if *code == REPLY_SUCCESS => {
                info!(%reason, "connection closed")
            }
            _ => warn!(%reason, "connection closed"),
        }

        self.terminal.send_replace(Some(reason.clone()));
        let channels = std::mem::take(&mut lock(&self.channels).channels);
        for channel in channels.values() {
            channel.connection_lost(&reason);
        }
        self.blocked.send_replace(false);
        self.shutdown.cancel();
    }

    /// Send Connection.Close for a fatal error, then tear down.
    fn abort(&self, code: u16, reason: Error) {
        if let Ok(close) = close_method(code, &reason.to_string()) {
            let _ = self.send_method(close);
        }
        self.fail(reason);
    }

    /// Route one inbound frame. Errors are fatal to the connection.
    fn dispatch(&self, frame: Frame) -> std::result::Result<(), (u16, Error)> {
        if frame.channel == 0 {
            return self.control(frame.payload);
        }

        if matches!(*lock(&self.state), State::Closing { .. }) {
            trace!(channel = frame.channel, "discarded while connection closes");
            return Ok(());
        }

        let channel = lock(&self.channels).channels.get(&frame.channel).cloned();
        match channel {
            Some(channel) => {
                channel.handle_frame(frame.payload);
                Ok(())
            }
            None => Err((
                CHANNEL_ERROR,
                Error::ProtocolViolation(format!(
                    "{:?} frame for unknown channel {}",
                    frame.frame_type(),
                    frame.channel
                )),
            )),
        }
    }

    fn control(&self, payload: FramePayload) -> std::result::Result<(), (u16, Error)> {
        let method = match payload {
            FramePayload::Heartbeat => {
                trace!("heartbeat received");
                return Ok(());
            }
            FramePayload::Method(method) => method,
            FramePayload::UnknownMethod {
                class_id,
                method_id,
            } => {
                return Err((
                    NOT_IMPLEMENTED,
                    Error::UnknownMethod {
                        class_id,
                        method_id,
                    },
                ))
            }
            FramePayload::Header(_) | FramePayload::Body(_) => {
                return Err((
                    UNEXPECTED_FRAME,
                    Error::ProtocolViolation("content frame on channel 0".into()),
                ))
            }
        };

        match method.id() {
            method::CONNECTION_CLOSE => {
                let reason = Error::connection_closed(
                    method.short("reply_code").unwrap_or(0),
                    method.short_str("reply_text").unwrap_or_default(),
                );
                if let Ok(close_ok) = Method::new(method::CONNECTION_CLOSE_OK, Vec::new()) {
                    let _ = self.send_method(close_ok);
                }
                self.fail(reason);
                Ok(())
            }
            method::CONNECTION_CLOSE_OK => {
                let state = lock(&self.state).clone();
                match state {
                    State::Closing { code, text } => {
                        self.fail(Error::connection_closed(code, text));
                        Ok(())
                    }
                    _ => Err((
                        COMMAND_INVALID,
                        Error::ProtocolViolation("connection.close-ok without a close".into()),
                    )),
                }
            }
            method::CONNECTION_BLOCKED => {
                warn!(
                    reason = method.short_str("reason").unwrap_or_default(),
                    "broker blocked publishing"
                );
                self.blocked.send_replace(true);
                Ok(())
            }
            method::CONNECTION_UNBLOCKED => {
                info!("broker unblocked publishing");
                self.blocked.send_replace(false);
                Ok(())
            }
            _ => Err((
                COMMAND_INVALID,
                Error::ProtocolViolation(format!("unexpected {} on channel 0", method.name())),
            )),
        }
    }
}

fn close_method(code: u16, text: &str) -> Result<Method> {
    Ok(Method::with_args(
        method::CONNECTION_CLOSE,
        [
            ("reply_code", Arg::Short(code)),
            ("reply_text", Arg::from(short_text(text))),
        ],
    )?)
}

/// An open AMQP connection.
///
/// Dropping the handle tears the connection down without the close
/// handshake; use [`Connection::close`] for a clean shutdown.
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("tunables", &self.shared.tunables)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connect over TCP and open the connection.
    pub async fn connect(addr: &str, config: ConnectionConfig) -> Result<Self> {
        let stream = tcp::connect(addr, config.handshake_timeout).await?;
        Self::open(stream, config).await
    }

    /// Run the handshake over an established transport and start the
    /// connection tasks.
    pub async fn open<T: Transport>(transport: T, config: ConnectionConfig) -> Result<Self> {
        let mut framed = Framed::new(transport, AmqpCodec::default());
        let negotiated = handshake(&mut framed, &config).await?;
        info!(
            channel_max = negotiated.tunables.channel_max,
            frame_max = negotiated.tunables.frame_max,
            heartbeat = negotiated.tunables.heartbeat,
            vhost = %config.virtual_host,
            "connection open"
        );

        let (sink, stream) = framed.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let shared = Arc::new(ConnectionShared {
            channels: Mutex::new(ChannelTable {
                max_id: negotiated.tunables.max_channel_id(),
                channels: BTreeMap::new(),
            }),
            tunables: negotiated.tunables,
            server_properties: negotiated.server_properties,
            config,
            outbound,
            state: Mutex::new(State::Open),
            terminal: watch::channel(None).0,
            blocked: watch::channel(false).0,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(write_loop(sink, queue, shutdown, Arc::downgrade(&shared)));
        tokio::spawn(read_loop(Arc::clone(&shared), stream));
        Ok(Self { shared })
    }

    pub fn tunables(&self) -> Tunables {
        self.shared.tunables
    }

    pub fn server_properties(&self) -> &FieldTable {
        &self.shared.server_properties
    }

    pub fn is_closed(&self) -> bool {
        self.shared.terminal.borrow().is_some()
    }

    /// Whether the broker currently blocks publishing (resource alarm).
    pub fn is_blocked(&self) -> bool {
        *self.shared.blocked.borrow()
    }

    /// Number of channels currently holding an id.
    pub fn channel_count(&self) -> usize {
        lock(&self.shared.channels).channels.len()
    }

    /// Open a channel on the lowest free id.
    pub async fn open_channel(&self) -> Result<Channel> {
        let shared = &self.shared;
        if !matches!(*lock(&shared.state), State::Open) {
            return Err(shared.terminal_error());
        }

        let channel = {
            let mut table = lock(&shared.channels);
            let id = table.free_id().ok_or(Error::ChannelAllocationError {
                channel_max: shared.tunables.channel_max,
            })?;
            let channel = Arc::new(ChannelShared::new(
                id,
                Arc::downgrade(shared),
                shared.tunables.frame_max,
                shared.config.rpc_timeout,
                shared.config.close_timeout,
            ));
            table.channels.insert(id, Arc::clone(&channel));
            channel
        };

        let handle = Channel {
            shared: channel,
            timeout: None,
        };
        let open = Method::new(method::CHANNEL_OPEN, vec![Arg::from("")])?;
        match handle.call(open, None).await {
            Ok(_) => {
                debug!(channel = handle.id(), "channel open");
                Ok(handle)
            }
            Err(err) => {
                if matches!(err, Error::Timeout(_)) {
                    // The broker may still open it; close so the id is
                    // released only after the broker agrees.
                    let orphan = handle.clone();
                    tokio::spawn(async move {
                        let _ = orphan.close().await;
                    });
                }
                Err(err)
            }
        }
    }

    /// Close with reply code 200 and wait for the broker's CloseOk.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "Normal shutdown").await
    }

    pub async fn close_with(&self, code: u16, text: &str) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = lock(&shared.state);
            match &*state {
                State::Open => {
                    *state = State::Closing {
                        code,
                        text: text.to_string(),
                    }
                }
                State::Closing { .. } | State::Closed => {
                    drop(state);
                    self.closed().await;
                    return Ok(());
                }
            }
        }

        let reason = Error::connection_closed(code, text);
        if let Err(err) = close_method(code, text).and_then(|close| shared.send_method(close)) {
            shared.fail(reason);
            debug!(%err, "connection already gone while closing");
            return Ok(());
        }

        let timeout = shared.config.close_timeout;
        match tokio::time::timeout(timeout, self.closed()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("no close-ok from broker, dropping connection");
                shared.fail(reason);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Wait until the connection is closed and return why.
    pub async fn closed(&self) -> Error {
        let mut terminal = self.shared.terminal.subscribe();
        let result = terminal
            .wait_for(Option::is_some)
            .await
            .map(|reason| reason.clone());
        match result {
            Ok(Some(reason)) => reason,
            _ => self.shared.terminal_error(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!("connection handle dropped");
            self.shared.fail(Error::connection_closed(
                REPLY_SUCCESS,
                "connection handle dropped",
            ));
        }
    }
}

async fn write_loop<T: Transport>(
    mut sink: SplitSink<Framed<T, AmqpCodec>, Frame>,
    mut queue: mpsc::UnboundedReceiver<Batch>,
    shutdown: CancellationToken,
    conn: Weak<ConnectionShared>,
) {
    loop {
        let batch = tokio::select! {
            batch = queue.recv() => batch,
            _ = shutdown.cancelled() => break,
        };
        let Some(batch) = batch else { break };
        if let Err(err) = write_batch(&mut sink, batch).await {
            error!(%err, "write failed");
            if let Some(conn) = conn.upgrade() {
                conn.fail(err.into());
            }
            return;
        }
    }

    // Flush what was queued before shutdown, such as a final CloseOk.
    while let Ok(batch) = queue.try_recv() {
        if write_batch(&mut sink, batch).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
    debug!("writer stopped");
}

async fn write_batch<T: Transport>(
    sink: &mut SplitSink<Framed<T, AmqpCodec>, Frame>,
    batch: Batch,
) -> std::result::Result<(), FrameError> {
    for frame in batch {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

async fn read_loop<T: Transport>(
    conn: Arc<ConnectionShared>,
    mut stream: SplitStream<Framed<T, AmqpCodec>>,
) {
    let heartbeat = conn.tunables.heartbeat_interval();
    let mut ticker = heartbeat.map(|every| {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            _ = conn.shutdown.cancelled() => break,
            next = stream.next() => {
                let frame = match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        conn.abort(FRAME_ERROR, err.into());
                        break;
                    }
                    None => {
                        conn.fail(Error::connection_closed(
                            CONNECTION_FORCED,
                            "broker closed the socket",
                        ));
                        break;
                    }
                };
                last_inbound = Instant::now();
                if let Err((code, err)) = conn.dispatch(frame) {
                    conn.abort(code, err);
                    break;
                }
            }
            _ = tick(&mut ticker) => {
                let every = heartbeat.unwrap_or_default();
                let silence = last_inbound.elapsed();
                if silence > every * 2 {
                    conn.fail(Error::HeartbeatTimeout(silence));
                    break;
                }
                trace!("heartbeat sent");
                let _ = conn.send(vec![Frame::heartbeat()]);
            }
        }
    }
    debug!("reader stopped");
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
