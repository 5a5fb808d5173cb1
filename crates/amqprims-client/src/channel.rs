//! Channel state machine.
//!
//! A channel is `Opening` until Channel.OpenOk, `Open` while usable,
//! `Closing` after a Channel.Close was sent (by us, or because the broker
//! violated the protocol) and `Closed` once the close completed. Entering
//! `Closed` fails the pending call, ends every consumer and releases
//! publishers waiting on flow control, all with the same reason.
//!
//! Synchronous calls are serialised by a fair async mutex, so a second
//! call waits its turn behind the first. The reader task resolves the
//! single pending slot when the matching reply arrives. A call that times
//! out moves its request onto a stale queue; the late reply is discarded
//! instead of resolving the next caller.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use amqprims_frame::method::{self, Arg, MethodDescriptor, MethodId};
use amqprims_frame::{BasicProperties, FramePayload, Method, FRAME_OVERHEAD};
use bytes::{Bytes, BytesMut};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionShared;
use crate::consumer::{Callback, Consumer, ConsumerEnd, ConsumerRegistry, Delivery};
use crate::content::{ContentAssembler, Feed, Message};
use crate::error::{
    Error, Result, CHANNEL_ERROR, NOT_ALLOWED, NOT_IMPLEMENTED, REPLY_SUCCESS, UNEXPECTED_FRAME,
};
use crate::lock;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Reply to a synchronous call.
#[derive(Debug)]
pub struct Reply {
    pub method: Method,
    /// Content that followed the reply (Basic.GetOk).
    pub message: Option<Message>,
    pub(crate) consumer: Option<Consumer>,
}

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The channel is not in confirm mode.
    NotRequested,
    Ack,
    Nack,
}

/// A mandatory or immediate publish the broker could not route.
#[derive(Debug, Clone, PartialEq)]
pub struct Returned {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

type ReturnHandler = Arc<dyn Fn(Returned) + Send + Sync>;

struct Pending {
    seq: u64,
    request: &'static MethodDescriptor,
    tx: oneshot::Sender<Result<Reply>>,
    consumer: Option<Callback>,
}

#[derive(Default)]
struct Confirms {
    next_tag: u64,
    waiting: BTreeMap<u64, oneshot::Sender<Confirmation>>,
}

impl Confirms {
    fn new() -> Self {
        Self {
            next_tag: 1,
            waiting: BTreeMap::new(),
        }
    }

    fn register(&mut self) -> oneshot::Receiver<Confirmation> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(self.next_tag, tx);
        self.next_tag += 1;
        rx
    }

    fn resolve(&mut self, tag: u64, multiple: bool, outcome: Confirmation) {
        if multiple {
            let rest = self.waiting.split_off(&tag.saturating_add(1));
            for (_, tx) in std::mem::replace(&mut self.waiting, rest) {
                let _ = tx.send(outcome);
            }
        } else if let Some(tx) = self.waiting.remove(&tag) {
            let _ = tx.send(outcome);
        }
    }
}

struct Inner {
    state: ChannelState,
    next_seq: u64,
    pending: Option<Pending>,
    /// A Basic.Get whose GetOk arrived and whose content is still coming.
    awaiting_content: Option<Pending>,
    /// Requests whose caller gave up before the reply arrived.
    stale: VecDeque<&'static MethodDescriptor>,
    content: ContentAssembler,
    consumers: ConsumerRegistry,
    confirms: Option<Confirms>,
    returns: Option<ReturnHandler>,
    close_ok: Option<oneshot::Sender<()>>,
    /// Reason reported once a close we started completes.
    close_reason: Option<Error>,
}

pub(crate) struct ChannelShared {
    id: u16,
    conn: Weak<ConnectionShared>,
    frame_max: u32,
    default_timeout: Option<Duration>,
    close_timeout: Duration,
    inner: Mutex<Inner>,
    rpc: tokio::sync::Mutex<()>,
    flow: watch::Sender<bool>,
    terminal: watch::Sender<Option<Error>>,
}

impl ChannelShared {
    pub(crate) fn new(
        id: u16,
        conn: Weak<ConnectionShared>,
        frame_max: u32,
        default_timeout: Option<Duration>,
        close_timeout: Duration,
    ) -> Self {
        Self {
            id,
            conn,
            frame_max,
            default_timeout,
            close_timeout,
            inner: Mutex::new(Inner {
                state: ChannelState::Opening,
                next_seq: 0,
                pending: None,
                awaiting_content: None,
                stale: VecDeque::new(),
                content: ContentAssembler::new(),
                consumers: ConsumerRegistry::new(id),
                confirms: None,
                returns: None,
                close_ok: None,
                close_reason: None,
            }),
            rpc: tokio::sync::Mutex::new(()),
            flow: watch::channel(true).0,
            terminal: watch::channel(None).0,
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    fn connection(&self) -> Result<Arc<ConnectionShared>> {
        self.conn
            .upgrade()
            .ok_or_else(|| Error::connection_closed(REPLY_SUCCESS, "connection dropped"))
    }

    fn send_method(&self, method: Method) -> Result<()> {
        let mut encoded = BytesMut::new();
        method.encode(&mut encoded)?;
        self.check_frame_size(method.name(), encoded.len())?;
        self.connection()?
            .send(vec![amqprims_frame::Frame::method(self.id, method)])
    }

    /// Reject a payload the writer could not put on the wire. An oversized
    /// frame must fail its own call instead of the connection.
    fn check_frame_size(&self, what: &str, payload_len: usize) -> Result<()> {
        let max = self.frame_max as usize;
        if max > 0 && payload_len + FRAME_OVERHEAD > max {
            return Err(Error::ConfigurationError(format!(
                "{what} needs a {} byte frame, negotiated frame_max is {max}",
                payload_len + FRAME_OVERHEAD
            )));
        }
        Ok(())
    }

    fn terminal_error(&self) -> Error {
        self.terminal
            .borrow()
            .clone()
            .unwrap_or_else(|| Error::channel_closed(CHANNEL_ERROR, "channel closed"))
    }

    fn check_usable(&self, inner: &Inner, id: MethodId) -> Result<()> {
        match inner.state {
            ChannelState::Open => Ok(()),
            ChannelState::Opening if id == method::CHANNEL_OPEN => Ok(()),
            ChannelState::Opening => Err(Error::channel_closed(
                CHANNEL_ERROR,
                "channel is not open yet",
            )),
            ChannelState::Closing => Err(inner
                .close_reason
                .clone()
                .unwrap_or_else(|| Error::channel_closed(CHANNEL_ERROR, "channel is closing"))),
            ChannelState::Closed => Err(self.terminal_error()),
        }
    }

    /// Send a synchronous method and wait for its reply.
    pub(crate) async fn rpc(
        &self,
        method: Method,
        consumer: Option<Callback>,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let descriptor = method.descriptor();
        if !descriptor.is_synchronous() {
            return Err(Error::ConfigurationError(format!(
                "{} has no reply; send it without waiting",
                descriptor.name
            )));
        }

        let timeout = timeout.or(self.default_timeout);
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let _turn = within(deadline, self.rpc.lock()).await?;

        let (tx, rx) = oneshot::channel();
        let seq = {
            let mut inner = lock(&self.inner);
            self.check_usable(&inner, descriptor.id())?;

            if consumer.is_some() {
                let tag = method.short_str("consumer_tag").unwrap_or_default();
                if !tag.is_empty() && inner.consumers.contains(tag) {
                    return Err(duplicate_tag(tag));
                }
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            trace!(channel = self.id, method = descriptor.name, "call");
            self.send_method(method)?;
            inner.pending = Some(Pending {
                seq,
                request: descriptor,
                tx,
                consumer,
            });
            seq
        };

        let mut guard = PendingGuard {
            channel: self,
            seq,
            armed: true,
        };
        match within(deadline, rx).await {
            Ok(Ok(reply)) => {
                guard.armed = false;
                reply
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(self.current_error())
            }
            Err(err) => Err(err),
        }
    }

    fn current_error(&self) -> Error {
        let inner = lock(&self.inner);
        match (&inner.state, &inner.close_reason) {
            (ChannelState::Closing, Some(reason)) => reason.clone(),
            _ => {
                drop(inner);
                self.terminal_error()
            }
        }
    }

    /// Send a method that has no reply, or a synchronous method with
    /// `no_wait` set.
    pub(crate) fn cast(&self, method: Method) -> Result<()> {
        let inner = lock(&self.inner);
        self.check_usable(&inner, method.id())?;
        trace!(channel = self.id, method = method.name(), "cast");
        self.send_method(method)
    }

    /// Register a consumer without waiting for Basic.ConsumeOk.
    pub(crate) fn consume_no_wait(&self, method: Method, callback: Callback) -> Result<Consumer> {
        let mut inner = lock(&self.inner);
        self.check_usable(&inner, method.id())?;
        let tag = method.short_str("consumer_tag").unwrap_or_default().to_string();
        if inner.consumers.contains(&tag) {
            return Err(duplicate_tag(&tag));
        }
        self.send_method(method)?;
        Ok(inner.consumers.register(tag, callback))
    }

    pub(crate) async fn publish(
        &self,
        method: Method,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<Confirmation> {
        // Encode the header once up front so invalid properties fail here
        // rather than inside the writer.
        let header = amqprims_frame::ContentHeader::new(
            method::class::BASIC,
            body.len() as u64,
            properties,
        );
        let mut encoded = BytesMut::new();
        header.encode(&mut encoded)?;
        self.check_frame_size("content header", encoded.len())?;

        self.wait_for_flow().await?;
        let conn = self.connection()?;
        conn.wait_unblocked().await?;

        let mut frames = Vec::with_capacity(2 + body.len() / self.frame_max.max(1) as usize);
        frames.push(amqprims_frame::Frame::method(self.id, method));
        frames.push(amqprims_frame::Frame::header(self.id, header));
        for chunk in amqprims_frame::body_chunks(&body, self.frame_max) {
            frames.push(amqprims_frame::Frame::body(self.id, chunk));
        }

        let confirm = {
            let mut inner = lock(&self.inner);
            self.check_usable(&inner, method::BASIC_PUBLISH)?;
            let confirm = inner.confirms.as_mut().map(Confirms::register);
            conn.send(frames)?;
            confirm
        };

        match confirm {
            None => Ok(Confirmation::NotRequested),
            Some(rx) => rx.await.map_err(|_| self.current_error()),
        }
    }

    async fn wait_for_flow(&self) -> Result<()> {
        let mut flow = self.flow.subscribe();
        if !*flow.borrow() {
            debug!(channel = self.id, "publish waiting for channel flow");
        }
        flow.wait_for(|active| *active)
            .await
            .map_err(|_| self.terminal_error())?;
        Ok(())
    }

    pub(crate) fn set_return_handler(&self, handler: ReturnHandler) {
        lock(&self.inner).returns = Some(handler);
    }

    pub(crate) fn remove_consumer(&self, tag: &str) {
        lock(&self.inner)
            .consumers
            .remove(tag, ConsumerEnd::Cancelled);
    }

    pub(crate) fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    /// Send Channel.Close and wait for CloseOk.
    pub(crate) async fn close(&self, code: u16, text: &str) -> Result<()> {
        // The guard must be gone before any await.
        let started = {
            let mut inner = lock(&self.inner);
            match inner.state {
                ChannelState::Closed => return Ok(()),
                ChannelState::Closing => None,
                ChannelState::Opening | ChannelState::Open => {
                    Some(self.start_close(&mut inner, code, text)?)
                }
            }
        };
        let rx = match started {
            None => return self.await_closing(code, text).await,
            Some(None) => return Ok(()),
            Some(Some(rx)) => rx,
        };

        match tokio::time::timeout(self.close_timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => {
                self.close_timed_out(code, text);
                Err(Error::Timeout(self.close_timeout))
            }
        }
    }

    /// Move an open channel to `Closing` and send Channel.Close. Returns
    /// `None` when the close could not be sent and the channel is already
    /// closed locally.
    fn start_close(
        &self,
        inner: &mut Inner,
        code: u16,
        text: &str,
    ) -> Result<Option<oneshot::Receiver<()>>> {
        let close = close_method(code, text)?;
        let reason = Error::channel_closed(code, text);
        inner.state = ChannelState::Closing;
        inner.close_reason = Some(reason.clone());
        fail_waiters(inner, &reason);

        let (tx, rx) = oneshot::channel();
        inner.close_ok = Some(tx);
        if let Err(err) = self.send_method(close) {
            self.finish_locked(inner, err);
            return Ok(None);
        }
        Ok(Some(rx))
    }

    /// Wait, bounded by the close timeout, for a close already in flight.
    async fn await_closing(&self, code: u16, text: &str) -> Result<()> {
        let mut terminal = self.terminal.subscribe();
        let finished = tokio::time::timeout(self.close_timeout, terminal.wait_for(Option::is_some))
            .await
            .is_ok();
        if finished {
            return Ok(());
        }
        self.close_timed_out(code, text);
        Err(Error::Timeout(self.close_timeout))
    }

    fn close_timed_out(&self, code: u16, text: &str) {
        let mut inner = lock(&self.inner);
        if inner.state != ChannelState::Closing {
            return;
        }
        warn!(channel = self.id, "no close-ok from broker, closing locally");
        let reason = inner
            .close_reason
            .take()
            .unwrap_or_else(|| Error::channel_closed(code, text));
        // The id stays reserved until a late CloseOk arrives.
        self.seal_locked(&mut inner, reason);
    }

    /// Wait for the channel to close and return the reason.
    pub(crate) async fn closed(&self) -> Error {
        let mut terminal = self.terminal.subscribe();
        let result = terminal
            .wait_for(Option::is_some)
            .await
            .map(|reason| reason.clone());
        match result {
            Ok(Some(reason)) => reason,
            _ => Error::channel_closed(CHANNEL_ERROR, "channel dropped"),
        }
    }

    fn detach(&self) {
        if let Ok(conn) = self.connection() {
            conn.remove_channel(self.id);
        }
    }

    /// Close the channel because its connection ended.
    pub(crate) fn connection_lost(&self, reason: &Error) {
        let mut inner = lock(&self.inner);
        if inner.state != ChannelState::Closed {
            self.seal_locked(&mut inner, reason.clone());
        }
    }

    /// Enter `Closed` and release the channel id. The id is released
    /// before waiters wake, so they can reopen on it straight away.
    fn finish_locked(&self, inner: &mut Inner, reason: Error) {
        self.detach();
        self.seal_locked(inner, reason);
    }

    /// Enter `Closed`, keeping the id reserved.
    fn seal_locked(&self, inner: &mut Inner, reason: Error) {
        debug!(channel = self.id, %reason, "channel closed");
        inner.state = ChannelState::Closed;
        inner.close_reason = None;
        inner.stale.clear();
        inner.content.reset();
        fail_waiters(inner, &reason);
        inner.consumers.close_all(&reason);
        inner.confirms = None;
        if let Some(tx) = inner.close_ok.take() {
            let _ = tx.send(());
        }
        self.terminal.send_replace(Some(reason));
        self.flow.send_replace(true);
    }

    /// Fail the channel after the broker broke the protocol: send
    /// Channel.Close (540 for a method we cannot decode, 505 otherwise)
    /// and keep the id reserved until CloseOk.
    fn violation_locked(&self, inner: &mut Inner, err: Error) {
        if matches!(inner.state, ChannelState::Closing | ChannelState::Closed) {
            return;
        }
        warn!(channel = self.id, %err, "closing channel");
        inner.state = ChannelState::Closing;
        inner.content.reset();
        fail_waiters(inner, &err);
        let code = match &err {
            Error::UnknownMethod { .. } => NOT_IMPLEMENTED,
            _ => UNEXPECTED_FRAME,
        };
        let sent = close_method(code, &err.to_string())
            .and_then(|close| self.send_method(close));
        match sent {
            Ok(()) => inner.close_reason = Some(err),
            Err(_) => self.finish_locked(inner, err),
        }
    }

    /// Handle one inbound frame routed to this channel by the reader.
    pub(crate) fn handle_frame(&self, payload: FramePayload) {
        let close_ok = matches!(
            &payload,
            FramePayload::Method(m) if m.id() == method::CHANNEL_CLOSE_OK
        );
        let late_close_ok = {
            let mut inner = lock(&self.inner);
            let was_closed = inner.state == ChannelState::Closed;
            let result = match payload {
                FramePayload::Method(method) => self.on_method(&mut inner, method),
                FramePayload::UnknownMethod {
                    class_id,
                    method_id,
                } => self.on_unknown_method(&inner, class_id, method_id),
                FramePayload::Header(header) => {
                    self.on_content(&mut inner, |content| content.feed_header(header))
                }
                FramePayload::Body(chunk) => {
                    self.on_content(&mut inner, |content| content.feed_body(chunk))
                }
                FramePayload::Heartbeat => Err(Error::ProtocolViolation(format!(
                    "heartbeat frame on channel {}",
                    self.id
                ))),
            };
            if let Err(err) = result {
                self.violation_locked(&mut inner, err);
            }
            was_closed && close_ok
        };
        if late_close_ok {
            self.detach();
        }
    }

    fn on_unknown_method(&self, inner: &Inner, class_id: u16, method_id: u16) -> Result<()> {
        if matches!(inner.state, ChannelState::Closing | ChannelState::Closed) {
            trace!(channel = self.id, class_id, method_id, "unknown method discarded");
            return Ok(());
        }
        Err(Error::UnknownMethod {
            class_id,
            method_id,
        })
    }

    fn on_method(&self, inner: &mut Inner, method: Method) -> Result<()> {
        let id = method.id();
        match inner.state {
            ChannelState::Closed => {
                debug!(channel = self.id, method = method.name(), "ignored on closed channel");
                return Ok(());
            }
            ChannelState::Closing => {
                match id {
                    method::CHANNEL_CLOSE => {
                        // Crossed closes: the broker still owes a CloseOk for
                        // ours, so the id stays reserved until it arrives.
                        self.send_method(Method::new(method::CHANNEL_CLOSE_OK, Vec::new())?)?;
                        let reason = broker_close(&method);
                        self.seal_locked(inner, reason);
                    }
                    method::CHANNEL_CLOSE_OK => {
                        let reason = inner.close_reason.take().unwrap_or_else(|| {
                            Error::channel_closed(REPLY_SUCCESS, "channel closed")
                        });
                        self.finish_locked(inner, reason);
                    }
                    _ => trace!(channel = self.id, method = method.name(), "discarded while closing"),
                }
                return Ok(());
            }
            ChannelState::Opening | ChannelState::Open => {}
        }

        match id {
            method::CHANNEL_CLOSE => {
                let reason = broker_close(&method);
                warn!(channel = self.id, %reason, "broker closed channel");
                self.send_method(Method::new(method::CHANNEL_CLOSE_OK, Vec::new())?)?;
                self.finish_locked(inner, reason);
                Ok(())
            }
            method::CHANNEL_CLOSE_OK => Err(Error::ProtocolViolation(
                "channel.close-ok without a pending close".into(),
            )),
            method::CHANNEL_FLOW => {
                let active = method.bit("active").unwrap_or(true);
                debug!(channel = self.id, active, "broker flow control");
                self.flow.send_replace(active);
                self.send_method(Method::new(
                    method::CHANNEL_FLOW_OK,
                    vec![Arg::Bit(active)],
                )?)
            }
            method::BASIC_DELIVER | method::BASIC_RETURN => inner.content.start(method),
            method::BASIC_ACK => self.on_confirm(inner, &method, Confirmation::Ack),
            method::BASIC_NACK => self.on_confirm(inner, &method, Confirmation::Nack),
            method::BASIC_CANCEL => {
                let tag = method.short_str("consumer_tag").unwrap_or_default();
                if inner.consumers.remove(tag, ConsumerEnd::CancelledByBroker) {
                    warn!(channel = self.id, consumer_tag = %tag, "consumer cancelled by broker");
                }
                if !method.no_wait() {
                    self.send_method(Method::new(
                        method::BASIC_CANCEL_OK,
                        vec![Arg::from(tag)],
                    )?)?;
                }
                Ok(())
            }
            _ => self.on_reply(inner, method),
        }
    }

    fn on_reply(&self, inner: &mut Inner, method: Method) -> Result<()> {
        let id = method.id();

        if inner
            .stale
            .front()
            .is_some_and(|request| request.accepts_reply(id))
        {
            inner.stale.pop_front();
            warn!(channel = self.id, method = method.name(), "discarding late reply");
            match id {
                method::BASIC_GET_OK => inner.content.start(method)?,
                method::BASIC_CONSUME_OK => {
                    // Nobody will receive these deliveries.
                    let tag = method.short_str("consumer_tag").unwrap_or_default();
                    let cancel = Method::with_args(
                        method::BASIC_CANCEL,
                        [("consumer_tag", Arg::from(tag)), ("no_wait", Arg::Bit(true))],
                    )?;
                    self.send_method(cancel)?;
                }
                _ => {}
            }
            return Ok(());
        }

        let expected = inner
            .pending
            .as_ref()
            .is_some_and(|pending| pending.request.accepts_reply(id));
        if !expected {
            return Err(Error::ProtocolViolation(format!(
                "unexpected {} on channel {}",
                method.name(),
                self.id
            )));
        }

        if id == method::BASIC_GET_OK {
            inner.content.start(method)?;
            inner.awaiting_content = inner.pending.take();
            return Ok(());
        }

        let Some(mut pending) = inner.pending.take() else {
            return Ok(());
        };
        let mut consumer = None;
        match id {
            method::CHANNEL_OPEN_OK => inner.state = ChannelState::Open,
            method::BASIC_CONSUME_OK => {
                if let Some(callback) = pending.consumer.take() {
                    let tag = method.short_str("consumer_tag").unwrap_or_default();
                    consumer = Some(inner.consumers.register(tag.to_string(), callback));
                }
            }
            method::BASIC_CANCEL_OK => {
                let tag = method.short_str("consumer_tag").unwrap_or_default();
                inner.consumers.remove(tag, ConsumerEnd::Cancelled);
            }
            method::CONFIRM_SELECT_OK => {
                inner.confirms.get_or_insert_with(Confirms::new);
            }
            _ => {}
        }

        trace!(channel = self.id, method = method.name(), "reply");
        let _ = pending.tx.send(Ok(Reply {
            method,
            message: None,
            consumer,
        }));
        Ok(())
    }

    fn on_confirm(&self, inner: &mut Inner, method: &Method, outcome: Confirmation) -> Result<()> {
        let confirms = inner.confirms.as_mut().ok_or_else(|| {
            Error::ProtocolViolation(format!("{} outside confirm mode", method.name()))
        })?;
        let tag = method.long_long("delivery_tag").unwrap_or(0);
        let multiple = method.bit("multiple").unwrap_or(false);
        confirms.resolve(tag, multiple, outcome);
        Ok(())
    }

    fn on_content(
        &self,
        inner: &mut Inner,
        feed: impl FnOnce(&mut ContentAssembler) -> Result<Feed>,
    ) -> Result<()> {
        if matches!(inner.state, ChannelState::Closing | ChannelState::Closed) {
            return Ok(());
        }
        match feed(&mut inner.content)? {
            Feed::Incomplete => Ok(()),
            Feed::Complete(message) => {
                self.on_message(inner, message);
                Ok(())
            }
        }
    }

    fn on_message(&self, inner: &mut Inner, message: Message) {
        match message.method.id() {
            method::BASIC_DELIVER => {
                inner.consumers.dispatch(delivery_from(message));
            }
            method::BASIC_RETURN => {
                let returned = returned_from(message);
                match &inner.returns {
                    Some(handler) => handler(returned),
                    None => warn!(
                        channel = self.id,
                        code = returned.reply_code,
                        text = %returned.reply_text,
                        exchange = %returned.exchange,
                        routing_key = %returned.routing_key,
                        "message returned by broker"
                    ),
                }
            }
            _ => match inner.awaiting_content.take() {
                Some(pending) => {
                    let _ = pending.tx.send(Ok(Reply {
                        method: message.method.clone(),
                        message: Some(message),
                        consumer: None,
                    }));
                }
                None => debug!(channel = self.id, "discarding content of late get-ok"),
            },
        }
    }
}

/// Releases the pending slot if the caller stops waiting (timeout or a
/// dropped future). The reply still owed by the broker becomes stale.
struct PendingGuard<'a> {
    channel: &'a ChannelShared,
    seq: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = lock(&self.channel.inner);
        if inner.pending.as_ref().is_some_and(|p| p.seq == self.seq) {
            if let Some(pending) = inner.pending.take() {
                debug!(
                    channel = self.channel.id,
                    method = pending.request.name,
                    "caller gave up, reply will be discarded"
                );
                inner.stale.push_back(pending.request);
            }
        } else if inner
            .awaiting_content
            .as_ref()
            .is_some_and(|p| p.seq == self.seq)
        {
            inner.awaiting_content = None;
        }
    }
}

fn fail_waiters(inner: &mut Inner, reason: &Error) {
    for pending in [inner.pending.take(), inner.awaiting_content.take()]
        .into_iter()
        .flatten()
    {
        let _ = pending.tx.send(Err(reason.clone()));
    }
}

fn duplicate_tag(tag: &str) -> Error {
    Error::channel_closed(
        NOT_ALLOWED,
        format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"),
    )
}

fn broker_close(method: &Method) -> Error {
    Error::channel_closed(
        method.short("reply_code").unwrap_or(0),
        method.short_str("reply_text").unwrap_or_default(),
    )
}

pub(crate) fn close_method(code: u16, text: &str) -> Result<Method> {
    Ok(Method::with_args(
        method::CHANNEL_CLOSE,
        [
            ("reply_code", Arg::Short(code)),
            ("reply_text", Arg::from(short_text(text))),
        ],
    )?)
}

/// Clip reply text to the 255-byte short string limit.
pub(crate) fn short_text(text: &str) -> &str {
    if text.len() <= 255 {
        return text;
    }
    let mut end = 255;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn delivery_from(message: Message) -> Delivery {
    let m = &message.method;
    Delivery {
        consumer_tag: m.short_str("consumer_tag").unwrap_or_default().to_string(),
        delivery_tag: m.long_long("delivery_tag").unwrap_or(0),
        redelivered: m.bit("redelivered").unwrap_or(false),
        exchange: m.short_str("exchange").unwrap_or_default().to_string(),
        routing_key: m.short_str("routing_key").unwrap_or_default().to_string(),
        properties: message.properties,
        body: message.body,
    }
}

fn returned_from(message: Message) -> Returned {
    let m = &message.method;
    Returned {
        reply_code: m.short("reply_code").unwrap_or(0),
        reply_text: m.short_str("reply_text").unwrap_or_default().to_string(),
        exchange: m.short_str("exchange").unwrap_or_default().to_string(),
        routing_key: m.short_str("routing_key").unwrap_or_default().to_string(),
        properties: message.properties,
        body: message.body,
    }
}

/// Await `fut`, failing with `Timeout` once the deadline passes.
async fn within<F: Future>(deadline: Option<(Instant, Duration)>, fut: F) -> Result<F::Output> {
    match deadline {
        Some((at, timeout)) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| Error::Timeout(timeout)),
        None => Ok(fut.await),
    }
}

/// A handle to one AMQP channel. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) timeout: Option<Duration>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Channel {
    pub fn id(&self) -> u16 {
        self.shared.id()
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// A handle to the same channel whose synchronous calls give up after
    /// `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Channel {
        Channel {
            shared: Arc::clone(&self.shared),
            timeout: Some(timeout),
        }
    }

    /// Send a synchronous method and wait for the broker's reply.
    ///
    /// Calls on one channel run one at a time, in the order they were made.
    /// `timeout` overrides the handle's deadline for this call.
    pub async fn call(&self, method: Method, timeout: Option<Duration>) -> Result<Reply> {
        self.shared
            .rpc(method, None, timeout.or(self.timeout))
            .await
    }

    /// Close the channel with reply code 200.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "Normal shutdown").await
    }

    pub async fn close_with(&self, code: u16, text: &str) -> Result<()> {
        self.shared.close(code, text).await
    }

    /// Wait until the channel is closed and return why.
    pub async fn closed(&self) -> Error {
        self.shared.closed().await
    }

    /// Handle unroutable mandatory publishes. Without a handler they are
    /// logged and dropped.
    ///
    /// The handler runs on the connection's reader task with the channel
    /// locked; it must not block or call back into this channel.
    pub fn on_return<F>(&self, handler: F)
    where
        F: Fn(Returned) + Send + Sync + 'static,
    {
        self.shared.set_return_handler(Arc::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirms_resolve_single_and_multiple() {
        let mut confirms = Confirms::new();
        let mut first = confirms.register();
        let mut second = confirms.register();
        let mut third = confirms.register();
        let mut fourth = confirms.register();

        confirms.resolve(2, true, Confirmation::Ack);
        assert_eq!(first.try_recv().unwrap(), Confirmation::Ack);
        assert_eq!(second.try_recv().unwrap(), Confirmation::Ack);
        assert!(third.try_recv().is_err());

        confirms.resolve(4, false, Confirmation::Nack);
        assert_eq!(fourth.try_recv().unwrap(), Confirmation::Nack);
        assert!(third.try_recv().is_err());
        assert_eq!(confirms.waiting.len(), 1);
    }

    #[test]
    fn short_text_respects_char_boundaries() {
        let long = "é".repeat(200);
        let clipped = short_text(&long);
        assert!(clipped.len() <= 255);
        assert!(clipped.chars().all(|c| c == 'é'));
        assert_eq!(short_text("ok"), "ok");
    }

    #[test]
    fn duplicate_tag_error_is_not_allowed() {
        let err = duplicate_tag("ctag");
        assert_eq!(err.reply_code(), Some(NOT_ALLOWED));
        assert!(err.to_string().contains("reuse consumer tag"));
    }

    #[test]
    fn deliver_maps_to_delivery() {
        let method = Method::with_args(
            method::BASIC_DELIVER,
            [
                ("consumer_tag", Arg::from("c1")),
                ("delivery_tag", Arg::LongLong(9)),
                ("redelivered", Arg::Bit(true)),
                ("exchange", Arg::from("ex")),
                ("routing_key", Arg::from("rk")),
            ],
        )
        .unwrap();
        let delivery = delivery_from(Message {
            method,
            properties: BasicProperties::default(),
            body: Bytes::from_static(b"coucou"),
        });
        assert_eq!(delivery.consumer_tag, "c1");
        assert_eq!(delivery.delivery_tag, 9);
        assert!(delivery.redelivered);
        assert_eq!(delivery.exchange, "ex");
        assert_eq!(delivery.routing_key, "rk");
        assert_eq!(delivery.body, Bytes::from_static(b"coucou"));
    }
}
