//! In-process AMQP 0-9-1 broker for integration tests.
//!
//! Sessions run over `tokio::io::duplex` pairs and share one broker state,
//! so several client connections can see the same exchanges, queues and
//! consumers. Only the behaviour the tests rely on is modelled.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amqprims_client::{Connection, ConnectionConfig};
use amqprims_frame::method::{self, Arg, MethodId};
use amqprims_frame::{
    body_chunks, AmqpCodec, BasicProperties, ContentHeader, Frame, FramePayload, Method,
    PROTOCOL_HEADER,
};
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// What the broker does when a hook matches an inbound method.
pub enum Action {
    /// Sleep, then handle the method normally.
    Delay(Duration),
    /// Send these frames instead of the normal handling.
    Replace(Vec<Frame>),
}

pub type Hook = Arc<dyn Fn(u16, &Method) -> Option<Action> + Send + Sync>;

#[derive(Clone)]
pub struct Settings {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
    /// Never write anything after Connection.OpenOk.
    pub silent: bool,
    pub hook: Option<Hook>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 0,
            silent: false,
            hook: None,
        }
    }
}

struct Stored {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Bytes,
}

#[derive(Clone)]
struct ConsumerRef {
    conn: u64,
    channel: u16,
    tag: String,
    out: mpsc::UnboundedSender<Vec<Frame>>,
    delivery_tags: Arc<AtomicU64>,
    frame_max: u32,
}

impl ConsumerRef {
    fn deliver(&self, message: &Stored) {
        let tag = self.delivery_tags.fetch_add(1, Ordering::SeqCst) + 1;
        let deliver = Method::with_args(
            method::BASIC_DELIVER,
            [
                ("consumer_tag", Arg::from(self.tag.as_str())),
                ("delivery_tag", Arg::LongLong(tag)),
                ("exchange", Arg::from(message.exchange.as_str())),
                ("routing_key", Arg::from(message.routing_key.as_str())),
            ],
        )
        .unwrap();
        let _ = self.out.send(content_frames(
            self.channel,
            deliver,
            &message.properties,
            &message.body,
            self.frame_max,
        ));
    }
}

#[derive(Default)]
struct Queue {
    owner: Option<u64>,
    messages: VecDeque<Stored>,
    consumers: Vec<ConsumerRef>,
    next: usize,
}

#[derive(Default)]
struct State {
    next_conn: u64,
    next_name: u64,
    exchanges: HashMap<String, String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<(String, String, String)>,
    received: Vec<(u64, u16, Method)>,
    heartbeats: usize,
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_string())
                    .into_iter()
                    .collect(),
            );
        }
        let kind = self.exchanges.get(exchange)?;
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(q, ex, key)| {
                ex == exchange && (kind == "fanout" || key == routing_key) && self.queues.contains_key(q)
            })
            .map(|(q, _, _)| q.clone())
            .collect();
        targets.dedup();
        Some(targets)
    }

    fn enqueue(&mut self, queue: &str, message: Stored) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        if q.consumers.is_empty() {
            q.messages.push_back(message);
            return;
        }
        let index = q.next % q.consumers.len();
        q.next = q.next.wrapping_add(1);
        q.consumers[index].deliver(&message);
    }

    fn drop_connection(&mut self, conn: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.conn != conn);
        }
        self.queues.retain(|_, q| q.owner != Some(conn));
    }

    fn drop_channel(&mut self, conn: u64, channel: u16) {
        for queue in self.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.conn == conn && c.channel == channel));
        }
    }
}

#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<State>>,
    settings: Settings,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let mut state = State::default();
        for (name, kind) in [
            ("amq.direct", "direct"),
            ("amq.fanout", "fanout"),
            ("amq.topic", "topic"),
        ] {
            state.exchanges.insert(name.into(), kind.into());
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            settings,
        }
    }

    /// Start a broker session and return the client end of its transport.
    pub fn accept(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let conn = {
            let mut state = self.state.lock().unwrap();
            state.next_conn += 1;
            state.next_conn
        };
        let session = Session {
            conn,
            state: Arc::clone(&self.state),
            settings: self.settings.clone(),
            channels: HashMap::new(),
            frame_max: self.settings.frame_max,
            out: None,
        };
        tokio::spawn(session.run(server));
        client
    }

    pub async fn connect(&self, config: ConnectionConfig) -> Connection {
        Connection::open(self.accept(), config)
            .await
            .expect("mock broker handshake should succeed")
    }

    /// Methods received so far, as (channel, method).
    pub fn received(&self) -> Vec<(u16, Method)> {
        self.state
            .lock()
            .unwrap()
            .received
            .iter()
            .map(|(_, channel, method)| (*channel, method.clone()))
            .collect()
    }

    pub fn received_ids(&self) -> Vec<MethodId> {
        self.received().iter().map(|(_, m)| m.id()).collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.state.lock().unwrap().heartbeats
    }

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }
}

#[derive(Default)]
struct ChannelState {
    closing: bool,
    confirm: bool,
    published: u64,
    delivery_tags: Arc<AtomicU64>,
    consumers: HashSet<String>,
    content: Option<(Method, Option<ContentHeader>, BytesMut)>,
}

struct Session {
    conn: u64,
    state: Arc<Mutex<State>>,
    settings: Settings,
    channels: HashMap<u16, ChannelState>,
    frame_max: u32,
    out: Option<mpsc::UnboundedSender<Vec<Frame>>>,
}

type Server = Framed<DuplexStream, AmqpCodec>;

async fn recv_method(server: &mut Server) -> Option<Method> {
    loop {
        match server.next().await?.ok()?.payload {
            FramePayload::Method(method) => return Some(method),
            FramePayload::Heartbeat => continue,
            _ => return None,
        }
    }
}

fn m(id: MethodId, named: Vec<(&str, Arg)>) -> Method {
    Method::with_args(id, named).unwrap()
}

fn content_frames(
    channel: u16,
    method: Method,
    properties: &BasicProperties,
    body: &Bytes,
    frame_max: u32,
) -> Vec<Frame> {
    let mut frames = vec![
        Frame::method(channel, method),
        Frame::header(
            channel,
            ContentHeader::new(method::class::BASIC, body.len() as u64, properties.clone()),
        ),
    ];
    frames.extend(body_chunks(body, frame_max).map(|chunk| Frame::body(channel, chunk)));
    frames
}

impl Session {
    async fn run(mut self, mut io: DuplexStream) {
        let mut header = [0u8; 8];
        if io.read_exact(&mut header).await.is_err() || &header != PROTOCOL_HEADER {
            return;
        }
        let mut server = Framed::new(io, AmqpCodec::default());
        if self.handshake(&mut server).await.is_none() {
            return;
        }

        let (mut sink, mut stream) = server.split();
        let (out, mut queue) = mpsc::unbounded_channel::<Vec<Frame>>();
        let silent = self.settings.silent;
        tokio::spawn(async move {
            while let Some(batch) = queue.recv().await {
                if silent {
                    continue;
                }
                for frame in batch {
                    if sink.feed(frame).await.is_err() {
                        return;
                    }
                }
                if sink.flush().await.is_err() {
                    return;
                }
            }
        });
        self.out = Some(out.clone());

        let heartbeat = self.settings.heartbeat;
        let heartbeats = out.clone();
        let beat = tokio::spawn(async move {
            if heartbeat == 0 {
                return;
            }
            let mut ticker = tokio::time::interval(Duration::from_secs(u64::from(heartbeat)));
            loop {
                ticker.tick().await;
                if heartbeats.send(vec![Frame::heartbeat()]).is_err() {
                    return;
                }
            }
        });

        while let Some(Ok(frame)) = stream.next().await {
            if !self.handle(frame).await {
                break;
            }
        }
        beat.abort();
        self.state.lock().unwrap().drop_connection(self.conn);
    }

    async fn handshake(&mut self, server: &mut Server) -> Option<()> {
        let start = m(
            method::CONNECTION_START,
            vec![
                ("version_minor", Arg::Octet(9)),
                ("mechanisms", Arg::LongStr(Bytes::from_static(b"PLAIN AMQPLAIN"))),
                ("locales", Arg::LongStr(Bytes::from_static(b"en_US"))),
            ],
        );
        server.send(Frame::method(0, start)).await.ok()?;

        let start_ok = recv_method(server).await?;
        if start_ok.long_str("response").map(|r| &r[..]) != Some(&b"\0guest\0guest"[..]) {
            let close = m(
                method::CONNECTION_CLOSE,
                vec![
                    ("reply_code", Arg::Short(403)),
                    (
                        "reply_text",
                        Arg::from("ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN"),
                    ),
                ],
            );
            server.send(Frame::method(0, close)).await.ok()?;
            let _ = recv_method(server).await;
            return None;
        }

        let tune = m(
            method::CONNECTION_TUNE,
            vec![
                ("channel_max", Arg::Short(self.settings.channel_max)),
                ("frame_max", Arg::Long(self.settings.frame_max)),
                ("heartbeat", Arg::Short(self.settings.heartbeat)),
            ],
        );
        server.send(Frame::method(0, tune)).await.ok()?;
        let tune_ok = recv_method(server).await?;
        self.frame_max = tune_ok.long("frame_max").unwrap_or(self.settings.frame_max);
        server.codec_mut().set_max_frame_size(self.frame_max as usize);

        recv_method(server).await?;
        let open_ok = m(method::CONNECTION_OPEN_OK, vec![]);
        server.send(Frame::method(0, open_ok)).await.ok()?;
        Some(())
    }

    fn send(&self, frames: Vec<Frame>) {
        if let Some(out) = &self.out {
            let _ = out.send(frames);
        }
    }

    fn reply(&self, channel: u16, method: Method) {
        self.send(vec![Frame::method(channel, method)]);
    }

    fn close_channel(&mut self, channel: u16, code: u16, text: String, cause: MethodId) {
        let close = m(
            method::CHANNEL_CLOSE,
            vec![
                ("reply_code", Arg::Short(code)),
                ("reply_text", Arg::from(text)),
                ("class_id", Arg::Short(cause.0)),
                ("method_id", Arg::Short(cause.1)),
            ],
        );
        self.reply(channel, close);
        self.state.lock().unwrap().drop_channel(self.conn, channel);
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.closing = true;
            ch.consumers.clear();
        }
    }

    /// Returns false when the session should end.
    async fn handle(&mut self, frame: Frame) -> bool {
        let channel = frame.channel;
        match frame.payload {
            FramePayload::Heartbeat => {
                self.state.lock().unwrap().heartbeats += 1;
                true
            }
            FramePayload::Method(method) => {
                self.state
                    .lock()
                    .unwrap()
                    .received
                    .push((self.conn, channel, method.clone()));

                if let Some(hook) = self.settings.hook.clone() {
                    match hook(channel, &method) {
                        Some(Action::Replace(frames)) => {
                            self.send(frames);
                            return true;
                        }
                        Some(Action::Delay(delay)) => tokio::time::sleep(delay).await,
                        None => {}
                    }
                }
                self.on_method(channel, method)
            }
            FramePayload::UnknownMethod { .. } => true,
            FramePayload::Header(header) => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    if let Some(content) = ch.content.as_mut() {
                        content.1 = Some(header);
                    }
                }
                self.maybe_publish(channel);
                true
            }
            FramePayload::Body(chunk) => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    if let Some(content) = ch.content.as_mut() {
                        content.2.extend_from_slice(&chunk);
                    }
                }
                self.maybe_publish(channel);
                true
            }
        }
    }

    fn on_method(&mut self, channel: u16, method: Method) -> bool {
        let id = method.id();
        if channel == 0 {
            if id == method::CONNECTION_CLOSE {
                self.reply(0, m(method::CONNECTION_CLOSE_OK, vec![]));
                return false;
            }
            return id != method::CONNECTION_CLOSE_OK;
        }

        if id == method::CHANNEL_OPEN {
            self.channels.insert(channel, ChannelState::default());
            self.reply(channel, m(method::CHANNEL_OPEN_OK, vec![]));
            return true;
        }
        if id == method::CHANNEL_CLOSE_OK {
            self.channels.remove(&channel);
            return true;
        }
        if id == method::CHANNEL_CLOSE {
            self.channels.remove(&channel);
            self.state.lock().unwrap().drop_channel(self.conn, channel);
            self.reply(channel, m(method::CHANNEL_CLOSE_OK, vec![]));
            return true;
        }
        match self.channels.get(&channel) {
            Some(ch) if !ch.closing => {}
            _ => return true,
        }

        let no_wait = method.no_wait();
        let text = |name: &str| method.short_str(name).unwrap_or_default().to_string();
        match id {
            method::EXCHANGE_DECLARE => {
                let name = text("exchange");
                let mut state = self.state.lock().unwrap();
                if method.bit("passive") == Some(true) && !state.exchanges.contains_key(&name) {
                    drop(state);
                    self.close_channel(channel, 404, format!("NOT_FOUND - no exchange '{name}'"), id);
                    return true;
                }
                state.exchanges.entry(name).or_insert_with(|| text("type"));
                drop(state);
                if !no_wait {
                    self.reply(channel, m(method::EXCHANGE_DECLARE_OK, vec![]));
                }
            }
            method::EXCHANGE_DELETE => {
                self.state.lock().unwrap().exchanges.remove(&text("exchange"));
                if !no_wait {
                    self.reply(channel, m(method::EXCHANGE_DELETE_OK, vec![]));
                }
            }
            method::EXCHANGE_BIND | method::EXCHANGE_UNBIND => {
                if !no_wait {
                    let ok = if id == method::EXCHANGE_BIND {
                        method::EXCHANGE_BIND_OK
                    } else {
                        method::EXCHANGE_UNBIND_OK
                    };
                    self.reply(channel, m(ok, vec![]));
                }
            }
            method::QUEUE_DECLARE => {
                let mut name = text("queue");
                let mut state = self.state.lock().unwrap();
                if name.is_empty() {
                    state.next_name += 1;
                    name = format!("amq.gen-{}", state.next_name);
                }
                let locked = state
                    .queues
                    .get(&name)
                    .is_some_and(|q| q.owner.is_some_and(|owner| owner != self.conn));
                if locked {
                    drop(state);
                    self.close_channel(
                        channel,
                        405,
                        format!("RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}'"),
                        id,
                    );
                    return true;
                }
                if method.bit("passive") == Some(true) && !state.queues.contains_key(&name) {
                    drop(state);
                    self.close_channel(channel, 404, format!("NOT_FOUND - no queue '{name}'"), id);
                    return true;
                }
                let exclusive = method.bit("exclusive") == Some(true);
                let conn = self.conn;
                let queue = state.queues.entry(name.clone()).or_insert_with(|| Queue {
                    owner: exclusive.then_some(conn),
                    ..Queue::default()
                });
                let counts = (queue.messages.len() as u32, queue.consumers.len() as u32);
                drop(state);
                if !no_wait {
                    self.reply(
                        channel,
                        m(
                            method::QUEUE_DECLARE_OK,
                            vec![
                                ("queue", Arg::from(name)),
                                ("message_count", Arg::Long(counts.0)),
                                ("consumer_count", Arg::Long(counts.1)),
                            ],
                        ),
                    );
                }
            }
            method::QUEUE_BIND => {
                let (queue, exchange) = (text("queue"), text("exchange"));
                let mut state = self.state.lock().unwrap();
                if !state.queues.contains_key(&queue) || !state.exchanges.contains_key(&exchange) {
                    drop(state);
                    self.close_channel(channel, 404, format!("NOT_FOUND - no exchange '{exchange}'"), id);
                    return true;
                }
                state.bindings.push((queue, exchange, text("routing_key")));
                drop(state);
                if !no_wait {
                    self.reply(channel, m(method::QUEUE_BIND_OK, vec![]));
                }
            }
            method::QUEUE_UNBIND => {
                let binding = (text("queue"), text("exchange"), text("routing_key"));
                self.state.lock().unwrap().bindings.retain(|b| *b != binding);
                self.reply(channel, m(method::QUEUE_UNBIND_OK, vec![]));
            }
            method::QUEUE_PURGE => {
                let count = self
                    .state
                    .lock()
                    .unwrap()
                    .queues
                    .get_mut(&text("queue"))
                    .map_or(0, |q| std::mem::take(&mut q.messages).len());
                self.reply(
                    channel,
                    m(method::QUEUE_PURGE_OK, vec![("message_count", Arg::Long(count as u32))]),
                );
            }
            method::QUEUE_DELETE => {
                let removed = self.state.lock().unwrap().queues.remove(&text("queue"));
                let count = removed.as_ref().map_or(0, |q| q.messages.len());
                for consumer in removed.iter().flat_map(|q| q.consumers.iter()) {
                    let cancel = m(
                        method::BASIC_CANCEL,
                        vec![
                            ("consumer_tag", Arg::from(consumer.tag.as_str())),
                            ("no_wait", Arg::Bit(true)),
                        ],
                    );
                    let _ = consumer.out.send(vec![Frame::method(consumer.channel, cancel)]);
                }
                if !no_wait {
                    self.reply(
                        channel,
                        m(method::QUEUE_DELETE_OK, vec![("message_count", Arg::Long(count as u32))]),
                    );
                }
            }
            method::BASIC_QOS => self.reply(channel, m(method::BASIC_QOS_OK, vec![])),
            method::BASIC_CONSUME => self.consume(channel, &method),
            method::BASIC_CANCEL => {
                let tag = text("consumer_tag");
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.consumers.remove(&tag);
                }
                let conn = self.conn;
                for queue in self.state.lock().unwrap().queues.values_mut() {
                    queue
                        .consumers
                        .retain(|c| !(c.conn == conn && c.channel == channel && c.tag == tag));
                }
                if !no_wait {
                    self.reply(
                        channel,
                        m(method::BASIC_CANCEL_OK, vec![("consumer_tag", Arg::from(tag))]),
                    );
                }
            }
            method::BASIC_PUBLISH => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.content = Some((method, None, BytesMut::new()));
                }
            }
            method::BASIC_GET => {
                let queue = text("queue");
                let mut state = self.state.lock().unwrap();
                let next = state.queues.get_mut(&queue).map(|q| {
                    let message = q.messages.pop_front();
                    (message, q.messages.len() as u32)
                });
                drop(state);
                match next {
                    None => {
                        self.close_channel(channel, 404, format!("NOT_FOUND - no queue '{queue}'"), id);
                    }
                    Some((None, _)) => {
                        self.reply(channel, m(method::BASIC_GET_EMPTY, vec![]));
                    }
                    Some((Some(message), remaining)) => {
                        let tags = Arc::clone(&self.channels[&channel].delivery_tags);
                        let tag = tags.fetch_add(1, Ordering::SeqCst) + 1;
                        let get_ok = m(
                            method::BASIC_GET_OK,
                            vec![
                                ("delivery_tag", Arg::LongLong(tag)),
                                ("exchange", Arg::from(message.exchange.as_str())),
                                ("routing_key", Arg::from(message.routing_key.as_str())),
                                ("message_count", Arg::Long(remaining)),
                            ],
                        );
                        self.send(content_frames(
                            channel,
                            get_ok,
                            &message.properties,
                            &message.body,
                            self.frame_max,
                        ));
                    }
                }
            }
            method::BASIC_ACK | method::BASIC_NACK | method::BASIC_REJECT => {}
            method::BASIC_RECOVER => self.reply(channel, m(method::BASIC_RECOVER_OK, vec![])),
            method::CONFIRM_SELECT => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.confirm = true;
                }
                if !no_wait {
                    self.reply(channel, m(method::CONFIRM_SELECT_OK, vec![]));
                }
            }
            method::TX_SELECT => self.reply(channel, m(method::TX_SELECT_OK, vec![])),
            method::TX_COMMIT => self.reply(channel, m(method::TX_COMMIT_OK, vec![])),
            method::TX_ROLLBACK => self.reply(channel, m(method::TX_ROLLBACK_OK, vec![])),
            method::CHANNEL_FLOW => {
                let active = method.bit("active").unwrap_or(true);
                self.reply(
                    channel,
                    m(method::CHANNEL_FLOW_OK, vec![("active", Arg::Bit(active))]),
                );
            }
            method::CHANNEL_FLOW_OK => {}
            _ => {
                self.close_channel(channel, 540, format!("NOT_IMPLEMENTED - {}", method.name()), id);
            }
        }
        true
    }

    fn consume(&mut self, channel: u16, method: &Method) {
        let id = method.id();
        let queue = method.short_str("queue").unwrap_or_default().to_string();
        let mut tag = method.short_str("consumer_tag").unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        if tag.is_empty() {
            state.next_name += 1;
            tag = format!("amq.ctag-{}", state.next_name);
        }

        let duplicate = self.channels[&channel].consumers.contains(&tag);
        if duplicate {
            drop(state);
            self.close_channel(
                channel,
                530,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"),
                id,
            );
            return;
        }
        if !state.queues.contains_key(&queue) {
            drop(state);
            self.close_channel(channel, 404, format!("NOT_FOUND - no queue '{queue}'"), id);
            return;
        }

        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        ch.consumers.insert(tag.clone());
        let consumer = ConsumerRef {
            conn: self.conn,
            channel,
            tag: tag.clone(),
            out: self.out.clone().unwrap(),
            delivery_tags: Arc::clone(&ch.delivery_tags),
            frame_max: self.frame_max,
        };

        if !method.no_wait() {
            let ok = m(method::BASIC_CONSUME_OK, vec![("consumer_tag", Arg::from(tag))]);
            let _ = consumer.out.send(vec![Frame::method(channel, ok)]);
        }
        let q = state.queues.get_mut(&queue).unwrap();
        while let Some(message) = q.messages.pop_front() {
            consumer.deliver(&message);
        }
        q.consumers.push(consumer);
    }

    fn maybe_publish(&mut self, channel: u16) {
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        let complete = matches!(
            &ch.content,
            Some((_, Some(header), body)) if header.body_size == body.len() as u64
        );
        if !complete {
            return;
        }
        let Some((publish, Some(header), body)) = ch.content.take() else {
            return;
        };
        let confirm = ch.confirm.then(|| {
            ch.published += 1;
            ch.published
        });

        let exchange = publish.short_str("exchange").unwrap_or_default().to_string();
        let routing_key = publish.short_str("routing_key").unwrap_or_default().to_string();
        let message = Stored {
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            properties: header.properties,
            body: body.freeze(),
        };

        let mut state = self.state.lock().unwrap();
        let Some(targets) = state.route(&exchange, &routing_key) else {
            drop(state);
            self.close_channel(
                channel,
                404,
                format!("NOT_FOUND - no exchange '{exchange}'"),
                method::BASIC_PUBLISH,
            );
            return;
        };

        if targets.is_empty() && publish.bit("mandatory") == Some(true) {
            let returned = m(
                method::BASIC_RETURN,
                vec![
                    ("reply_code", Arg::Short(312)),
                    ("reply_text", Arg::from("NO_ROUTE")),
                    ("exchange", Arg::from(exchange.as_str())),
                    ("routing_key", Arg::from(routing_key.as_str())),
                ],
            );
            self.send(content_frames(
                channel,
                returned,
                &message.properties,
                &message.body,
                self.frame_max,
            ));
        }
        for queue in &targets {
            state.enqueue(
                queue,
                Stored {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                },
            );
        }
        drop(state);

        if let Some(tag) = confirm {
            self.reply(
                channel,
                m(
                    method::BASIC_ACK,
                    vec![("delivery_tag", Arg::LongLong(tag)), ("multiple", Arg::Bit(false))],
                ),
            );
        }
    }
}

/// Collects deliveries into a channel for assertions.
pub fn collector() -> (
    amqprims_client::Callback,
    mpsc::UnboundedReceiver<amqprims_client::Delivery>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (amqprims_client::Callback::channel(tx), rx)
}

/// Receive the next delivery or fail after two seconds.
pub async fn next_delivery(
    rx: &mut mpsc::UnboundedReceiver<amqprims_client::Delivery>,
) -> amqprims_client::Delivery {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery should arrive in time")
        .expect("consumer should still be registered")
}
