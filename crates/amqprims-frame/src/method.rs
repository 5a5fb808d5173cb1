//! Method registry and method payload marshalling.
//!
//! Every AMQP 0-9-1 method is described by a static [`MethodDescriptor`]:
//! its (class-id, method-id), ordered field schema, and the replies the
//! peer may answer a synchronous request with. [`Method`] values carry
//! ordered [`Arg`]s and are encoded/decoded by walking their descriptor, so
//! adding a method means adding a table row, not writing a codec.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::types::{
    read_long_str, read_short_str, read_table, read_u16, read_u32, read_u64, read_u8,
    write_long_str, write_short_str, write_table, FieldTable,
};

/// Class ids.
pub mod class {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
    pub const CONFIRM: u16 = 85;
    pub const TX: u16 = 90;
}

/// A (class-id, method-id) pair.
pub type MethodId = (u16, u16);

pub const CONNECTION_START: MethodId = (10, 10);
pub const CONNECTION_START_OK: MethodId = (10, 11);
pub const CONNECTION_SECURE: MethodId = (10, 20);
pub const CONNECTION_SECURE_OK: MethodId = (10, 21);
pub const CONNECTION_TUNE: MethodId = (10, 30);
pub const CONNECTION_TUNE_OK: MethodId = (10, 31);
pub const CONNECTION_OPEN: MethodId = (10, 40);
pub const CONNECTION_OPEN_OK: MethodId = (10, 41);
pub const CONNECTION_CLOSE: MethodId = (10, 50);
pub const CONNECTION_CLOSE_OK: MethodId = (10, 51);
pub const CONNECTION_BLOCKED: MethodId = (10, 60);
pub const CONNECTION_UNBLOCKED: MethodId = (10, 61);

pub const CHANNEL_OPEN: MethodId = (20, 10);
pub const CHANNEL_OPEN_OK: MethodId = (20, 11);
pub const CHANNEL_FLOW: MethodId = (20, 20);
pub const CHANNEL_FLOW_OK: MethodId = (20, 21);
pub const CHANNEL_CLOSE: MethodId = (20, 40);
pub const CHANNEL_CLOSE_OK: MethodId = (20, 41);

pub const EXCHANGE_DECLARE: MethodId = (40, 10);
pub const EXCHANGE_DECLARE_OK: MethodId = (40, 11);
pub const EXCHANGE_DELETE: MethodId = (40, 20);
pub const EXCHANGE_DELETE_OK: MethodId = (40, 21);
pub const EXCHANGE_BIND: MethodId = (40, 30);
pub const EXCHANGE_BIND_OK: MethodId = (40, 31);
pub const EXCHANGE_UNBIND: MethodId = (40, 40);
pub const EXCHANGE_UNBIND_OK: MethodId = (40, 51);

pub const QUEUE_DECLARE: MethodId = (50, 10);
pub const QUEUE_DECLARE_OK: MethodId = (50, 11);
pub const QUEUE_BIND: MethodId = (50, 20);
pub const QUEUE_BIND_OK: MethodId = (50, 21);
pub const QUEUE_PURGE: MethodId = (50, 30);
pub const QUEUE_PURGE_OK: MethodId = (50, 31);
pub const QUEUE_DELETE: MethodId = (50, 40);
pub const QUEUE_DELETE_OK: MethodId = (50, 41);
pub const QUEUE_UNBIND: MethodId = (50, 50);
pub const QUEUE_UNBIND_OK: MethodId = (50, 51);

pub const BASIC_QOS: MethodId = (60, 10);
pub const BASIC_QOS_OK: MethodId = (60, 11);
pub const BASIC_CONSUME: MethodId = (60, 20);
pub const BASIC_CONSUME_OK: MethodId = (60, 21);
pub const BASIC_CANCEL: MethodId = (60, 30);
pub const BASIC_CANCEL_OK: MethodId = (60, 31);
pub const BASIC_PUBLISH: MethodId = (60, 40);
pub const BASIC_RETURN: MethodId = (60, 50);
pub const BASIC_DELIVER: MethodId = (60, 60);
pub const BASIC_GET: MethodId = (60, 70);
pub const BASIC_GET_OK: MethodId = (60, 71);
pub const BASIC_GET_EMPTY: MethodId = (60, 72);
pub const BASIC_ACK: MethodId = (60, 80);
pub const BASIC_REJECT: MethodId = (60, 90);
pub const BASIC_RECOVER_ASYNC: MethodId = (60, 100);
pub const BASIC_RECOVER: MethodId = (60, 110);
pub const BASIC_RECOVER_OK: MethodId = (60, 111);
pub const BASIC_NACK: MethodId = (60, 120);

pub const CONFIRM_SELECT: MethodId = (85, 10);
pub const CONFIRM_SELECT_OK: MethodId = (85, 11);

pub const TX_SELECT: MethodId = (90, 10);
pub const TX_SELECT_OK: MethodId = (90, 11);
pub const TX_COMMIT: MethodId = (90, 20);
pub const TX_COMMIT_OK: MethodId = (90, 21);
pub const TX_ROLLBACK: MethodId = (90, 30);
pub const TX_ROLLBACK_OK: MethodId = (90, 31);

/// Wire type of a single method field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Octet,
    Short,
    Long,
    LongLong,
    ShortStr,
    LongStr,
    Bit,
    Table,
    Timestamp,
}

/// One named field in a method's schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Static description of one method.
#[derive(Debug)]
pub struct MethodDescriptor {
    pub class_id: u16,
    pub method_id: u16,
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
    /// Method ids (same class) that answer this method when it is sent as
    /// a synchronous request. Empty for asynchronous methods.
    pub replies: &'static [u16],
}

impl MethodDescriptor {
    pub fn id(&self) -> MethodId {
        (self.class_id, self.method_id)
    }

    /// Whether sending this method expects a reply.
    pub fn is_synchronous(&self) -> bool {
        !self.replies.is_empty()
    }

    /// Whether `reply` answers this method.
    pub fn accepts_reply(&self, reply: MethodId) -> bool {
        reply.0 == self.class_id && self.replies.contains(&reply.1)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

macro_rules! field {
    ($name:literal, $kind:ident) => {
        FieldSpec {
            name: $name,
            kind: FieldKind::$kind,
        }
    };
}

const fn method(
    id: MethodId,
    name: &'static str,
    fields: &'static [FieldSpec],
    replies: &'static [u16],
) -> MethodDescriptor {
    MethodDescriptor {
        class_id: id.0,
        method_id: id.1,
        name,
        fields,
        replies,
    }
}

const CLOSE_FIELDS: &[FieldSpec] = &[
    field!("reply_code", Short),
    field!("reply_text", ShortStr),
    field!("class_id", Short),
    field!("method_id", Short),
];

const TUNE_FIELDS: &[FieldSpec] = &[
    field!("channel_max", Short),
    field!("frame_max", Long),
    field!("heartbeat", Short),
];

const EXCHANGE_BIND_FIELDS: &[FieldSpec] = &[
    field!("reserved_1", Short),
    field!("destination", ShortStr),
    field!("source", ShortStr),
    field!("routing_key", ShortStr),
    field!("no_wait", Bit),
    field!("arguments", Table),
];

static REGISTRY: &[MethodDescriptor] = &[
    // connection
    method(
        CONNECTION_START,
        "connection.start",
        &[
            field!("version_major", Octet),
            field!("version_minor", Octet),
            field!("server_properties", Table),
            field!("mechanisms", LongStr),
            field!("locales", LongStr),
        ],
        &[11],
    ),
    method(
        CONNECTION_START_OK,
        "connection.start-ok",
        &[
            field!("client_properties", Table),
            field!("mechanism", ShortStr),
            field!("response", LongStr),
            field!("locale", ShortStr),
        ],
        &[],
    ),
    method(
        CONNECTION_SECURE,
        "connection.secure",
        &[field!("challenge", LongStr)],
        &[21],
    ),
    method(
        CONNECTION_SECURE_OK,
        "connection.secure-ok",
        &[field!("response", LongStr)],
        &[],
    ),
    method(CONNECTION_TUNE, "connection.tune", TUNE_FIELDS, &[31]),
    method(CONNECTION_TUNE_OK, "connection.tune-ok", TUNE_FIELDS, &[]),
    method(
        CONNECTION_OPEN,
        "connection.open",
        &[
            field!("virtual_host", ShortStr),
            field!("reserved_1", ShortStr),
            field!("reserved_2", Bit),
        ],
        &[41],
    ),
    method(
        CONNECTION_OPEN_OK,
        "connection.open-ok",
        &[field!("reserved_1", ShortStr)],
        &[],
    ),
    method(CONNECTION_CLOSE, "connection.close", CLOSE_FIELDS, &[51]),
    method(CONNECTION_CLOSE_OK, "connection.close-ok", &[], &[]),
    method(
        CONNECTION_BLOCKED,
        "connection.blocked",
        &[field!("reason", ShortStr)],
        &[],
    ),
    method(CONNECTION_UNBLOCKED, "connection.unblocked", &[], &[]),
    // channel
    method(
        CHANNEL_OPEN,
        "channel.open",
        &[field!("reserved_1", ShortStr)],
        &[11],
    ),
    method(
        CHANNEL_OPEN_OK,
        "channel.open-ok",
        &[field!("reserved_1", LongStr)],
        &[],
    ),
    method(CHANNEL_FLOW, "channel.flow", &[field!("active", Bit)], &[21]),
    method(
        CHANNEL_FLOW_OK,
        "channel.flow-ok",
        &[field!("active", Bit)],
        &[],
    ),
    method(CHANNEL_CLOSE, "channel.close", CLOSE_FIELDS, &[41]),
    method(CHANNEL_CLOSE_OK, "channel.close-ok", &[], &[]),
    // exchange
    method(
        EXCHANGE_DECLARE,
        "exchange.declare",
        &[
            field!("reserved_1", Short),
            field!("exchange", ShortStr),
            field!("type", ShortStr),
            field!("passive", Bit),
            field!("durable", Bit),
            field!("auto_delete", Bit),
            field!("internal", Bit),
            field!("no_wait", Bit),
            field!("arguments", Table),
        ],
        &[11],
    ),
    method(EXCHANGE_DECLARE_OK, "exchange.declare-ok", &[], &[]),
    method(
        EXCHANGE_DELETE,
        "exchange.delete",
        &[
            field!("reserved_1", Short),
            field!("exchange", ShortStr),
            field!("if_unused", Bit),
            field!("no_wait", Bit),
        ],
        &[21],
    ),
    method(EXCHANGE_DELETE_OK, "exchange.delete-ok", &[], &[]),
    method(
        EXCHANGE_BIND,
        "exchange.bind",
        EXCHANGE_BIND_FIELDS,
        &[31],
    ),
    method(EXCHANGE_BIND_OK, "exchange.bind-ok", &[], &[]),
    method(
        EXCHANGE_UNBIND,
        "exchange.unbind",
        EXCHANGE_BIND_FIELDS,
        &[51],
    ),
    method(EXCHANGE_UNBIND_OK, "exchange.unbind-ok", &[], &[]),
    // queue
    method(
        QUEUE_DECLARE,
        "queue.declare",
        &[
            field!("reserved_1", Short),
            field!("queue", ShortStr),
            field!("passive", Bit),
            field!("durable", Bit),
            field!("exclusive", Bit),
            field!("auto_delete", Bit),
            field!("no_wait", Bit),
            field!("arguments", Table),
        ],
        &[11],
    ),
    method(
        QUEUE_DECLARE_OK,
        "queue.declare-ok",
        &[
            field!("queue", ShortStr),
            field!("message_count", Long),
            field!("consumer_count", Long),
        ],
        &[],
    ),
    method(
        QUEUE_BIND,
        "queue.bind",
        &[
            field!("reserved_1", Short),
            field!("queue", ShortStr),
            field!("exchange", ShortStr),
            field!("routing_key", ShortStr),
            field!("no_wait", Bit),
            field!("arguments", Table),
        ],
        &[21],
    ),
    method(QUEUE_BIND_OK, "queue.bind-ok", &[], &[]),
    method(
        QUEUE_PURGE,
        "queue.purge",
        &[
            field!("reserved_1", Short),
            field!("queue", ShortStr),
            field!("no_wait", Bit),
        ],
        &[31],
    ),
    method(
        QUEUE_PURGE_OK,
        "queue.purge-ok",
        &[field!("message_count", Long)],
        &[],
    ),
    method(
        QUEUE_DELETE,
        "queue.delete",
        &[
            field!("reserved_1", Short),
            field!("queue", ShortStr),
            field!("if_unused", Bit),
            field!("if_empty", Bit),
            field!("no_wait", Bit),
        ],
        &[41],
    ),
    method(
        QUEUE_DELETE_OK,
        "queue.delete-ok",
        &[field!("message_count", Long)],
        &[],
    ),
    method(
        QUEUE_UNBIND,
        "queue.unbind",
        &[
            field!("reserved_1", Short),
            field!("queue", ShortStr),
            field!("exchange", ShortStr),
            field!("routing_key", ShortStr),
            field!("arguments", Table),
        ],
        &[51],
    ),
    method(QUEUE_UNBIND_OK, "queue.unbind-ok", &[], &[]),
    // basic
    method(
        BASIC_QOS,
        "basic.qos",
        &[
            field!("prefetch_size", Long),
            field!("prefetch_count", Short),
            field!("global", Bit),
        ],
        &[11],
    ),
    method(BASIC_QOS_OK, "basic.qos-ok", &[], &[]),
    method(
        BASIC_CONSUME,
        "basic.consume",
        &[
            field!("reserved_1", Short),
            field!("queue", ShortStr),
            field!("consumer_tag", ShortStr),
            field!("no_local", Bit),
            field!("no_ack", Bit),
            field!("exclusive", Bit),
            field!("no_wait", Bit),
            field!("arguments", Table),
        ],
        &[21],
    ),
    method(
        BASIC_CONSUME_OK,
        "basic.consume-ok",
        &[field!("consumer_tag", ShortStr)],
        &[],
    ),
    method(
        BASIC_CANCEL,
        "basic.cancel",
        &[field!("consumer_tag", ShortStr), field!("no_wait", Bit)],
        &[31],
    ),
    method(
        BASIC_CANCEL_OK,
        "basic.cancel-ok",
        &[field!("consumer_tag", ShortStr)],
        &[],
    ),
    method(
        BASIC_PUBLISH,
        "basic.publish",
        &[
            field!("reserved_1", Short),
            field!("exchange", ShortStr),
            field!("routing_key", ShortStr),
            field!("mandatory", Bit),
            field!("immediate", Bit),
        ],
        &[],
    ),
    method(
        BASIC_RETURN,
        "basic.return",
        &[
            field!("reply_code", Short),
            field!("reply_text", ShortStr),
            field!("exchange", ShortStr),
            field!("routing_key", ShortStr),
        ],
        &[],
    ),
    method(
        BASIC_DELIVER,
        "basic.deliver",
        &[
            field!("consumer_tag", ShortStr),
            field!("delivery_tag", LongLong),
            field!("redelivered", Bit),
            field!("exchange", ShortStr),
            field!("routing_key", ShortStr),
        ],
        &[],
    ),
    method(
        BASIC_GET,
        "basic.get",
        &[
            field!("reserved_1", Short),
            field!("queue", ShortStr),
            field!("no_ack", Bit),
        ],
        &[71, 72],
    ),
    method(
        BASIC_GET_OK,
        "basic.get-ok",
        &[
            field!("delivery_tag", LongLong),
            field!("redelivered", Bit),
            field!("exchange", ShortStr),
            field!("routing_key", ShortStr),
            field!("message_count", Long),
        ],
        &[],
    ),
    method(
        BASIC_GET_EMPTY,
        "basic.get-empty",
        &[field!("reserved_1", ShortStr)],
        &[],
    ),
    method(
        BASIC_ACK,
        "basic.ack",
        &[field!("delivery_tag", LongLong), field!("multiple", Bit)],
        &[],
    ),
    method(
        BASIC_REJECT,
        "basic.reject",
        &[field!("delivery_tag", LongLong), field!("requeue", Bit)],
        &[],
    ),
    method(
        BASIC_RECOVER_ASYNC,
        "basic.recover-async",
        &[field!("requeue", Bit)],
        &[],
    ),
    method(
        BASIC_RECOVER,
        "basic.recover",
        &[field!("requeue", Bit)],
        &[111],
    ),
    method(BASIC_RECOVER_OK, "basic.recover-ok", &[], &[]),
    method(
        BASIC_NACK,
        "basic.nack",
        &[
            field!("delivery_tag", LongLong),
            field!("multiple", Bit),
            field!("requeue", Bit),
        ],
        &[],
    ),
    // confirm
    method(
        CONFIRM_SELECT,
        "confirm.select",
        &[field!("no_wait", Bit)],
        &[11],
    ),
    method(CONFIRM_SELECT_OK, "confirm.select-ok", &[], &[]),
    // tx
    method(TX_SELECT, "tx.select", &[], &[11]),
    method(TX_SELECT_OK, "tx.select-ok", &[], &[]),
    method(TX_COMMIT, "tx.commit", &[], &[21]),
    method(TX_COMMIT_OK, "tx.commit-ok", &[], &[]),
    method(TX_ROLLBACK, "tx.rollback", &[], &[31]),
    method(TX_ROLLBACK_OK, "tx.rollback-ok", &[], &[]),
];

/// Look up the descriptor for a (class-id, method-id) pair.
pub fn lookup(class_id: u16, method_id: u16) -> Result<&'static MethodDescriptor> {
    REGISTRY
        .iter()
        .find(|d| d.class_id == class_id && d.method_id == method_id)
        .ok_or(FrameError::UnknownMethod {
            class_id,
            method_id,
        })
}

/// Every registered method descriptor.
pub fn descriptors() -> &'static [MethodDescriptor] {
    REGISTRY
}

/// One method argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Octet(u8),
    Short(u16),
    Long(u32),
    LongLong(u64),
    ShortStr(String),
    LongStr(Bytes),
    Bit(bool),
    Table(FieldTable),
    Timestamp(u64),
}

impl Arg {
    pub fn kind(&self) -> FieldKind {
        match self {
            Arg::Octet(_) => FieldKind::Octet,
            Arg::Short(_) => FieldKind::Short,
            Arg::Long(_) => FieldKind::Long,
            Arg::LongLong(_) => FieldKind::LongLong,
            Arg::ShortStr(_) => FieldKind::ShortStr,
            Arg::LongStr(_) => FieldKind::LongStr,
            Arg::Bit(_) => FieldKind::Bit,
            Arg::Table(_) => FieldKind::Table,
            Arg::Timestamp(_) => FieldKind::Timestamp,
        }
    }

    /// Zero value for a field kind (empty string, 0, false, empty table).
    pub fn default_for(kind: FieldKind) -> Arg {
        match kind {
            FieldKind::Octet => Arg::Octet(0),
            FieldKind::Short => Arg::Short(0),
            FieldKind::Long => Arg::Long(0),
            FieldKind::LongLong => Arg::LongLong(0),
            FieldKind::ShortStr => Arg::ShortStr(String::new()),
            FieldKind::LongStr => Arg::LongStr(Bytes::new()),
            FieldKind::Bit => Arg::Bit(false),
            FieldKind::Table => Arg::Table(FieldTable::new()),
            FieldKind::Timestamp => Arg::Timestamp(0),
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::ShortStr(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::ShortStr(value)
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Bit(value)
    }
}

impl From<u16> for Arg {
    fn from(value: u16) -> Self {
        Arg::Short(value)
    }
}

impl From<u32> for Arg {
    fn from(value: u32) -> Self {
        Arg::Long(value)
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Arg::LongLong(value)
    }
}

impl From<FieldTable> for Arg {
    fn from(value: FieldTable) -> Self {
        Arg::Table(value)
    }
}

/// A decoded or to-be-encoded method: descriptor plus ordered arguments.
#[derive(Clone)]
pub struct Method {
    descriptor: &'static MethodDescriptor,
    args: Vec<Arg>,
}

impl Method {
    /// Build a method, validating arguments against the field schema.
    pub fn new(id: MethodId, args: Vec<Arg>) -> Result<Self> {
        let descriptor = lookup(id.0, id.1)?;
        if args.len() != descriptor.fields.len() {
            return Err(FrameError::InvalidField {
                method: descriptor.name,
                field: "*",
                reason: format!(
                    "expected {} arguments, got {}",
                    descriptor.fields.len(),
                    args.len()
                ),
            });
        }
        for (field_spec, arg) in descriptor.fields.iter().zip(&args) {
            if field_spec.kind != arg.kind() {
                return Err(FrameError::InvalidField {
                    method: descriptor.name,
                    field: field_spec.name,
                    reason: format!("expected {:?}, got {:?}", field_spec.kind, arg.kind()),
                });
            }
            if let Arg::ShortStr(value) = arg {
                if value.len() > 255 {
                    return Err(FrameError::ShortStringTooLong { len: value.len() });
                }
            }
        }
        Ok(Self { descriptor, args })
    }

    /// Build a method from named arguments; unnamed fields take their zero
    /// value.
    pub fn with_args<'a>(
        id: MethodId,
        named: impl IntoIterator<Item = (&'a str, Arg)>,
    ) -> Result<Self> {
        let descriptor = lookup(id.0, id.1)?;
        let mut args: Vec<Arg> = descriptor
            .fields
            .iter()
            .map(|field_spec| Arg::default_for(field_spec.kind))
            .collect();
        for (name, arg) in named {
            let index = descriptor
                .field_index(name)
                .ok_or_else(|| FrameError::InvalidField {
                    method: descriptor.name,
                    field: "?",
                    reason: format!("no field named '{name}'"),
                })?;
            args[index] = arg;
        }
        Self::new(id, args)
    }

    pub fn id(&self) -> MethodId {
        self.descriptor.id()
    }

    pub fn class_id(&self) -> u16 {
        self.descriptor.class_id
    }

    pub fn method_id(&self) -> u16 {
        self.descriptor.method_id
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn descriptor(&self) -> &'static MethodDescriptor {
        self.descriptor
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Look up an argument by field name.
    pub fn arg(&self, name: &str) -> Option<&Arg> {
        self.descriptor
            .field_index(name)
            .and_then(|index| self.args.get(index))
    }

    pub fn octet(&self, name: &str) -> Option<u8> {
        match self.arg(name)? {
            Arg::Octet(v) => Some(*v),
            _ => None,
        }
    }

    pub fn short(&self, name: &str) -> Option<u16> {
        match self.arg(name)? {
            Arg::Short(v) => Some(*v),
            _ => None,
        }
    }

    pub fn long(&self, name: &str) -> Option<u32> {
        match self.arg(name)? {
            Arg::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn long_long(&self, name: &str) -> Option<u64> {
        match self.arg(name)? {
            Arg::LongLong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn short_str(&self, name: &str) -> Option<&str> {
        match self.arg(name)? {
            Arg::ShortStr(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn long_str(&self, name: &str) -> Option<&Bytes> {
        match self.arg(name)? {
            Arg::LongStr(v) => Some(v),
            _ => None,
        }
    }

    pub fn bit(&self, name: &str) -> Option<bool> {
        match self.arg(name)? {
            Arg::Bit(v) => Some(*v),
            _ => None,
        }
    }

    pub fn table(&self, name: &str) -> Option<&FieldTable> {
        match self.arg(name)? {
            Arg::Table(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this method was sent with `no_wait` set.
    pub fn no_wait(&self) -> bool {
        self.bit("no_wait").unwrap_or(false)
    }

    /// Encode class-id, method-id and arguments into a method frame payload.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u16(self.descriptor.class_id);
        dst.put_u16(self.descriptor.method_id);

        let mut bits = BitPacker::default();
        for (field_spec, arg) in self.descriptor.fields.iter().zip(&self.args) {
            if let Arg::Bit(value) = arg {
                bits.push(dst, *value);
                continue;
            }
            bits.flush(dst);
            match arg {
                Arg::Octet(v) => dst.put_u8(*v),
                Arg::Short(v) => dst.put_u16(*v),
                Arg::Long(v) => dst.put_u32(*v),
                Arg::LongLong(v) | Arg::Timestamp(v) => dst.put_u64(*v),
                Arg::ShortStr(v) => {
                    write_short_str(dst, v).map_err(|err| FrameError::InvalidField {
                        method: self.descriptor.name,
                        field: field_spec.name,
                        reason: err.to_string(),
                    })?
                }
                Arg::LongStr(v) => write_long_str(dst, v)?,
                Arg::Table(v) => write_table(dst, v)?,
                Arg::Bit(_) => unreachable!("bits are packed above"),
            }
        }
        bits.flush(dst);
        Ok(())
    }

    /// Decode a method frame payload.
    pub fn decode(mut src: Bytes) -> Result<Self> {
        let class_id = read_u16(&mut src)?;
        let method_id = read_u16(&mut src)?;
        let descriptor = lookup(class_id, method_id)?;

        let mut args = Vec::with_capacity(descriptor.fields.len());
        let mut bits = BitUnpacker::default();
        for field_spec in descriptor.fields {
            if field_spec.kind == FieldKind::Bit {
                args.push(Arg::Bit(bits.next(&mut src)?));
                continue;
            }
            bits.reset();
            let arg = match field_spec.kind {
                FieldKind::Octet => Arg::Octet(read_u8(&mut src)?),
                FieldKind::Short => Arg::Short(read_u16(&mut src)?),
                FieldKind::Long => Arg::Long(read_u32(&mut src)?),
                FieldKind::LongLong => Arg::LongLong(read_u64(&mut src)?),
                FieldKind::Timestamp => Arg::Timestamp(read_u64(&mut src)?),
                FieldKind::ShortStr => Arg::ShortStr(read_short_str(&mut src)?),
                FieldKind::LongStr => Arg::LongStr(read_long_str(&mut src)?),
                FieldKind::Table => Arg::Table(read_table(&mut src)?),
                FieldKind::Bit => unreachable!("bits are unpacked above"),
            };
            args.push(arg);
        }

        if src.has_remaining() {
            return Err(FrameError::MalformedFrame(format!(
                "{} trailing bytes after {}",
                src.remaining(),
                descriptor.name
            )));
        }

        Ok(Self { descriptor, args })
    }
}

impl PartialEq for Method {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.args == other.args
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct(self.descriptor.name);
        for (field_spec, arg) in self.descriptor.fields.iter().zip(&self.args) {
            match (field_spec.name, arg) {
                // PLAIN credentials travel in start-ok's response field.
                ("response", Arg::LongStr(v)) => {
                    dbg.field(field_spec.name, &format_args!("<redacted:{} bytes>", v.len()));
                }
                _ => {
                    dbg.field(field_spec.name, arg);
                }
            }
        }
        dbg.finish()
    }
}

/// Packs consecutive bit fields into octets, low bit first.
#[derive(Default)]
struct BitPacker {
    byte: u8,
    count: u8,
}

impl BitPacker {
    fn push(&mut self, dst: &mut BytesMut, value: bool) {
        if value {
            self.byte |= 1 << self.count;
        }
        self.count += 1;
        if self.count == 8 {
            self.flush(dst);
        }
    }

    fn flush(&mut self, dst: &mut BytesMut) {
        if self.count > 0 {
            dst.put_u8(self.byte);
            self.byte = 0;
            self.count = 0;
        }
    }
}

#[derive(Default)]
struct BitUnpacker {
    byte: u8,
    count: u8,
}

impl BitUnpacker {
    fn next(&mut self, src: &mut Bytes) -> Result<bool> {
        if self.count == 0 || self.count == 8 {
            self.byte = read_u8(src)?;
            self.count = 0;
        }
        let value = self.byte & (1 << self.count) != 0;
        self.count += 1;
        Ok(value)
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    /// A non-zero sample argument for each field kind.
    fn sample_arg(kind: FieldKind, seed: usize) -> Arg {
        match kind {
            FieldKind::Octet => Arg::Octet(seed as u8),
            FieldKind::Short => Arg::Short(1000 + seed as u16),
            FieldKind::Long => Arg::Long(70_000 + seed as u32),
            FieldKind::LongLong => Arg::LongLong(u64::MAX - seed as u64),
            FieldKind::ShortStr => Arg::ShortStr(format!("field-{seed}")),
            FieldKind::LongStr => Arg::LongStr(Bytes::from(format!("\0long\0{seed}"))),
            FieldKind::Bit => Arg::Bit(seed % 2 == 0),
            FieldKind::Table => {
                let mut table = FieldTable::new();
                table.insert(format!("k{seed}"), FieldValue::LongInt(seed as i32));
                Arg::Table(table)
            }
            FieldKind::Timestamp => Arg::Timestamp(1_700_000_000 + seed as u64),
        }
    }

    #[test]
    fn every_registered_method_roundtrips() {
        for descriptor in descriptors() {
            let args = descriptor
                .fields
                .iter()
                .enumerate()
                .map(|(i, field_spec)| sample_arg(field_spec.kind, i))
                .collect();
            let method = Method::new(descriptor.id(), args).unwrap();

            let mut buf = BytesMut::new();
            method.encode(&mut buf).unwrap();
            let decoded = Method::decode(buf.freeze()).unwrap();

            assert_eq!(decoded, method, "{} did not roundtrip", descriptor.name);
        }
    }

    #[test]
    fn registry_ids_are_unique() {
        let all = descriptors();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.id(), b.id(), "{} and {} share an id", a.name, b.name);
            }
        }
    }

    #[test]
    fn replies_point_at_registered_methods() {
        for descriptor in descriptors() {
            for reply in descriptor.replies {
                assert!(
                    lookup(descriptor.class_id, *reply).is_ok(),
                    "{} names unknown reply {}",
                    descriptor.name,
                    reply
                );
            }
        }
    }

    #[test]
    fn consecutive_bits_share_one_octet() {
        let method = Method::with_args(
            QUEUE_DECLARE,
            [
                ("queue", Arg::from("q")),
                ("durable", Arg::Bit(true)),
                ("auto_delete", Arg::Bit(true)),
            ],
        )
        .unwrap();

        let mut buf = BytesMut::new();
        method.encode(&mut buf).unwrap();

        // class, method, reserved short, "q", one bit octet, empty table
        assert_eq!(buf.len(), 2 + 2 + 2 + 2 + 1 + 4);
        // passive=0 durable=1 exclusive=0 auto_delete=1 no_wait=0
        assert_eq!(buf[8], 0b0000_1010);
    }

    #[test]
    fn named_accessors() {
        let method = Method::with_args(
            BASIC_DELIVER,
            [
                ("consumer_tag", Arg::from("ctag-1")),
                ("delivery_tag", Arg::LongLong(42)),
                ("redelivered", Arg::Bit(true)),
                ("routing_key", Arg::from("rk")),
            ],
        )
        .unwrap();

        assert_eq!(method.short_str("consumer_tag"), Some("ctag-1"));
        assert_eq!(method.long_long("delivery_tag"), Some(42));
        assert_eq!(method.bit("redelivered"), Some(true));
        assert_eq!(method.short_str("exchange"), Some(""));
        assert_eq!(method.short("delivery_tag"), None);
        assert_eq!(method.arg("missing"), None);
    }

    #[test]
    fn unknown_method_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(60);
        buf.put_u16(99);
        let err = Method::decode(buf.freeze()).unwrap_err();
        assert!(matches!(
            err,
            FrameError::UnknownMethod {
                class_id: 60,
                method_id: 99
            }
        ));
    }

    #[test]
    fn argument_kind_mismatch_rejected() {
        let err = Method::new(CHANNEL_FLOW, vec![Arg::Short(1)]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidField { field: "active", .. }
        ));

        let err = Method::new(CHANNEL_FLOW, vec![]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidField { .. }));
    }

    #[test]
    fn oversized_short_string_rejected_at_construction() {
        let err = Method::with_args(QUEUE_DECLARE, [("queue", Arg::from("q".repeat(256)))])
            .unwrap_err();
        assert!(matches!(err, FrameError::ShortStringTooLong { len: 256 }));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let method = Method::new(CHANNEL_CLOSE_OK, vec![]).unwrap();
        let mut buf = BytesMut::new();
        method.encode(&mut buf).unwrap();
        buf.put_u8(0);

        assert!(matches!(
            Method::decode(buf.freeze()),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn reply_matching() {
        let get = lookup(60, 70).unwrap();
        assert!(get.accepts_reply(BASIC_GET_OK));
        assert!(get.accepts_reply(BASIC_GET_EMPTY));
        assert!(!get.accepts_reply(BASIC_QOS_OK));
        assert!(!lookup(60, 40).unwrap().is_synchronous());
    }

    #[test]
    fn debug_redacts_credentials() {
        let method = Method::with_args(
            CONNECTION_START_OK,
            [
                ("mechanism", Arg::from("PLAIN")),
                ("response", Arg::LongStr(Bytes::from_static(b"\0guest\0secret"))),
            ],
        )
        .unwrap();
        let debug = format!("{method:?}");
        assert!(debug.contains("<redacted:13 bytes>"));
        assert!(!debug.contains("secret"));
    }
}
