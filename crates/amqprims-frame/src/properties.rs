//! Content header frames and basic-class message properties.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::types::{
    read_short_str, read_table, read_u16, read_u64, read_u8, write_short_str, write_table,
    FieldTable,
};

const CONTENT_TYPE: u16 = 1 << 15;
const CONTENT_ENCODING: u16 = 1 << 14;
const HEADERS: u16 = 1 << 13;
const DELIVERY_MODE: u16 = 1 << 12;
const PRIORITY: u16 = 1 << 11;
const CORRELATION_ID: u16 = 1 << 10;
const REPLY_TO: u16 = 1 << 9;
const EXPIRATION: u16 = 1 << 8;
const MESSAGE_ID: u16 = 1 << 7;
const TIMESTAMP: u16 = 1 << 6;
const TYPE: u16 = 1 << 5;
const USER_ID: u16 = 1 << 4;
const APP_ID: u16 = 1 << 3;
const CLUSTER_ID: u16 = 1 << 2;

/// Bit 0 of a flag word means another flag word follows.
const CONTINUATION: u16 = 1;

/// Delivery mode value for messages the broker should persist.
pub const PERSISTENT: u8 = 2;

/// Basic-class message properties. Absent properties are `None` and
/// cost nothing on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    /// The `type` property.
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn with_delivery_mode(mut self, value: u8) -> Self {
        self.delivery_mode = Some(value);
        self
    }

    pub fn with_headers(mut self, value: FieldTable) -> Self {
        self.headers = Some(value);
        self
    }

    pub fn with_correlation_id(mut self, value: impl Into<String>) -> Self {
        self.correlation_id = Some(value.into());
        self
    }

    pub fn with_reply_to(mut self, value: impl Into<String>) -> Self {
        self.reply_to = Some(value.into());
        self
    }

    pub fn with_message_id(mut self, value: impl Into<String>) -> Self {
        self.message_id = Some(value.into());
        self
    }

    pub fn with_priority(mut self, value: u8) -> Self {
        self.priority = Some(value);
        self
    }

    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, bit: u16| {
            if present {
                flags |= bit;
            }
        };
        set(self.content_type.is_some(), CONTENT_TYPE);
        set(self.content_encoding.is_some(), CONTENT_ENCODING);
        set(self.headers.is_some(), HEADERS);
        set(self.delivery_mode.is_some(), DELIVERY_MODE);
        set(self.priority.is_some(), PRIORITY);
        set(self.correlation_id.is_some(), CORRELATION_ID);
        set(self.reply_to.is_some(), REPLY_TO);
        set(self.expiration.is_some(), EXPIRATION);
        set(self.message_id.is_some(), MESSAGE_ID);
        set(self.timestamp.is_some(), TIMESTAMP);
        set(self.kind.is_some(), TYPE);
        set(self.user_id.is_some(), USER_ID);
        set(self.app_id.is_some(), APP_ID);
        set(self.cluster_id.is_some(), CLUSTER_ID);
        flags
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u16(self.flags());

        let strings = |dst: &mut BytesMut, value: &Option<String>| -> Result<()> {
            match value {
                Some(v) => write_short_str(dst, v),
                None => Ok(()),
            }
        };

        strings(dst, &self.content_type)?;
        strings(dst, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            write_table(dst, headers)?;
        }
        if let Some(v) = self.delivery_mode {
            dst.put_u8(v);
        }
        if let Some(v) = self.priority {
            dst.put_u8(v);
        }
        strings(dst, &self.correlation_id)?;
        strings(dst, &self.reply_to)?;
        strings(dst, &self.expiration)?;
        strings(dst, &self.message_id)?;
        if let Some(v) = self.timestamp {
            dst.put_u64(v);
        }
        strings(dst, &self.kind)?;
        strings(dst, &self.user_id)?;
        strings(dst, &self.app_id)?;
        strings(dst, &self.cluster_id)?;
        Ok(())
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        let flags = read_u16(src)?;
        if flags & CONTINUATION != 0 {
            return Err(FrameError::MalformedFrame(
                "property flag continuation is not supported for class basic".into(),
            ));
        }

        let has = |bit: u16| flags & bit != 0;
        let mut props = BasicProperties::default();

        if has(CONTENT_TYPE) {
            props.content_type = Some(read_short_str(src)?);
        }
        if has(CONTENT_ENCODING) {
            props.content_encoding = Some(read_short_str(src)?);
        }
        if has(HEADERS) {
            props.headers = Some(read_table(src)?);
        }
        if has(DELIVERY_MODE) {
            props.delivery_mode = Some(read_u8(src)?);
        }
        if has(PRIORITY) {
            props.priority = Some(read_u8(src)?);
        }
        if has(CORRELATION_ID) {
            props.correlation_id = Some(read_short_str(src)?);
        }
        if has(REPLY_TO) {
            props.reply_to = Some(read_short_str(src)?);
        }
        if has(EXPIRATION) {
            props.expiration = Some(read_short_str(src)?);
        }
        if has(MESSAGE_ID) {
            props.message_id = Some(read_short_str(src)?);
        }
        if has(TIMESTAMP) {
            props.timestamp = Some(read_u64(src)?);
        }
        if has(TYPE) {
            props.kind = Some(read_short_str(src)?);
        }
        if has(USER_ID) {
            props.user_id = Some(read_short_str(src)?);
        }
        if has(APP_ID) {
            props.app_id = Some(read_short_str(src)?);
        }
        if has(CLUSTER_ID) {
            props.cluster_id = Some(read_short_str(src)?);
        }
        Ok(props)
    }
}

/// Header frame payload: announces the body size of the content that
/// follows a content-bearing method.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn new(class_id: u16, body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id,
            body_size,
            properties,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u16(self.class_id);
        // weight, always zero
        dst.put_u16(0);
        dst.put_u64(self.body_size);
        self.properties.encode(dst)
    }

    pub fn decode(mut src: Bytes) -> Result<Self> {
        let class_id = read_u16(&mut src)?;
        let _weight = read_u16(&mut src)?;
        let body_size = read_u64(&mut src)?;
        let properties = BasicProperties::decode(&mut src)?;
        if !src.is_empty() {
            return Err(FrameError::MalformedFrame(format!(
                "{} trailing bytes after content header",
                src.len()
            )));
        }
        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    fn full() -> BasicProperties {
        let mut headers = FieldTable::new();
        headers.insert("x-trace".into(), FieldValue::from("abc"));
        BasicProperties {
            content_type: Some("text/plain".into()),
            content_encoding: Some("utf-8".into()),
            headers: Some(headers),
            delivery_mode: Some(PERSISTENT),
            priority: Some(5),
            correlation_id: Some("corr".into()),
            reply_to: Some("amq.rabbitmq.reply-to".into()),
            expiration: Some("60000".into()),
            message_id: Some("m-1".into()),
            timestamp: Some(1_700_000_000),
            kind: Some("greeting".into()),
            user_id: Some("guest".into()),
            app_id: Some("amqprims".into()),
            cluster_id: Some("c1".into()),
        }
    }

    #[test]
    fn empty_properties_are_just_flags() {
        let header = ContentHeader::new(60, 6, BasicProperties::default());
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 6, 0, 0]);
        assert_eq!(ContentHeader::decode(buf.freeze()).unwrap(), header);
    }

    #[test]
    fn all_properties_roundtrip() {
        let header = ContentHeader::new(60, 1_000_000, full());
        assert_eq!(header.properties.flags(), 0xFFFC);

        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(ContentHeader::decode(buf.freeze()).unwrap(), header);
    }

    #[test]
    fn sparse_properties_roundtrip() {
        let props = BasicProperties::default()
            .with_content_type("application/json")
            .with_delivery_mode(PERSISTENT)
            .with_message_id("id-7");
        assert_eq!(props.flags(), CONTENT_TYPE | DELIVERY_MODE | MESSAGE_ID);

        let header = ContentHeader::new(60, 0, props);
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(ContentHeader::decode(buf.freeze()).unwrap(), header);
    }

    #[test]
    fn continuation_flag_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(60);
        buf.put_u16(0);
        buf.put_u64(0);
        buf.put_u16(CONTINUATION);
        assert!(matches!(
            ContentHeader::decode(buf.freeze()),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn truncated_property_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(60);
        buf.put_u16(0);
        buf.put_u64(3);
        buf.put_u16(CONTENT_TYPE);
        buf.put_u8(10);
        buf.put_slice(b"text");
        assert!(ContentHeader::decode(buf.freeze()).is_err());
    }
}
