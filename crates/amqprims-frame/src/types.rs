//! AMQP field values, field tables and the primitive wire helpers shared by
//! method and content-header encoding.
//!
//! All integers are big-endian. Table value tags follow the RabbitMQ
//! dialect of 0-9-1 (`s` is a signed 16-bit integer, `x` a byte array).

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{truncated, FrameError, Result};

/// A field table. Ordered so encoding is deterministic.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A typed value stored in a [`FieldTable`] or field array.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    ShortShortInt(i8),
    ShortShortUInt(u8),
    ShortInt(i16),
    ShortUInt(u16),
    LongInt(i32),
    LongUInt(u32),
    LongLongInt(i64),
    Float(f32),
    Double(f64),
    Decimal { scale: u8, value: u32 },
    LongString(Bytes),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
    ByteArray(Bytes),
}

impl FieldValue {
    /// The single-octet type tag written before the value.
    pub fn tag(&self) -> u8 {
        match self {
            FieldValue::Boolean(_) => b't',
            FieldValue::ShortShortInt(_) => b'b',
            FieldValue::ShortShortUInt(_) => b'B',
            FieldValue::ShortInt(_) => b's',
            FieldValue::ShortUInt(_) => b'u',
            FieldValue::LongInt(_) => b'I',
            FieldValue::LongUInt(_) => b'i',
            FieldValue::LongLongInt(_) => b'l',
            FieldValue::Float(_) => b'f',
            FieldValue::Double(_) => b'd',
            FieldValue::Decimal { .. } => b'D',
            FieldValue::LongString(_) => b'S',
            FieldValue::Array(_) => b'A',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::Table(_) => b'F',
            FieldValue::Void => b'V',
            FieldValue::ByteArray(_) => b'x',
        }
    }

    /// Borrow the value as UTF-8 text if it is a long string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::LongString(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::LongString(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::LongString(Bytes::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::LongInt(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::LongLongInt(value)
    }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self {
        FieldValue::Table(value)
    }
}

fn ensure(src: &Bytes, need: usize, what: &str) -> Result<()> {
    if src.remaining() < need {
        return Err(truncated(what, need, src.remaining()));
    }
    Ok(())
}

pub fn read_u8(src: &mut Bytes) -> Result<u8> {
    ensure(src, 1, "octet")?;
    Ok(src.get_u8())
}

pub fn read_u16(src: &mut Bytes) -> Result<u16> {
    ensure(src, 2, "short")?;
    Ok(src.get_u16())
}

pub fn read_u32(src: &mut Bytes) -> Result<u32> {
    ensure(src, 4, "long")?;
    Ok(src.get_u32())
}

pub fn read_u64(src: &mut Bytes) -> Result<u64> {
    ensure(src, 8, "long long")?;
    Ok(src.get_u64())
}

pub fn read_short_str(src: &mut Bytes) -> Result<String> {
    let len = read_u8(src)? as usize;
    ensure(src, len, "short string")?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::MalformedFrame("short string is not valid UTF-8".to_string()))
}

pub fn read_long_str(src: &mut Bytes) -> Result<Bytes> {
    let len = read_u32(src)? as usize;
    ensure(src, len, "long string")?;
    Ok(src.split_to(len))
}

pub fn write_short_str(dst: &mut BytesMut, value: &str) -> Result<()> {
    if value.len() > u8::MAX as usize {
        return Err(FrameError::ShortStringTooLong { len: value.len() });
    }
    dst.put_u8(value.len() as u8);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub fn write_long_str(dst: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: value.len(),
        max: u32::MAX as usize,
    })?;
    dst.put_u32(len);
    dst.put_slice(value);
    Ok(())
}

/// Decode a length-prefixed field table.
pub fn read_table(src: &mut Bytes) -> Result<FieldTable> {
    let len = read_u32(src)? as usize;
    ensure(src, len, "field table")?;
    let mut body = src.split_to(len);

    let mut table = FieldTable::new();
    while body.has_remaining() {
        let key = read_short_str(&mut body)?;
        let value = read_field_value(&mut body)?;
        table.insert(key, value);
    }
    Ok(table)
}

/// Encode a field table with its 32-bit length prefix.
pub fn write_table(dst: &mut BytesMut, table: &FieldTable) -> Result<()> {
    with_length_prefix(dst, |dst| {
        for (key, value) in table {
            write_short_str(dst, key)?;
            write_field_value(dst, value)?;
        }
        Ok(())
    })
}

fn read_array(src: &mut Bytes) -> Result<Vec<FieldValue>> {
    let len = read_u32(src)? as usize;
    ensure(src, len, "field array")?;
    let mut body = src.split_to(len);

    let mut values = Vec::new();
    while body.has_remaining() {
        values.push(read_field_value(&mut body)?);
    }
    Ok(values)
}

fn write_array(dst: &mut BytesMut, values: &[FieldValue]) -> Result<()> {
    with_length_prefix(dst, |dst| {
        for value in values {
            write_field_value(dst, value)?;
        }
        Ok(())
    })
}

fn with_length_prefix(
    dst: &mut BytesMut,
    body: impl FnOnce(&mut BytesMut) -> Result<()>,
) -> Result<()> {
    let start = dst.len();
    dst.put_u32(0);
    body(dst)?;
    let len = dst.len() - start - 4;
    let len = u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge {
        size: len,
        max: u32::MAX as usize,
    })?;
    dst[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn read_field_value(src: &mut Bytes) -> Result<FieldValue> {
    let tag = read_u8(src)?;
    let value = match tag {
        b't' => FieldValue::Boolean(read_u8(src)? != 0),
        b'b' => FieldValue::ShortShortInt(read_u8(src)? as i8),
        b'B' => FieldValue::ShortShortUInt(read_u8(src)?),
        b's' => FieldValue::ShortInt(read_u16(src)? as i16),
        b'u' => FieldValue::ShortUInt(read_u16(src)?),
        b'I' => FieldValue::LongInt(read_u32(src)? as i32),
        b'i' => FieldValue::LongUInt(read_u32(src)?),
        b'l' => FieldValue::LongLongInt(read_u64(src)? as i64),
        b'f' => FieldValue::Float(f32::from_bits(read_u32(src)?)),
        b'd' => FieldValue::Double(f64::from_bits(read_u64(src)?)),
        b'D' => {
            let scale = read_u8(src)?;
            let value = read_u32(src)?;
            FieldValue::Decimal { scale, value }
        }
        b'S' => FieldValue::LongString(read_long_str(src)?),
        b'A' => FieldValue::Array(read_array(src)?),
        b'T' => FieldValue::Timestamp(read_u64(src)?),
        b'F' => FieldValue::Table(read_table(src)?),
        b'V' => FieldValue::Void,
        b'x' => FieldValue::ByteArray(read_long_str(src)?),
        other => {
            return Err(FrameError::MalformedFrame(format!(
                "unknown field value tag 0x{other:02x}"
            )))
        }
    };
    Ok(value)
}

fn write_field_value(dst: &mut BytesMut, value: &FieldValue) -> Result<()> {
    dst.put_u8(value.tag());
    match value {
        FieldValue::Boolean(v) => dst.put_u8(u8::from(*v)),
        FieldValue::ShortShortInt(v) => dst.put_i8(*v),
        FieldValue::ShortShortUInt(v) => dst.put_u8(*v),
        FieldValue::ShortInt(v) => dst.put_i16(*v),
        FieldValue::ShortUInt(v) => dst.put_u16(*v),
        FieldValue::LongInt(v) => dst.put_i32(*v),
        FieldValue::LongUInt(v) => dst.put_u32(*v),
        FieldValue::LongLongInt(v) => dst.put_i64(*v),
        FieldValue::Float(v) => dst.put_f32(*v),
        FieldValue::Double(v) => dst.put_f64(*v),
        FieldValue::Decimal { scale, value } => {
            dst.put_u8(*scale);
            dst.put_u32(*value);
        }
        FieldValue::LongString(v) | FieldValue::ByteArray(v) => write_long_str(dst, v)?,
        FieldValue::Array(values) => write_array(dst, values)?,
        FieldValue::Timestamp(v) => dst.put_u64(*v),
        FieldValue::Table(table) => write_table(dst, table)?,
        FieldValue::Void => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> FieldTable {
        let mut nested = FieldTable::new();
        nested.insert("publisher_confirms".to_string(), FieldValue::Boolean(true));

        let mut table = FieldTable::new();
        table.insert("product".to_string(), "amqprims".into());
        table.insert("capabilities".to_string(), FieldValue::Table(nested));
        table.insert("x-message-ttl".to_string(), FieldValue::LongInt(60_000));
        table.insert("x-max-priority".to_string(), FieldValue::ShortShortUInt(9));
        table.insert("delta".to_string(), FieldValue::ShortInt(-3));
        table.insert(
            "ratio".to_string(),
            FieldValue::Decimal {
                scale: 2,
                value: 314,
            },
        );
        table.insert(
            "list".to_string(),
            FieldValue::Array(vec![FieldValue::LongLongInt(-1), FieldValue::Void]),
        );
        table.insert("at".to_string(), FieldValue::Timestamp(1_700_000_000));
        table.insert("weight".to_string(), FieldValue::Double(0.5));
        table.insert(
            "raw".to_string(),
            FieldValue::ByteArray(Bytes::from_static(&[0, 1, 2])),
        );
        table
    }

    #[test]
    fn table_roundtrip_preserves_every_tag() {
        let table = sample_table();
        let mut buf = BytesMut::new();
        write_table(&mut buf, &table).unwrap();

        let mut src = buf.freeze();
        let decoded = read_table(&mut src).unwrap();
        assert_eq!(decoded, table);
        assert!(src.is_empty());
    }

    #[test]
    fn empty_table_is_four_zero_bytes() {
        let mut buf = BytesMut::new();
        write_table(&mut buf, &FieldTable::new()).unwrap();
        assert_eq!(buf.as_ref(), &[0, 0, 0, 0]);
    }

    #[test]
    fn short_string_length_limit() {
        let mut buf = BytesMut::new();
        let err = write_short_str(&mut buf, &"q".repeat(256)).unwrap_err();
        assert!(matches!(err, FrameError::ShortStringTooLong { len: 256 }));

        write_short_str(&mut buf, &"q".repeat(255)).unwrap();
        assert_eq!(buf[0], 255);
    }

    #[test]
    fn truncated_table_is_malformed() {
        let mut buf = BytesMut::new();
        write_table(&mut buf, &sample_table()).unwrap();
        buf.truncate(buf.len() - 3);

        let mut src = buf.freeze();
        assert!(matches!(
            read_table(&mut src),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_value_tag_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(1);
        buf.put_u8(b'k');
        buf.put_u8(b'?');

        let mut src = buf.freeze();
        let err = read_table(&mut src).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(msg) if msg.contains("0x3f")));
    }

    #[test]
    fn long_string_accessor() {
        let value = FieldValue::from("guest");
        assert_eq!(value.as_str(), Some("guest"));
        assert_eq!(FieldValue::Boolean(true).as_str(), None);
    }
}
