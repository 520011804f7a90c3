//! Self-describing key/value archive codec
//!
//! Encoding, all integers little-endian:
//!
//! ```text
//! archive  := count:u32 entry*
//! entry    := key_len:u16 key:bytes tag:u8 value
//! value    := bool:u8 | u64 | len:u32 bytes | archive
//! ```
//!
//! Fields are stored in a `BTreeMap`, so encoding is deterministic and
//! re-encoding a decoded archive is byte-identical. Readers must look
//! fields up by name and tolerate keys they do not recognize; that is what
//! lets the protocol grow fields without a version bump.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

const TAG_BOOL: u8 = 0x01;
const TAG_U64: u8 = 0x02;
const TAG_STRING: u8 = 0x03;
const TAG_BYTES: u8 = 0x04;
const TAG_ARCHIVE: u8 = 0x05;

/// A typed archive value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    U64(u64),
    String(String),
    Bytes(Bytes),
    Archive(Archive),
}

/// Ordered map of named, typed values. See the module docs for the wire
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Archive {
    fields: BTreeMap<String, Value>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Insert or overwrite a field.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.set(key, Value::Bool(value))
    }

    pub fn set_u64(&mut self, key: impl Into<String>, value: u64) -> &mut Self {
        self.set(key, Value::U64(value))
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set(key, Value::String(value.into()))
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, value: Bytes) -> &mut Self {
        self.set(key, Value::Bytes(value))
    }

    pub fn set_archive(&mut self, key: impl Into<String>, value: Archive) -> &mut Self {
        self.set(key, Value::Archive(value))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.fields.get(key) {
            Some(Value::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.fields.get(key) {
            Some(Value::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(Value::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&Bytes> {
        match self.fields.get(key) {
            Some(Value::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_archive(&self, key: &str) -> Option<&Archive> {
        match self.fields.get(key) {
            Some(Value::Archive(v)) => Some(v),
            _ => None,
        }
    }

    /// Encode to a frame payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.fields.len() as u32);
        for (key, value) in &self.fields {
            buf.put_u16_le(key.len() as u16);
            buf.put_slice(key.as_bytes());
            match value {
                Value::Bool(v) => {
                    buf.put_u8(TAG_BOOL);
                    buf.put_u8(u8::from(*v));
                }
                Value::U64(v) => {
                    buf.put_u8(TAG_U64);
                    buf.put_u64_le(*v);
                }
                Value::String(v) => {
                    buf.put_u8(TAG_STRING);
                    buf.put_u32_le(v.len() as u32);
                    buf.put_slice(v.as_bytes());
                }
                Value::Bytes(v) => {
                    buf.put_u8(TAG_BYTES);
                    buf.put_u32_le(v.len() as u32);
                    buf.put_slice(v);
                }
                Value::Archive(v) => {
                    buf.put_u8(TAG_ARCHIVE);
                    v.encode_into(buf);
                }
            }
        }
    }

    /// Decode a frame payload. The whole payload must be consumed;
    /// trailing bytes are a protocol error.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(payload);
        let archive = Self::decode_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::TrailingBytes {
                len: buf.remaining(),
            });
        }
        Ok(archive)
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::truncated("field count"));
        }
        let count = buf.get_u32_le() as usize;

        let mut fields = BTreeMap::new();
        for _ in 0..count {
            if buf.remaining() < 2 {
                return Err(Error::truncated("key length"));
            }
            let key_len = buf.get_u16_le() as usize;
            if buf.remaining() < key_len {
                return Err(Error::truncated("key"));
            }
            let key = std::str::from_utf8(&buf.chunk()[..key_len])
                .map_err(|_| Error::InvalidKey)?
                .to_string();
            buf.advance(key_len);

            if buf.remaining() < 1 {
                return Err(Error::truncated("value tag"));
            }
            let tag = buf.get_u8();
            let value = match tag {
                TAG_BOOL => {
                    if buf.remaining() < 1 {
                        return Err(Error::truncated("bool value"));
                    }
                    Value::Bool(buf.get_u8() != 0)
                }
                TAG_U64 => {
                    if buf.remaining() < 8 {
                        return Err(Error::truncated("u64 value"));
                    }
                    Value::U64(buf.get_u64_le())
                }
                TAG_STRING => {
                    let len = read_len(buf, "string length")?;
                    if buf.remaining() < len {
                        return Err(Error::truncated("string value"));
                    }
                    let s = std::str::from_utf8(&buf.chunk()[..len])
                        .map_err(|_| Error::InvalidKey)?
                        .to_string();
                    buf.advance(len);
                    Value::String(s)
                }
                TAG_BYTES => {
                    let len = read_len(buf, "bytes length")?;
                    if buf.remaining() < len {
                        return Err(Error::truncated("bytes value"));
                    }
                    Value::Bytes(buf.copy_to_bytes(len))
                }
                TAG_ARCHIVE => Value::Archive(Self::decode_from(buf)?),
                tag => return Err(Error::UnknownTag { tag }),
            };
            fields.insert(key, value);
        }
        Ok(Self { fields })
    }
}

fn read_len(buf: &mut Bytes, context: &'static str) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(Error::truncated(context));
    }
    Ok(buf.get_u32_le() as usize)
}
