//! Tagged Value Codec
//!
//! Self-describing binary encoding of nested maps and lists used for the
//! leader's structured responses (commit info, file lists).
//!
//! Layout: one version byte, then a single value. Every value starts with a
//! tag byte; integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Codec version written as the first byte of every document
pub const CODEC_VERSION: u8 = 1;

const TAG_NULL: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;

/// Nesting limit when decoding untrusted input
const MAX_DEPTH: usize = 32;

/// A decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Long(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(ValueMap),
}

/// Ordered string-keyed map
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueMap(Vec<(String, Value)>);

impl ValueMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an entry, keeping insertion order
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.0.push((key.into(), value));
        self
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// Encode a value into a versioned document
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u8(CODEC_VERSION);
    write_value(&mut buf, value);
    buf.freeze()
}

fn write_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Long(v) => {
            buf.put_u8(TAG_LONG);
            buf.put_i64(*v);
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            write_len_prefixed(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            write_len_prefixed(buf, b);
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            buf.put_u32(items.len() as u32);
            for item in items {
                write_value(buf, item);
            }
        }
        Value::Map(map) => {
            buf.put_u8(TAG_MAP);
            buf.put_u32(map.len() as u32);
            for (key, item) in map.iter() {
                write_len_prefixed(buf, key.as_bytes());
                write_value(buf, item);
            }
        }
    }
}

fn write_len_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Decode a versioned document. The whole input must be consumed.
pub fn decode(mut input: &[u8]) -> Result<Value> {
    if !input.has_remaining() {
        return Err(Error::Protocol("Empty response body".into()));
    }
    let version = input.get_u8();
    if version != CODEC_VERSION {
        return Err(Error::Protocol(format!("Unsupported codec version: {}", version)));
    }

    let value = read_value(&mut input, 0)?;
    if input.has_remaining() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after document",
            input.remaining()
        )));
    }
    Ok(value)
}

fn read_value(input: &mut &[u8], depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::Protocol("Document nested too deeply".into()));
    }
    need(*input, 1)?;
    let tag = input.get_u8();

    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_TRUE => Value::Bool(true),
        TAG_FALSE => Value::Bool(false),
        TAG_LONG => {
            need(*input, 8)?;
            Value::Long(input.get_i64())
        }
        TAG_STR => Value::Str(read_string(input)?),
        TAG_BYTES => Value::Bytes(read_len_prefixed(input)?.to_vec()),
        TAG_LIST => {
            need(*input, 4)?;
            let count = input.get_u32() as usize;
            // Each element takes at least one byte
            need(*input, count)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(input, depth + 1)?);
            }
            Value::List(items)
        }
        TAG_MAP => {
            need(*input, 4)?;
            let count = input.get_u32() as usize;
            let mut map = ValueMap::new();
            for _ in 0..count {
                let key = read_string(input)?;
                let item = read_value(input, depth + 1)?;
                map.insert(key, item);
            }
            Value::Map(map)
        }
        other => return Err(Error::Protocol(format!("Unknown value tag: {}", other))),
    };

    Ok(value)
}

fn read_string(input: &mut &[u8]) -> Result<String> {
    let bytes = read_len_prefixed(input)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Protocol("Invalid UTF-8 in string value".into()))
}

fn read_len_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    need(*input, 4)?;
    let len = input.get_u32() as usize;
    need(*input, len)?;
    let slice: &'a [u8] = *input;
    let (head, tail) = slice.split_at(len);
    *input = tail;
    Ok(head)
}

fn need(input: &[u8], n: usize) -> Result<()> {
    if input.len() < n {
        return Err(Error::Protocol(format!(
            "Truncated document: needed {} bytes, {} remaining",
            n,
            input.len()
        )));
    }
    Ok(())
}
