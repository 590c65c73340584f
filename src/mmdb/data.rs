//! MMDB data section encoding and decoding.
//!
//! Every value starts with a control byte: the type in the top 3 bits and a
//! 5-bit size. Type 0 means "extended": the real type minus 7 follows in the
//! next byte. Sizes 29, 30 and 31 are followed by 1, 2 or 3 extra bytes.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::{Error, Result};

const TYPE_EXTENDED: u8 = 0;
const TYPE_POINTER: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_DOUBLE: u8 = 3;
const TYPE_BYTES: u8 = 4;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_INT32: u8 = 8;
const TYPE_UINT64: u8 = 9;
const TYPE_UINT128: u8 = 10;
const TYPE_ARRAY: u8 = 11;
const TYPE_CONTAINER: u8 = 12;
const TYPE_END_MARKER: u8 = 13;
const TYPE_BOOL: u8 = 14;
const TYPE_FLOAT: u8 = 15;

/// Maximum nesting of maps, arrays and pointers while decoding.
const MAX_DEPTH: usize = 64;

/// Largest size the control byte encoding can express.
const MAX_SIZE: usize = 65_821 + 0xFF_FFFF;

/// A decoded data section value (pointers already resolved).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Double(f64),
    Bytes(Vec<u8>),
    Uint16(u16),
    Uint32(u32),
    Map(BTreeMap<String, Value>),
    Int32(i32),
    Uint64(u64),
    Uint128(u128),
    Array(Vec<Value>),
    Bool(bool),
    Float(f32),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Unsigned integer types widened to `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint16(n) => Some(*n as u64),
            Value::Uint32(n) => Some(*n as u64),
            Value::Uint64(n) => Some(*n),
            Value::Uint128(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Follow a path of map keys.
    pub fn path(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .try_fold(self, |value, key| value.as_map()?.get(*key))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Decoder over a data section (or the metadata block).
///
/// Offsets, including pointer targets, are relative to the start of `buf`.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Decode the value starting at `offset`.
    pub fn decode(&self, offset: usize) -> Result<Value> {
        self.decode_at(offset, 0).map(|(value, _)| value)
    }

    /// Decode a value, returning it with the offset just past it.
    fn decode_at(&self, offset: usize, depth: usize) -> Result<(Value, usize)> {
        if depth > MAX_DEPTH {
            return Err(Error::malformed("data section nesting too deep"));
        }

        let (type_id, size_bits, cursor) = self.read_control(offset)?;

        if type_id == TYPE_POINTER {
            let (target, next) = self.read_pointer(size_bits, cursor)?;
            let (target_type, _, _) = self.read_control(target)?;
            if target_type == TYPE_POINTER {
                return Err(Error::malformed(format!(
                    "pointer at offset {} points to another pointer",
                    offset
                )));
            }
            let (value, _) = self.decode_at(target, depth + 1)?;
            return Ok((value, next));
        }

        let (size, cursor) = self.read_size(size_bits, cursor)?;

        match type_id {
            TYPE_STRING => {
                let bytes = self.slice(cursor, size)?;
                let s = std::str::from_utf8(bytes).map_err(|e| {
                    Error::malformed(format!("invalid UTF-8 string at offset {}: {}", offset, e))
                })?;
                Ok((Value::String(s.to_string()), cursor + size))
            }
            TYPE_DOUBLE => {
                let bytes = self.fixed::<8>(cursor, size, "double")?;
                Ok((Value::Double(f64::from_be_bytes(bytes)), cursor + size))
            }
            TYPE_BYTES => Ok((Value::Bytes(self.slice(cursor, size)?.to_vec()), cursor + size)),
            TYPE_UINT16 => {
                let n = self.read_uint(cursor, size, 2)?;
                Ok((Value::Uint16(n as u16), cursor + size))
            }
            TYPE_UINT32 => {
                let n = self.read_uint(cursor, size, 4)?;
                Ok((Value::Uint32(n as u32), cursor + size))
            }
            TYPE_INT32 => {
                let n = self.read_uint(cursor, size, 4)?;
                Ok((Value::Int32(n as u32 as i32), cursor + size))
            }
            TYPE_UINT64 => {
                let n = self.read_uint(cursor, size, 8)?;
                Ok((Value::Uint64(n as u64), cursor + size))
            }
            TYPE_UINT128 => {
                let n = self.read_uint(cursor, size, 16)?;
                Ok((Value::Uint128(n), cursor + size))
            }
            TYPE_MAP => {
                let mut map = BTreeMap::new();
                let mut cursor = cursor;
                for _ in 0..size {
                    let (key, next) = self.decode_at(cursor, depth + 1)?;
                    let key = match key {
                        Value::String(key) => key,
                        other => {
                            return Err(Error::malformed(format!(
                                "map key at offset {} is not a string: {:?}",
                                cursor, other
                            )))
                        }
                    };
                    let (value, next) = self.decode_at(next, depth + 1)?;
                    map.insert(key, value);
                    cursor = next;
                }
                Ok((Value::Map(map), cursor))
            }
            TYPE_ARRAY => {
                let mut items = Vec::with_capacity(size.min(1024));
                let mut cursor = cursor;
                for _ in 0..size {
                    let (item, next) = self.decode_at(cursor, depth + 1)?;
                    items.push(item);
                    cursor = next;
                }
                Ok((Value::Array(items), cursor))
            }
            TYPE_BOOL => match size {
                0 | 1 => Ok((Value::Bool(size == 1), cursor)),
                _ => Err(Error::malformed(format!(
                    "invalid boolean size {} at offset {}",
                    size, offset
                ))),
            },
            TYPE_FLOAT => {
                let bytes = self.fixed::<4>(cursor, size, "float")?;
                Ok((Value::Float(f32::from_be_bytes(bytes)), cursor + size))
            }
            TYPE_CONTAINER | TYPE_END_MARKER => Err(Error::malformed(format!(
                "unexpected type {} at offset {}",
                type_id, offset
            ))),
            _ => Err(Error::malformed(format!(
                "unknown data type {} at offset {}",
                type_id, offset
            ))),
        }
    }

    /// Returns (type, size bits, cursor after the control bytes).
    fn read_control(&self, offset: usize) -> Result<(u8, u8, usize)> {
        let ctrl = self.byte(offset)?;
        let mut type_id = ctrl >> 5;
        let mut cursor = offset + 1;
        if type_id == TYPE_EXTENDED {
            let ext = self.byte(cursor)?;
            cursor += 1;
            type_id = ext.saturating_add(7);
            if type_id <= TYPE_MAP {
                return Err(Error::malformed(format!(
                    "invalid extended type {} at offset {}",
                    ext, offset
                )));
            }
        }
        Ok((type_id, ctrl & 0x1F, cursor))
    }

    /// Returns (target offset, cursor after the pointer).
    fn read_pointer(&self, size_bits: u8, cursor: usize) -> Result<(usize, usize)> {
        let ss = (size_bits >> 3) & 0x3;
        let vvv = (size_bits & 0x7) as u32;
        let len = ss as usize + 1;
        let raw = self
            .slice(cursor, len)?
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32);
        let target = match ss {
            0 => (vvv << 8) | raw,
            1 => ((vvv << 16) | raw) + 2048,
            2 => ((vvv << 24) | raw) + 526_336,
            _ => raw,
        };
        Ok((target as usize, cursor + len))
    }

    /// Returns (size, cursor after the size bytes).
    fn read_size(&self, size_bits: u8, cursor: usize) -> Result<(usize, usize)> {
        match size_bits {
            0..=28 => Ok((size_bits as usize, cursor)),
            29 => Ok((29 + self.byte(cursor)? as usize, cursor + 1)),
            30 => {
                let b = self.slice(cursor, 2)?;
                Ok((285 + u16::from_be_bytes([b[0], b[1]]) as usize, cursor + 2))
            }
            _ => {
                let b = self.slice(cursor, 3)?;
                let n = ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize;
                Ok((65_821 + n, cursor + 3))
            }
        }
    }

    fn read_uint(&self, cursor: usize, size: usize, max: usize) -> Result<u128> {
        if size > max {
            return Err(Error::malformed(format!(
                "unsigned integer of {} bytes exceeds {} bytes at offset {}",
                size, max, cursor
            )));
        }
        Ok(self
            .slice(cursor, size)?
            .iter()
            .fold(0u128, |acc, b| (acc << 8) | *b as u128))
    }

    fn fixed<const N: usize>(&self, cursor: usize, size: usize, what: &str) -> Result<[u8; N]> {
        if size != N {
            return Err(Error::malformed(format!(
                "invalid {} size {} at offset {}",
                what, size, cursor
            )));
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.slice(cursor, N)?);
        Ok(bytes)
    }

    fn byte(&self, offset: usize) -> Result<u8> {
        self.buf
            .get(offset)
            .copied()
            .ok_or_else(|| Error::malformed(format!("data offset {} out of bounds", offset)))
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or_else(|| {
                Error::malformed(format!(
                    "data of {} bytes at offset {} exceeds section of {} bytes",
                    len,
                    offset,
                    self.buf.len()
                ))
            })
    }
}

/// Data section encoder.
///
/// With deduplication enabled, strings nested inside maps and arrays that were
/// already written are emitted as pointers when that is shorter.
pub struct Encoder {
    buf: Vec<u8>,
    dedup: bool,
    strings: AHashMap<String, usize>,
}

impl Encoder {
    /// Encoder with string deduplication (for data sections).
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            dedup: true,
            strings: AHashMap::new(),
        }
    }

    /// Encode a single value without pointers (for metadata and value keys).
    pub fn encode_standalone(value: &Value) -> Result<Vec<u8>> {
        let mut encoder = Self {
            buf: Vec::new(),
            dedup: false,
            strings: AHashMap::new(),
        };
        encoder.encode(value)?;
        Ok(encoder.buf)
    }

    /// Append a value and return its offset.
    pub fn encode(&mut self, value: &Value) -> Result<usize> {
        let offset = self.buf.len();
        self.write_value(value, false)?;
        Ok(offset)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_value(&mut self, value: &Value, nested: bool) -> Result<()> {
        match value {
            Value::String(s) => self.write_string(s, nested)?,
            Value::Double(d) => {
                self.write_control(TYPE_DOUBLE, 8)?;
                self.buf.extend_from_slice(&d.to_be_bytes());
            }
            Value::Bytes(b) => {
                self.write_control(TYPE_BYTES, b.len())?;
                self.buf.extend_from_slice(b);
            }
            Value::Uint16(n) => self.write_uint(TYPE_UINT16, &n.to_be_bytes())?,
            Value::Uint32(n) => self.write_uint(TYPE_UINT32, &n.to_be_bytes())?,
            Value::Int32(n) => {
                if *n < 0 {
                    self.write_control(TYPE_INT32, 4)?;
                    self.buf.extend_from_slice(&n.to_be_bytes());
                } else {
                    self.write_uint(TYPE_INT32, &n.to_be_bytes())?;
                }
            }
            Value::Uint64(n) => self.write_uint(TYPE_UINT64, &n.to_be_bytes())?,
            Value::Uint128(n) => self.write_uint(TYPE_UINT128, &n.to_be_bytes())?,
            Value::Map(map) => {
                self.write_control(TYPE_MAP, map.len())?;
                for (key, value) in map {
                    self.write_string(key, true)?;
                    self.write_value(value, true)?;
                }
            }
            Value::Array(items) => {
                self.write_control(TYPE_ARRAY, items.len())?;
                for item in items {
                    self.write_value(item, true)?;
                }
            }
            Value::Bool(b) => self.write_control(TYPE_BOOL, *b as usize)?,
            Value::Float(f) => {
                self.write_control(TYPE_FLOAT, 4)?;
                self.buf.extend_from_slice(&f.to_be_bytes());
            }
        }
        Ok(())
    }

    fn write_string(&mut self, s: &str, nested: bool) -> Result<()> {
        if self.dedup && nested {
            if let Some(&target) = self.strings.get(s) {
                if pointer_len(target) < control_len(s.len()) + s.len() {
                    self.write_pointer(target);
                    return Ok(());
                }
            }
        }
        let offset = self.buf.len();
        self.write_control(TYPE_STRING, s.len())?;
        self.buf.extend_from_slice(s.as_bytes());
        if self.dedup {
            self.strings.entry(s.to_string()).or_insert(offset);
        }
        Ok(())
    }

    /// Unsigned integers are written without leading zero bytes.
    fn write_uint(&mut self, type_id: u8, be_bytes: &[u8]) -> Result<()> {
        let skip = be_bytes.iter().take_while(|b| **b == 0).count();
        let bytes = &be_bytes[skip..];
        self.write_control(type_id, bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn write_pointer(&mut self, target: usize) {
        let target = target as u32;
        let ctrl = TYPE_POINTER << 5;
        if target < 2048 {
            self.buf.push(ctrl | ((target >> 8) & 0x7) as u8);
            self.buf.push(target as u8);
        } else if target < 526_336 {
            let adjusted = target - 2048;
            self.buf.push(ctrl | 0x08 | ((adjusted >> 16) & 0x7) as u8);
            self.buf.extend_from_slice(&adjusted.to_be_bytes()[2..]);
        } else if target < 134_744_064 {
            let adjusted = target - 526_336;
            self.buf.push(ctrl | 0x10 | ((adjusted >> 24) & 0x7) as u8);
            self.buf.extend_from_slice(&adjusted.to_be_bytes()[1..]);
        } else {
            self.buf.push(ctrl | 0x18);
            self.buf.extend_from_slice(&target.to_be_bytes());
        }
    }

    fn write_control(&mut self, type_id: u8, size: usize) -> Result<()> {
        if size > MAX_SIZE {
            return Err(Error::Config(format!(
                "data value of {} bytes exceeds the format limit",
                size
            )));
        }

        let (size_bits, extra): (u8, Vec<u8>) = if size < 29 {
            (size as u8, Vec::new())
        } else if size < 285 {
            (29, vec![(size - 29) as u8])
        } else if size < 65_821 {
            (30, ((size - 285) as u16).to_be_bytes().to_vec())
        } else {
            (31, ((size - 65_821) as u32).to_be_bytes()[1..].to_vec())
        };

        if type_id <= TYPE_MAP {
            self.buf.push((type_id << 5) | size_bits);
        } else {
            self.buf.push((TYPE_EXTENDED << 5) | size_bits);
            self.buf.push(type_id - 7);
        }
        self.buf.extend_from_slice(&extra);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn control_len(size: usize) -> usize {
    match size {
        0..=28 => 1,
        29..=284 => 2,
        285..=65_820 => 3,
        _ => 4,
    }
}

fn pointer_len(target: usize) -> usize {
    match target {
        0..=2047 => 2,
        2048..=526_335 => 3,
        526_336..=134_744_063 => 4,
        _ => 5,
    }
}
