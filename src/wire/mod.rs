//! Inbound atom wire format.
//!
//! Each atom arrives as a length-prefixed record
//! `{tag_id, source_uid, elapsed_ns, field_count, fields…}` with varint
//! integers; each field is `{path (varint), type (1 byte), payload}`.
//! Length checks happen once per record, then the cursor advances through
//! fixed decode steps.

use thiserror::Error;

use crate::field::{Atom, Field, FieldPath, FieldValue, Value};

/// Upper bound on fields per atom, to reject absurd records early.
const MAX_FIELDS_PER_ATOM: u64 = 512;

/// Errors that can occur while decoding the atom wire format.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("record truncated at byte {offset}")]
    Truncated { offset: usize },

    #[error("varint longer than 10 bytes at byte {offset}")]
    VarintOverflow { offset: usize },

    #[error("unknown field type: {raw}")]
    UnknownFieldType { raw: u8 },

    #[error("field count {count} exceeds limit")]
    TooManyFields { count: u64 },

    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("record length {len} overruns buffer")]
    BadRecordLength { len: u64 },
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(WireError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_varint(&mut self) -> Result<u64, WireError> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(WireError::VarintOverflow { offset: start });
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(WireError::Truncated { offset: self.pos })?;
        if end > self.data.len() {
            return Err(WireError::Truncated { offset: self.pos });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_f32(&mut self) -> Result<f32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Decode one atom from `data`, which must contain exactly one record body
/// (no length prefix).
pub fn decode_atom(data: &[u8]) -> Result<Atom, WireError> {
    let mut cur = Cursor::new(data);

    let tag = cur.read_varint()? as i32;
    let source_uid = cur.read_varint()? as i32;
    let elapsed_ns = cur.read_varint()? as i64;
    let field_count = cur.read_varint()?;
    if field_count > MAX_FIELDS_PER_ATOM {
        return Err(WireError::TooManyFields { count: field_count });
    }

    let mut values = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let path = FieldPath::from_raw(cur.read_varint()? as u32);
        let type_id = cur.read_u8()?;
        let value = match type_id {
            0 => Value::Int(cur.read_varint()? as i32),
            1 => Value::Long(cur.read_varint()? as i64),
            2 => Value::Float(cur.read_f32()?),
            3 => {
                let len = cur.read_varint()? as usize;
                let bytes = cur.read_bytes(len)?;
                Value::Str(
                    std::str::from_utf8(bytes)
                        .map_err(|_| WireError::InvalidUtf8)?
                        .to_owned(),
                )
            }
            4 => {
                let len = cur.read_varint()? as usize;
                Value::Bytes(cur.read_bytes(len)?.to_vec())
            }
            raw => return Err(WireError::UnknownFieldType { raw }),
        };
        values.push(FieldValue::new(Field::new(tag, path), value));
    }

    Ok(Atom::new(tag, source_uid, elapsed_ns, values))
}

/// Iterator over a stream of length-prefixed atom records.
pub struct AtomStream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AtomStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        AtomStream { data, pos: 0 }
    }
}

impl Iterator for AtomStream<'_> {
    type Item = Result<Atom, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let mut cur = Cursor::new(&self.data[self.pos..]);
        let len = match cur.read_varint() {
            Ok(len) => len,
            Err(e) => {
                self.pos = self.data.len();
                return Some(Err(e));
            }
        };
        let body_start = self.pos + cur.pos;
        let body_end = match body_start.checked_add(len as usize) {
            Some(end) if end <= self.data.len() => end,
            _ => {
                self.pos = self.data.len();
                return Some(Err(WireError::BadRecordLength { len }));
            }
        };
        self.pos = body_end;
        Some(decode_atom(&self.data[body_start..body_end]))
    }
}

/// Encode an atom as one length-prefixed record. The inverse of the decode
/// path; used by tests and the replay tooling.
pub fn encode_atom(atom: &Atom) -> Vec<u8> {
    let mut body = Vec::with_capacity(32);
    write_varint(&mut body, atom.tag() as u64);
    write_varint(&mut body, atom.source_uid() as u64);
    write_varint(&mut body, atom.elapsed_ns() as u64);
    write_varint(&mut body, atom.values().len() as u64);
    for fv in atom.values() {
        write_varint(&mut body, u64::from(fv.field.path.raw()));
        body.push(fv.value.type_id());
        match &fv.value {
            Value::Int(v) => write_varint(&mut body, *v as u32 as u64),
            Value::Long(v) => write_varint(&mut body, *v as u64),
            Value::Float(v) => body.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Str(v) => {
                write_varint(&mut body, v.len() as u64);
                body.extend_from_slice(v.as_bytes());
            }
            Value::Bytes(v) => {
                write_varint(&mut body, v.len() as u64);
                body.extend_from_slice(v);
            }
        }
    }

    let mut out = Vec::with_capacity(body.len() + 2);
    write_varint(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    out
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
