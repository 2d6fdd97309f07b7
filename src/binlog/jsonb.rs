//! MySql internal binary JSON representation.
//!
//! A jsonb value is a one-byte type tag followed by either an inline scalar
//! or a container. Containers start with an element count and a total size
//! (2 bytes each in the small format, 4 in the large one), then fixed-size
//! entry tables whose offsets point into the container, so lookups never
//! have to walk the whole document. Re-emitted here as `serde_json::Value`.
//!
//! https://dev.mysql.com/doc/dev/mysql-server/latest/json__binary_8h.html

use serde_json::{Map, Number, Value};

use crate::buf_ext::BufExt;
use crate::error::{Error, Result};

const TYPE_SMALL_OBJECT: u8 = 0x00;
const TYPE_LARGE_OBJECT: u8 = 0x01;
const TYPE_SMALL_ARRAY: u8 = 0x02;
const TYPE_LARGE_ARRAY: u8 = 0x03;
const TYPE_LITERAL: u8 = 0x04;
const TYPE_INT16: u8 = 0x05;
const TYPE_UINT16: u8 = 0x06;
const TYPE_INT32: u8 = 0x07;
const TYPE_UINT32: u8 = 0x08;
const TYPE_INT64: u8 = 0x09;
const TYPE_UINT64: u8 = 0x0a;
const TYPE_DOUBLE: u8 = 0x0b;
const TYPE_STRING: u8 = 0x0c;
const TYPE_OPAQUE: u8 = 0x0f;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

/// Decodes a whole jsonb column payload.
pub fn decode(data: &[u8]) -> Result<Value> {
  // MySql stores an empty value for SQL NULL in a json column
  if data.is_empty() {
    return Ok(Value::Null);
  }
  decode_tagged(data[0], &data[1..])
}

fn decode_tagged(tag: u8, data: &[u8]) -> Result<Value> {
  let mut b = data;
  match tag {
    TYPE_SMALL_OBJECT => decode_container(data, false, true),
    TYPE_LARGE_OBJECT => decode_container(data, true, true),
    TYPE_SMALL_ARRAY => decode_container(data, false, false),
    TYPE_LARGE_ARRAY => decode_container(data, true, false),
    TYPE_LITERAL => decode_literal(b.mysql_get_u8()?),
    TYPE_INT16 => Ok(Value::from(b.mysql_get_uint_le(2)? as i16)),
    TYPE_UINT16 => Ok(Value::from(b.mysql_get_uint_le(2)? as u16)),
    TYPE_INT32 => Ok(Value::from(b.mysql_get_uint_le(4)? as i32)),
    TYPE_UINT32 => Ok(Value::from(b.mysql_get_uint_le(4)? as u32)),
    TYPE_INT64 => Ok(Value::from(b.mysql_get_uint_le(8)? as i64)),
    TYPE_UINT64 => Ok(Value::from(b.mysql_get_uint_le(8)?)),
    TYPE_DOUBLE => {
      let v = b.mysql_get_f64_le()?;
      Ok(Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null))
    }
    TYPE_STRING => {
      let len = decode_variable_length(&mut b)? as usize;
      let bytes = b.mysql_get_bytes(len)?;
      Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    }
    // DECIMAL/DATE/TIME values inside a json document; no faithful json
    // rendering exists for these
    TYPE_OPAQUE => Err(Error::protocol("jsonb opaque value")),
    other => Err(Error::protocol(format!("unknown jsonb type 0x{:02x}", other))),
  }
}

fn decode_literal(literal: u8) -> Result<Value> {
  match literal {
    LITERAL_NULL => Ok(Value::Null),
    LITERAL_TRUE => Ok(Value::Bool(true)),
    LITERAL_FALSE => Ok(Value::Bool(false)),
    other => Err(Error::protocol(format!("unknown jsonb literal 0x{:02x}", other))),
  }
}

/// Decodes an array or object. `data` starts at the container header and
/// all offsets inside are relative to it.
fn decode_container(data: &[u8], large: bool, object: bool) -> Result<Value> {
  let offset_size = if large { 4 } else { 2 };
  let key_entry_size = offset_size + 2;
  let value_entry_size = offset_size + 1;

  let mut b = data;
  let element_count = b.mysql_get_uint_le(offset_size)? as usize;
  let total_size = b.mysql_get_uint_le(offset_size)? as usize;
  if total_size > data.len() {
    return Err(Error::Truncated {
      needed: total_size - data.len(),
      remaining: data.len(),
    });
  }
  let data = &data[..total_size];

  // Entry tables must fit inside the container before any of the per-entry
  // offsets are trusted.
  let key_table = if object { element_count as u64 * key_entry_size as u64 } else { 0 };
  let header_size = 2 * offset_size as u64 + key_table + element_count as u64 * value_entry_size as u64;
  if header_size > total_size as u64 {
    return Err(Error::protocol("jsonb container header larger than the container"));
  }
  let value_entries_start = (2 * offset_size as u64 + key_table) as usize;

  let mut keys = Vec::with_capacity(if object { element_count } else { 0 });
  if object {
    for i in 0..element_count {
      let mut entry = data
        .get(2 * offset_size + i * key_entry_size..)
        .ok_or_else(|| Error::protocol("jsonb key entry out of bounds"))?;
      let key_offset = entry.mysql_get_uint_le(offset_size)? as usize;
      let key_len = entry.mysql_get_uint_le(2)? as usize;
      let key = data
        .get(key_offset..key_offset + key_len)
        .ok_or_else(|| Error::protocol("jsonb key offset out of bounds"))?;
      keys.push(String::from_utf8_lossy(key).into_owned());
    }
  }

  let mut elements = Vec::with_capacity(element_count);
  for i in 0..element_count {
    let entry_offset = value_entries_start + i * value_entry_size;
    let mut entry = data
      .get(entry_offset..entry_offset + value_entry_size)
      .ok_or_else(|| Error::protocol("jsonb value entry out of bounds"))?;
    let tag = entry.mysql_get_u8()?;

    let value = if is_inlined(tag, large) {
      decode_tagged(tag, entry)?
    } else {
      let value_offset = entry.mysql_get_uint_le(offset_size)? as usize;
      if value_offset >= data.len() {
        return Err(Error::protocol("jsonb value offset out of bounds"));
      }
      decode_tagged(tag, &data[value_offset..])?
    };
    elements.push(value);
  }

  if object {
    let mut map = Map::with_capacity(element_count);
    for (key, value) in keys.into_iter().zip(elements) {
      map.insert(key, value);
    }
    Ok(Value::Object(map))
  } else {
    Ok(Value::Array(elements))
  }
}

// Scalars small enough for the entry table itself are stored there instead
// of behind an offset. The large format has room for 32-bit ints too.
fn is_inlined(tag: u8, large: bool) -> bool {
  match tag {
    TYPE_LITERAL | TYPE_INT16 | TYPE_UINT16 => true,
    TYPE_INT32 | TYPE_UINT32 => large,
    _ => false,
  }
}

/// Strings and opaque values carry their length as a base-128 varint, low
/// byte first, at most 5 bytes.
fn decode_variable_length(b: &mut &[u8]) -> Result<u32> {
  let mut len = 0_u64;
  for i in 0..5 {
    let byte = b.mysql_get_u8()? as u64;
    len |= (byte & 0x7f) << (7 * i);
    if byte & 0x80 == 0 {
      if len > u32::MAX as u64 {
        return Err(Error::protocol("jsonb variable length exceeds u32"));
      }
      return Ok(len as u32);
    }
  }
  Err(Error::protocol("jsonb variable length is longer than 5 bytes"))
}
