//! Decoding of row values, one column at a time.
//!
//! A value's encoding is fully determined by the column type byte and the
//! meta bytes announced by the preceding table map event. Signedness is not
//! part of either, so integers decode as raw unsigned and downstream
//! consumers re-sign against their own schema knowledge.

use tracing::debug;

use super::jsonb;
use crate::buf_ext::BufExt;
use crate::constants::ColumnType;
use crate::debug::HexDump;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  UInt(u64),
  Float(f32),
  Double(f64),
  /// Canonical decimal string at the column's exact scale, e.g. "123.4500".
  Decimal(String),
  String(String),
  Bytes(Vec<u8>),
  Bit(Vec<u8>),
  Enum(u64),
  Set(u64),
  /// "0000" or a 4-digit year.
  Year(String),
  /// "YYYY-MM-DD"
  Date(String),
  /// "HH:MM:SS", with a fractional tail when the column has one.
  Time(String),
  /// "YYYY-MM-DD HH:MM:SS", with a fractional tail when the column has one.
  DateTime(String),
  Timestamp {
    seconds: u32,
    micros: u32,
  },
  Json(serde_json::Value),
  /// Type the codec does not decode (old decimal, new date). Kept in the
  /// row so positional column access still works.
  Unsupported(ColumnType),
}

/// Decodes one column value and leaves the cursor at the next one.
pub fn decode_value(b: &mut &[u8], column_type: ColumnType, meta: u16) -> Result<Value> {
  let (column_type, length) = rewrite_string_meta(column_type, meta)?;

  match column_type {
    ColumnType::MYSQL_TYPE_NULL => Ok(Value::Null),

    ColumnType::MYSQL_TYPE_TINY => b.mysql_get_uint_le(1).map(Value::UInt),
    ColumnType::MYSQL_TYPE_SHORT => b.mysql_get_uint_le(2).map(Value::UInt),
    ColumnType::MYSQL_TYPE_INT24 => b.mysql_get_uint_le(3).map(Value::UInt),
    ColumnType::MYSQL_TYPE_LONG => b.mysql_get_uint_le(4).map(Value::UInt),
    ColumnType::MYSQL_TYPE_LONGLONG => b.mysql_get_uint_le(8).map(Value::UInt),

    ColumnType::MYSQL_TYPE_FLOAT => b.mysql_get_f32_le().map(Value::Float),
    ColumnType::MYSQL_TYPE_DOUBLE => b.mysql_get_f64_le().map(Value::Double),

    ColumnType::MYSQL_TYPE_NEWDECIMAL => {
      let precision = (meta >> 8) as usize;
      let scale = (meta & 0xFF) as usize;
      decode_decimal(b, precision, scale).map(Value::Decimal)
    }

    ColumnType::MYSQL_TYPE_YEAR => {
      let v = b.mysql_get_u8()?;
      Ok(Value::Year(match v {
        0 => "0000".to_string(),
        v => (1900 + v as u16).to_string(),
      }))
    }

    ColumnType::MYSQL_TYPE_DATE => {
      let v = b.mysql_get_uint_le(3)?;
      let day = v & 0x1F;
      let month = (v >> 5) & 0x0F;
      let year = v >> 9;
      Ok(Value::Date(format!("{:04}-{:02}-{:02}", year, month, day)))
    }

    ColumnType::MYSQL_TYPE_TIME => {
      let v = b.mysql_get_uint_le(3)?;
      Ok(Value::Time(format!(
        "{:02}:{:02}:{:02}",
        v / 10_000,
        v / 100 % 100,
        v % 100
      )))
    }

    ColumnType::MYSQL_TYPE_TIME2 => {
      let fsp = meta as u32;
      let packed = b.mysql_get_uint_be(3)? as u32;
      let negative = packed & 0x800000 == 0;
      let v = if negative { 0x800000 - (packed & 0x7FFFFF) } else { packed & 0x7FFFFF };
      let hours = (v >> 12) & 0x3FF;
      let minutes = (v >> 6) & 0x3F;
      let seconds = v & 0x3F;
      let micros = decode_fractional(b, fsp)?;
      let mut out = String::new();
      if negative {
        out.push('-');
      }
      out.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
      push_fractional(&mut out, micros, fsp);
      Ok(Value::Time(out))
    }

    ColumnType::MYSQL_TYPE_TIMESTAMP => {
      let seconds = b.mysql_get_u32_le()?;
      Ok(Value::Timestamp { seconds, micros: 0 })
    }

    ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
      let seconds = b.mysql_get_uint_be(4)? as u32;
      let micros = decode_fractional(b, meta as u32)?;
      Ok(Value::Timestamp { seconds, micros })
    }

    ColumnType::MYSQL_TYPE_DATETIME => {
      let v = b.mysql_get_u64_le()?;
      let date = v / 1_000_000;
      let time = v % 1_000_000;
      Ok(Value::DateTime(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        date / 10_000,
        date / 100 % 100,
        date % 100,
        time / 10_000,
        time / 100 % 100,
        time % 100
      )))
    }

    ColumnType::MYSQL_TYPE_DATETIME2 => {
      let fsp = meta as u32;
      let packed = b.mysql_get_uint_be(5)?;
      let year_month = (packed >> 22) & 0x1FFFF;
      let mut out = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year_month / 13,
        year_month % 13,
        (packed >> 17) & 0x1F,
        (packed >> 12) & 0x1F,
        (packed >> 6) & 0x3F,
        packed & 0x3F
      );
      let micros = decode_fractional(b, fsp)?;
      push_fractional(&mut out, micros, fsp);
      Ok(Value::DateTime(out))
    }

    ColumnType::MYSQL_TYPE_STRING => decode_string(b, length),

    ColumnType::MYSQL_TYPE_VARCHAR | ColumnType::MYSQL_TYPE_VAR_STRING => decode_string(b, length),

    ColumnType::MYSQL_TYPE_BLOB | ColumnType::MYSQL_TYPE_GEOMETRY => {
      b.mysql_get_varenc_bytes(meta as usize).map(Value::Bytes)
    }

    ColumnType::MYSQL_TYPE_JSON => {
      let data = b.mysql_get_varenc_bytes(meta as usize)?;
      match jsonb::decode(&data) {
        Ok(json) => Ok(Value::Json(json)),
        Err(err) => {
          debug!(error = %err, "undecodable jsonb payload: {:?}", HexDump(&data));
          Ok(Value::Bytes(data))
        }
      }
    }

    ColumnType::MYSQL_TYPE_TINY_BLOB => b.mysql_get_varenc_bytes(1).map(Value::Bytes),
    ColumnType::MYSQL_TYPE_MEDIUM_BLOB => b.mysql_get_varenc_bytes(3).map(Value::Bytes),
    ColumnType::MYSQL_TYPE_LONG_BLOB => b.mysql_get_varenc_bytes(4).map(Value::Bytes),

    ColumnType::MYSQL_TYPE_BIT => {
      let nbits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
      b.mysql_get_bytes(nbits.div_ceil(8)).map(Value::Bit)
    }

    ColumnType::MYSQL_TYPE_SET => b.mysql_get_uint_le(length).map(Value::Set),

    ColumnType::MYSQL_TYPE_ENUM => match length {
      1 => b.mysql_get_uint_le(1).map(Value::Enum),
      2 => b.mysql_get_uint_le(2).map(Value::Enum),
      n => Err(Error::protocol(format!("enum with invalid packed length {}", n))),
    },

    ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDATE => {
      Ok(Value::Unsupported(column_type))
    }
  }
}

/// String columns smuggle their real type and length through the meta
/// bytes: the high byte is the type, and for lengths above 255 two length
/// bits hide inverted in the type byte's 0x30 mask.
fn rewrite_string_meta(column_type: ColumnType, meta: u16) -> Result<(ColumnType, usize)> {
  if column_type != ColumnType::MYSQL_TYPE_STRING || meta <= 0xFF {
    return Ok((column_type, meta as usize));
  }

  let type_byte = (meta >> 8) as u8;
  let length_byte = meta & 0xFF;

  let (real_type, length) = if type_byte & 0x30 != 0x30 {
    (
      type_byte | 0x30,
      length_byte | ((((type_byte & 0x30) ^ 0x30) as u16) << 4),
    )
  } else {
    (type_byte, length_byte)
  };

  let real_type = ColumnType::try_from(real_type)
    .map_err(|t| Error::protocol(format!("string column with unknown real type 0x{:02x}", t)))?;
  Ok((real_type, length as usize))
}

fn decode_string(b: &mut &[u8], length: usize) -> Result<Value> {
  let prefix_len = if length < 256 { 1 } else { 2 };
  let bytes = b.mysql_get_varenc_bytes(prefix_len)?;
  Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Fractional seconds: `ceil(fsp / 2)` big-endian bytes holding the
/// fraction at two digits per byte. Returned in microseconds.
fn decode_fractional(b: &mut &[u8], fsp: u32) -> Result<u32> {
  if fsp > 6 {
    return Err(Error::protocol(format!("invalid fractional seconds precision {}", fsp)));
  }
  let nbytes = fsp.div_ceil(2) as usize;
  if nbytes == 0 {
    return Ok(0);
  }
  let stored = b.mysql_get_uint_be(nbytes)? as u32;
  Ok(stored * 10_u32.pow(6 - 2 * nbytes as u32))
}

fn push_fractional(out: &mut String, micros: u32, fsp: u32) {
  if fsp > 0 {
    let digits = format!("{:06}", micros);
    out.push('.');
    out.push_str(&digits[..fsp as usize]);
  }
}

// Packed decimal constants: 9 decimal digits per 4-byte group, and the
// byte cost of a partial group of N digits.
const DIGITS_PER_GROUP: usize = 9;
const GROUP_SIZE_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// Decodes a packed decimal into its canonical string at the requested
/// scale. The sign lives in the MSB of the first byte: set means positive
/// and the bytes are used as-is; clear means negative and every byte is
/// inverted first.
fn decode_decimal(b: &mut &[u8], precision: usize, scale: usize) -> Result<String> {
  if precision == 0 || scale > precision {
    return Err(Error::protocol(format!(
      "invalid decimal precision/scale {}/{}",
      precision, scale
    )));
  }

  let int_digits = precision - scale;
  let int_groups = int_digits / DIGITS_PER_GROUP;
  let int_residual = int_digits % DIGITS_PER_GROUP;
  let frac_groups = scale / DIGITS_PER_GROUP;
  let frac_residual = scale % DIGITS_PER_GROUP;

  let total = int_groups * 4
    + GROUP_SIZE_BYTES[int_residual]
    + frac_groups * 4
    + GROUP_SIZE_BYTES[frac_residual];

  let mut bytes = b.mysql_get_bytes(total)?;
  let positive = bytes[0] & 0x80 != 0;
  bytes[0] ^= 0x80;
  if !positive {
    for byte in bytes.iter_mut() {
      *byte = !*byte;
    }
  }

  let mut r = bytes.as_slice();
  let mut out = String::with_capacity(precision + 2);
  if !positive {
    out.push('-');
  }

  let mut int_part = String::new();
  if int_residual > 0 {
    let v = r.mysql_get_uint_be(GROUP_SIZE_BYTES[int_residual])?;
    if v > 0 {
      int_part.push_str(&v.to_string());
    }
  }
  for _ in 0..int_groups {
    let v = r.mysql_get_uint_be(4)?;
    if int_part.is_empty() {
      if v > 0 {
        int_part.push_str(&v.to_string());
      }
    } else {
      int_part.push_str(&format!("{:09}", v));
    }
  }
  if int_part.is_empty() {
    int_part.push('0');
  }
  out.push_str(&int_part);

  if scale > 0 {
    out.push('.');
    for _ in 0..frac_groups {
      let v = r.mysql_get_uint_be(4)?;
      out.push_str(&format!("{:09}", v));
    }
    if frac_residual > 0 {
      let v = r.mysql_get_uint_be(GROUP_SIZE_BYTES[frac_residual])?;
      out.push_str(&format!("{:0width$}", v, width = frac_residual));
    }
  }

  Ok(out)
}
