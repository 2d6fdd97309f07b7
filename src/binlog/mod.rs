//! Binlog v4 event decoding.
//!
//! Layouts follow the binary log event format:
//! https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_replication_binlog_event.html

pub mod jsonb;
pub mod value;

use std::fmt;
use std::str::FromStr;

use bytes::Buf;

use crate::buf_ext::BufExt;
use crate::constants::{BinlogEventType, ColumnType, RowsFlags, EVENT_HEADER_LEN};
use crate::error::{Error, Result};
use value::Value;

/// A `(file, offset)` resumption point. Marks the end of the last fully
/// decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
  pub file: String,
  pub offset: u64,
}

impl fmt::Display for Position {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.file, self.offset)
  }
}

impl FromStr for Position {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    let (file, offset) = s
      .split_once('/')
      .ok_or_else(|| "expected <file>/<offset>".to_string())?;
    let offset = offset.parse().map_err(|_| "offset must be a u64".to_string())?;
    Ok(Self {
      file: file.to_string(),
      offset,
    })
  }
}

/// The 19-byte header common to every v4 event.
#[derive(Debug, Clone)]
pub struct EventHeader {
  pub timestamp: u32,
  pub event_type: u8,
  pub server_id: u32,
  pub event_len: u32,
  /// Offset of the next event in the current file. Zero for events the
  /// server fabricates for the dump stream.
  pub next_offset: u32,
  pub flags: u16,
}

impl EventHeader {
  pub fn parse(b: &mut &[u8]) -> Result<Self> {
    let timestamp = b.mysql_get_u32_le()?;
    let event_type = b.mysql_get_u8()?;
    let server_id = b.mysql_get_u32_le()?;
    let event_len = b.mysql_get_u32_le()?;
    let next_offset = b.mysql_get_u32_le()?;
    let flags = b.mysql_get_u16_le()?;

    Ok(Self {
      timestamp,
      event_type,
      server_id,
      event_len,
      next_offset,
      flags,
    })
  }

  pub fn kind(&self) -> Option<BinlogEventType> {
    self.event_type.try_into().ok()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
  None,
  Crc32,
  Undefined,
}

impl From<u8> for ChecksumAlgorithm {
  fn from(v: u8) -> Self {
    match v {
      0x00 => ChecksumAlgorithm::None,
      0x01 => ChecksumAlgorithm::Crc32,
      _ => ChecksumAlgorithm::Undefined,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFlavor {
  MySQL,
  MariaDB,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDetails {
  pub flavor: ServerFlavor,
  pub checksum_algorithm: ChecksumAlgorithm,
}

/// Parsed from the first event of every file; carries the per-event-type
/// post-header lengths the rest of the stream is decoded against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
  pub version: u16,
  pub server_version: String,
  pub create_timestamp: u32,
  pub header_len: u8,
  pub event_type_header_lens: Vec<u8>,
  pub server_details: ServerDetails,
}

impl Default for FormatDescription {
  fn default() -> Self {
    Self {
      version: 4,
      server_version: String::new(),
      create_timestamp: 0,
      header_len: EVENT_HEADER_LEN as u8,
      event_type_header_lens: Vec::new(),
      server_details: ServerDetails {
        flavor: ServerFlavor::MySQL,
        checksum_algorithm: ChecksumAlgorithm::None,
      },
    }
  }
}

// Fixed-size prefix of the format description body: version, the 50-byte
// server version, create timestamp and the header length byte.
const FORMAT_DESCRIPTION_PREFIX_LEN: usize = 2 + 50 + 4 + 1;

impl FormatDescription {
  pub fn parse(buffer: &[u8]) -> Result<Self> {
    let mut b = buffer;
    let version = b.mysql_get_u16_le()?;

    let server_version_raw = b.mysql_get_bytes(50)?;
    let nul = server_version_raw.iter().position(|x| *x == 0x00).unwrap_or(50);
    let server_version = String::from_utf8_lossy(&server_version_raw[..nul]).into_owned();

    let create_timestamp = b.mysql_get_u32_le()?;
    let header_len = b.mysql_get_u8()?;
    let mut event_type_header_lens = b.mysql_get_bytes_eof();

    // The description describes itself: its own post-header length equals
    // the fixed prefix plus one byte per known event type. When the raw
    // tail is five bytes longer than that, the server appended a checksum
    // algorithm byte and the event's own CRC32.
    let mut checksum_algorithm = ChecksumAlgorithm::None;
    let fde_index = BinlogEventType::FORMAT_DESCRIPTION_EVENT as usize - 1;
    if let Some(own_len) = event_type_header_lens.get(fde_index).copied() {
      let type_count = (own_len as usize).saturating_sub(FORMAT_DESCRIPTION_PREFIX_LEN);
      if type_count > fde_index && event_type_header_lens.len() == type_count + 5 {
        checksum_algorithm = event_type_header_lens[type_count].into();
        event_type_header_lens.truncate(type_count);
      }
    }

    let flavor = if server_version.contains("MariaDB") {
      ServerFlavor::MariaDB
    } else {
      ServerFlavor::MySQL
    };

    Ok(Self {
      version,
      server_version,
      create_timestamp,
      header_len,
      event_type_header_lens,
      server_details: ServerDetails {
        flavor,
        checksum_algorithm,
      },
    })
  }

  pub fn header_len(&self) -> usize {
    if self.header_len == 0 {
      EVENT_HEADER_LEN
    } else {
      self.header_len as usize
    }
  }

  /// Table ids are 6 bytes wide unless the post-header length for the given
  /// rows/table-map event type says the short 4-byte form is in use.
  pub fn table_id_size(&self, event_type: BinlogEventType) -> usize {
    match self.event_type_header_lens.get(event_type as usize - 1) {
      Some(6) => 4,
      _ => 6,
    }
  }
}

/// Written at the end of a file to point at its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
  pub next_file: Position,
}

impl RotateEvent {
  pub fn parse(buffer: &[u8], fd: &FormatDescription) -> Result<Self> {
    let mut b = buffer;
    let offset = if fd.version > 1 { b.mysql_get_u64_le()? } else { 4 };
    let file = b.mysql_get_eof_string()?;

    Ok(Self {
      next_file: Position { file, offset },
    })
  }
}

/// Everything later rows events need to know about a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
  pub schema: String,
  pub table: String,
  pub column_types: Vec<ColumnType>,
  pub column_meta: Vec<u16>,
  pub null_bitmap: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TableMapEvent {
  pub table_id: u64,
  pub flags: u16,
  pub description: TableDescription,
}

impl TableMapEvent {
  pub fn parse(buffer: &[u8], fd: &FormatDescription) -> Result<Self> {
    let mut b = buffer;
    let table_id = b.mysql_get_uint_le(fd.table_id_size(BinlogEventType::TABLE_MAP_EVENT))?;
    let flags = b.mysql_get_u16_le()?;

    let schema_len = b.mysql_get_u8()? as usize;
    let schema = b.mysql_get_fixed_length_string(schema_len)?;
    b.mysql_skip(1)?; // 0x00 terminator

    let table_len = b.mysql_get_u8()? as usize;
    let table = b.mysql_get_fixed_length_string(table_len)?;
    b.mysql_skip(1)?;

    let column_count = b.mysql_get_lenc_uint()? as usize;
    let column_types = b
      .mysql_get_bytes(column_count)?
      .into_iter()
      .map(|v| ColumnType::try_from(v).map_err(|t| Error::protocol(format!("unknown column type 0x{:02x}", t))))
      .collect::<Result<Vec<_>>>()?;

    let packed_meta = b.mysql_get_lenc_bytes()?;
    let column_meta = unpack_column_meta(&column_types, &packed_meta)?;

    let null_bitmap = b.mysql_get_bytes(column_count.div_ceil(8))?;

    Ok(Self {
      table_id,
      flags,
      description: TableDescription {
        schema,
        table,
        column_types,
        column_meta,
        null_bitmap,
      },
    })
  }
}

/// Expands the packed per-column meta blob into one u16 per column.
///
/// Each type consumes 0, 1 or 2 bytes. The two-byte entries are not encoded
/// uniformly: STRING and NEWDECIMAL put the discriminating byte (real type,
/// precision) first, VARCHAR/VAR_STRING/BIT are plain little-endian.
fn unpack_column_meta(column_types: &[ColumnType], packed: &[u8]) -> Result<Vec<u16>> {
  let mut b = packed;
  let mut column_meta = vec![0_u16; column_types.len()];

  for (i, t) in column_types.iter().enumerate() {
    column_meta[i] = match t {
      ColumnType::MYSQL_TYPE_STRING | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
        let high = b.mysql_get_u8()? as u16;
        let low = b.mysql_get_u8()? as u16;
        (high << 8) | low
      }

      ColumnType::MYSQL_TYPE_VARCHAR | ColumnType::MYSQL_TYPE_VAR_STRING | ColumnType::MYSQL_TYPE_BIT => {
        b.mysql_get_u16_le()?
      }

      ColumnType::MYSQL_TYPE_FLOAT
      | ColumnType::MYSQL_TYPE_DOUBLE
      | ColumnType::MYSQL_TYPE_BLOB
      | ColumnType::MYSQL_TYPE_GEOMETRY
      | ColumnType::MYSQL_TYPE_JSON
      | ColumnType::MYSQL_TYPE_TIME2
      | ColumnType::MYSQL_TYPE_DATETIME2
      | ColumnType::MYSQL_TYPE_TIMESTAMP2 => b.mysql_get_u8()? as u16,

      _ => 0,
    };
  }

  Ok(column_meta)
}

/// A write/update/delete event, fully decoded.
#[derive(Debug, Clone)]
pub struct RowsEvent {
  pub event_type: BinlogEventType,
  pub table_id: u64,
  pub flags: u16,
  pub extra_data: Vec<u8>,
  pub column_count: u64,
  pub present_bitmap_1: Vec<u8>,
  pub present_bitmap_2: Option<Vec<u8>>,
  /// One inner vec per row image. Updates contribute two images per row:
  /// before, then after.
  pub rows: Vec<Vec<Value>>,
}

impl RowsEvent {
  /// Reads `(table_id, flags)` without decoding the event, so the caller
  /// can consult its table map index first.
  pub fn peek_table_id_and_flags(
    buffer: &[u8],
    event_type: BinlogEventType,
    fd: &FormatDescription,
  ) -> Result<(u64, RowsFlags)> {
    let mut b = buffer;
    let table_id = b.mysql_get_uint_le(fd.table_id_size(event_type))?;
    let flags = b.mysql_get_u16_le()?;
    Ok((table_id, RowsFlags::from_bits_truncate(flags)))
  }

  pub fn parse(
    buffer: &[u8],
    event_type: BinlogEventType,
    fd: &FormatDescription,
    td: &TableDescription,
  ) -> Result<Self> {
    let mut b = buffer;
    let table_id = b.mysql_get_uint_le(fd.table_id_size(event_type))?;
    let flags = b.mysql_get_u16_le()?;

    let extra_data = if event_type.rows_have_extra_data() {
      // The length prefix counts itself.
      let extra_len = b.mysql_get_u16_le()? as usize;
      b.mysql_get_bytes(extra_len.saturating_sub(2))?
    } else {
      Vec::new()
    };

    let column_count = b.mysql_get_lenc_uint()?;
    let bitmap_len = (column_count as usize).div_ceil(8);

    let present_bitmap_1 = b.mysql_get_bytes(bitmap_len)?;
    let present_bitmap_2 = if event_type.rows_have_second_bitmap() {
      Some(b.mysql_get_bytes(bitmap_len)?)
    } else {
      None
    };

    let mut rows = Vec::new();
    while b.has_remaining() {
      rows.push(decode_row_image(&mut b, td, &present_bitmap_1, column_count as usize)?);

      if let Some(bitmap_2) = present_bitmap_2.as_ref() {
        rows.push(decode_row_image(&mut b, td, bitmap_2, column_count as usize)?);
      }
    }

    Ok(Self {
      event_type,
      table_id,
      flags,
      extra_data,
      column_count,
      present_bitmap_1,
      present_bitmap_2,
      rows,
    })
  }
}

/// One row image against a present-column bitmap: a null bitmap sized by the
/// number of present columns, then one encoded value per present, non-null
/// column. Absent columns come back as `Value::Null`.
fn decode_row_image(
  b: &mut &[u8],
  td: &TableDescription,
  present: &[u8],
  column_count: usize,
) -> Result<Vec<Value>> {
  let present_count = (0..column_count).filter(|i| is_bit_set(present, *i)).count();
  let null_bitmap = b.mysql_get_bytes(present_count.div_ceil(8))?;

  let mut row = Vec::with_capacity(column_count);
  let mut null_idx = 0;
  for i in 0..column_count {
    if !is_bit_set(present, i) {
      row.push(Value::Null);
      continue;
    }

    let is_null = is_bit_set(&null_bitmap, null_idx);
    null_idx += 1;
    if is_null {
      row.push(Value::Null);
      continue;
    }

    let column_type = *td
      .column_types
      .get(i)
      .ok_or_else(|| Error::protocol("row has more columns than its table map"))?;
    let meta = td.column_meta.get(i).copied().unwrap_or(0);
    row.push(value::decode_value(b, column_type, meta)?);
  }

  Ok(row)
}

pub(crate) fn is_bit_set(bitmap: &[u8], i: usize) -> bool {
  bitmap
    .get(i >> 3)
    .map(|byte| byte & (1 << (i & 7)) > 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod test {
  use super::*;

  // Captured packets below include the network OK byte; tests strip it and
  // split header from body the way the reader does.
  fn split_event(packet: &[u8]) -> (EventHeader, Vec<u8>) {
    let mut b = &packet[1..];
    let header = EventHeader::parse(&mut b).unwrap();
    (header, b.to_vec())
  }

  const FORMAT_DESCRIPTION_EVENT: &[u8] = b"\x00\xf2\x43\x5d\x5d\x0f\x01\x00\x00\x00\x77\x00\x00\x00\x00\x00\x00\
                                            \x00\x00\x00\x04\x00\x35\x2e\x37\x2e\x31\x38\x2d\x31\x36\x2d\x6c\x6f\
                                            \x67\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\
                                            \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\
                                            \x00\x00\x00\x00\x00\x00\x00\x00\x13\x38\x0d\x00\x08\x00\x12\x00\x04\
                                            \x04\x04\x04\x12\x00\x00\x5f\x00\x04\x1a\x08\x00\x00\x00\x08\x08\x08\
                                            \x02\x00\x00\x00\x0a\x0a\x0a\x2a\x2a\x00\x12\x34\x00\x00\xc2\x36\x0c\
                                            \xdf";

  const ROTATE_EVENT: &[u8] = b"\x00\x00\x00\x00\x00\x04\x01\x00\x00\x00\x2d\x00\x00\x00\x00\x00\x00\
                                \x00\x20\x00\x96\x00\x00\x00\x00\x00\x00\x00\x73\x68\x6f\x70\x69\x66\
                                \x79\x2d\x62\x69\x6e\x2e\x30\x30\x30\x30\x30\x35";

  const TABLE_MAP_EVENT: &[u8] = b"\x00\xfc\x5a\x5d\x5d\x13\x01\x00\x00\x00\x32\x00\x00\x00\x49\x01\x00\
                                   \x00\x00\x00\x2d\x0a\x00\x00\x00\x00\x01\x00\x04\x70\x65\x74\x73\x00\
                                   \x04\x63\x61\x74\x73\x00\x04\x03\x0f\x0f\x0a\x04\x58\x02\x58\x02\x00";

  const INSERT_ROW_EVENT: &[u8] = b"\x00\xfc\x5a\x5d\x5d\x1e\x01\x00\x00\x00\x37\x00\x00\x00\x80\x01\x00\
                                    \x00\x00\x00\x2d\x0a\x00\x00\x00\x00\x01\x00\x02\x00\x04\xff\xf0\x04\
                                    \x00\x00\x00\x07\x00\x43\x68\x61\x72\x6c\x69\x65\x05\x00\x52\x69\x76\
                                    \x65\x72\xb5\xc0\x0f";

  #[test]
  fn parses_event_header() {
    let (header, body) = split_event(ROTATE_EVENT);
    assert_eq!(BinlogEventType::ROTATE_EVENT as u8, header.event_type);
    assert_eq!(Some(BinlogEventType::ROTATE_EVENT), header.kind());
    assert_eq!(0x2d, header.event_len);
    assert_eq!(0, header.next_offset);
    assert_eq!(0x20, header.flags);
    assert_eq!(0x2d as usize - EVENT_HEADER_LEN, body.len());
  }

  #[test]
  fn parses_format_description() {
    let (header, body) = split_event(FORMAT_DESCRIPTION_EVENT);
    assert_eq!(Some(BinlogEventType::FORMAT_DESCRIPTION_EVENT), header.kind());

    let fd = FormatDescription::parse(&body).unwrap();
    assert_eq!(4, fd.version);
    assert_eq!("5.7.18-16-log", fd.server_version);
    assert_eq!(0, fd.create_timestamp);
    assert_eq!(EVENT_HEADER_LEN, fd.header_len());
    assert_eq!(ServerFlavor::MySQL, fd.server_details.flavor);
    // the capture has the checksum block appended with the algorithm off
    assert_eq!(ChecksumAlgorithm::None, fd.server_details.checksum_algorithm);
    assert_eq!(38, fd.event_type_header_lens.len());
    // and describes itself correctly
    assert_eq!(
      95,
      fd.event_type_header_lens[BinlogEventType::FORMAT_DESCRIPTION_EVENT as usize - 1]
    );
    assert_eq!(6, fd.table_id_size(BinlogEventType::TABLE_MAP_EVENT));
  }

  #[test]
  fn detects_crc32_checksum_block() {
    let mut body = Vec::new();
    body.extend_from_slice(&4_u16.to_le_bytes());
    let mut server_version = [0_u8; 50];
    server_version[..6].copy_from_slice(b"8.0.32");
    body.extend_from_slice(&server_version);
    body.extend_from_slice(&0_u32.to_le_bytes());
    body.push(EVENT_HEADER_LEN as u8);
    // 41 event types; the description's own entry says 57 + 41
    let mut lens = vec![0_u8; 41];
    lens[BinlogEventType::FORMAT_DESCRIPTION_EVENT as usize - 1] = (FORMAT_DESCRIPTION_PREFIX_LEN + 41) as u8;
    body.extend_from_slice(&lens);
    body.push(0x01); // CRC32
    body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

    let fd = FormatDescription::parse(&body).unwrap();
    assert_eq!(ChecksumAlgorithm::Crc32, fd.server_details.checksum_algorithm);
    assert_eq!(41, fd.event_type_header_lens.len());
  }

  #[test]
  fn parses_rotate() {
    let (header, body) = split_event(ROTATE_EVENT);
    assert_eq!(Some(BinlogEventType::ROTATE_EVENT), header.kind());

    let rotate = RotateEvent::parse(&body, &FormatDescription::default()).unwrap();
    assert_eq!("shopify-bin.000005", rotate.next_file.file);
    assert_eq!(150, rotate.next_file.offset);
  }

  #[test]
  fn parses_table_map() {
    let (header, body) = split_event(TABLE_MAP_EVENT);
    assert_eq!(Some(BinlogEventType::TABLE_MAP_EVENT), header.kind());

    let event = TableMapEvent::parse(&body, &FormatDescription::default()).unwrap();
    assert_eq!(2605, event.table_id);
    assert_eq!(1, event.flags);
    assert_eq!("pets", event.description.schema);
    assert_eq!("cats", event.description.table);
    assert_eq!(
      vec![
        ColumnType::MYSQL_TYPE_LONG,
        ColumnType::MYSQL_TYPE_VARCHAR,
        ColumnType::MYSQL_TYPE_VARCHAR,
        ColumnType::MYSQL_TYPE_DATE,
      ],
      event.description.column_types
    );
    assert_eq!(vec![0, 600, 600, 0], event.description.column_meta);
    assert_eq!(vec![0x00], event.description.null_bitmap);
  }

  #[test]
  fn width_zero_types_get_zero_meta() {
    let types = vec![
      ColumnType::MYSQL_TYPE_LONG,
      ColumnType::MYSQL_TYPE_TIMESTAMP,
      ColumnType::MYSQL_TYPE_LONGLONG,
      ColumnType::MYSQL_TYPE_DATE,
      ColumnType::MYSQL_TYPE_YEAR,
    ];
    assert_eq!(vec![0, 0, 0, 0, 0], unpack_column_meta(&types, &[]).unwrap());
  }

  #[test]
  fn unpacks_string_meta_big_endian() {
    // CHAR(3): real type in the high byte, length in the low byte
    let types = vec![ColumnType::MYSQL_TYPE_STRING];
    let meta = unpack_column_meta(&types, &[0xfe, 0x03]).unwrap();
    assert_eq!(vec![0xfe03], meta);
  }

  #[test]
  fn unpacks_decimal_meta_precision_first() {
    let types = vec![ColumnType::MYSQL_TYPE_NEWDECIMAL];
    let meta = unpack_column_meta(&types, &[0x0a, 0x04]).unwrap();
    assert_eq!(vec![0x0a04], meta);
  }

  #[test]
  fn truncated_meta_is_an_error() {
    let types = vec![ColumnType::MYSQL_TYPE_VARCHAR];
    assert!(matches!(
      unpack_column_meta(&types, &[0x58]),
      Err(Error::Truncated { .. })
    ));
  }

  #[test]
  fn peeks_rows_header_without_consuming() {
    let (header, body) = split_event(INSERT_ROW_EVENT);
    let event_type = header.kind().unwrap();
    assert_eq!(BinlogEventType::WRITE_ROWS_EVENTV2, event_type);

    let fd = FormatDescription::default();
    let (table_id, flags) =
      RowsEvent::peek_table_id_and_flags(&body, event_type, &fd).unwrap();
    assert_eq!(2605, table_id);
    assert!(flags.contains(RowsFlags::END_OF_STATEMENT));
  }

  #[test]
  fn decodes_insert_row_against_table_map() {
    let (_, map_body) = split_event(TABLE_MAP_EVENT);
    let (header, body) = split_event(INSERT_ROW_EVENT);
    let fd = FormatDescription::default();
    let td = TableMapEvent::parse(&map_body, &fd).unwrap().description;

    let event = RowsEvent::parse(&body, header.kind().unwrap(), &fd, &td).unwrap();
    assert_eq!(2605, event.table_id);
    assert_eq!(4, event.column_count);
    assert_eq!(1, event.rows.len());
    assert_eq!(
      vec![
        Value::UInt(4),
        Value::String("Charlie".to_string()),
        Value::String("River".to_string()),
        Value::Date("2016-05-21".to_string()),
      ],
      event.rows[0]
    );
  }

  #[test]
  fn position_parses_and_prints() {
    let position: Position = "mysql-bin.000042/4".parse().unwrap();
    assert_eq!("mysql-bin.000042", position.file);
    assert_eq!(4, position.offset);
    assert_eq!("mysql-bin.000042/4", position.to_string());
    assert!("nonsense".parse::<Position>().is_err());
  }
}
