//! The replication session: connects as a replica, tracks stream state and
//! hands decoded events to the caller one at a time.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::binlog::{
  EventHeader, FormatDescription, Position, RotateEvent, RowsEvent, TableDescription, TableMapEvent,
  ChecksumAlgorithm,
};
use crate::conn::Connection;
use crate::constants::{BinlogEventType, RowsFlags};
use crate::debug::HexDump;
use crate::error::{Error, Result};

/// Table map entries accumulate until a statement boundary arrives with the
/// index above this size; then the whole index is dropped.
const TABLE_MAP_FLUSH_THRESHOLD: usize = 100;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
  /// Server id this replica announces. Must be unique in the topology.
  pub server_id: u32,
  /// Binlog file to dump from.
  pub file: String,
  /// Byte offset to dump from. Values below 4 (the binlog magic) are
  /// rounded up to 4.
  pub offset: u64,
  /// Hostname reported to the primary on registration.
  pub hostname: String,
}

impl Default for ReaderOptions {
  fn default() -> Self {
    Self {
      server_id: 1,
      file: String::new(),
      offset: 4,
      hostname: "localhost".to_string(),
    }
  }
}

/// A binary log reader. Owns its connection; all state moves only through
/// [`Reader::next_event`].
#[derive(Debug)]
pub struct Reader {
  conn: Connection,
  state: StreamState,
}

impl Reader {
  /// Connects, disables checksums, registers as a replica and starts the
  /// dump. The returned reader is ready for [`Reader::next_event`].
  pub async fn connect(url: &Url, options: ReaderOptions) -> Result<Self> {
    let conn = Connection::connect_from_url(url).await?;
    Self::start(conn, options).await
  }

  /// Starts a dump session over an already established connection.
  pub async fn start(mut conn: Connection, options: ReaderOptions) -> Result<Self> {
    let position = Position {
      file: options.file,
      offset: options.offset.max(4),
    };

    conn.disable_checksum().await?;
    conn.register_replica(options.server_id, &options.hostname).await?;
    conn
      .start_dump(&position.file, position.offset as u32, options.server_id)
      .await?;

    Ok(Self {
      conn,
      state: StreamState {
        position,
        format: FormatDescription::default(),
        table_map: HashMap::new(),
      },
    })
  }

  /// Reads and decodes the next event. Returns `Ok(None)` when the server
  /// ends the stream (a non-blocking dump reached the end of the log).
  ///
  /// Cancel safety: the only await point is the packet read, which buffers
  /// internally. Dropping the future and calling again resumes cleanly.
  pub async fn next_event(&mut self) -> Result<Option<Event>> {
    let packet = self.conn.read_packet().await?;

    match packet.first() {
      Some(0x00) => self.state.handle_event_packet(packet.slice(1..)).map(Some),
      Some(0xFF) => Err(self.conn.server_error(packet)),
      Some(0xFE) => Ok(None),
      Some(first) => Err(Error::protocol(format!("unexpected packet header 0x{:02x}", first))),
      None => Err(Error::protocol("empty packet")),
    }
  }

  /// Current resumption point: the end of the last fully decoded event.
  pub fn state(&self) -> Position {
    self.state.position.clone()
  }

  /// Closes the underlying connection.
  pub async fn close(self) -> Result<()> {
    self.conn.shutdown().await
  }
}

/// Decoder state threaded through the event stream, separate from the
/// connection so it can be driven with captured packets.
#[derive(Debug, Default)]
struct StreamState {
  position: Position,
  format: FormatDescription,
  table_map: HashMap<u64, TableDescription>,
}

impl StreamState {
  /// Decodes one event packet (the 0x00 status byte already stripped) and
  /// applies its effect on the session state.
  fn handle_event_packet(&mut self, packet: Bytes) -> Result<Event> {
    let mut b = &packet[..];
    let header = EventHeader::parse(&mut b)?;

    // Artificial events report offset zero; they must not move the cursor.
    if header.next_offset > 0 {
      self.position.offset = header.next_offset as u64;
    }

    let header_len = self.format.header_len();
    if packet.len() < header_len {
      return Err(Error::Truncated {
        needed: header_len - packet.len(),
        remaining: packet.len(),
      });
    }
    let mut payload = packet.slice(header_len..);

    // The format description keeps its checksum; everything after it loses
    // the trailing CRC32 we asked the server not to verify against.
    if self.format.server_details.checksum_algorithm == ChecksumAlgorithm::Crc32
      && header.kind() != Some(BinlogEventType::FORMAT_DESCRIPTION_EVENT)
    {
      let len = payload.len().saturating_sub(4);
      payload.truncate(len);
    }

    let data = match header.kind() {
      Some(BinlogEventType::FORMAT_DESCRIPTION_EVENT) => {
        let fd = FormatDescription::parse(&payload)?;
        self.format = fd.clone();
        EventData::FormatDescription(fd)
      }

      Some(BinlogEventType::ROTATE_EVENT) => {
        let rotate = RotateEvent::parse(&payload, &self.format)?;
        self.position = rotate.next_file.clone();
        EventData::Rotate(rotate)
      }

      Some(BinlogEventType::TABLE_MAP_EVENT) => {
        let table_map = TableMapEvent::parse(&payload, &self.format)?;
        self.table_map.insert(table_map.table_id, table_map.description.clone());
        EventData::TableMap(table_map)
      }

      Some(event_type) if event_type.is_rows_event() => {
        let (table_id, flags) = RowsEvent::peek_table_id_and_flags(&payload, event_type, &self.format)?;

        // Snapshot before any flush; the event may outlive the index entry.
        let table = self
          .table_map
          .get(&table_id)
          .cloned()
          .ok_or(Error::UnknownTableId(table_id))?;

        // Statement boundaries bound the index size. Flushing on every
        // boundary would throw away entries that are about to be reused,
        // so only an oversized index is dropped.
        if flags.contains(RowsFlags::END_OF_STATEMENT) && self.table_map.len() > TABLE_MAP_FLUSH_THRESHOLD {
          debug!(entries = self.table_map.len(), "clearing table map index");
          self.table_map.clear();
        }

        EventData::Rows(RowsData {
          event_type,
          payload: payload.clone(),
          table,
        })
      }

      Some(BinlogEventType::QUERY_EVENT) => EventData::Query(payload.clone()),
      Some(BinlogEventType::XID_EVENT) => EventData::Xid(payload.clone()),

      Some(BinlogEventType::GTID_EVENT)
      | Some(BinlogEventType::ANONYMOUS_GTID_EVENT)
      | Some(BinlogEventType::PREVIOUS_GTIDS_EVENT) => EventData::Gtid(payload.clone()),

      _ => EventData::Opaque(payload.clone()),
    };

    Ok(Event {
      header,
      format: self.format.clone(),
      offset: self.position.offset,
      data,
    })
  }
}

/// One decoded event, returned to the caller.
#[derive(Debug, Clone)]
pub struct Event {
  pub header: EventHeader,
  /// Format in effect for this event.
  pub format: FormatDescription,
  /// Stream offset at the end of this event; persisting `(file, offset)`
  /// makes the stream resumable here.
  pub offset: u64,
  pub data: EventData,
}

#[derive(Debug, Clone)]
pub enum EventData {
  FormatDescription(FormatDescription),
  Rotate(RotateEvent),
  TableMap(TableMapEvent),
  /// A write/update/delete event. Rows are decoded on demand through
  /// [`Event::decode_rows`].
  Rows(RowsData),
  Query(Bytes),
  Xid(Bytes),
  Gtid(Bytes),
  Opaque(Bytes),
}

/// An undecoded rows event plus the table snapshot it decodes against.
#[derive(Debug, Clone)]
pub struct RowsData {
  pub event_type: BinlogEventType,
  pub table: TableDescription,
  payload: Bytes,
}

impl Event {
  /// The table a rows event applies to.
  pub fn table(&self) -> Option<&TableDescription> {
    match &self.data {
      EventData::Rows(rows) => Some(&rows.table),
      _ => None,
    }
  }

  /// Decodes the row images of a rows event.
  pub fn decode_rows(&self) -> Result<RowsEvent> {
    match &self.data {
      EventData::Rows(rows) => RowsEvent::parse(&rows.payload, rows.event_type, &self.format, &rows.table)
        .map_err(|err| {
          debug!(
            table = %format!("{}.{}", rows.table.schema, rows.table.table),
            error = %err,
            "rows event decode failed: {:?}",
            HexDump(&rows.payload)
          );
          err
        }),
      _ => Err(Error::protocol("not a rows event")),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::binlog::value::Value;
  use crate::binlog::ServerFlavor;
  use bytes::{BufMut, BytesMut};

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

  fn fresh_state() -> StreamState {
    StreamState {
      position: Position {
        file: "mysql-bin.000001".to_string(),
        offset: 4,
      },
      format: FormatDescription::default(),
      table_map: HashMap::new(),
    }
  }

  /// Builds an event packet (sans status byte) around a body.
  fn make_event(event_type: BinlogEventType, next_offset: u32, body: &[u8]) -> Bytes {
    let mut b = BytesMut::new();
    b.put_u32_le(0); // timestamp
    b.put_u8(event_type as u8);
    b.put_u32_le(1); // server id
    b.put_u32_le(19 + body.len() as u32);
    b.put_u32_le(next_offset);
    b.put_u16_le(0); // flags
    b.put(body);
    b.freeze()
  }

  fn users_table_map_body(table_id: u64) -> Vec<u8> {
    let mut b = BytesMut::new();
    b.put_uint_le(table_id, 6);
    b.put_u16_le(1); // flags
    b.put_u8(4);
    b.put(&b"test"[..]);
    b.put_u8(0);
    b.put_u8(5);
    b.put(&b"users"[..]);
    b.put_u8(0);
    b.put_u8(3); // column count
    b.put(&[0x03, 0x0f, 0xf6][..]); // LONG, VARCHAR, NEWDECIMAL
    b.put_u8(4); // packed meta length
    b.put(&[45, 0][..]); // varchar max length, little-endian
    b.put(&[10, 4][..]); // decimal precision/scale
    b.put_u8(0b001); // null bitmap: id is nullable
    b.to_vec()
  }

  // DECIMAL(10,4) encodings: 3 bytes of integer digits, 2 of fraction,
  // sign bit folded into the first byte.
  fn decimal_10_4(int_part: u32, frac_part: u16) -> [u8; 5] {
    let int = int_part.to_be_bytes();
    let frac = frac_part.to_be_bytes();
    [int[1] ^ 0x80, int[2], int[3], frac[0], frac[1]]
  }

  fn write_row(b: &mut BytesMut, id: u32, name: &str, decimal: &[u8]) {
    b.put_u8(0); // null bitmap: nothing null
    b.put_u32_le(id);
    b.put_u8(name.len() as u8);
    b.put(name.as_bytes());
    b.put(decimal);
  }

  #[test]
  fn format_handshake_establishes_the_format() {
    let mut state = fresh_state();
    let event = state.handle_event_packet(Bytes::from_static(&FORMAT_DESCRIPTION_EVENT[1..])).unwrap();

    assert_eq!(4, state.format.version);
    assert_eq!("5.7.18-16-log", state.format.server_version);
    assert_eq!(ServerFlavor::MySQL, state.format.server_details.flavor);
    assert!(matches!(event.data, EventData::FormatDescription(_)));
    assert_eq!(state.format, event.format);
  }

  #[test]
  fn rotate_moves_the_position() {
    let mut state = fresh_state();
    let event = state.handle_event_packet(Bytes::from_static(&ROTATE_EVENT[1..])).unwrap();

    assert_eq!("shopify-bin.000005", state.position.file);
    assert_eq!(150, state.position.offset);
    assert!(matches!(event.data, EventData::Rotate(_)));
  }

  #[test]
  fn next_offset_drives_the_position() {
    let mut state = fresh_state();
    state
      .handle_event_packet(make_event(BinlogEventType::XID_EVENT, 600, &[0; 8]))
      .unwrap();
    assert_eq!(600, state.position.offset);

    // artificial events leave the position alone
    state
      .handle_event_packet(make_event(BinlogEventType::HEARTBEAT_EVENT, 0, &[]))
      .unwrap();
    assert_eq!(600, state.position.offset);
  }

  #[test]
  fn write_rows_decode_against_the_mapped_table() {
    let mut state = fresh_state();
    state
      .handle_event_packet(make_event(BinlogEventType::TABLE_MAP_EVENT, 300, &users_table_map_body(0x400)))
      .unwrap();

    let mut body = BytesMut::new();
    body.put_uint_le(0x400, 6);
    body.put_u16_le(RowsFlags::END_OF_STATEMENT.bits());
    body.put_u16_le(2); // extra data: just its own length
    body.put_u8(3);
    body.put_u8(0b111); // all columns present
    write_row(&mut body, 1, "alice", &decimal_10_4(123, 4500));

    let event = state
      .handle_event_packet(make_event(BinlogEventType::WRITE_ROWS_EVENTV2, 400, &body))
      .unwrap();

    let table = event.table().expect("rows event must carry its table");
    assert_eq!("test", table.schema);
    assert_eq!("users", table.table);

    let rows = event.decode_rows().unwrap();
    assert_eq!(table.column_types.len() as u64, rows.column_count);
    assert_eq!(
      vec![vec![
        Value::UInt(1),
        Value::String("alice".to_string()),
        Value::Decimal("123.4500".to_string()),
      ]],
      rows.rows
    );
    assert_eq!(400, event.offset);
    assert_eq!(400, state.position.offset);
  }

  #[test]
  fn update_rows_carry_before_and_after_images() {
    let mut state = fresh_state();
    state
      .handle_event_packet(make_event(BinlogEventType::TABLE_MAP_EVENT, 300, &users_table_map_body(0x400)))
      .unwrap();

    let mut body = BytesMut::new();
    body.put_uint_le(0x400, 6);
    body.put_u16_le(RowsFlags::END_OF_STATEMENT.bits());
    body.put_u16_le(2);
    body.put_u8(3);
    body.put_u8(0b111); // before image columns
    body.put_u8(0b111); // after image columns
    write_row(&mut body, 1, "alice", &decimal_10_4(1, 0));
    write_row(&mut body, 1, "alice2", &decimal_10_4(2, 0));

    let event = state
      .handle_event_packet(make_event(BinlogEventType::UPDATE_ROWS_EVENTV2, 400, &body))
      .unwrap();

    let rows = event.decode_rows().unwrap();
    assert_eq!(
      vec![
        vec![
          Value::UInt(1),
          Value::String("alice".to_string()),
          Value::Decimal("1.0000".to_string()),
        ],
        vec![
          Value::UInt(1),
          Value::String("alice2".to_string()),
          Value::Decimal("2.0000".to_string()),
        ],
      ],
      rows.rows
    );
  }

  #[test]
  fn unknown_table_id_is_an_error_and_still_advances() {
    let mut state = fresh_state();

    let mut body = BytesMut::new();
    body.put_uint_le(0x999, 6);
    body.put_u16_le(0);
    body.put_u16_le(2);
    body.put_u8(3);
    body.put_u8(0b111);

    let err = state
      .handle_event_packet(make_event(BinlogEventType::WRITE_ROWS_EVENTV2, 500, &body))
      .unwrap_err();
    assert!(matches!(err, Error::UnknownTableId(0x999)));
    assert_eq!(500, state.position.offset);
  }

  #[test]
  fn oversized_table_map_flushes_at_statement_end() {
    let mut state = fresh_state();
    for table_id in 0..101_u64 {
      state
        .handle_event_packet(make_event(
          BinlogEventType::TABLE_MAP_EVENT,
          100 + table_id as u32,
          &users_table_map_body(table_id),
        ))
        .unwrap();
    }
    assert_eq!(101, state.table_map.len());

    let mut body = BytesMut::new();
    body.put_uint_le(7, 6);
    body.put_u16_le(RowsFlags::END_OF_STATEMENT.bits());
    body.put_u16_le(2);
    body.put_u8(3);
    body.put_u8(0b111);
    write_row(&mut body, 9, "bob", &decimal_10_4(0, 0));

    let event = state
      .handle_event_packet(make_event(BinlogEventType::WRITE_ROWS_EVENTV2, 9000, &body))
      .unwrap();

    // the index is gone, but the event kept its own snapshot
    assert_eq!(0, state.table_map.len());
    assert_eq!("users", event.table().unwrap().table);
    assert!(event.decode_rows().is_ok());
  }

  #[test]
  fn mid_statement_rows_do_not_flush() {
    let mut state = fresh_state();
    for table_id in 0..101_u64 {
      state
        .handle_event_packet(make_event(
          BinlogEventType::TABLE_MAP_EVENT,
          100 + table_id as u32,
          &users_table_map_body(table_id),
        ))
        .unwrap();
    }

    let mut body = BytesMut::new();
    body.put_uint_le(7, 6);
    body.put_u16_le(0); // not the end of the statement
    body.put_u16_le(2);
    body.put_u8(3);
    body.put_u8(0b111);
    write_row(&mut body, 9, "bob", &decimal_10_4(0, 0));

    state
      .handle_event_packet(make_event(BinlogEventType::WRITE_ROWS_EVENTV2, 9000, &body))
      .unwrap();
    assert_eq!(101, state.table_map.len());
  }

  #[test]
  fn crc32_trailer_is_stripped_from_non_format_events() {
    let mut state = fresh_state();
    state.format.server_details.checksum_algorithm = ChecksumAlgorithm::Crc32;

    let mut body = b"BEGIN".to_vec();
    body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    let event = state
      .handle_event_packet(make_event(BinlogEventType::QUERY_EVENT, 700, &body))
      .unwrap();

    match event.data {
      EventData::Query(payload) => assert_eq!(&b"BEGIN"[..], &payload[..]),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn unhandled_events_pass_through_raw() {
    let mut state = fresh_state();
    let event = state
      .handle_event_packet(make_event(BinlogEventType::INTVAR_EVENT, 800, &[1, 2, 3]))
      .unwrap();
    match event.data {
      EventData::Opaque(payload) => assert_eq!(&[1, 2, 3][..], &payload[..]),
      other => panic!("unexpected {:?}", other),
    }

    let event = state
      .handle_event_packet(make_event(BinlogEventType::ANONYMOUS_GTID_EVENT, 900, &[0; 25]))
      .unwrap();
    assert!(matches!(event.data, EventData::Gtid(_)));
  }

  #[test]
  fn decode_rows_on_a_non_rows_event_is_an_error() {
    let mut state = fresh_state();
    let event = state
      .handle_event_packet(make_event(BinlogEventType::XID_EVENT, 1000, &[0; 8]))
      .unwrap();
    assert!(event.table().is_none());
    assert!(event.decode_rows().is_err());
  }
}
