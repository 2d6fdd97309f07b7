use std::slice::ChunksExact;

use bytes::Bytes;

use crate::{
  buf_ext::BufExt,
  constants::{ColumnFlags, ColumnType},
  error::{Error, Result},
};

/// Owned results for 0..N rows of a text-protocol query.
///
/// The replication session only runs a handful of setup statements
/// (`SHOW VARIABLES`, `SET`, `SHOW MASTER STATUS`), so values stay as
/// server-sent strings.
#[derive(Debug, Default)]
pub struct QueryResults {
  pub columns: Vec<Column>,
  pub values: Vec<RowValue>,
}

pub type RowValue = Option<String>;

impl QueryResults {
  pub fn columns_len(&self) -> usize {
    self.columns.len()
  }

  pub fn rows_len(&self) -> usize {
    if self.columns.is_empty() {
      0
    } else {
      self.values.len() / self.columns.len()
    }
  }

  pub fn row(&self, i: usize) -> &[RowValue] {
    let len = self.columns.len();
    &self.values[i * len..(i + 1) * len]
  }

  pub fn rows(&self) -> Option<ChunksExact<'_, RowValue>> {
    if self.columns.is_empty() {
      None
    } else {
      Some(self.values.chunks_exact(self.columns.len()))
    }
  }
}

// https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_query_response_text_resultset_column_definition.html
#[derive(Debug)]
pub struct Column {
  pub schema: String,
  pub table: String,
  pub name: String,
  pub character_set: u16,
  pub column_length: u32,
  pub column_type: ColumnType,
  pub flags: ColumnFlags,
  pub decimals: u8,
}

impl Column {
  pub(crate) fn parse(mut b: Bytes) -> Result<Self> {
    let catalog = b.mysql_get_lenc_string()?;
    if catalog != "def" {
      return Err(Error::protocol(format!("unexpected column catalog {:?}", catalog)));
    }
    let schema = b.mysql_get_lenc_string()?;
    let table = b.mysql_get_lenc_string()?;
    let _org_table = b.mysql_get_lenc_string()?;
    let name = b.mysql_get_lenc_string()?;
    let _org_name = b.mysql_get_lenc_string()?;
    let _fixed_len = b.mysql_get_lenc_uint()?;
    let character_set = b.mysql_get_u16_le()?;
    let column_length = b.mysql_get_u32_le()?;
    let column_type = b
      .mysql_get_u8()?
      .try_into()
      .map_err(|t| Error::protocol(format!("unknown column type 0x{:02x}", t)))?;
    let flags = ColumnFlags::from_bits_truncate(b.mysql_get_u16_le()?);
    let decimals = b.mysql_get_u8()?;

    Ok(Self {
      schema,
      table,
      name,
      character_set,
      column_length,
      column_type,
      flags,
      decimals,
    })
  }
}
