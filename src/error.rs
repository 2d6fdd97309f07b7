use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// A decoder ran past the end of a buffer while reading a known-layout
  /// region. Fatal for the current event; the stream itself may still be
  /// consumable.
  #[error("truncated buffer: needed {needed} more bytes, {remaining} remaining")]
  Truncated { needed: usize, remaining: usize },

  /// A rows event referenced a table id that was never announced by a
  /// table map event. Usually means the dump started mid-statement.
  #[error("unknown table id {0}")]
  UnknownTableId(u64),

  /// The server sent an ERR packet.
  #[error("server error {code}: {message}")]
  Server { code: u16, message: String },

  /// The server sent something the protocol does not allow at this point.
  #[error("protocol error: {0}")]
  Protocol(String),

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl Error {
  pub(crate) fn protocol(msg: impl Into<String>) -> Self {
    Error::Protocol(msg.into())
  }
}
