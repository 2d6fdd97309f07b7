use std::fmt::{self, Debug};

/// Renders a byte slice as a rust byte-string literal. Used for packet
/// traces, where most of the payload is printable SQL or identifiers.
pub struct DebugBytesRef<'a>(pub &'a [u8]);

impl Debug for DebugBytesRef<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "b\"")?;
    for &b in self.0 {
      match b {
        b'\n' => write!(f, "\\n")?,
        b'\r' => write!(f, "\\r")?,
        b'\t' => write!(f, "\\t")?,
        b'\\' | b'"' => write!(f, "\\{}", b as char)?,
        b'\0' => write!(f, "\\0")?,
        0x20..=0x7e => write!(f, "{}", b as char)?,
        _ => write!(f, "\\x{:02x}", b)?,
      }
    }
    write!(f, "\"")
  }
}

/// Classic offset/hex/ascii dump, emitted at debug level when a rows event
/// fails to decode.
pub struct HexDump<'a>(pub &'a [u8]);

impl Debug for HexDump<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, chunk) in self.0.chunks(16).enumerate() {
      write!(f, "\n{:08x}  ", i * 16)?;
      for j in 0..16 {
        match chunk.get(j) {
          Some(b) => write!(f, "{:02x} ", b)?,
          None => write!(f, "   ")?,
        }
        if j == 7 {
          write!(f, " ")?;
        }
      }
      write!(f, " |")?;
      for &b in chunk {
        let c = if (0x20..0x7f).contains(&b) { b as char } else { '.' };
        write!(f, "{}", c)?;
      }
      write!(f, "|")?;
    }
    Ok(())
  }
}
