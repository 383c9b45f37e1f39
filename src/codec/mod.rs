//! Byte-level reading of tag data.
//!
//! [`BinaryReader`] gives endian-aware random access over an immutable
//! buffer, and [`BinaryReader::unpack`] decodes whole structs from a compact
//! format string.

mod reader;
mod unpack;

pub use reader::{BinaryReader, ReaderOptions};
pub use unpack::{FormatError, Unpacked};
