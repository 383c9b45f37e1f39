use bytes::Bytes;
use std::fmt::Write;

use super::unpack::FormatError;
use crate::utils::latin1;

/// Construction options for a [`BinaryReader`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ReaderOptions {
    /// Position in the buffer that index `0` refers to.
    pub offset: usize,
    /// Declared length of the readable window. Defaults to the rest of the
    /// buffer after `offset`.
    pub length: Option<usize>,
    pub big_endian: bool,
}

/// Random-access reader over an immutable byte buffer.
///
/// All `*_at` methods take an index relative to the reader's own offset.
/// Reads are permissive: an index past the end of the buffer reads as `0`
/// instead of panicking, so callers that need strictness must check
/// [`BinaryReader::len`] themselves.
#[derive(Clone, Debug)]
pub struct BinaryReader {
    data: Bytes,
    offset: usize,
    length: usize,
    big_endian: bool,
}

impl BinaryReader {
    /// A little-endian reader over the whole buffer.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::with_options(data, ReaderOptions::default())
    }

    pub fn with_options(data: impl Into<Bytes>, options: ReaderOptions) -> Self {
        let data = data.into();
        let length = options
            .length
            .unwrap_or_else(|| data.len().saturating_sub(options.offset));
        Self {
            data,
            offset: options.offset,
            length,
            big_endian: options.big_endian,
        }
    }

    /// Decode a percent-encoded dump produced by
    /// [`BinaryReader::to_encoded_string`].
    pub fn from_encoded_string(encoded: &str) -> Result<Self, FormatError> {
        let raw = encoded.as_bytes();
        let mut out = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] == b'%' {
                let hex = raw
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or(FormatError::BadEscape(i))?;
                out.push(hex);
                i += 3;
            } else {
                out.push(raw[i]);
                i += 1;
            }
        }
        Ok(Self::new(out))
    }

    /// Declared length of the readable window.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn set_big_endian(&mut self, big_endian: bool) {
        self.big_endian = big_endian;
    }

    /// The bytes of the readable window.
    pub fn bytes(&self) -> Bytes {
        let start = self.offset.min(self.data.len());
        let end = (self.offset + self.length).min(self.data.len());
        self.data.slice(start..end)
    }

    /// A reader over `length` bytes starting at `start`, sharing the buffer.
    pub fn slice(&self, start: usize, length: usize) -> Self {
        Self {
            data: self.data.clone(),
            offset: self.offset + start,
            length,
            big_endian: self.big_endian,
        }
    }

    pub fn byte_at(&self, i: usize) -> u8 {
        self.data.get(self.offset + i).copied().unwrap_or(0)
    }

    pub fn signed_byte_at(&self, i: usize) -> i8 {
        self.byte_at(i) as i8
    }

    pub fn short_at(&self, i: usize) -> u16 {
        let pair = [self.byte_at(i), self.byte_at(i + 1)];
        if self.big_endian {
            u16::from_be_bytes(pair)
        } else {
            u16::from_le_bytes(pair)
        }
    }

    pub fn signed_short_at(&self, i: usize) -> i16 {
        self.short_at(i) as i16
    }

    pub fn long_at(&self, i: usize) -> u32 {
        let quad = [
            self.byte_at(i),
            self.byte_at(i + 1),
            self.byte_at(i + 2),
            self.byte_at(i + 3),
        ];
        if self.big_endian {
            u32::from_be_bytes(quad)
        } else {
            u32::from_le_bytes(quad)
        }
    }

    pub fn signed_long_at(&self, i: usize) -> i32 {
        self.long_at(i) as i32
    }

    pub fn char_at(&self, i: usize) -> char {
        char::from(self.byte_at(i))
    }

    /// Reads `len` raw bytes, one character per byte.
    pub fn string_at(&self, i: usize, len: usize) -> String {
        let bytes: Vec<u8> = (i..i + len).map(|n| self.byte_at(n)).collect();
        latin1(&bytes)
    }

    /// Raw bytes of `[i, i + len)`, zero-filled past the end of the buffer.
    pub fn bytes_at(&self, i: usize, len: usize) -> Vec<u8> {
        (i..i + len).map(|n| self.byte_at(n)).collect()
    }

    /// Bits of the byte at `i`, most significant first, left-padded with
    /// zeros to `num_bits`.
    ///
    /// The shortest binary form of the byte is used before padding, so a
    /// byte that needs more than `num_bits` digits yields all of them.
    pub fn bits_at(&self, i: usize, num_bits: usize) -> Vec<u8> {
        let byte = self.byte_at(i);
        let digits = (8 - byte.leading_zeros() as usize).max(1);
        let width = digits.max(num_bits);
        (0..width)
            .rev()
            .map(|bit| if bit < 8 { (byte >> bit) & 1 } else { 0 })
            .collect()
    }

    /// [`BinaryReader::bits_at`] with 8 bits for each of `len` bytes.
    pub fn bits_from_string_at(&self, i: usize, len: usize) -> Vec<Vec<u8>> {
        (i..i + len).map(|n| self.bits_at(n, 8)).collect()
    }

    /// Percent-encodes the readable window; unreserved ASCII is kept as is.
    pub fn to_encoded_string(&self) -> String {
        let mut out = String::with_capacity(self.length * 3);
        for n in 0..self.length {
            let b = self.byte_at(n);
            if b.is_ascii_alphanumeric() || b"-_.!~*'()".contains(&b) {
                out.push(char::from(b));
            } else {
                let _ = write!(out, "%{:02X}", b);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le() -> BinaryReader {
        BinaryReader::new(vec![0u8, 0, 1, 0])
    }

    fn be() -> BinaryReader {
        BinaryReader::with_options(
            vec![0u8, 1, 0, 0],
            ReaderOptions {
                big_endian: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn options_default_to_whole_buffer() {
        assert_eq!(le().len(), 4);
        assert!(!le().is_big_endian());
        assert_eq!(be().len(), 4);
        assert!(be().is_big_endian());

        let windowed = BinaryReader::with_options(
            vec![9u8, 8, 7, 6],
            ReaderOptions {
                offset: 1,
                ..Default::default()
            },
        );
        assert_eq!(windowed.len(), 3);
        assert_eq!(windowed.byte_at(0), 8);
    }

    #[test]
    fn reads_bytes() {
        assert_eq!(le().byte_at(0), 0);
        assert_eq!(le().byte_at(2), 1);
        assert_eq!(be().byte_at(1), 1);
        assert_eq!(BinaryReader::new(vec![0xFFu8]).signed_byte_at(0), -1);
    }

    #[test]
    fn reads_shorts_in_both_orders() {
        assert_eq!(le().short_at(0), 0);
        assert_eq!(le().short_at(1), 256);
        assert_eq!(le().short_at(2), 1);

        assert_eq!(be().short_at(0), 1);
        assert_eq!(be().short_at(1), 256);
        assert_eq!(be().short_at(2), 0);

        assert_eq!(BinaryReader::new(vec![0xFFu8, 0xFF]).signed_short_at(0), -1);
    }

    #[test]
    fn reads_longs_in_both_orders() {
        assert_eq!(le().long_at(0), 65536);
        assert_eq!(be().long_at(0), 65536);
        let max = BinaryReader::new(vec![0xFFu8; 4]);
        assert_eq!(max.long_at(0), u32::MAX);
        assert_eq!(max.signed_long_at(0), -1);
    }

    #[test]
    fn reads_bits() {
        assert_eq!(le().bits_at(2, 2), vec![0, 1]);
        assert_eq!(be().bits_at(1, 4), vec![0, 0, 0, 1]);
        assert_eq!(BinaryReader::new(b"2".to_vec()).bits_at(0, 8), vec![0, 0, 1, 1, 0, 0, 1, 0]);
    }

    #[test]
    fn out_of_range_reads_are_zero() {
        let r = le();
        assert_eq!(r.byte_at(100), 0);
        assert_eq!(r.long_at(3), 0);
        assert_eq!(r.string_at(3, 3), "\0\0\0");
    }

    #[test]
    fn encoded_string_round_trips() {
        assert_eq!(le().to_encoded_string(), "%00%00%01%00");
        assert_eq!(be().to_encoded_string(), "%00%01%00%00");
        let decoded = BinaryReader::from_encoded_string("TAG%20x").unwrap();
        assert_eq!(decoded.string_at(0, 5), "TAG x");
        assert!(BinaryReader::from_encoded_string("%G1").is_err());
    }

    #[test]
    fn slices_share_the_buffer() {
        let r = BinaryReader::new(b"ID3TIT2".to_vec());
        let frame = r.slice(3, 4);
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.string_at(0, 4), "TIT2");
        assert_eq!(frame.bytes().as_ref(), b"TIT2");
    }
}
