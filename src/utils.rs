//! Small helpers shared by the tag decoders, the store and the CLI.
//!

use std::hash::Hasher;

/// Decode bytes one byte per character (ISO-8859-1).
///
/// Every byte value maps to the code point of the same value, so this never
/// fails and is the right view of raw tag bytes.
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Remove every NUL character and trim surrounding whitespace.
pub fn strip(s: &str) -> String {
    s.replace('\0', "").trim().to_string()
}

/// Hashes arbitrary bytes into a stable 64-bit value.
pub fn ihash(key: &[u8]) -> u64 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    hasher.finish()
}

/// A stable document id derived from a source location such as a file path.
pub fn source_id(source: &str) -> String {
    format!("{:016x}", ihash(source.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_maps_high_bytes() {
        assert_eq!(latin1(&[0x41, 0xD3, 0x00]), "A\u{d3}\0");
    }

    #[test]
    fn strip_removes_nuls_and_edges() {
        assert_eq!(strip("Made In Heaven\0\0\0"), "Made In Heaven");
        assert_eq!(strip(" Yeah\0 "), "Yeah");
    }

    #[test]
    fn source_ids_are_stable() {
        assert_eq!(source_id("/music/a.mp3"), source_id("/music/a.mp3"));
        assert_ne!(source_id("/music/a.mp3"), source_id("/music/b.mp3"));
        assert_eq!(source_id("x").len(), 16);
    }
}
