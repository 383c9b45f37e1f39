//! ID3v2.2, v2.3 and v2.4: a variable-length tag at the start of the file.

use std::ops::Range;

use super::frames::{simplify, FrameParsers};
use super::{
    ByteRange, DecodeContext, Decoded, DecodedTag, FrameTable, HeaderFlags, TagError, TagFormat,
    TagHeader,
};
use crate::codec::{BinaryReader, ReaderOptions};
use tracing::{debug, warn};

const HEADER_SIZE: usize = 10;

// Frame flags.
const COMPRESS_23: u16 = 0x0080;
const ENCRYPT_23: u16 = 0x0040;
const COMPRESS_24: u16 = 0x0008;
const ENCRYPT_24: u16 = 0x0004;
const UNSYNC_24: u16 = 0x0002;
const DATALEN_24: u16 = 0x0001;

/// Decode a synch-safe integer: 7 significant bits per byte, most
/// significant byte first.
pub fn synchsafe(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, &b| (acc << 7) | u64::from(b & 0x7F))
}

/// Reverse unsynchronisation over `range`: every `FF 00` pair collapses to
/// `FF`. Bytes outside the range are copied as they are.
pub fn reverse_unsync(data: &[u8], range: Range<usize>) -> Vec<u8> {
    let start = range.start.min(data.len());
    let end = range.end.min(data.len()).max(start);
    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..start]);
    let mut previous = 0u8;
    for &b in &data[start..end] {
        if !(previous == 0xFF && b == 0x00) {
            out.push(b);
        }
        previous = b;
    }
    out.extend_from_slice(&data[end..]);
    out
}

fn big_endian(bytes: Vec<u8>) -> BinaryReader {
    BinaryReader::with_options(
        bytes,
        ReaderOptions {
            big_endian: true,
            ..Default::default()
        },
    )
}

/// The ID3v2 family decoder.
#[derive(Clone, Debug)]
pub struct Id3v2 {
    parsers: FrameParsers,
}

impl Id3v2 {
    pub fn new(parsers: FrameParsers) -> Self {
        Self { parsers }
    }

    pub fn parsers_mut(&mut self) -> &mut FrameParsers {
        &mut self.parsers
    }

    /// Read the 10-byte header.
    pub fn header(data: &BinaryReader) -> TagHeader {
        let raw_flags = data.byte_at(5);
        TagHeader {
            major_version: data.byte_at(3),
            minor_version: data.byte_at(4),
            flags: HeaderFlags::from_byte(raw_flags),
            raw_flags,
            size: synchsafe(&data.bytes_at(6, 4)) + HEADER_SIZE as u64,
        }
    }

    /// Where the first frame starts, skipping the extended header if the
    /// tag really carries one.
    fn first_frame(
        &self,
        data: &BinaryReader,
        header: &TagHeader,
        tag_size: usize,
    ) -> Result<usize, TagError> {
        if !header.flags.extended || header.major_version < 3 {
            return Ok(HEADER_SIZE);
        }
        // Some taggers set the flag but never write the extended header.
        if self.parsers.contains(&data.string_at(HEADER_SIZE, 4)) {
            return Ok(HEADER_SIZE);
        }

        let raw = data.long_at(HEADER_SIZE) as usize;
        let mut candidates = Vec::with_capacity(2);
        if header.major_version >= 4 {
            candidates.push(synchsafe(&data.bytes_at(HEADER_SIZE, 4)) as usize);
        }
        candidates.push(raw.saturating_add(4));

        candidates
            .into_iter()
            .find(|&size| size >= 6 && HEADER_SIZE + size <= tag_size)
            .map(|size| HEADER_SIZE + size)
            .ok_or_else(|| {
                TagError::decode(
                    self.name(),
                    format!("extended header of {raw:#x} bytes does not fit the tag"),
                )
            })
    }

    fn parse_frames(
        &self,
        data: &BinaryReader,
        header: &TagHeader,
        tag_size: usize,
        identity: &str,
    ) -> Result<FrameTable, TagError> {
        let mut frames = FrameTable::new();
        let major = header.major_version;
        let (name_len, header_len) = if major >= 3 { (4, 10) } else { (3, 6) };
        let mut offset = self.first_frame(data, header, tag_size)?;

        while offset + header_len <= tag_size {
            let name = data.string_at(offset, name_len);
            if name.starts_with('\0') {
                break;
            }
            let (size, flags) = match major {
                4 => (synchsafe(&data.bytes_at(offset + 4, 4)) as usize, data.short_at(offset + 8)),
                3 => (data.long_at(offset + 4) as usize, data.short_at(offset + 8)),
                _ => {
                    let mut size = vec![0u8];
                    size.extend(data.bytes_at(offset + 3, 3));
                    (big_endian(size).long_at(0) as usize, 0)
                }
            };
            if size == 0 {
                break;
            }
            if offset + header_len + size > tag_size {
                warn!("{name} frame of {identity} runs past the end of the tag");
                break;
            }

            let mut data_offset = offset + header_len;
            let mut data_size = size;
            let mut skip = false;
            let mut unsync = false;
            match major {
                4 => {
                    if flags & (COMPRESS_24 | DATALEN_24) != 0 {
                        data_offset += 4;
                        data_size = data_size.saturating_sub(4);
                    }
                    skip = flags & ENCRYPT_24 != 0;
                    unsync = flags & UNSYNC_24 != 0 && !header.flags.unsync_all;
                }
                3 => skip = flags & (COMPRESS_23 | ENCRYPT_23) != 0,
                _ => {}
            }

            if skip {
                debug!("skipping compressed or encrypted {name} frame of {identity}");
            } else if let Some(parser) = self.parsers.get(&name) {
                let value = if unsync {
                    let bytes = reverse_unsync(&data.bytes_at(data_offset, data_size), 0..data_size);
                    let len = bytes.len();
                    parser(&big_endian(bytes), 0, len)
                } else {
                    parser(data, data_offset, data_size)
                };
                if let Some(value) = value {
                    frames.insert(name, value);
                }
            }

            offset += header_len + size;
        }

        Ok(frames)
    }
}

impl Default for Id3v2 {
    fn default() -> Self {
        Self::new(FrameParsers::standard())
    }
}

impl TagFormat for Id3v2 {
    fn name(&self) -> &'static str {
        "id3v2"
    }

    fn range(&self) -> ByteRange {
        ByteRange::Head {
            offset: 0,
            length: 14,
        }
    }

    fn test(&self, data: &BinaryReader) -> bool {
        data.string_at(0, 3) == "ID3" && data.byte_at(3) <= 4
    }

    fn decode(&self, data: &BinaryReader, cx: &DecodeContext<'_>) -> Result<Decoded, TagError> {
        if let Some(tag) = cx.cache.get(self.name(), cx.identity) {
            return Ok(Decoded::Complete(tag));
        }

        let header = Self::header(data);
        if (data.len() as u64) < header.size {
            return Ok(Decoded::NeedMoreData { size: header.size });
        }
        let (_, major, minor) = header.version();
        debug!("parsing ID3v2.{major}.{minor} tag of {}", cx.identity);

        let mut tag_size = header.size as usize;
        let mut body = data.bytes().to_vec();
        if header.flags.unsync_all {
            body = reverse_unsync(&body, HEADER_SIZE..tag_size);
            tag_size -= data.len() - body.len();
        }
        let body = big_endian(body);

        let frames = self.parse_frames(&body, &header, tag_size, cx.identity)?;
        let tag = DecodedTag {
            format: self.name().to_string(),
            header: Some(header),
            simplified: simplify(&frames),
            frames,
        };
        cx.cache.insert(self.name(), cx.identity, tag.clone());
        Ok(Decoded::Complete(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{FrameValue, Genre, Links, TagCache};

    fn frame(name: &str, size: [u8; 4], flags: u16, body: &[u8]) -> Vec<u8> {
        let mut out = name.as_bytes().to_vec();
        out.extend(size);
        out.extend(flags.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn frame_v23(name: &str, body: &[u8]) -> Vec<u8> {
        frame(name, (body.len() as u32).to_be_bytes(), 0, body)
    }

    fn tag(major: u8, flags: u8, frames: &[u8], padding: usize) -> Vec<u8> {
        let size = (frames.len() + padding) as u32;
        let mut out = b"ID3".to_vec();
        out.extend([major, 0, flags]);
        out.extend([
            ((size >> 21) & 0x7F) as u8,
            ((size >> 14) & 0x7F) as u8,
            ((size >> 7) & 0x7F) as u8,
            (size & 0x7F) as u8,
        ]);
        out.extend_from_slice(frames);
        out.resize(out.len() + padding, 0);
        out
    }

    fn decode(format: &Id3v2, data: Vec<u8>) -> Decoded {
        let cache = TagCache::default();
        let cx = DecodeContext {
            identity: "test",
            cache: &cache,
        };
        format.decode(&BinaryReader::new(data), &cx).unwrap()
    }

    fn complete(data: Vec<u8>) -> DecodedTag {
        match decode(&Id3v2::default(), data) {
            Decoded::Complete(tag) => tag,
            Decoded::NeedMoreData { size } => panic!("needed {size} bytes"),
        }
    }

    #[test]
    fn synchsafe_sizes() {
        assert_eq!(synchsafe(&[0, 0, 2, 0]), 256);
        assert_eq!(synchsafe(&[0x7F, 0x7F, 0x7F, 0x7F]), 0x0FFF_FFFF);
        assert_eq!(synchsafe(&[0, 0, 0, 0x45]), 69);
    }

    #[test]
    fn unsync_collapses_pairs_in_range() {
        let data = [0xFF, 0x00, 0xE0, 0xFF, 0x00, 0xFF, 0x00];
        assert_eq!(reverse_unsync(&data, 0..7), vec![0xFF, 0xE0, 0xFF, 0xFF]);
        assert_eq!(
            reverse_unsync(&data, 3..7),
            vec![0xFF, 0x00, 0xE0, 0xFF, 0xFF]
        );
    }

    #[test]
    fn recognises_versions_up_to_four() {
        let format = Id3v2::default();
        assert!(format.test(&BinaryReader::new(tag(3, 0, &[], 0))));
        assert!(format.test(&BinaryReader::new(tag(4, 0, &[], 0))));
        assert!(!format.test(&BinaryReader::new(tag(5, 0, &[], 0))));
        assert!(!format.test(&BinaryReader::new(b"TAG".to_vec())));
    }

    #[test]
    fn short_data_asks_for_declared_size() {
        let frames = frame_v23("TIT2", b"\0Halcyon");
        let full = tag(3, 0, &frames, 100);
        let head = full[..14].to_vec();
        match decode(&Id3v2::default(), head) {
            Decoded::NeedMoreData { size } => assert_eq!(size, full.len() as u64),
            Decoded::Complete(_) => panic!("decoded a truncated tag"),
        }
    }

    #[test]
    fn decodes_v23_frames() {
        let mut frames = frame_v23("TIT2", &[1, 0xFF, 0xFE, b'Y', 0, b'o', 0]);
        frames.extend(frame_v23("TPE1", b"\0Mew"));
        frames.extend(frame_v23("TRCK", b"\x003/12"));
        frames.extend(frame_v23("TCON", b"\0Shoegaze"));
        frames.extend(frame_v23("WOAR", b"http://mew.example"));
        frames.extend(frame(
            "TALB",
            5u32.to_be_bytes(),
            COMPRESS_23,
            b"\0zzzz",
        ));
        let tag = complete(tag(3, 0, &frames, 20));

        assert_eq!(tag.header.unwrap().version(), (2, 3, 0));
        assert_eq!(tag.frames.get("TIT2"), Some(&FrameValue::Text("Yo".into())));
        assert!(tag.frames.get("TALB").is_none());

        let simplified = tag.simplified.unwrap();
        assert_eq!(simplified.artist, "Mew");
        assert_eq!(simplified.track, 3);
        assert_eq!(simplified.genre, Genre::Name("Shoegaze".into()));
        assert_eq!(
            simplified.links,
            Some(Links {
                official: "http://mew.example".into()
            })
        );
    }

    #[test]
    fn decodes_v22_frames() {
        let mut frames = b"TT2\0\0\x08\0Halcyon".to_vec();
        frames.extend(b"TP1\0\0\x08\0Delphic");
        frames.extend(b"TCO\0\0\x05\0(52)");
        let tag = complete(tag(2, 0, &frames, 10));

        let simplified = tag.simplified.unwrap();
        assert_eq!(simplified.title, "Halcyon");
        assert_eq!(simplified.artist, "Delphic");
        assert_eq!(simplified.genre, Genre::Id(52));
    }

    #[test]
    fn v24_data_length_indicator_is_skipped() {
        let body = b"\0\0\0\x08\0Halcyon";
        let frames = frame("TIT2", [0, 0, 0, body.len() as u8], DATALEN_24, body);
        let tag = complete(tag(4, 0, &frames, 0));
        assert_eq!(tag.frames.get("TIT2"), Some(&FrameValue::Text("Halcyon".into())));
    }

    #[test]
    fn v24_whole_tag_unsynchronisation() {
        // Title "a\xFFb" is stored as "a\xFF\x00b"; the frame size counts the
        // collapsed bytes.
        let frames = frame("TIT2", [0, 0, 0, 4], 0, b"\0a\xFF\x00b");
        let tag = complete(tag(4, 0x80, &frames, 0));
        assert_eq!(
            tag.frames.get("TIT2"),
            Some(&FrameValue::Text("a\u{ff}b".into()))
        );
    }

    #[test]
    fn missing_extended_header_is_tolerated() {
        let frames = frame_v23("TIT2", b"\0Halcyon");
        let tag = complete(tag(3, 0x40, &frames, 0));
        assert_eq!(tag.simplified.unwrap().title, "Halcyon");
    }

    #[test]
    fn extended_header_is_skipped() {
        let mut body = vec![0, 0, 0, 6, 0, 0, 0, 0, 0, 0];
        body.extend(frame_v23("TIT2", b"\0Halcyon"));
        let tag = complete(tag(3, 0x40, &body, 0));
        assert_eq!(tag.simplified.unwrap().title, "Halcyon");
    }

    #[test]
    fn implausible_extended_header_fails() {
        let mut body = vec![0x7F, 0xFF, 0xFF, 0xFF, 0, 0];
        body.extend(frame_v23("TIT2", b"\0Halcyon"));
        let cache = TagCache::default();
        let cx = DecodeContext {
            identity: "broken",
            cache: &cache,
        };
        let err = Id3v2::default()
            .decode(&BinaryReader::new(tag(3, 0x40, &body, 0)), &cx)
            .unwrap_err();
        assert!(matches!(err, TagError::DecodeFailure { decoder: "id3v2", .. }));
    }

    #[test]
    fn tag_without_known_frames_has_no_simplified_view() {
        let frames = frame_v23("TPUB", b"\0Polydor");
        let tag = complete(tag(3, 0, &frames, 4));
        assert!(tag.frames.is_empty());
        assert!(tag.simplified.is_none());
    }
}
