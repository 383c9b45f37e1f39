//! ID3v1: a fixed 128-byte block at the end of the file.

use super::{
    ByteRange, DecodeContext, Decoded, DecodedTag, FrameTable, Genre, SimplifiedTag, TagError,
    TagFormat,
};
use crate::codec::{BinaryReader, Unpacked};
use tracing::debug;

/// `TAG`, title, artist, album, year, a skipped comment, track and genre.
const LAYOUT: &str = "xxx30S30S30S4S29x2i";

#[derive(Clone, Copy, Debug, Default)]
pub struct Id3v1;

impl TagFormat for Id3v1 {
    fn name(&self) -> &'static str {
        "id3v1"
    }

    fn range(&self) -> ByteRange {
        ByteRange::Tail { length: 128 }
    }

    fn test(&self, data: &BinaryReader) -> bool {
        data.string_at(0, 3) == "TAG"
    }

    fn decode(&self, data: &BinaryReader, cx: &DecodeContext<'_>) -> Result<Decoded, TagError> {
        if let Some(tag) = cx.cache.get(self.name(), cx.identity) {
            return Ok(Decoded::Complete(tag));
        }

        let fields = data
            .unpack(LAYOUT)
            .map_err(|err| TagError::decode(self.name(), err))?;
        let text = |i: usize| {
            fields
                .get(i)
                .and_then(Unpacked::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let number = |i: usize| fields.get(i).and_then(Unpacked::as_int).unwrap_or_default();

        let simplified = SimplifiedTag {
            title: text(0),
            artist: text(1),
            album: text(2),
            year: text(3).parse::<i64>().unwrap_or(0),
            track: number(4).into(),
            genre: Genre::Id(number(5).into()),
            links: None,
        };
        debug!("id3v1 tag of {}: {:?}", cx.identity, simplified.title);

        let tag = DecodedTag {
            format: self.name().to_string(),
            header: None,
            simplified: Some(simplified),
            frames: FrameTable::new(),
        };
        cx.cache.insert(self.name(), cx.identity, tag.clone());
        Ok(Decoded::Complete(tag))
    }
}
