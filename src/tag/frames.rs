//! Frame value parsers for ID3v2.
//!
//! A parser gets the tag reader, the offset of the frame data and its size,
//! and returns `None` when the frame holds nothing usable.

use encoding_rs::{UTF_16BE, UTF_16LE};
use std::collections::HashMap;

use super::{FrameTable, FrameValue, Genre, Links, SimplifiedTag};
use crate::codec::BinaryReader;
use crate::utils::{latin1, strip};

pub type FrameParser = fn(&BinaryReader, usize, usize) -> Option<FrameValue>;

/// Decode a text payload according to its leading encoding byte.
///
/// `0` is ISO-8859-1, `1` UTF-16 with a byte order mark, `2` UTF-16BE and
/// `3` UTF-8. Unknown encodings fall back to ISO-8859-1.
pub fn decode_text(encoding: u8, bytes: &[u8]) -> String {
    match encoding {
        1 => {
            let (text, _, _) = UTF_16LE.decode(bytes);
            text.into_owned()
        }
        2 => {
            let (text, _) = UTF_16BE.decode_without_bom_handling(bytes);
            text.into_owned()
        }
        3 => String::from_utf8_lossy(bytes).into_owned(),
        _ => latin1(bytes),
    }
}

fn frame_text(data: &BinaryReader, offset: usize, size: usize) -> String {
    if size == 0 {
        return String::new();
    }
    let encoding = data.byte_at(offset);
    strip(&decode_text(encoding, &data.bytes_at(offset + 1, size - 1)))
}

pub fn text(data: &BinaryReader, offset: usize, size: usize) -> Option<FrameValue> {
    Some(FrameValue::Text(frame_text(data, offset, size)))
}

pub fn numeric(data: &BinaryReader, offset: usize, size: usize) -> Option<FrameValue> {
    frame_text(data, offset, size)
        .parse::<i64>()
        .ok()
        .map(FrameValue::Number)
}

/// Recording time stamps such as `"2010-05-03"` read as their year.
pub fn year(data: &BinaryReader, offset: usize, size: usize) -> Option<FrameValue> {
    let text = frame_text(data, offset, size);
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().ok().map(FrameValue::Number)
}

/// `"6/10"` reads as track 6.
pub fn track(data: &BinaryReader, offset: usize, size: usize) -> Option<FrameValue> {
    let text = frame_text(data, offset, size);
    let number = text.split('/').next().unwrap_or_default().trim();
    number.parse::<i64>().ok().map(FrameValue::Number)
}

/// `"(52)Electronic"` reads as genre 52, `"Electronic"` as the name, and
/// anything else as `-1`.
pub fn genre(data: &BinaryReader, offset: usize, size: usize) -> Option<FrameValue> {
    let text = frame_text(data, offset, size);
    let rest = text.strip_prefix('(').unwrap_or(&text);
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if let Ok(id) = digits.parse::<i64>() {
        return Some(FrameValue::Number(id));
    }
    let name = text.trim();
    if name.is_empty() {
        Some(FrameValue::Number(-1))
    } else {
        Some(FrameValue::Text(name.to_string()))
    }
}

/// URL frames have no encoding byte.
pub fn link(data: &BinaryReader, offset: usize, size: usize) -> Option<FrameValue> {
    Some(FrameValue::Text(strip(&data.string_at(offset, size))))
}

/// User defined URL: the URL follows a NUL-terminated description.
pub fn user_link(data: &BinaryReader, offset: usize, size: usize) -> Option<FrameValue> {
    let raw = data.string_at(offset, size);
    let url = raw.rsplit('\0').next().unwrap_or_default();
    Some(FrameValue::Text(url.trim().to_string()))
}

/// Unsynchronised lyrics: encoding, 3-byte language, NUL-terminated
/// descriptor, then the lyrics text.
pub fn unsynced_lyrics(data: &BinaryReader, offset: usize, size: usize) -> Option<FrameValue> {
    if size < 4 {
        return None;
    }
    let encoding = data.byte_at(offset);
    let body = data.bytes_at(offset + 4, size - 4);
    let wide = matches!(encoding, 1 | 2);
    let text_start = if wide {
        body.chunks(2)
            .position(|pair| pair == [0, 0])
            .map(|n| n * 2 + 2)
    } else {
        body.iter().position(|&b| b == 0).map(|n| n + 1)
    };
    let lyrics = &body[text_start.unwrap_or(0).min(body.len())..];
    Some(FrameValue::Text(strip(&decode_text(encoding, lyrics))))
}

/// Frame name to parser.
#[derive(Clone, Debug, Default)]
pub struct FrameParsers {
    parsers: HashMap<String, FrameParser>,
}

impl FrameParsers {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsers for the frames [`simplify`] looks at, under both the ID3v2.3+
    /// names and their ID3v2.2 aliases.
    pub fn standard() -> Self {
        let mut parsers = Self::new();
        for (names, parser) in [
            (&["TIT1", "TT1"][..], text as FrameParser),
            (&["TIT2", "TT2"][..], text),
            (&["TIT3", "TT3"][..], text),
            (&["TPE1", "TP1"][..], text),
            (&["TPE2", "TP2"][..], text),
            (&["TALB", "TAL"][..], text),
            (&["TRCK", "TRK"][..], track),
            (&["TYER", "TYE"][..], numeric),
            (&["TDRC"][..], year),
            (&["TCON", "TCO"][..], genre),
            (&["WOAR", "WAR"][..], link),
            (&["WXXX", "WXX"][..], user_link),
        ] {
            for name in names {
                parsers.add(*name, parser);
            }
        }
        parsers
    }

    /// Register or replace the parser for `name`.
    pub fn add(&mut self, name: impl Into<String>, parser: FrameParser) -> &mut Self {
        self.parsers.insert(name.into(), parser);
        self
    }

    pub fn get(&self, name: &str) -> Option<FrameParser> {
        self.parsers.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parsers.contains_key(name)
    }
}

fn first<'a>(frames: &'a FrameTable, names: &[&str]) -> Option<&'a FrameValue> {
    names
        .iter()
        .filter_map(|name| frames.get(*name))
        .find(|value| value.is_present())
}

fn first_text(frames: &FrameTable, names: &[&str], default: &str) -> String {
    first(frames, names)
        .map(|value| match value {
            FrameValue::Text(s) => s.clone(),
            FrameValue::Number(n) => n.to_string(),
        })
        .unwrap_or_else(|| default.to_string())
}

fn first_number(frames: &FrameTable, names: &[&str]) -> i64 {
    first(frames, names)
        .and_then(FrameValue::as_number)
        .unwrap_or_default()
}

/// Project decoded frames onto the common tag fields, falling back to
/// `"Unknown"`, `0` or `-1`. Returns `None` when there are no frames at all.
pub fn simplify(frames: &FrameTable) -> Option<SimplifiedTag> {
    if frames.is_empty() {
        return None;
    }

    let genre = match first(frames, &["TCON", "TCO"]) {
        Some(FrameValue::Number(id)) => Genre::Id(*id),
        Some(FrameValue::Text(name)) => Genre::Name(name.clone()),
        None => Genre::default(),
    };

    Some(SimplifiedTag {
        title: first_text(frames, &["TIT2", "TT2"], "Unknown"),
        artist: first_text(frames, &["TPE2", "TPE1", "TP2", "TP1"], "Unknown"),
        album: first_text(frames, &["TALB", "TAL"], "Unknown"),
        track: first_number(frames, &["TRCK", "TRK"]),
        year: first_number(frames, &["TYER", "TYE", "TDRC"]),
        genre,
        links: Some(Links {
            official: first_text(frames, &["WOAR", "WXXX", "WAR", "WXX"], ""),
        }),
    })
}
