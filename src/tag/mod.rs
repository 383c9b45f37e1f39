//! ID3 tag extraction.
//!
//! A [`TagDecoder`] holds an ordered list of candidate formats. For each
//! candidate it fetches the small byte window the format needs for its
//! `test`, and the first candidate that recognises the data decodes it.
//! The variable-length ID3v2 format may ask for more bytes once it knows the
//! declared tag size; the facade fetches them and decodes again from
//! scratch.
//!
//! Nothing here is global: frame parsers, candidates and the decode cache all
//! live on the [`TagDecoder`] instance.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

use crate::codec::BinaryReader;

pub mod frames;
pub mod genres;
pub mod v1;
pub mod v2;

pub use frames::{FrameParser, FrameParsers};
pub use genres::genre_name;
pub use v1::Id3v1;
pub use v2::Id3v2;

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("No decoder recognised the data")]
    NoDecoderFound,
    #[error("{decoder} decoder failed: {reason}")]
    DecodeFailure {
        decoder: &'static str,
        reason: String,
    },
    #[error("Failed to fetch tag bytes: {0}")]
    Fetch(#[from] std::io::Error),
}

impl TagError {
    pub fn decode(decoder: &'static str, reason: impl ToString) -> Self {
        TagError::DecodeFailure {
            decoder,
            reason: reason.to_string(),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
// Byte ranges
/////////////////////////////////////////////////////////////////////////////

/// A window of the source to fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteRange {
    /// `length` bytes starting at `offset`.
    Head { offset: u64, length: u64 },
    /// The last `length` bytes.
    Tail { length: u64 },
}

impl ByteRange {
    /// Clamp the range to a source of `total` bytes, returning
    /// `(start, length)`.
    pub fn resolve(&self, total: u64) -> (u64, u64) {
        match *self {
            ByteRange::Head { offset, length } => {
                let start = offset.min(total);
                (start, length.min(total - start))
            }
            ByteRange::Tail { length } => {
                let length = length.min(total);
                (total - length, length)
            }
        }
    }
}

/// Asynchronous access to byte ranges of a tagged source.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch(&self, range: ByteRange) -> Result<Bytes, TagError>;
}

/// Serves ranges out of a buffer that is already in memory.
#[derive(Clone, Debug)]
pub struct SliceFetcher(pub Bytes);

#[async_trait]
impl RangeFetcher for SliceFetcher {
    async fn fetch(&self, range: ByteRange) -> Result<Bytes, TagError> {
        let (start, length) = range.resolve(self.0.len() as u64);
        let start = start as usize;
        Ok(self.0.slice(start..start + length as usize))
    }
}

/// Serves ranges of a local file, reading only the requested window.
#[derive(Clone, Debug)]
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RangeFetcher for FileFetcher {
    async fn fetch(&self, range: ByteRange) -> Result<Bytes, TagError> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let total = file.metadata().await?.len();
        let (start, length) = range.resolve(total);
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/////////////////////////////////////////////////////////////////////////////
// Decoded tags
/////////////////////////////////////////////////////////////////////////////

/// A decoded frame value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameValue {
    Number(i64),
    Text(String),
}

impl FrameValue {
    /// Empty text counts as absent when picking simplified fields.
    fn is_present(&self) -> bool {
        !matches!(self, FrameValue::Text(s) if s.is_empty())
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            FrameValue::Number(n) => Some(*n),
            FrameValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FrameValue::Text(s) => Some(s),
            FrameValue::Number(_) => None,
        }
    }
}

/// Frame name to decoded value.
pub type FrameTable = BTreeMap<String, FrameValue>;

/// A genre is either an index into the ID3 genre table or a free-form name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Genre {
    Id(i64),
    Name(String),
}

impl Genre {
    /// Human readable genre.
    pub fn display_name(&self) -> String {
        match self {
            Genre::Id(id) => genre_name(*id).to_string(),
            Genre::Name(name) => name.clone(),
        }
    }
}

impl Default for Genre {
    fn default() -> Self {
        Genre::Id(-1)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    pub official: String,
}

/// The normalised projection of a tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplifiedTag {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub track: i64,
    pub year: i64,
    pub genre: Genre,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
}

/// ID3v2 header flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFlags {
    pub unsync_all: bool,
    pub extended: bool,
    pub experimental: bool,
    pub footer: bool,
}

impl HeaderFlags {
    pub fn from_byte(flags: u8) -> Self {
        Self {
            unsync_all: flags & 0x80 != 0,
            extended: flags & 0x40 != 0,
            experimental: flags & 0x20 != 0,
            footer: flags & 0x10 != 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: HeaderFlags,
    pub raw_flags: u8,
    /// Total tag size including the 10-byte header.
    pub size: u64,
}

impl TagHeader {
    /// `2.3` style version, `(2, major, minor)`.
    pub fn version(&self) -> (u8, u8, u8) {
        (2, self.major_version, self.minor_version)
    }
}

/// Result of a successful decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedTag {
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<TagHeader>,
    /// `None` when the tag carried no usable frames.
    pub simplified: Option<SimplifiedTag>,
    pub frames: FrameTable,
}

/// Outcome of one decode attempt.
#[derive(Debug)]
pub enum Decoded {
    Complete(DecodedTag),
    /// The tag is larger than the data at hand; fetch `size` bytes from the
    /// start and decode again.
    NeedMoreData { size: u64 },
}

/// Decode results by source identity.
#[derive(Debug, Default)]
pub struct TagCache {
    entries: DashMap<String, DecodedTag>,
}

impl TagCache {
    fn slot(format: &str, identity: &str) -> String {
        format!("{format}:{identity}")
    }

    pub fn get(&self, format: &str, identity: &str) -> Option<DecodedTag> {
        self.entries
            .get(&Self::slot(format, identity))
            .map(|entry| entry.clone())
    }

    pub fn insert(&self, format: &str, identity: &str, tag: DecodedTag) {
        self.entries.insert(Self::slot(format, identity), tag);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Everything a format needs besides the bytes.
pub struct DecodeContext<'a> {
    pub identity: &'a str,
    pub cache: &'a TagCache,
}

/// One tag format the facade can try.
pub trait TagFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Window fetched before [`TagFormat::test`] is called.
    fn range(&self) -> ByteRange;

    fn test(&self, data: &BinaryReader) -> bool;

    fn decode(&self, data: &BinaryReader, cx: &DecodeContext<'_>) -> Result<Decoded, TagError>;
}

/////////////////////////////////////////////////////////////////////////////
// Facade
/////////////////////////////////////////////////////////////////////////////

pub struct TagDecoder {
    candidates: Vec<Box<dyn TagFormat>>,
    cache: TagCache,
}

impl TagDecoder {
    pub fn new(candidates: Vec<Box<dyn TagFormat>>) -> Self {
        Self {
            candidates,
            cache: TagCache::default(),
        }
    }

    /// ID3v2 first, then ID3v1, with the default frame parsers.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(Id3v2::new(FrameParsers::standard())),
            Box::new(Id3v1),
        ])
    }

    pub fn cache(&self) -> &TagCache {
        &self.cache
    }

    /// Decode the tag of the source behind `fetcher`.
    ///
    /// `identity` names the source for caching; see
    /// [`TagDecoder::decode_fresh`] to bypass the cache.
    pub async fn decode<F>(&self, identity: &str, fetcher: &F) -> Result<DecodedTag, TagError>
    where
        F: RangeFetcher + ?Sized,
    {
        let mut last_failure = None;
        for candidate in &self.candidates {
            let data = BinaryReader::new(fetcher.fetch(candidate.range()).await?);
            if !candidate.test(&data) {
                trace!("{} does not match {}", candidate.name(), identity);
                continue;
            }

            match self.decode_with(candidate.as_ref(), data, identity, fetcher).await {
                Ok(tag) => return Ok(tag),
                Err(err @ TagError::DecodeFailure { .. }) => {
                    debug!("{} failed on {}: {}", candidate.name(), identity, err);
                    last_failure = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_failure.unwrap_or(TagError::NoDecoderFound))
    }

    /// Decode under a random identity, so nothing is read from or shared
    /// through the cache.
    pub async fn decode_fresh<F>(&self, fetcher: &F) -> Result<DecodedTag, TagError>
    where
        F: RangeFetcher + ?Sized,
    {
        let identity = uuid::Uuid::new_v4().to_string();
        self.decode(&identity, fetcher).await
    }

    async fn decode_with<F>(
        &self,
        format: &dyn TagFormat,
        data: BinaryReader,
        identity: &str,
        fetcher: &F,
    ) -> Result<DecodedTag, TagError>
    where
        F: RangeFetcher + ?Sized,
    {
        let cx = DecodeContext {
            identity,
            cache: &self.cache,
        };
        match format.decode(&data, &cx)? {
            Decoded::Complete(tag) => Ok(tag),
            Decoded::NeedMoreData { size } => {
                trace!("{} needs {} bytes of {}", format.name(), size, identity);
                let range = ByteRange::Head {
                    offset: 0,
                    length: size,
                };
                let data = BinaryReader::new(fetcher.fetch(range).await?);
                match format.decode(&data, &cx)? {
                    Decoded::Complete(tag) => Ok(tag),
                    Decoded::NeedMoreData { size } => Err(TagError::decode(
                        format.name(),
                        format!("source ends before the declared tag size of {size} bytes"),
                    )),
                }
            }
        }
    }
}
