//! Songs by title, and the documents they come from.
//!

use anyhow::Result;
use serde_json::Value;

use super::SONG;
use crate::tag::DecodedTag;
use crate::{utils, Document, Emitter};

/// Builds the song document for the tag read from `path`.
///
/// Returns [`None`] when the tag carried no usable frames.
pub fn song_document(path: &str, tag: &DecodedTag) -> Option<Document> {
    let simplified = tag.simplified.as_ref()?;
    let mut doc = Document::new(utils::source_id(path))
        .with("type", SONG)
        .with("path", path)
        .with("format", tag.format.as_str())
        .with("title", simplified.title.as_str())
        .with("artist", simplified.artist.as_str())
        .with("album", simplified.album.as_str())
        .with("track", simplified.track)
        .with("year", simplified.year);
    doc.set(
        "genre",
        serde_json::to_value(&simplified.genre).unwrap_or(Value::Null),
    );
    if let Some(links) = &simplified.links {
        if !links.official.is_empty() {
            doc.set("link", links.official.as_str());
        }
    }
    Some(doc)
}

pub fn map(doc: &Document, emit: &mut Emitter) -> Result<()> {
    if doc.kind() != Some(SONG) {
        return Ok(());
    }
    if let Some(title) = doc.str_field("title") {
        emit.emit(title, doc.to_value()?);
    }
    Ok(())
}
