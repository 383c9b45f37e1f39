//! Number of songs per genre, keyed by the genre's name.
//!

use anyhow::Result;

use super::SONG;
use crate::tag::Genre;
use crate::{Document, Emitter};

/// Genre name of a song document. Numeric genres index the ID3 table;
/// a missing genre is `-1`.
pub fn genre_of(doc: &Document) -> String {
    doc.get("genre")
        .cloned()
        .and_then(|genre| serde_json::from_value::<Genre>(genre).ok())
        .unwrap_or_default()
        .display_name()
}

pub fn map(doc: &Document, emit: &mut Emitter) -> Result<()> {
    if doc.kind() == Some(SONG) {
        emit.emit(genre_of(doc), 1);
    }
    Ok(())
}
