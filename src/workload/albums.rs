//! Number of songs per album.
//!

use anyhow::Result;

use super::SONG;
use crate::{Document, Emitter};

pub fn map(doc: &Document, emit: &mut Emitter) -> Result<()> {
    if doc.kind() == Some(SONG) {
        emit.emit(doc.str_field("album").unwrap_or("Unknown"), 1);
    }
    Ok(())
}
