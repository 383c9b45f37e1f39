//! Number of songs per artist.
//!

use anyhow::Result;

use super::SONG;
use crate::{Document, Emitter};

pub fn map(doc: &Document, emit: &mut Emitter) -> Result<()> {
    if doc.kind() == Some(SONG) {
        emit.emit(doc.str_field("artist").unwrap_or("Unknown"), 1);
    }
    Ok(())
}
