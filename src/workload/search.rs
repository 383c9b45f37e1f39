//! Songs whose title contains a search term.
//!

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Workload, SONG};
use crate::{Document, Emitter};

#[derive(Parser, Debug, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
struct Args {
    #[clap(short, long, value_parser)]
    term: String,
    /// Match case exactly.
    #[clap(long)]
    case_sensitive: bool,
}

/// Title of `doc` if it is a song whose title contains `term`.
fn matches(doc: &Document, term: &str, case_sensitive: bool) -> Option<String> {
    if doc.kind() != Some(SONG) {
        return None;
    }
    let title = doc.str_field("title")?;
    let found = if case_sensitive {
        title.contains(term)
    } else {
        title.to_lowercase().contains(&term.to_lowercase())
    };
    found.then(|| title.to_string())
}

pub fn workload(args: &[String]) -> Result<Workload> {
    let args = Args::try_parse_from(args)?;
    let map = move |doc: &Document, emit: &mut Emitter| -> Result<()> {
        if let Some(title) = matches(doc, &args.term, args.case_sensitive) {
            emit.emit(title, doc.id.as_str());
        }
        Ok(())
    };
    Ok(Workload {
        map_fn: Arc::new(map),
        reduce_fn: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(title: &str) -> Document {
        Document::new(title).with("type", "Song").with("title", title)
    }

    #[test]
    fn finds_title_substrings() {
        let search = workload(&["--term".to_string(), "big".to_string()]).unwrap();
        let mut emit = Emitter::default();
        for doc in [song("Hey Big Bang"), song("Maps"), song("Big Love")] {
            (search.map_fn)(&doc, &mut emit).unwrap();
        }
        assert_eq!(emit.len(), 2);
    }

    #[test]
    fn case_sensitive_search() {
        let args: Vec<String> = ["-t", "big", "--case-sensitive"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let search = workload(&args).unwrap();
        let mut emit = Emitter::default();
        (search.map_fn)(&song("Hey Big Bang"), &mut emit).unwrap();
        assert!(emit.is_empty());
    }

    #[test]
    fn term_is_required() {
        assert!(workload(&[]).is_err());
    }
}
