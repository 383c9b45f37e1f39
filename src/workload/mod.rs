//! Converts built-in view names to view code over song documents.
//!
//! # Example
//!
//! To count songs per artist:
//! ```
//! # use anyhow::Result;
//! use tagcouch::workload;
//! # fn main() -> Result<()> {
//! let artists = workload::named("artists", &[])?;
//! let definition = artists.definition("artists");
//! assert!(definition.has_reduce());
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::sync::Arc;

use crate::{Key, MapFn, ReduceFn, ViewDefinition};

pub mod albums;
pub mod artists;
pub mod genres;
pub mod search;
pub mod songs;

pub use songs::song_document;

/// The `type` of documents built from decoded tags.
pub const SONG: &str = "Song";

/// A map function and its optional reduce function.
#[derive(Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: Option<ReduceFn>,
}

impl Workload {
    /// A stored view definition running this workload. Callbacks are left
    /// to the caller.
    pub fn definition(self, id: impl Into<String>) -> ViewDefinition {
        let definition = ViewDefinition::new(id).map_fn(self.map_fn);
        match self.reduce_fn {
            Some(reduce) => definition.reduce_fn(reduce),
            None => definition,
        }
    }
}

/// Sums integer values. Sums are integers too, so the same code serves
/// reduce and re-reduce.
pub fn count(_key: &Key, values: &[Value], _rereduce: bool) -> Result<Value> {
    let mut total = 0i64;
    for value in values {
        total += value
            .as_i64()
            .ok_or_else(|| anyhow!("cannot count non-integer value {value}"))?;
    }
    Ok(Value::from(total))
}

/// Gets the [`Workload`] named `name`, configured with `args`.
///
/// Returns `Ok(None)` if no workload with the given name was found, and an
/// error if `args` are not understood by the workload.
pub fn try_named(name: &str, args: &[String]) -> Result<Option<Workload>> {
    let workload = match name {
        "songs" => Workload {
            map_fn: Arc::new(songs::map),
            reduce_fn: None,
        },
        "artists" => Workload {
            map_fn: Arc::new(artists::map),
            reduce_fn: Some(Arc::new(count)),
        },
        "albums" => Workload {
            map_fn: Arc::new(albums::map),
            reduce_fn: Some(Arc::new(count)),
        },
        "genres" => Workload {
            map_fn: Arc::new(genres::map),
            reduce_fn: Some(Arc::new(count)),
        },
        "search" => search::workload(args)?,
        _ => return Ok(None),
    };
    Ok(Some(workload))
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no workload with the given name was found.
pub fn named(name: &str, args: &[String]) -> Result<Workload> {
    match try_named(name, args)? {
        Some(workload) => Ok(workload),
        None => bail!("No workload named `{}` found.", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn count_sums_integers() {
        let key = Key::from("Queen");
        assert_eq!(count(&key, &[json!(1), json!(1)], false).unwrap(), json!(2));
        assert_eq!(count(&key, &[json!(2), json!(15)], true).unwrap(), json!(17));
        assert!(count(&key, &[json!("x")], false).is_err());
    }

    #[test]
    fn unknown_names_are_reported() {
        assert!(try_named("wc", &[]).unwrap().is_none());
        assert!(named("wc", &[]).is_err());
        assert!(named("songs", &[]).unwrap().reduce_fn.is_none());
        assert!(named("genres", &[]).unwrap().reduce_fn.is_some());
    }
}
