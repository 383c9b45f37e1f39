//! A document store with incremental map/reduce views, plus an ID3 tag
//! decoder that feeds it.
//!
//! Documents are written into a [`store::DocumentStore`]. Named views are
//! computed by the chunked [`engine`] and kept up to date by the
//! [`view::ViewStore`] as new batches of documents arrive, without
//! recomputing the whole view. Tags read through [`tag::TagDecoder`] are the
//! usual source of documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub mod cmd;
pub mod codec;
pub mod engine;
pub mod store;
pub mod tag;
pub mod utils;
pub mod view;
pub mod workload;

pub use engine::Emitter;
pub use store::{Document, DocumentStore};
pub use view::{View, ViewDefinition};

/////////////////////////////////////////////////////////////////////////////
// Map/reduce application types
/////////////////////////////////////////////////////////////////////////////

/// A map function receives one document and emits zero or more rows through
/// the [`Emitter`].
///
/// Errors are not isolated per document: an error aborts the computation of
/// the view the function belongs to.
pub type MapFn = Arc<dyn Fn(&Document, &mut Emitter) -> anyhow::Result<()> + Send + Sync>;

/// A reduce function folds every value that shares a key into one value.
///
/// The third argument is `true` during a re-reduce, in which case the values
/// are outputs of earlier reduce calls rather than mapped values. The
/// function has to handle both cases.
pub type ReduceFn = Arc<dyn Fn(&Key, &[Value], bool) -> anyhow::Result<Value> + Send + Sync>;

/////////////////////////////////////////////////////////////////////////////
// Keys
/////////////////////////////////////////////////////////////////////////////

/// A sortable view key.
///
/// Keys of different kinds sort by kind first
/// (`Null < Bool < Number < String < Array < Object`), numbers compare
/// numerically and strings lexicographically.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Key {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Key>),
    Object(Vec<(String, Key)>),
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Null => 0,
            Key::Bool(_) => 1,
            Key::Number(_) => 2,
            Key::String(_) => 3,
            Key::Array(_) => 4,
            Key::Object(_) => 5,
        }
    }

    /// Returns the string slice if this is a string key.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number if this is a numeric key.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Null, Key::Null) => Ordering::Equal,
            (Key::Bool(a), Key::Bool(b)) => a.cmp(b),
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            (Key::Object(a), Key::Object(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Key::Null => {}
            Key::Bool(b) => b.hash(state),
            Key::Number(n) => n.to_bits().hash(state),
            Key::String(s) => s.hash(state),
            Key::Array(items) => items.hash(state),
            Key::Object(fields) => fields.hash(state),
        }
    }
}

impl From<Value> for Key {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Key::Null,
            Value::Bool(b) => Key::Bool(b),
            Value::Number(n) => Key::Number(n.as_f64().unwrap_or_default()),
            Value::String(s) => Key::String(s),
            Value::Array(items) => Key::Array(items.into_iter().map(Key::from).collect()),
            Value::Object(fields) => {
                Key::Object(fields.into_iter().map(|(k, v)| (k, Key::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for Key {
    fn from(value: &Value) -> Self {
        Key::from(value.clone())
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Null => Value::Null,
            Key::Bool(b) => Value::Bool(b),
            Key::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                Value::from(n as i64)
            }
            Key::Number(n) => Value::from(n),
            Key::String(s) => Value::String(s),
            Key::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Key::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key::String(s.clone())
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Key::Bool(b)
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(n.into())
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Number(n.into())
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

/////////////////////////////////////////////////////////////////////////////
// Rows
/////////////////////////////////////////////////////////////////////////////

/// One row emitted by a map function.
///
/// `id` is always the id of the document that was being mapped; the map
/// function cannot choose it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmittedRow {
    pub id: String,
    pub key: Key,
    pub value: Value,
}

/// One row of a reduce view: a distinct key and its reduced value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReducedRow {
    pub key: Key,
    pub value: Value,
}

impl ReducedRow {
    pub fn new(key: Key, value: Value) -> Self {
        Self { key, value }
    }
}
