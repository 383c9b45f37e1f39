//! Materialised views.
//!
//! A [`View`] is an immutable snapshot: either the sorted rows of a map-only
//! view or the reduced rows of a map/reduce view. The [`ViewStore`] replaces
//! snapshots as documents are written; readers holding an older `Arc<View>`
//! keep seeing the old rows.

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::engine::MapResult;
use crate::{EmittedRow, Key, ReducedRow};

pub mod definition;
pub mod store;

pub use definition::{ViewCallback, ViewDefinition};
pub use store::{ViewFailure, ViewStore};

/// Rows of a map-only view, sorted by key, plus the position of the first
/// row of every distinct key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapView {
    rows: Vec<EmittedRow>,
    index: Vec<(Key, usize)>,
}

/// Outcome of folding a batch of re-mapped documents into a [`MapView`].
#[derive(Debug)]
pub(crate) struct MapMerge {
    pub view: MapView,
    /// Only the rows emitted by the batch.
    pub delta: MapView,
    /// Rows of changed documents that were not emitted again.
    pub removed: usize,
}

impl MapView {
    /// Rows that are already in key order.
    fn indexed(rows: Vec<EmittedRow>) -> Self {
        let mut index: Vec<(Key, usize)> = Vec::new();
        for (position, row) in rows.iter().enumerate() {
            if index.last().map_or(true, |(key, _)| *key != row.key) {
                index.push((row.key.clone(), position));
            }
        }
        Self { rows, index }
    }

    /// Sort `rows` by key, keeping the given order among equal keys.
    pub fn from_rows(mut rows: Vec<EmittedRow>) -> Self {
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Self::indexed(rows)
    }

    pub fn from_result(mapped: MapResult) -> Self {
        Self::indexed(mapped.into_rows())
    }

    pub fn rows(&self) -> &[EmittedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the first row with exactly `key`.
    pub fn find_row(&self, key: impl Into<Key>) -> Option<usize> {
        let key = key.into();
        self.index
            .binary_search_by(|(probe, _)| probe.cmp(&key))
            .ok()
            .map(|i| self.index[i].1)
    }

    /// Value of the first row with exactly `key`.
    pub fn get_row(&self, key: impl Into<Key>) -> Option<&Value> {
        self.find_row(key).map(|i| &self.rows[i].value)
    }

    /// All rows sharing `key`.
    pub fn rows_for(&self, key: &Key) -> &[EmittedRow] {
        match self.index.binary_search_by(|(probe, _)| probe.cmp(key)) {
            Ok(i) => {
                let start = self.index[i].1;
                let end = self
                    .index
                    .get(i + 1)
                    .map_or(self.rows.len(), |(_, next)| *next);
                &self.rows[start..end]
            }
            Err(_) => &[],
        }
    }

    /// Keys that the documents in `changed` currently contribute to.
    pub(crate) fn keys_of(&self, changed: &HashSet<String>) -> HashSet<Key> {
        self.rows
            .iter()
            .filter(|row| changed.contains(&row.id))
            .map(|row| row.key.clone())
            .collect()
    }

    /// Replace the rows of the `changed` documents by the rows they emit now.
    ///
    /// An existing row of a changed document whose key is emitted again
    /// takes the new value and keeps its position. Rows that are no longer
    /// emitted are dropped and new rows are merged in by key after the rows
    /// already there.
    pub(crate) fn merge(&self, changed: &HashSet<String>, batch: MapResult) -> MapMerge {
        let fresh = batch.into_rows();
        let mut pending: HashMap<(&str, &Key), VecDeque<usize>> = HashMap::new();
        for (i, row) in fresh.iter().enumerate() {
            pending
                .entry((row.id.as_str(), &row.key))
                .or_default()
                .push_back(i);
        }

        let mut used = vec![false; fresh.len()];
        let mut rows = Vec::with_capacity(self.rows.len() + fresh.len());
        let mut removed = 0;
        for row in &self.rows {
            if !changed.contains(&row.id) {
                rows.push(row.clone());
                continue;
            }
            match pending
                .get_mut(&(row.id.as_str(), &row.key))
                .and_then(VecDeque::pop_front)
            {
                Some(i) => {
                    used[i] = true;
                    rows.push(EmittedRow {
                        value: fresh[i].value.clone(),
                        ..row.clone()
                    });
                }
                None => removed += 1,
            }
        }

        let appended: Vec<EmittedRow> = fresh
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .map(|(row, _)| row.clone())
            .collect();
        let view = if appended.is_empty() {
            Self::indexed(rows)
        } else {
            rows.extend(appended);
            Self::from_rows(rows)
        };

        MapMerge {
            view,
            delta: Self::indexed(fresh),
            removed,
        }
    }
}

/// One row per distinct key, sorted by key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReduceView {
    rows: Vec<ReducedRow>,
}

impl ReduceView {
    pub fn from_rows(mut rows: Vec<ReducedRow>) -> Self {
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows.dedup_by(|later, earlier| later.key == earlier.key);
        Self { rows }
    }

    pub fn rows(&self) -> &[ReducedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn find_row(&self, key: impl Into<Key>) -> Option<usize> {
        let key = key.into();
        self.rows.binary_search_by(|row| row.key.cmp(&key)).ok()
    }

    pub fn get_row(&self, key: impl Into<Key>) -> Option<&Value> {
        self.find_row(key).map(|i| &self.rows[i].value)
    }

    /// A copy with `updates` written over and `removed` keys taken out.
    pub(crate) fn with_changes(&self, updates: &[ReducedRow], removed: &[Key]) -> Self {
        let mut rows = self.rows.clone();
        for update in updates {
            match rows.binary_search_by(|row| row.key.cmp(&update.key)) {
                Ok(i) => rows[i].value = update.value.clone(),
                Err(i) => rows.insert(i, update.clone()),
            }
        }
        for key in removed {
            if let Ok(i) = rows.binary_search_by(|row| row.key.cmp(key)) {
                rows.remove(i);
            }
        }
        Self { rows }
    }
}

/// A view snapshot.
#[derive(Clone, Debug, PartialEq)]
pub enum View {
    Map(MapView),
    Reduce(ReduceView),
}

impl View {
    pub fn find_row(&self, key: impl Into<Key>) -> Option<usize> {
        match self {
            View::Map(view) => view.find_row(key),
            View::Reduce(view) => view.find_row(key),
        }
    }

    pub fn get_row(&self, key: impl Into<Key>) -> Option<&Value> {
        match self {
            View::Map(view) => view.get_row(key),
            View::Reduce(view) => view.get_row(key),
        }
    }

    /// `(key, value)` of every row in order.
    pub fn rows(&self) -> Vec<(&Key, &Value)> {
        match self {
            View::Map(view) => view.rows.iter().map(|row| (&row.key, &row.value)).collect(),
            View::Reduce(view) => view.rows.iter().map(|row| (&row.key, &row.value)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            View::Map(view) => view.len(),
            View::Reduce(view) => view.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_map(&self) -> Option<&MapView> {
        match self {
            View::Map(view) => Some(view),
            View::Reduce(_) => None,
        }
    }

    pub fn as_reduce(&self) -> Option<&ReduceView> {
        match self {
            View::Reduce(view) => Some(view),
            View::Map(_) => None,
        }
    }

    /// The rows as a JSON array.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        match self {
            View::Map(view) => serde_json::to_value(&view.rows),
            View::Reduce(view) => serde_json::to_value(&view.rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, key: &str, value: i64) -> EmittedRow {
        EmittedRow {
            id: id.into(),
            key: key.into(),
            value: json!(value),
        }
    }

    fn mapped(rows: &[EmittedRow]) -> MapResult {
        let mut result = MapResult::new();
        for row in rows {
            result.push(row.id.as_str(), row.key.clone(), row.value.clone());
        }
        result
    }

    fn changed(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn binary_search_finds_first_row_of_key() {
        let view = MapView::from_rows(vec![
            row("c", "b", 3),
            row("a", "a", 1),
            row("b", "b", 2),
        ]);
        assert_eq!(view.find_row("a"), Some(0));
        assert_eq!(view.find_row("b"), Some(1));
        assert_eq!(view.get_row("b"), Some(&json!(3)));
        assert_eq!(view.find_row("zzz"), None);
        assert_eq!(view.rows_for(&"b".into()).len(), 2);
        assert_eq!(MapView::default().find_row("a"), None);
    }

    #[test]
    fn keys_compare_exactly() {
        let view = MapView::from_rows(vec![row("x", "10", 1)]);
        assert_eq!(view.find_row(10), None);
        assert_eq!(view.find_row("10"), Some(0));
    }

    #[test]
    fn merge_replaces_rows_of_the_same_document_in_place() {
        let view = MapView::from_rows(vec![
            row("keane", "Keane", 1997),
            row("delphic", "Delphic", 2010),
        ]);
        let merge = view.merge(
            &changed(&["delphic", "coldplay"]),
            mapped(&[row("coldplay", "Coldplay", 1997), row("delphic", "Delphic", 2009)]),
        );
        assert_eq!(merge.view.len(), 3);
        assert_eq!(merge.view.find_row("Coldplay"), Some(0));
        assert_eq!(merge.view.get_row("Delphic"), Some(&json!(2009)));
        assert_eq!(merge.delta.len(), 2);
        assert_eq!(merge.delta.find_row("Keane"), None);
        assert_eq!(merge.removed, 0);
    }

    #[test]
    fn merge_keeps_other_documents_sharing_a_key() {
        let view = MapView::from_rows(vec![row("a", "k", 1), row("b", "k", 2)]);
        let merge = view.merge(&changed(&["b"]), mapped(&[row("b", "k", 20)]));
        let values: Vec<_> = merge.view.rows().iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![json!(1), json!(20)]);
    }

    #[test]
    fn merge_drops_rows_no_longer_emitted() {
        let view = MapView::from_rows(vec![row("a", "x", 1), row("a", "y", 2)]);
        let merge = view.merge(&changed(&["a"]), mapped(&[row("a", "y", 3)]));
        assert_eq!(merge.removed, 1);
        assert_eq!(merge.view.find_row("x"), None);
        assert_eq!(merge.view.get_row("y"), Some(&json!(3)));
    }

    #[test]
    fn appended_rows_follow_existing_rows_of_their_key() {
        let view = MapView::from_rows(vec![row("a", "k", 1), row("b", "z", 2)]);
        let merge = view.merge(&changed(&["c"]), mapped(&[row("c", "k", 3)]));
        let ids: Vec<_> = merge.view.rows().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn reduce_view_changes_are_copied() {
        let view = ReduceView::from_rows(vec![
            ReducedRow::new("odd".into(), json!(4)),
            ReducedRow::new("even".into(), json!(2)),
        ]);
        assert_eq!(view.find_row("even"), Some(0));
        assert_eq!(view.find_row("even/odd"), None);

        let next = view.with_changes(
            &[
                ReducedRow::new("even".into(), json!(6)),
                ReducedRow::new("none".into(), json!(0)),
            ],
            &["odd".into()],
        );
        assert_eq!(next.get_row("even"), Some(&json!(6)));
        assert_eq!(next.find_row("none"), Some(1));
        assert_eq!(next.find_row("odd"), None);
        assert_eq!(view.get_row("even"), Some(&json!(2)));
    }

    #[test]
    fn view_json_rows() {
        let view = View::Reduce(ReduceView::from_rows(vec![ReducedRow::new(
            "albums".into(),
            json!(15),
        )]));
        assert_eq!(
            view.to_json().unwrap(),
            json!([{"key": "albums", "value": 15}])
        );
        assert_eq!(view.rows(), vec![(&Key::from("albums"), &json!(15))]);
    }
}
