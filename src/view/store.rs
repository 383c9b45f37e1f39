//! Registered views and their incremental maintenance.

use itertools::Itertools;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::{MapView, ReduceView, View, ViewCallback, ViewDefinition};
use crate::engine::{
    drive, reduce_rows, JobOutput, MapReduceJob, Scheduler, ViewError, YieldNow,
    DEFAULT_CHUNK_SIZE,
};
use crate::store::{Document, DocumentDictionary};
use crate::{MapFn, ReducedRow};

/// A view whose update failed. The view keeps its previous snapshot.
#[derive(Debug)]
pub struct ViewFailure {
    pub id: String,
    pub error: ViewError,
}

impl fmt::Display for ViewFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view `{}`: {}", self.id, self.error)
    }
}

/// A stored view: its definition, current snapshot and subscribers.
struct RegisteredView {
    definition: ViewDefinition,
    view: Arc<View>,
    /// Mapped rows behind a reduce view.
    mapped: Option<Arc<MapView>>,
    subscribers: Vec<ViewCallback>,
}

impl RegisteredView {
    fn view(&self) -> Arc<View> {
        self.view.clone()
    }
}

/// What an update pass works from, copied out so no lock is held while the
/// engine runs.
struct Target {
    id: String,
    definition: ViewDefinition,
    view: Arc<View>,
    mapped: Option<Arc<MapView>>,
}

/// A computed next state for one view.
struct Next {
    view: View,
    mapped: Option<MapView>,
    delta: View,
    changed: bool,
}

/// Owns the stored views of one document collection.
pub struct ViewStore {
    views: Mutex<BTreeMap<String, RegisteredView>>,
    scheduler: Arc<dyn Scheduler>,
    chunk_size: usize,
}

impl Default for ViewStore {
    fn default() -> Self {
        Self::new(Arc::new(YieldNow), DEFAULT_CHUNK_SIZE)
    }
}

impl ViewStore {
    pub fn new(scheduler: Arc<dyn Scheduler>, chunk_size: usize) -> Self {
        Self {
            views: Mutex::new(BTreeMap::new()),
            scheduler,
            chunk_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, RegisteredView>> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compute a view over `source`.
    ///
    /// Temporary views are computed and handed to `finished` without being
    /// stored. A stored view is computed on its first registration; later
    /// registrations under the same id only add their `updated` callback and
    /// get the current snapshot back.
    ///
    /// Returns `Ok(None)` without registering anything when the definition
    /// lacks a map function, a `finished` callback, or (for a stored view)
    /// an id.
    pub async fn register(
        &self,
        definition: ViewDefinition,
        source: &DocumentDictionary,
    ) -> Result<Option<Arc<View>>, ViewError> {
        let (Some(map), Some(finished)) = (definition.map.clone(), definition.finished.clone())
        else {
            debug!("refusing a view without map function or finished callback");
            return Ok(None);
        };

        if definition.temporary {
            let (view, _) = self.compute(&definition, map, source.docs()).await?;
            let view = Arc::new(view);
            finished(view.clone());
            return Ok(Some(view));
        }

        let Some(id) = definition.id.clone() else {
            debug!("refusing a stored view without id");
            return Ok(None);
        };

        if let Some(registered) = self.lock().get_mut(&id) {
            if let Some(updated) = &definition.updated {
                registered.subscribers.push(updated.clone());
            }
            debug!(view = %id, "view already registered");
            return Ok(Some(registered.view.clone()));
        }

        let (view, mapped) = self.compute(&definition, map, source.docs()).await?;
        let view = Arc::new(view);
        info!(view = %id, rows = view.len(), "view registered");
        let subscribers = definition.updated.iter().cloned().collect();
        self.lock().insert(
            id,
            RegisteredView {
                definition,
                view: view.clone(),
                mapped: mapped.map(Arc::new),
                subscribers,
            },
        );
        finished(view.clone());
        Ok(Some(view))
    }

    async fn compute(
        &self,
        definition: &ViewDefinition,
        map: MapFn,
        docs: Vec<Arc<Document>>,
    ) -> Result<(View, Option<MapView>), ViewError> {
        let chunk_size = definition.chunk_size.unwrap_or(self.chunk_size);
        let job = MapReduceJob::new(map, definition.reduce.clone(), docs, chunk_size)
            .with_strategy(definition.strategy);
        let output = drive(job, self.scheduler.as_ref(), definition.progress.as_ref()).await?;
        Ok(match output {
            JobOutput::Mapped(mapped) => (View::Map(MapView::from_result(mapped)), None),
            JobOutput::Reduced { mapped, rows } => (
                View::Reduce(ReduceView::from_rows(rows)),
                Some(MapView::from_result(mapped)),
            ),
        })
    }

    /// Bring every stored view up to date with a batch of written documents.
    ///
    /// Views are updated one after the other and independently: a view whose
    /// map or reduce function fails keeps its previous snapshot and is
    /// reported, the others still update. Subscribers are called after the
    /// new snapshot is in place.
    pub async fn on_documents_written(&self, docs: &[Arc<Document>]) -> Vec<ViewFailure> {
        let targets: Vec<Target> = self
            .lock()
            .iter()
            .map(|(id, registered)| Target {
                id: id.clone(),
                definition: registered.definition.clone(),
                view: registered.view.clone(),
                mapped: registered.mapped.clone(),
            })
            .collect();
        if targets.is_empty() || docs.is_empty() {
            return Vec::new();
        }

        let changed: HashSet<String> = docs.iter().map(|doc| doc.id.clone()).collect();
        let mut failures = Vec::new();
        for target in targets {
            let next = match self.update(&target, docs, &changed).await {
                Ok(next) => next,
                Err(error) => {
                    warn!(view = %target.id, %error, "view update failed");
                    failures.push(ViewFailure {
                        id: target.id,
                        error,
                    });
                    continue;
                }
            };
            if !next.changed {
                continue;
            }

            let subscribers = {
                let mut views = self.lock();
                let Some(registered) = views.get_mut(&target.id) else {
                    // Killed while the update was computed.
                    continue;
                };
                registered.view = Arc::new(next.view);
                registered.mapped = next.mapped.map(Arc::new);
                registered.subscribers.clone()
            };
            debug!(view = %target.id, rows = next.delta.len(), "view updated");
            let delta = Arc::new(next.delta);
            for subscriber in subscribers {
                subscriber(delta.clone());
            }
        }
        failures
    }

    async fn update(
        &self,
        target: &Target,
        docs: &[Arc<Document>],
        changed: &HashSet<String>,
    ) -> Result<Next, ViewError> {
        let Some(map) = target.definition.map.clone() else {
            return Err(ViewError::Finished);
        };
        let chunk_size = target.definition.chunk_size.unwrap_or(self.chunk_size);
        let job = MapReduceJob::new(map, None, docs.to_vec(), chunk_size)
            .with_strategy(target.definition.strategy);
        let batch = match drive(job, self.scheduler.as_ref(), target.definition.progress.as_ref()).await? {
            JobOutput::Mapped(batch) | JobOutput::Reduced { mapped: batch, .. } => batch,
        };

        match (&target.definition.reduce, target.view.as_ref()) {
            (Some(reduce), View::Reduce(stored)) => {
                let old_mapped = target.mapped.clone().unwrap_or_default();
                let dirty = old_mapped.keys_of(changed);
                let batch_keys = batch.keys().cloned().collect_vec();
                let batch_values = batch_keys
                    .iter()
                    .map(|key| batch.values(key))
                    .collect_vec();
                let merge = old_mapped.merge(changed, batch);

                let mut updates = Vec::new();
                let mut removed = Vec::new();
                for (key, values) in batch_keys.iter().zip(batch_values) {
                    if dirty.contains(key) {
                        continue;
                    }
                    let fresh = reduce_rows(reduce, key, &values, false)?;
                    let value = match stored.get_row(key) {
                        Some(previous) => {
                            reduce_rows(reduce, key, &[fresh, previous.clone()], true)?
                        }
                        None => fresh,
                    };
                    updates.push(ReducedRow::new(key.clone(), value));
                }
                for key in dirty.iter().sorted() {
                    let values = merge
                        .view
                        .rows_for(key)
                        .iter()
                        .map(|row| row.value.clone())
                        .collect_vec();
                    if values.is_empty() {
                        removed.push(key.clone());
                    } else {
                        let value = reduce_rows(reduce, key, &values, false)?;
                        updates.push(ReducedRow::new(key.clone(), value));
                    }
                }

                let changed = !updates.is_empty() || !removed.is_empty();
                Ok(Next {
                    view: View::Reduce(stored.with_changes(&updates, &removed)),
                    mapped: Some(merge.view),
                    delta: View::Reduce(ReduceView::from_rows(updates)),
                    changed,
                })
            }
            (_, View::Map(stored)) => {
                let merge = stored.merge(changed, batch);
                let changed = !merge.delta.is_empty() || merge.removed > 0;
                Ok(Next {
                    view: View::Map(merge.view),
                    mapped: None,
                    delta: View::Map(merge.delta),
                    changed,
                })
            }
            (None, View::Reduce(_)) => Err(ViewError::Finished),
        }
    }

    /// Drop the view `id` and its subscribers.
    pub fn kill(&self, id: &str) -> bool {
        let killed = self.lock().remove(id).is_some();
        if killed {
            info!(view = %id, "view killed");
        }
        killed
    }

    pub fn get(&self, id: &str) -> Option<Arc<View>> {
        self.lock().get(id).map(RegisteredView::view)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dict(docs: &[Value]) -> DocumentDictionary {
        DocumentDictionary::unpickle(
            docs.iter()
                .map(|doc| Document::from_value(doc.clone()).unwrap())
                .collect(),
        )
    }

    fn written(docs: &[Value]) -> Vec<Arc<Document>> {
        dict(docs).docs()
    }

    fn parity(id: &str) -> ViewDefinition {
        ViewDefinition::new(id)
            .map(|doc, emit| {
                let nr = doc.i64_field("nr").unwrap_or_default();
                emit.emit(if nr % 2 == 0 { "even" } else { "odd" }, nr);
                Ok(())
            })
            .reduce(|_key, values, _rereduce| {
                Ok(json!(values.iter().filter_map(Value::as_i64).sum::<i64>()))
            })
            .on_finished(|_| {})
    }

    #[tokio::test]
    async fn refuses_incomplete_definitions() {
        let store = ViewStore::default();
        let source = dict(&[json!({"id": "a"})]);

        let no_map = ViewDefinition::new("x").on_finished(|_| {});
        assert!(store.register(no_map, &source).await.unwrap().is_none());

        let no_finished = ViewDefinition::new("x").map(|_, _| Ok(()));
        assert!(store.register(no_finished, &source).await.unwrap().is_none());

        let no_id = ViewDefinition::default()
            .map(|_, _| Ok(()))
            .on_finished(|_| {});
        assert!(store.register(no_id, &source).await.unwrap().is_none());
        assert!(store.ids().is_empty());
    }

    #[tokio::test]
    async fn temporary_views_are_not_stored() {
        let store = ViewStore::default();
        let source = dict(&[json!({"id": "doc1", "nr": 1}), json!({"id": "doc2", "nr": 2})]);
        let by_id = ViewDefinition::new("by-id")
            .map(|doc, emit| {
                emit.emit(doc.id.as_str(), 1);
                Ok(())
            })
            .on_finished(|_| {});
        let view = store.register(by_id, &source).await.unwrap().unwrap();
        assert_eq!(view.len(), 2);

        let mut temp = parity("unused");
        temp.id = None;
        temp.temporary = true;
        let view = store.register(temp, &source).await.unwrap().unwrap();
        assert_eq!(view.get_row("odd"), Some(&json!(1)));
        assert_eq!(view.get_row("even"), Some(&json!(2)));
        assert_eq!(store.ids(), vec!["by-id".to_string()]);
    }

    #[tokio::test]
    async fn second_registration_only_subscribes() {
        let store = ViewStore::default();
        let source = dict(&[json!({"id": "doc1", "nr": 1})]);
        let finished = Arc::new(AtomicUsize::new(0));
        let updates = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let finished = finished.clone();
            let updates = updates.clone();
            let def = parity("parity")
                .on_finished(move |_| {
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .on_updated(move |_| {
                    updates.fetch_add(1, Ordering::SeqCst);
                });
            store.register(def, &source).await.unwrap();
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        store
            .on_documents_written(&written(&[json!({"id": "doc2", "nr": 2})]))
            .await;
        assert_eq!(updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rewriting_a_document_does_not_double_count() {
        let store = ViewStore::default();
        let source = dict(&[json!({"id": "doc1", "nr": 1}), json!({"id": "doc2", "nr": 2})]);
        store.register(parity("parity"), &source).await.unwrap();

        store
            .on_documents_written(&written(&[json!({"id": "doc2", "nr": 2})]))
            .await;
        assert_eq!(store.get("parity").unwrap().get_row("even"), Some(&json!(2)));

        store
            .on_documents_written(&written(&[json!({"id": "doc2", "nr": 3})]))
            .await;
        let view = store.get("parity").unwrap();
        assert_eq!(view.find_row("even"), None);
        assert_eq!(view.get_row("odd"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn failing_view_keeps_its_snapshot() {
        let store = ViewStore::default();
        let source = dict(&[json!({"id": "doc1", "nr": 1})]);
        store.register(parity("parity"), &source).await.unwrap();
        let fragile = ViewDefinition::new("fragile")
            .map(|doc, emit| {
                anyhow::ensure!(doc.id != "bad", "cannot map bad");
                emit.emit(doc.id.as_str(), 1);
                Ok(())
            })
            .on_finished(|_| {});
        store.register(fragile, &source).await.unwrap();

        let failures = store
            .on_documents_written(&written(&[json!({"id": "bad", "nr": 2})]))
            .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "fragile");
        assert_eq!(store.get("fragile").unwrap().len(), 1);
        assert_eq!(store.get("parity").unwrap().get_row("even"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn killed_views_stop_updating() {
        let store = ViewStore::default();
        let updates = Arc::new(AtomicUsize::new(0));
        let seen = updates.clone();
        let def = parity("parity").on_updated(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        store.register(def, &DocumentDictionary::new()).await.unwrap();
        assert!(store.kill("parity"));
        assert!(!store.kill("parity"));

        store
            .on_documents_written(&written(&[json!({"id": "doc1", "nr": 1})]))
            .await;
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        assert!(store.get("parity").is_none());
    }
}
