use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::View;
use crate::engine::{MapStrategy, Phase, ProgressFn};
use crate::{Document, Emitter, Key, MapFn, ReduceFn};

/// Receives a view snapshot: the whole view once it is computed, or only
/// the rows touched by a write.
pub type ViewCallback = Arc<dyn Fn(Arc<View>) + Send + Sync>;

/// Everything needed to compute and maintain one view.
///
/// A view without a map function or a `finished` callback is refused by
/// the store, as is a stored view without an id.
#[derive(Clone, Default)]
pub struct ViewDefinition {
    pub(crate) id: Option<String>,
    pub(crate) temporary: bool,
    pub(crate) map: Option<MapFn>,
    pub(crate) reduce: Option<ReduceFn>,
    pub(crate) finished: Option<ViewCallback>,
    pub(crate) updated: Option<ViewCallback>,
    pub(crate) progress: Option<ProgressFn>,
    pub(crate) chunk_size: Option<usize>,
    pub(crate) strategy: MapStrategy,
}

impl ViewDefinition {
    /// A stored, incrementally maintained view.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// A one-shot view that is computed and forgotten.
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Default::default()
        }
    }

    pub fn map<F>(self, map: F) -> Self
    where
        F: Fn(&Document, &mut Emitter) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.map_fn(Arc::new(map))
    }

    pub fn map_fn(mut self, map: MapFn) -> Self {
        self.map = Some(map);
        self
    }

    pub fn reduce<F>(self, reduce: F) -> Self
    where
        F: Fn(&Key, &[Value], bool) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.reduce_fn(Arc::new(reduce))
    }

    pub fn reduce_fn(mut self, reduce: ReduceFn) -> Self {
        self.reduce = Some(reduce);
        self
    }

    pub fn on_finished<F>(mut self, finished: F) -> Self
    where
        F: Fn(Arc<View>) + Send + Sync + 'static,
    {
        self.finished = Some(Arc::new(finished));
        self
    }

    pub fn on_updated<F>(mut self, updated: F) -> Self
    where
        F: Fn(Arc<View>) + Send + Sync + 'static,
    {
        self.updated = Some(Arc::new(updated));
        self
    }

    pub fn on_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(Phase, f64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn strategy(mut self, strategy: MapStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn has_reduce(&self) -> bool {
        self.reduce.is_some()
    }
}

impl fmt::Debug for ViewDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewDefinition")
            .field("id", &self.id)
            .field("temporary", &self.temporary)
            .field("map", &self.map.is_some())
            .field("reduce", &self.reduce.is_some())
            .field("finished", &self.finished.is_some())
            .field("updated", &self.updated.is_some())
            .field("chunk_size", &self.chunk_size)
            .field("strategy", &self.strategy)
            .finish()
    }
}
