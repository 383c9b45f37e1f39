use std::collections::HashMap;
use std::sync::Arc;

use super::Document;

/// Documents by id, plus the order in which ids were first seen.
///
/// Every id in the ordered list has an entry and the list has no
/// duplicates.
#[derive(Clone, Debug, Default)]
pub struct DocumentDictionary {
    dict: HashMap<String, Arc<Document>>,
    ids: Vec<String>,
}

impl DocumentDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a dictionary from a snapshot, keeping its order.
    pub fn unpickle(docs: Vec<Document>) -> Self {
        let mut dict = Self::new();
        dict.set_docs(docs.into_iter().map(Arc::new));
        dict
    }

    /// Insert or replace one document. A new id goes to the end of the
    /// order; a known id keeps its position.
    pub fn set(&mut self, doc: Arc<Document>) {
        if !self.dict.contains_key(&doc.id) {
            self.ids.push(doc.id.clone());
        }
        self.dict.insert(doc.id.clone(), doc);
    }

    /// [`DocumentDictionary::set`] for each document in turn, so the last
    /// of several documents sharing an id wins.
    pub fn set_docs(&mut self, docs: impl IntoIterator<Item = Arc<Document>>) {
        for doc in docs {
            self.set(doc);
        }
    }

    pub fn has(&self, id: &str) -> bool {
        self.dict.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Document>> {
        self.dict.get(id).cloned()
    }

    /// Physically drop `id`.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Document>> {
        let doc = self.dict.remove(id)?;
        self.ids.retain(|known| known != id);
        Some(doc)
    }

    pub fn clear(&mut self) {
        self.dict.clear();
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Documents in order.
    pub fn docs(&self) -> Vec<Arc<Document>> {
        self.ids
            .iter()
            .filter_map(|id| self.dict.get(id).cloned())
            .collect()
    }

    /// Owned copies of the documents in order, ready to persist.
    pub fn snapshot(&self) -> Vec<Document> {
        self.ids
            .iter()
            .filter_map(|id| self.dict.get(id))
            .map(|doc| Document::clone(doc))
            .collect()
    }
}
