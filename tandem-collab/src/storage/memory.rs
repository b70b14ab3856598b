//! In-memory persistence adapter: the default when no storage path is
//! configured, and the workhorse for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tandem_ot::{DocumentId, Operation, Version};

use crate::storage::{Persistence, StoreError, StoredDocument};

#[derive(Default)]
struct DocRecord {
    doc: Option<StoredDocument>,
    ops: BTreeMap<Version, Operation>,
}

/// Process-local store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<DocumentId, DocRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations retained for a document.
    pub fn operation_count(&self, id: &str) -> usize {
        self.inner
            .lock()
            .expect("memory store poisoned")
            .get(id)
            .map_or(0, |r| r.ops.len())
    }
}

impl Persistence for MemoryStore {
    fn save_document(&self, doc: &StoredDocument) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.entry(doc.id.clone()).or_default().doc = Some(doc.clone());
        Ok(())
    }

    fn load_document(&self, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.get(id).and_then(|r| r.doc.clone()))
    }

    fn save_operation(&self, id: &str, version: Version, op: &Operation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .entry(id.to_string())
            .or_default()
            .ops
            .insert(version, op.clone());
        Ok(())
    }

    fn load_operations(&self, id: &str, since: Version) -> Result<Vec<Operation>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.get(id).map_or_else(Vec::new, |r| {
            r.ops
                .range(since + 1..)
                .map(|(_, op)| op.clone())
                .collect()
        }))
    }

    fn delete_document(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.remove(id);
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut ids: Vec<DocumentId> = inner
            .iter()
            .filter(|(_, r)| r.doc.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
