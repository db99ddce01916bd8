//! In-memory [`DocumentStore`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use mindweave_core::Document;

use super::{DocumentStore, StoreError, StoredDocument};
use crate::protocol::Operation;

#[derive(Debug, Default)]
struct Entry {
    snapshot: Option<StoredDocument>,
    operations: Vec<Operation>,
}

/// Snapshots and operation logs kept in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, as if it had been saved earlier.
    pub fn insert(&self, document_id: &str, document: Document, version: u64) -> Result<(), StoreError> {
        self.save_snapshot(document_id, &document, version)
    }

    /// Operations appended for `document_id`, in arrival order.
    pub fn operations(&self, document_id: &str) -> Result<Vec<Operation>, StoreError> {
        Ok(self
            .lock()?
            .get(document_id)
            .map(|e| e.operations.clone())
            .unwrap_or_default())
    }

    pub fn document_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.values().filter(|e| e.snapshot.is_some()).count())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, document_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.lock()?.get(document_id).and_then(|e| e.snapshot.clone()))
    }

    fn append_operation(&self, document_id: &str, operation: &Operation) -> Result<(), StoreError> {
        self.lock()?
            .entry(document_id.to_string())
            .or_default()
            .operations
            .push(operation.clone());
        Ok(())
    }

    fn save_snapshot(&self, document_id: &str, document: &Document, version: u64) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        let entry = entries.entry(document_id.to_string()).or_default();
        // Never move a document backwards.
        if entry.snapshot.as_ref().is_some_and(|s| s.version > version) {
            log::warn!("ignoring stale snapshot of {document_id} at version {version}");
            return Ok(());
        }
        entry.snapshot = Some(StoredDocument {
            document: document.clone(),
            version,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindweave_core::{Mutation, NodePatch, ROOT_ID};
    use uuid::Uuid;

    #[test]
    fn test_missing_document_loads_none() {
        let store = MemoryStore::new();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_roundtrip_and_stale_guard() {
        let store = MemoryStore::new();
        store.insert("d", Document::new("v5"), 5).unwrap();
        store.save_snapshot("d", &Document::new("v3"), 3).unwrap();

        let loaded = store.load("d").unwrap().unwrap();
        assert_eq!(loaded.version, 5);
        assert_eq!(loaded.document.root().text, "v5");
        assert_eq!(store.document_count().unwrap(), 1);
    }

    #[test]
    fn test_operations_append_in_order() {
        let store = MemoryStore::new();
        for v in 1..=3 {
            let op = Operation {
                id: Uuid::new_v4(),
                mutation: Mutation::update(ROOT_ID, NodePatch::text(format!("t{v}"))),
                target_node_id: ROOT_ID.into(),
                origin_session_id: Uuid::new_v4(),
                server_timestamp: v * 1_000,
                document_version: v,
                clock: None,
            };
            store.append_operation("d", &op).unwrap();
        }
        let versions: Vec<u64> = store
            .operations("d")
            .unwrap()
            .iter()
            .map(|o| o.document_version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }
}
