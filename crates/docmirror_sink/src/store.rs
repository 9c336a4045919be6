//! The document store seam and an in-memory implementation.

use crate::error::{SinkError, SinkResult};
use docmirror_codec::DecodedRecord;
use docmirror_feed::Tid;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One row of the destination document table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Object id; the row key.
    pub object_id: u64,
    /// Dotted class name.
    pub class_name: String,
    /// The class pickle, enough to build a placeholder object.
    pub header_bytes: Vec<u8>,
    /// The object state as JSON text.
    pub state_json: String,
}

impl Document {
    /// Builds the row for a converted record.
    pub fn from_record(object_id: u64, record: DecodedRecord) -> Self {
        Self {
            object_id,
            class_name: record.class_name,
            header_bytes: record.header_bytes,
            state_json: record.state_json,
        }
    }
}

/// A transactional destination for documents and checkpoints.
///
/// Writes are staged until [`DocumentStore::commit`]; a failed run calls
/// [`DocumentStore::rollback`] so that documents and the checkpoint move
/// together.
///
/// # Invariants
///
/// - `replace_documents` deletes any existing rows with the same object ids
///   before inserting, so applying the same documents twice is harmless
/// - `save_checkpoint` creates the checkpoint table if it is missing
pub trait DocumentStore {
    /// Returns true if the checkpoint table exists.
    fn checkpoint_table_exists(&mut self) -> SinkResult<bool>;

    /// Create the checkpoint table.
    fn create_checkpoint_table(&mut self) -> SinkResult<()>;

    /// The saved checkpoint for `client_id`.
    fn load_checkpoint(&mut self, client_id: &str) -> SinkResult<Option<Tid>>;

    /// Stage a new checkpoint for `client_id`.
    fn save_checkpoint(&mut self, client_id: &str, tid: Tid) -> SinkResult<()>;

    /// Returns true if the document table exists.
    fn table_exists(&mut self) -> SinkResult<bool>;

    /// Create the document table and its index.
    fn create_table(&mut self) -> SinkResult<()>;

    /// Returns true if the legacy synchronous delete trigger is installed.
    fn legacy_trigger_present(&mut self) -> SinkResult<bool>;

    /// Drop the legacy delete trigger.
    fn remove_legacy_trigger(&mut self) -> SinkResult<()>;

    /// Delete rows with the documents' ids, then insert the documents.
    fn replace_documents(&mut self, documents: &[Document]) -> SinkResult<()>;

    /// Object ids of every stored document.
    fn document_ids(&mut self) -> SinkResult<Vec<u64>>;

    /// Delete the rows with these ids.
    fn delete_documents(&mut self, object_ids: &[u64]) -> SinkResult<()>;

    /// Make staged writes durable.
    fn commit(&mut self) -> SinkResult<()>;

    /// Discard staged writes.
    fn rollback(&mut self) -> SinkResult<()>;
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    table: bool,
    checkpoint_table: bool,
    legacy_trigger: bool,
    checkpoints: HashMap<String, Tid>,
    documents: BTreeMap<u64, Document>,
}

/// An in-memory document store.
///
/// Clones share committed state; each clone stages its own writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    committed: Arc<RwLock<StoreState>>,
    staged: Option<StoreState>,
    commits: usize,
}

impl MemoryStore {
    /// Creates an empty store with no tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose schema still carries the legacy delete trigger.
    pub fn with_legacy_trigger() -> Self {
        let store = Self::default();
        {
            let mut state = store.committed.write();
            state.table = true;
            state.legacy_trigger = true;
        }
        store
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        match &self.staged {
            Some(state) => f(state),
            None => f(&self.committed.read()),
        }
    }

    fn stage(&mut self) -> &mut StoreState {
        let committed = &self.committed;
        self.staged.get_or_insert_with(|| committed.read().clone())
    }

    fn require_table(&mut self) -> SinkResult<&mut StoreState> {
        let state = self.stage();
        if state.table {
            Ok(state)
        } else {
            Err(SinkError::store("document table does not exist"))
        }
    }

    /// The committed document for `object_id`.
    pub fn document(&self, object_id: u64) -> Option<Document> {
        self.committed.read().documents.get(&object_id).cloned()
    }

    /// All committed documents, ordered by object id.
    pub fn documents(&self) -> Vec<Document> {
        self.committed.read().documents.values().cloned().collect()
    }

    /// The committed checkpoint for `client_id`.
    pub fn checkpoint(&self, client_id: &str) -> Option<Tid> {
        self.committed.read().checkpoints.get(client_id).copied()
    }

    /// Number of commits made through this handle.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Returns true if this handle has uncommitted writes.
    pub fn has_staged_writes(&self) -> bool {
        self.staged.is_some()
    }
}

impl DocumentStore for MemoryStore {
    fn checkpoint_table_exists(&mut self) -> SinkResult<bool> {
        Ok(self.read(|s| s.checkpoint_table))
    }

    fn create_checkpoint_table(&mut self) -> SinkResult<()> {
        self.stage().checkpoint_table = true;
        Ok(())
    }

    fn load_checkpoint(&mut self, client_id: &str) -> SinkResult<Option<Tid>> {
        Ok(self.read(|s| s.checkpoints.get(client_id).copied()))
    }

    fn save_checkpoint(&mut self, client_id: &str, tid: Tid) -> SinkResult<()> {
        let state = self.stage();
        state.checkpoint_table = true;
        state.checkpoints.insert(client_id.to_string(), tid);
        Ok(())
    }

    fn table_exists(&mut self) -> SinkResult<bool> {
        Ok(self.read(|s| s.table))
    }

    fn create_table(&mut self) -> SinkResult<()> {
        let state = self.stage();
        if state.table {
            return Err(SinkError::store("document table already exists"));
        }
        state.table = true;
        Ok(())
    }

    fn legacy_trigger_present(&mut self) -> SinkResult<bool> {
        Ok(self.read(|s| s.legacy_trigger))
    }

    fn remove_legacy_trigger(&mut self) -> SinkResult<()> {
        self.stage().legacy_trigger = false;
        Ok(())
    }

    fn replace_documents(&mut self, documents: &[Document]) -> SinkResult<()> {
        let state = self.require_table()?;
        for document in documents {
            state.documents.remove(&document.object_id);
        }
        for document in documents {
            state.documents.insert(document.object_id, document.clone());
        }
        Ok(())
    }

    fn document_ids(&mut self) -> SinkResult<Vec<u64>> {
        Ok(self.read(|s| s.documents.keys().copied().collect()))
    }

    fn delete_documents(&mut self, object_ids: &[u64]) -> SinkResult<()> {
        let state = self.require_table()?;
        for id in object_ids {
            state.documents.remove(id);
        }
        Ok(())
    }

    fn commit(&mut self) -> SinkResult<()> {
        if let Some(state) = self.staged.take() {
            *self.committed.write() = state;
        }
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> SinkResult<()> {
        self.staged = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(object_id: u64, state: &str) -> Document {
        Document {
            object_id,
            class_name: "app.Doc".into(),
            header_bytes: vec![],
            state_json: state.into(),
        }
    }

    #[test]
    fn writes_are_visible_after_commit_only() {
        let mut store = MemoryStore::new();
        store.create_table().unwrap();
        store.replace_documents(&[doc(1, "{}")]).unwrap();
        assert_eq!(store.document_ids().unwrap(), vec![1]);
        assert!(store.document(1).is_none());
        store.commit().unwrap();
        assert_eq!(store.document(1), Some(doc(1, "{}")));
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let mut store = MemoryStore::new();
        store.create_table().unwrap();
        store.commit().unwrap();
        store.replace_documents(&[doc(1, "{}")]).unwrap();
        store.save_checkpoint("c", 5).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.load_checkpoint("c").unwrap(), None);
        assert!(store.documents().is_empty());
    }

    #[test]
    fn replace_overwrites_existing_rows() {
        let mut store = MemoryStore::new();
        store.create_table().unwrap();
        store.replace_documents(&[doc(1, "{}"), doc(2, "{}")]).unwrap();
        store.replace_documents(&[doc(1, r#"{"a":1}"#)]).unwrap();
        store.commit().unwrap();
        assert_eq!(store.documents(), vec![doc(1, r#"{"a":1}"#), doc(2, "{}")]);
    }

    #[test]
    fn writes_need_a_table() {
        let mut store = MemoryStore::new();
        assert!(store.replace_documents(&[doc(1, "{}")]).is_err());
        assert!(store.create_table().is_ok());
        assert!(store.create_table().is_err());
    }

    #[test]
    fn checkpoints_create_their_table() {
        let mut store = MemoryStore::new();
        assert!(!store.checkpoint_table_exists().unwrap());
        store.save_checkpoint("c", 42).unwrap();
        store.commit().unwrap();
        assert!(store.checkpoint_table_exists().unwrap());
        assert_eq!(store.checkpoint("c"), Some(42));
    }
}
