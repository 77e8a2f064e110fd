//! The last-synced document snapshot and the user-editable working copy.

use parking_lot::{Mutex, RwLock};
use songsync_protocol::{Document, DocumentId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Authoritative snapshot of all documents at the current sequence.
///
/// Tombstones keep their slot: a document patched down to zero fields stays
/// in the map so later patches still find their base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentStore {
    documents: BTreeMap<DocumentId, Document>,
}

impl DocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from documents.
    pub fn from_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let mut store = Self::new();
        store.upsert_all(documents);
        store
    }

    /// Returns a document, tombstones included.
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Returns true if the ID has a slot.
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.contains_key(id)
    }

    /// Inserts or replaces documents.
    pub fn upsert_all(&mut self, documents: impl IntoIterator<Item = Document>) {
        for document in documents {
            self.documents.insert(document.id(), document);
        }
    }

    /// Removes every document.
    pub fn clear(&mut self) {
        self.documents.clear();
    }

    /// Iterates all documents in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Iterates documents that are not tombstones.
    pub fn live(&self) -> impl Iterator<Item = &Document> {
        self.documents.values().filter(|d| !d.is_tombstone())
    }

    /// Number of slots, tombstones included.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the store has no slots.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Number of tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.documents.values().filter(|d| d.is_tombstone()).count()
    }

    /// Clones every document.
    pub fn snapshot(&self) -> Vec<Document> {
        self.documents.values().cloned().collect()
    }

    /// Differences a working copy has against this store: new and changed
    /// documents as they are, removed documents as empty tombstones.
    pub fn changes_from(&self, working: &[Document]) -> Vec<Document> {
        let mut changes = Vec::new();
        let mut present = BTreeMap::new();
        for doc in working.iter().filter(|d| !d.is_tombstone()) {
            present.insert(doc.id(), doc);
            if self.get(&doc.id()) != Some(doc) {
                changes.push(doc.clone());
            }
        }
        for doc in self.live() {
            if !present.contains_key(&doc.id()) {
                changes.push(Document::new(doc.id()));
            }
        }
        changes
    }
}

/// What changed in a [`WorkingCopy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkingCopyChange {
    /// Remote changes were merged; removed IDs were tombstones.
    Merged {
        /// Inserted or updated documents.
        updated: Vec<DocumentId>,
        /// Documents removed because they became tombstones.
        removed: Vec<DocumentId>,
    },
    /// The whole content was replaced.
    Replaced,
    /// A local edit.
    Edited(DocumentId),
    /// A local removal.
    Removed(DocumentId),
}

/// Listener for working copy changes.
pub type WorkingCopyListener = Arc<dyn Fn(&WorkingCopyChange) + Send + Sync>;

#[derive(Default)]
struct WorkingInner {
    documents: RwLock<BTreeMap<DocumentId, Document>>,
    listeners: Mutex<Vec<(u64, WorkingCopyListener)>>,
    next_listener: AtomicU64,
}

/// The live document collection shown to and edited by the user.
///
/// Cloning shares the same collection. Listeners run after the internal
/// lock is released, so they may read the working copy.
#[derive(Clone, Default)]
pub struct WorkingCopy {
    inner: Arc<WorkingInner>,
}

impl WorkingCopy {
    /// Creates an empty working copy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a working copy holding `documents` (tombstones are skipped).
    pub fn from_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let copy = Self::new();
        copy.replace_quiet(documents);
        copy
    }

    /// Returns a document.
    pub fn get(&self, id: &DocumentId) -> Option<Document> {
        self.inner.documents.read().get(id).cloned()
    }

    /// Clones every document.
    pub fn documents(&self) -> Vec<Document> {
        self.inner.documents.read().values().cloned().collect()
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.inner.documents.read().len()
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.inner.documents.read().is_empty()
    }

    /// Stores a local edit. A tombstone removes the document.
    pub fn put(&self, document: Document) {
        let id = document.id();
        let change = if document.is_tombstone() {
            self.inner.documents.write().remove(&id);
            WorkingCopyChange::Removed(id)
        } else {
            self.inner.documents.write().insert(id, document);
            WorkingCopyChange::Edited(id)
        };
        self.notify(&change);
    }

    /// Removes a document locally.
    pub fn remove(&self, id: &DocumentId) -> Option<Document> {
        let removed = self.inner.documents.write().remove(id);
        if removed.is_some() {
            self.notify(&WorkingCopyChange::Removed(*id));
        }
        removed
    }

    /// Replaces the content and notifies listeners.
    pub fn replace_all(&self, documents: impl IntoIterator<Item = Document>) {
        let change = self.replace_quiet(documents);
        self.notify(&change);
    }

    /// Replaces the content without notifying; returns the change to report.
    pub(crate) fn replace_quiet(&self, documents: impl IntoIterator<Item = Document>) -> WorkingCopyChange {
        let map = documents
            .into_iter()
            .filter(|d| !d.is_tombstone())
            .map(|d| (d.id(), d))
            .collect();
        *self.inner.documents.write() = map;
        WorkingCopyChange::Replaced
    }

    /// Merges committed documents without notifying; tombstones are removed.
    pub(crate) fn merge_quiet<'a>(&self, documents: impl IntoIterator<Item = &'a Document>) -> WorkingCopyChange {
        let mut updated = Vec::new();
        let mut removed = Vec::new();
        let mut map = self.inner.documents.write();
        for doc in documents {
            if doc.is_tombstone() {
                if map.remove(&doc.id()).is_some() {
                    removed.push(doc.id());
                }
            } else {
                map.insert(doc.id(), doc.clone());
                updated.push(doc.id());
            }
        }
        WorkingCopyChange::Merged { updated, removed }
    }

    /// Registers a change listener and returns its ID.
    pub fn on_change<F>(&self, listener: F) -> u64
    where
        F: Fn(&WorkingCopyChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a change listener.
    pub fn remove_listener(&self, id: u64) {
        self.inner.listeners.lock().retain(|(l, _)| *l != id);
    }

    pub(crate) fn notify(&self, change: &WorkingCopyChange) {
        let listeners: Vec<WorkingCopyListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

impl std::fmt::Debug for WorkingCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingCopy").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use songsync_protocol::fields;

    fn doc(title: &str) -> Document {
        Document::new(DocumentId::new()).with_field(fields::TITLE, title)
    }

    #[test]
    fn store_keeps_tombstones() {
        let a = doc("A");
        let mut store = DocumentStore::from_documents([a.clone()]);
        store.upsert_all([Document::new(a.id())]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.tombstone_count(), 1);
        assert_eq!(store.live().count(), 0);
        assert!(store.contains(&a.id()));
    }

    #[test]
    fn changes_from_working_copy() {
        let kept = doc("Kept");
        let edited = doc("Before");
        let removed = doc("Removed");
        let store = DocumentStore::from_documents([kept.clone(), edited.clone(), removed.clone()]);

        let added = doc("New");
        let after = edited.clone().with_field(fields::TITLE, "After");
        let changes = store.changes_from(&[kept, after.clone(), added.clone()]);

        assert_eq!(changes.len(), 3);
        assert!(changes.contains(&after));
        assert!(changes.contains(&added));
        assert!(changes.contains(&Document::new(removed.id())));
    }

    #[test]
    fn working_copy_merge_drops_tombstones() {
        let a = doc("A");
        let b = doc("B");
        let copy = WorkingCopy::from_documents([a.clone(), b.clone()]);

        let change = copy.merge_quiet(&[Document::new(a.id()), b.clone().with_field(fields::LYRICS, "la")]);
        assert_eq!(
            change,
            WorkingCopyChange::Merged {
                updated: vec![b.id()],
                removed: vec![a.id()],
            }
        );
        assert_eq!(copy.len(), 1);
        assert_eq!(copy.get(&b.id()).unwrap().get(fields::LYRICS), Some("la"));
    }

    #[test]
    fn listeners_see_local_edits() {
        let copy = WorkingCopy::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reader = copy.clone();
        let id = copy.on_change(move |change| {
            sink.lock().push((change.clone(), reader.len()));
        });

        let a = doc("A");
        copy.put(a.clone());
        copy.remove(&a.id());
        copy.remove_listener(id);
        copy.put(doc("B"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (WorkingCopyChange::Edited(a.id()), 1));
        assert_eq!(seen[1], (WorkingCopyChange::Removed(a.id()), 0));
    }
}
