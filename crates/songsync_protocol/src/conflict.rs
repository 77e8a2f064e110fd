//! Conflicts between pending local edits and remote changes.

use crate::document::{Document, DocumentId};

/// A pending local edit superseded by a remote change to the same document.
///
/// The remote side always wins; the local edit is kept here for manual
/// handling and is never republished automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Document both sides touched.
    pub document_id: DocumentId,
    /// The unpublished local edit.
    pub local: Document,
    /// The document as committed by the remote version.
    pub remote: Document,
    /// Sequence of the remote version.
    pub sequence: u64,
    /// Author of the remote version.
    pub author: String,
}

impl Conflict {
    /// Creates a new conflict.
    pub fn new(local: Document, remote: Document, sequence: u64, author: impl Into<String>) -> Self {
        Self {
            document_id: local.id(),
            local,
            remote,
            sequence,
            author: author.into(),
        }
    }

    /// Returns true if one side deleted the document and the other edited it.
    pub fn is_update_delete_conflict(&self) -> bool {
        self.local.is_tombstone() != self.remote.is_tombstone()
    }

    /// Returns true if both sides ended with the same content.
    pub fn is_equivalent(&self) -> bool {
        self.local.fields() == self.remote.fields()
    }

    /// Names of fields whose values differ between the two sides.
    pub fn differing_fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .local
            .fields()
            .keys()
            .chain(self.remote.fields().keys())
            .map(String::as_str)
            .filter(|name| self.local.get(name) != self.remote.get(name))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::fields;

    #[test]
    fn classification() {
        let id = DocumentId::new();
        let local = Document::new(id).with_field(fields::TITLE, "Mine");
        let remote = Document::new(id)
            .with_field(fields::TITLE, "Theirs")
            .with_field(fields::COMPOSER, "X");
        let conflict = Conflict::new(local.clone(), remote, 3, "bob");
        assert_eq!(conflict.document_id, id);
        assert!(!conflict.is_update_delete_conflict());
        assert!(!conflict.is_equivalent());
        assert_eq!(conflict.differing_fields(), vec![fields::COMPOSER, fields::TITLE]);

        let deleted = Conflict::new(local.clone(), Document::new(id), 4, "bob");
        assert!(deleted.is_update_delete_conflict());

        let same = Conflict::new(local.clone(), local, 5, "bob");
        assert!(same.is_equivalent());
        assert!(same.differing_fields().is_empty());
    }
}
