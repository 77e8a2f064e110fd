//! Per-document field patches and the patch payload.

use crate::cbor::{from_cbor, to_cbor};
use crate::document::{Document, DocumentId, PatchId};
use crate::error::ProtocolResult;
use crate::textpatch::{make_patch_text, TextPatch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Textual patches for the fields of one document, keyed by field name.
///
/// Fields that did not change are never present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPatchSet(BTreeMap<String, String>);

/// Result of applying a [`FieldPatchSet`] to a base document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDocument {
    /// The patched document; fields that became empty are dropped.
    pub document: Document,
    /// Fields where some hunk could not be placed.
    pub partial_fields: Vec<String>,
    /// Fields whose patch text could not be parsed; left unchanged.
    pub malformed_fields: Vec<String>,
}

impl AppliedDocument {
    /// Returns true if every field patch applied without loss.
    pub fn is_clean(&self) -> bool {
        self.partial_fields.is_empty() && self.malformed_fields.is_empty()
    }
}

impl FieldPatchSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs every field of `target` against `base`.
    ///
    /// A missing base behaves like an all-empty document. Fields present only
    /// in the base are driven to empty, which is how deletion travels.
    pub fn between(base: Option<&Document>, target: &Document) -> Self {
        let mut names: BTreeSet<&str> = target.fields().keys().map(String::as_str).collect();
        if let Some(base) = base {
            names.extend(base.fields().keys().map(String::as_str));
        }

        let mut set = Self::new();
        for name in names {
            let old = base.map_or("", |b| b.field_or_empty(name));
            let patch = make_patch_text(old, target.field_or_empty(name));
            set.insert(name, patch);
        }
        set
    }

    /// Adds a field patch. Empty patches are ignored.
    pub fn insert(&mut self, field: impl Into<String>, patch: impl Into<String>) {
        let patch = patch.into();
        if !patch.is_empty() {
            self.0.insert(field.into(), patch);
        }
    }

    /// Returns the patch text for a field.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Returns true if no field changed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of changed fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates `(field, patch)` pairs in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Applies the set on top of `base`, or on an empty document `id`.
    pub fn apply_to(&self, id: DocumentId, base: Option<&Document>) -> AppliedDocument {
        let mut document = base.cloned().unwrap_or_else(|| Document::new(id));
        let mut partial_fields = Vec::new();
        let mut malformed_fields = Vec::new();

        for (field, text) in self.iter() {
            let patch = match TextPatch::parse(text) {
                Ok(patch) => patch,
                Err(_) => {
                    malformed_fields.push(field.to_string());
                    continue;
                }
            };
            let outcome = patch.apply(document.field_or_empty(field));
            if !outcome.is_clean() {
                partial_fields.push(field.to_string());
            }
            document.set(field, outcome.text);
        }

        AppliedDocument {
            document,
            partial_fields,
            malformed_fields,
        }
    }
}

/// A bundle of field patches for one version of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Identifier referenced by the matching version announcement.
    pub patch_id: PatchId,
    /// Changed documents.
    pub entries: BTreeMap<DocumentId, FieldPatchSet>,
}

impl Patch {
    /// Creates an empty patch.
    pub fn new(patch_id: PatchId) -> Self {
        Self {
            patch_id,
            entries: BTreeMap::new(),
        }
    }

    /// Adds the changes for one document. Empty sets are ignored.
    pub fn insert(&mut self, id: DocumentId, set: FieldPatchSet) {
        if !set.is_empty() {
            self.entries.insert(id, set);
        }
    }

    /// Returns true if the patch changes no document.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of changed documents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// IDs of the changed documents.
    pub fn documents(&self) -> impl Iterator<Item = DocumentId> + '_ {
        self.entries.keys().copied()
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::fields;

    #[test]
    fn unchanged_fields_are_omitted() {
        let id = DocumentId::new();
        let base = Document::new(id)
            .with_field(fields::TITLE, "Amazing Grace")
            .with_field(fields::LYRICS, "Amazing grace, how sweet the sound");
        let target = base.clone().with_field(fields::TITLE, "Amazing Grace (live)");

        let set = FieldPatchSet::between(Some(&base), &target);
        assert_eq!(set.len(), 1);
        assert!(set.get(fields::TITLE).is_some());
        assert!(set.get(fields::LYRICS).is_none());

        assert!(FieldPatchSet::between(Some(&base), &base).is_empty());
    }

    #[test]
    fn new_document_against_empty_base() {
        let id = DocumentId::new();
        let target = Document::new(id).with_field(fields::TITLE, "Amazing Grace");
        let set = FieldPatchSet::between(None, &target);
        assert!(!set.is_empty());

        let applied = set.apply_to(id, None);
        assert!(applied.is_clean());
        assert_eq!(applied.document, target);
    }

    #[test]
    fn deletion_patches_every_field_away() {
        let id = DocumentId::new();
        let base = Document::new(id)
            .with_field(fields::TITLE, "Old")
            .with_field(fields::COMPOSER, "Someone");
        let set = FieldPatchSet::between(Some(&base), &Document::new(id));
        assert_eq!(set.len(), 2);

        let applied = set.apply_to(id, Some(&base));
        assert!(applied.document.is_tombstone());
    }

    #[test]
    fn malformed_field_patch_is_reported() {
        let id = DocumentId::new();
        let base = Document::new(id).with_field(fields::TITLE, "kept");
        let mut set = FieldPatchSet::new();
        set.insert(fields::TITLE, "not a patch");
        let applied = set.apply_to(id, Some(&base));
        assert_eq!(applied.malformed_fields, vec![fields::TITLE.to_string()]);
        assert_eq!(applied.document.get(fields::TITLE), Some("kept"));
    }

    #[test]
    fn patch_cbor_roundtrip() {
        let id = DocumentId::new();
        let target = Document::new(id).with_field(fields::TITLE, "Amazing Grace");
        let mut patch = Patch::new(PatchId::generate());
        patch.insert(id, FieldPatchSet::between(None, &target));
        patch.insert(DocumentId::new(), FieldPatchSet::new());
        assert_eq!(patch.len(), 1);

        let bytes = patch.encode().unwrap();
        assert_eq!(Patch::decode(&bytes).unwrap(), patch);
        assert!(Patch::decode(b"garbage").is_err());
    }
}
