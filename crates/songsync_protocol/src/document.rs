//! Documents and identifiers.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Well-known field names of a song document.
pub mod fields {
    /// Song title.
    pub const TITLE: &str = "title";
    /// Lyrics including chord lines.
    pub const LYRICS: &str = "lyrics";
    /// Composer.
    pub const COMPOSER: &str = "composer";
    /// Author of the text.
    pub const AUTHOR_TEXT: &str = "authortext";
    /// Translator of the text.
    pub const AUTHOR_TRANSLATION: &str = "authortranslation";
    /// Publisher.
    pub const PUBLISHER: &str = "publisher";
    /// Copyright notes.
    pub const COPYRIGHT: &str = "additionalcopyrightnotes";
    /// Language code.
    pub const LANGUAGE: &str = "language";
    /// Tonality.
    pub const TONALITY: &str = "tonality";
    /// Chord sequence.
    pub const CHORD_SEQUENCE: &str = "chordsequence";
    /// Reference to a blob (`sdb://<file>`), served by the file side-channel.
    pub const IMAGE: &str = "image";
}

/// Stable identity of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Creates a new random document ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ProtocolError::DecodingFailed {
                message: format!("invalid document id {s:?}: {e}"),
            })
    }
}

/// Opaque identifier of a patch.
///
/// Travels inside comma-joined version tuples and as a topic segment, so it
/// may not contain `,`, `/`, `+` or `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchId(String);

impl PatchId {
    /// Validates and wraps a patch ID.
    pub fn new(id: impl Into<String>) -> ProtocolResult<Self> {
        let id = id.into();
        if id.is_empty() || id.contains([',', '/', '+', '#']) {
            return Err(ProtocolError::SeparatorInValue {
                field: "patch_id",
                value: id,
            });
        }
        Ok(Self(id))
    }

    /// Generates a fresh random patch ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PatchId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A document: a stable ID plus named text fields.
///
/// Empty fields are never stored, so two documents compare equal exactly
/// when their non-empty content matches. A document without any field is a
/// tombstone: deletion is expressed by patching every field away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    fields: BTreeMap<String, String>,
}

impl Document {
    /// Creates a document without fields.
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Creates a document from `(name, value)` pairs, dropping empty values.
    pub fn from_fields<I, K, V>(id: DocumentId, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut doc = Self::new(id);
        for (name, value) in fields {
            doc.set(name, value);
        }
        doc
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Returns the document ID.
    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Returns a field value, `None` when absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Returns a field value or the empty string.
    pub fn field_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    /// Sets a field. Setting an empty value removes the field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if value.is_empty() {
            self.fields.remove(&name);
        } else {
            self.fields.insert(name, value);
        }
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }

    /// Returns all non-empty fields.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Returns true if the document has no content, i.e. is logically deleted.
    pub fn is_tombstone(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_dropped() {
        let id = DocumentId::new();
        let doc = Document::from_fields(id, [("title", "Amazing Grace"), ("lyrics", "")]);
        assert_eq!(doc.fields().len(), 1);
        assert_eq!(doc.field_or_empty("lyrics"), "");
        assert!(!doc.is_tombstone());

        let mut doc = doc;
        doc.set(fields::TITLE, "");
        assert!(doc.is_tombstone());
    }

    #[test]
    fn equality_ignores_empty_values() {
        let id = DocumentId::new();
        let a = Document::new(id).with_field("title", "x").with_field("lyrics", "");
        let b = Document::new(id).with_field("title", "x");
        assert_eq!(a, b);
    }

    #[test]
    fn patch_id_validation() {
        assert!(PatchId::new("abc-123").is_ok());
        assert!(PatchId::new("").is_err());
        assert!(PatchId::new("a,b").is_err());
        assert!(PatchId::new("a/b").is_err());
        assert!(PatchId::new("a+b").is_err());

        let generated = PatchId::generate();
        assert_eq!(PatchId::new(generated.as_str()).unwrap(), generated);
    }

    #[test]
    fn document_id_parse() {
        let id = DocumentId::new();
        let parsed: DocumentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<DocumentId>().is_err());
    }
}
