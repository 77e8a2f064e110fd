//! On-disk sync state.
//!
//! Two files live in the data directory: the document store (`songs.db`,
//! CBOR) and the sync properties (`songs.properties.json`). They are only
//! meaningful together: a file without its partner is deleted on load, and
//! reset removes both. The store records the sequence it was saved at; a
//! pair whose sequences disagree (a crash between the two renames) is
//! unreadable.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use songsync_protocol::{from_cbor, to_cbor, Document};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the serialized document store.
pub const DOCUMENTS_FILE: &str = "songs.db";

/// File name of the sync properties.
pub const STATE_FILE: &str = "songs.properties.json";

/// Identifies which chain and server a stored snapshot belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Last applied sequence.
    pub current_sequence: u64,
    /// Namespace prefix the snapshot was synced under.
    pub namespace_prefix: String,
    /// Server the snapshot was synced from.
    pub server_identity: String,
    /// Identity of the version chain, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

impl SyncState {
    /// Creates an empty state for a namespace and server.
    pub fn new(namespace_prefix: impl Into<String>, server_identity: impl Into<String>) -> Self {
        Self {
            current_sequence: 0,
            namespace_prefix: namespace_prefix.into(),
            server_identity: server_identity.into(),
            chain_id: None,
        }
    }

    /// Returns true if the state belongs to the given namespace and server.
    pub fn same_identity(&self, namespace_prefix: &str, server_identity: &str) -> bool {
        self.namespace_prefix == namespace_prefix && self.server_identity == server_identity
    }
}

/// A persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredSnapshot {
    /// Sync properties.
    pub state: SyncState,
    /// Document store content.
    pub documents: Vec<Document>,
}

/// Content of the document store file.
#[derive(Deserialize)]
struct StoreFile {
    sequence: u64,
    documents: Vec<Document>,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    sequence: u64,
    documents: &'a [Document],
}

/// Reads and writes the two state files of one data directory.
#[derive(Debug, Clone)]
pub struct SyncStorage {
    dir: PathBuf,
}

impl SyncStorage {
    /// Creates storage rooted at `dir`. The directory is created on save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document store file.
    pub fn documents_path(&self) -> PathBuf {
        self.dir.join(DOCUMENTS_FILE)
    }

    /// Path of the properties file.
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Loads the snapshot. Returns `None` if nothing is stored.
    ///
    /// A lone file without its partner is deleted first.
    pub fn load(&self) -> SyncResult<Option<StoredSnapshot>> {
        let documents_path = self.documents_path();
        let state_path = self.state_path();

        match (documents_path.exists(), state_path.exists()) {
            (false, false) => return Ok(None),
            (true, false) => {
                warn!(path = %documents_path.display(), "deleting document store without properties");
                remove_if_exists(&documents_path)?;
                return Ok(None);
            }
            (false, true) => {
                warn!(path = %state_path.display(), "deleting properties without document store");
                remove_if_exists(&state_path)?;
                return Ok(None);
            }
            (true, true) => {}
        }

        let bytes = fs::read(&documents_path)?;
        let store: StoreFile = from_cbor(&bytes)
            .map_err(|e| SyncError::Persistence(format!("{}: {e}", documents_path.display())))?;
        let text = fs::read_to_string(&state_path)?;
        let state: SyncState = serde_json::from_str(&text)
            .map_err(|e| SyncError::Persistence(format!("{}: {e}", state_path.display())))?;
        if store.sequence != state.current_sequence {
            return Err(SyncError::Persistence(format!(
                "{} is at sequence {} but {} at {}",
                DOCUMENTS_FILE, store.sequence, STATE_FILE, state.current_sequence
            )));
        }
        let documents = store.documents;

        debug!(
            dir = %self.dir.display(),
            sequence = state.current_sequence,
            documents = documents.len(),
            "loaded sync state"
        );
        Ok(Some(StoredSnapshot { state, documents }))
    }

    /// Writes both files, each to a temporary file that is then renamed.
    /// Both carry the sequence, so a crash between the renames leaves a
    /// pair that `load` rejects instead of one that replays patches twice.
    pub fn save(&self, state: &SyncState, documents: &[Document]) -> SyncResult<()> {
        fs::create_dir_all(&self.dir)?;
        let store = to_cbor(&StoreFileRef {
            sequence: state.current_sequence,
            documents,
        })?;
        let props = serde_json::to_vec_pretty(state)
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        write_atomic(&self.documents_path(), &store)?;
        write_atomic(&self.state_path(), &props)?;
        debug!(
            dir = %self.dir.display(),
            sequence = state.current_sequence,
            documents = documents.len(),
            "saved sync state"
        );
        Ok(())
    }

    /// Deletes both files.
    pub fn reset(&self) -> SyncResult<()> {
        remove_if_exists(&self.state_path())?;
        remove_if_exists(&self.documents_path())?;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use songsync_protocol::{fields, DocumentId};
    use tempfile::tempdir;

    fn sample() -> (SyncState, Vec<Document>) {
        let mut state = SyncState::new("church/", "tcp://broker");
        state.current_sequence = 12;
        state.chain_id = Some("db-1".into());
        let docs = vec![
            Document::new(DocumentId::new()).with_field(fields::TITLE, "Amazing Grace"),
            Document::new(DocumentId::new()),
        ];
        (state, docs)
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let storage = SyncStorage::new(dir.path().join("data"));
        assert_eq!(storage.load().unwrap(), None);

        let (state, docs) = sample();
        storage.save(&state, &docs).unwrap();
        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.documents, docs);
    }

    #[test]
    fn orphaned_files_are_deleted() {
        let dir = tempdir().unwrap();
        let storage = SyncStorage::new(dir.path());
        let (state, docs) = sample();

        storage.save(&state, &docs).unwrap();
        fs::remove_file(storage.state_path()).unwrap();
        assert_eq!(storage.load().unwrap(), None);
        assert!(!storage.documents_path().exists());

        storage.save(&state, &docs).unwrap();
        fs::remove_file(storage.documents_path()).unwrap();
        assert_eq!(storage.load().unwrap(), None);
        assert!(!storage.state_path().exists());
    }

    #[test]
    fn reset_removes_both() {
        let dir = tempdir().unwrap();
        let storage = SyncStorage::new(dir.path());
        let (state, docs) = sample();
        storage.save(&state, &docs).unwrap();
        storage.reset().unwrap();
        assert!(!storage.documents_path().exists());
        assert!(!storage.state_path().exists());
        storage.reset().unwrap();
    }

    #[test]
    fn corrupt_files_are_reported() {
        let dir = tempdir().unwrap();
        let storage = SyncStorage::new(dir.path());
        fs::write(storage.documents_path(), b"\xff\xff").unwrap();
        fs::write(storage.state_path(), b"{}").unwrap();
        assert!(matches!(storage.load(), Err(SyncError::Persistence(_))));
    }

    #[test]
    fn store_ahead_of_properties_is_unreadable() {
        let dir = tempdir().unwrap();
        let storage = SyncStorage::new(dir.path());
        let (mut state, docs) = sample();
        storage.save(&state, &docs).unwrap();
        let older_props = fs::read(storage.state_path()).unwrap();

        state.current_sequence += 1;
        storage.save(&state, &docs).unwrap();
        fs::write(storage.state_path(), older_props).unwrap();

        let err = storage.load().unwrap_err();
        assert!(matches!(err, SyncError::Persistence(_)));
        assert!(err.to_string().contains("sequence 13"));
    }

    #[test]
    fn identity_check() {
        let state = SyncState::new("a/", "s1");
        assert!(state.same_identity("a/", "s1"));
        assert!(!state.same_identity("b/", "s1"));
        assert!(!state.same_identity("a/", "s2"));
    }
}
