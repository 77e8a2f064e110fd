//! Reset command implementation.

use songsync_engine::SyncStorage;
use std::path::Path;
use tracing::info;

/// Runs the reset command.
///
/// Both state files are removed together; the next engine start loads
/// nothing and catches up from the broker.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let storage = SyncStorage::new(path);
    let existed = storage.documents_path().exists() || storage.state_path().exists();

    storage.reset()?;

    if existed {
        info!(dir = %path.display(), "sync state deleted");
        println!("Sync state at {:?} deleted", path);
    } else {
        println!("No sync state at {:?}", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use songsync_engine::SyncState;
    use tempfile::tempdir;

    #[test]
    fn removes_both_files() {
        let dir = tempdir().unwrap();
        let storage = SyncStorage::new(dir.path());
        storage
            .save(&SyncState::new("church/", "tcp://broker:1883"), &[])
            .unwrap();

        run(dir.path()).unwrap();

        assert!(!storage.documents_path().exists());
        assert!(!storage.state_path().exists());
    }

    #[test]
    fn empty_directory_is_fine() {
        let dir = tempdir().unwrap();
        run(dir.path()).unwrap();
    }
}
