//! Inspect command implementation.

use serde::Serialize;
use songsync_engine::{SyncStorage, DOCUMENTS_FILE, STATE_FILE};
use std::fs;
use std::path::Path;

/// Data directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory path.
    pub path: String,
    /// Document store size in bytes.
    pub store_size: u64,
    /// Properties file size in bytes.
    pub state_size: u64,
    /// Last applied sequence.
    pub current_sequence: u64,
    /// Namespace prefix the snapshot belongs to.
    pub namespace_prefix: String,
    /// Server the snapshot was synced from.
    pub server_identity: String,
    /// Version chain identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// Number of live documents.
    pub document_count: usize,
    /// Number of tombstones.
    pub tombstone_count: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Reads the data directory without modifying it.
///
/// A lone state file is reported as an error instead of being cleaned up;
/// the engine deletes it on its next start.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let storage = SyncStorage::new(path);
    let store_path = storage.documents_path();
    let state_path = storage.state_path();

    match (store_path.exists(), state_path.exists()) {
        (false, false) => return Err(format!("No sync state found at {:?}", path).into()),
        (true, false) => {
            return Err(format!("{} has no matching {}", DOCUMENTS_FILE, STATE_FILE).into())
        }
        (false, true) => {
            return Err(format!("{} has no matching {}", STATE_FILE, DOCUMENTS_FILE).into())
        }
        (true, true) => {}
    }

    let store_size = fs::metadata(&store_path)?.len();
    let state_size = fs::metadata(&state_path)?.len();
    let snapshot = storage
        .load()?
        .ok_or_else(|| format!("No sync state found at {:?}", path))?;

    let tombstone_count = snapshot
        .documents
        .iter()
        .filter(|d| d.is_tombstone())
        .count();

    Ok(InspectResult {
        path: path.display().to_string(),
        store_size,
        state_size,
        current_sequence: snapshot.state.current_sequence,
        namespace_prefix: snapshot.state.namespace_prefix,
        server_identity: snapshot.state.server_identity,
        chain_id: snapshot.state.chain_id,
        document_count: snapshot.documents.len() - tombstone_count,
        tombstone_count,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("songsync data directory: {}", result.path);
    println!();
    println!("Sync State:");
    println!("  Sequence:   {}", result.current_sequence);
    println!("  Namespace:  {}", result.namespace_prefix);
    println!("  Server:     {}", result.server_identity);
    println!(
        "  Chain:      {}",
        result.chain_id.as_deref().unwrap_or("(unknown)")
    );
    println!();
    println!("Documents:");
    println!("  Live:       {}", result.document_count);
    println!("  Tombstones: {}", result.tombstone_count);
    println!();
    println!("Files:");
    println!("  {:<24} {} bytes", DOCUMENTS_FILE, result.store_size);
    println!("  {:<24} {} bytes", STATE_FILE, result.state_size);
}
