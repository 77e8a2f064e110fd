//! Apply command implementation.

use songsync_protocol::{PatchOutcome, TextPatch};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Runs the apply command.
///
/// The patched text goes to `output` or stdout. Hunks that could not be
/// placed are reported but do not fail the command, matching how the
/// engine treats partially applied field patches.
pub fn run(base: &Path, patch: &Path, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = apply_files(base, patch)?;

    let failed = outcome.applied.iter().filter(|a| !**a).count();
    if failed > 0 {
        warn!(
            failed,
            total = outcome.applied.len(),
            "patch applied partially"
        );
        eprintln!(
            "{} of {} hunks could not be applied",
            failed,
            outcome.applied.len()
        );
    }

    match output {
        Some(path) => fs::write(path, &outcome.text)?,
        None => print!("{}", outcome.text),
    }
    Ok(())
}

/// Parses the patch file and applies it to the base file.
pub fn apply_files(base: &Path, patch: &Path) -> Result<PatchOutcome, Box<dyn std::error::Error>> {
    let base_text = fs::read_to_string(base)
        .map_err(|e| format!("Cannot read {:?}: {e}", base))?;
    let patch_text = fs::read_to_string(patch)
        .map_err(|e| format!("Cannot read {:?}: {e}", patch))?;
    let patch = TextPatch::parse(&patch_text)?;
    Ok(patch.apply(&base_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use songsync_protocol::make_patch_text;
    use tempfile::tempdir;

    #[test]
    fn applies_patch_to_file() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.txt");
        let patch = dir.path().join("change.patch");
        let out = dir.path().join("out.txt");
        fs::write(&base, "Be thou my vision").unwrap();
        fs::write(&patch, make_patch_text("Be thou my vision", "Be Thou my Vision, O Lord")).unwrap();

        run(&base, &patch, Some(out.as_path())).unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "Be Thou my Vision, O Lord");
    }

    #[test]
    fn unplaceable_hunks_are_reported() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.txt");
        let patch = dir.path().join("change.patch");
        fs::write(&base, "completely unrelated content").unwrap();
        fs::write(&patch, make_patch_text("Amazing grace", "Amazing grace!")).unwrap();

        let outcome = apply_files(&base, &patch).unwrap();
        assert!(!outcome.is_clean());
        assert_eq!(outcome.text, "completely unrelated content");
    }

    #[test]
    fn malformed_patch_is_an_error() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.txt");
        let patch = dir.path().join("bad.patch");
        fs::write(&base, "text").unwrap();
        fs::write(&patch, "this is not a patch\n").unwrap();
        assert!(apply_files(&base, &patch).is_err());
    }
}
