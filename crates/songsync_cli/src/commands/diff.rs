//! Diff command implementation.

use songsync_protocol::make_patch_text;
use std::fs;
use std::path::Path;

/// Runs the diff command, printing the patch from `old` to `new`.
pub fn run(old: &Path, new: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let patch = diff_files(old, new)?;
    if patch.is_empty() {
        eprintln!("Files are identical");
    } else {
        print!("{patch}");
    }
    Ok(())
}

/// Computes the patch text between two files.
pub fn diff_files(old: &Path, new: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let old_text = fs::read_to_string(old)
        .map_err(|e| format!("Cannot read {:?}: {e}", old))?;
    let new_text = fs::read_to_string(new)
        .map_err(|e| format!("Cannot read {:?}: {e}", new))?;
    Ok(make_patch_text(&old_text, &new_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use songsync_protocol::apply_patch_text;
    use tempfile::tempdir;

    #[test]
    fn patch_turns_old_into_new() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.txt");
        let new = dir.path().join("new.txt");
        fs::write(&old, "Amazing grace, how sweet the sound\n").unwrap();
        fs::write(&new, "Amazing grace, how sweet the sound\nThat saved a wretch like me\n").unwrap();

        let patch = diff_files(&old, &new).unwrap();
        assert!(!patch.is_empty());

        let outcome = apply_patch_text("Amazing grace, how sweet the sound\n", &patch).unwrap();
        assert!(outcome.is_clean());
        assert_eq!(
            outcome.text,
            "Amazing grace, how sweet the sound\nThat saved a wretch like me\n"
        );
    }

    #[test]
    fn identical_files_give_empty_patch() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, "same").unwrap();
        assert_eq!(diff_files(&a, &a).unwrap(), "");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, "text").unwrap();
        assert!(diff_files(&a, &dir.path().join("missing.txt")).is_err());
    }
}
