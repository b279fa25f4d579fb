//! Cheap content-change fingerprints
//!
//! Mutable artifacts are re-uploaded only when their extracted tree changed.
//! Rather than hashing file contents, the fingerprint folds the metadata
//! tuple `(name, size, mode, mtime, is_dir)` of every entry in the tree into
//! a 64-bit xxHash. Reading files does not disturb the fingerprint; writes,
//! renames, and permission changes do.

use crate::error::Result;
use std::collections::VecDeque;
use std::path::Path;
use std::time::UNIX_EPOCH;
use xxhash_rust::xxh64::Xxh64;

const SEED: u64 = 0;

/// Hash the metadata of every entry under `root`, breadth-first
///
/// Entries inside each directory are visited in name order so the result is
/// stable across platforms and readdir orderings. A missing root is an error;
/// an empty directory hashes to a fixed value.
pub fn dir_hash(root: &Path) -> Result<u64> {
    let mut hasher = Xxh64::new(SEED);
    let mut queue = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let meta = entry.metadata()?;
            let name = entry.file_name();

            hasher.update(name.to_string_lossy().as_bytes());
            hasher.update(&meta.len().to_le_bytes());
            hasher.update(&mode_of(&meta).to_le_bytes());
            hasher.update(&mtime_secs(&meta).to_le_bytes());
            hasher.update(&[meta.is_dir() as u8]);

            if meta.is_dir() {
                queue.push_back(entry.path());
            }
        }
    }

    Ok(hasher.digest())
}

/// Hash a byte slice with the shared seed
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut hasher = Xxh64::new(SEED);
    hasher.update(data);
    hasher.digest()
}

/// Fold an ordered list of strings into a 64-bit key
///
/// Parts are length-prefixed so `["ab","c"]` and `["a","bc"]` differ.
pub fn hash_parts<S: AsRef<str>>(parts: &[S]) -> u64 {
    let mut hasher = Xxh64::new(SEED);
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hasher.digest()
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    meta.permissions().readonly() as u32
}

/// Modification time at one-second granularity
fn mtime_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_reads_do_not_change_hash() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("weights.bin"), b"0123456789").unwrap();
        fs::create_dir(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("logs/out.txt"), b"line").unwrap();

        let before = dir_hash(dir.path()).unwrap();
        let _ = fs::read(dir.path().join("weights.bin")).unwrap();
        let after = dir_hash(dir.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_size_change_changes_hash() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("weights.bin"), b"0123456789").unwrap();

        let before = dir_hash(dir.path()).unwrap();
        fs::write(dir.path().join("weights.bin"), b"0123456789abcdef").unwrap();
        let after = dir_hash(dir.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_new_entry_changes_hash() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"x").unwrap();

        let before = dir_hash(dir.path()).unwrap();
        fs::write(dir.path().join("b"), b"y").unwrap();
        let after = dir_hash(dir.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("never-created");
        assert!(dir_hash(&gone).is_err());
    }

    #[test]
    fn test_hash_parts_length_prefixing() {
        assert_ne!(hash_parts(&["ab", "c"]), hash_parts(&["a", "bc"]));
        assert_eq!(
            hash_parts(&["3.10", "numpy", "torch"]),
            hash_parts(&["3.10", "numpy", "torch"])
        );
    }
}
