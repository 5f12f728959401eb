//! Change detection for watched files and directories
//!
//! Watching is done by polling: each tick computes a [`Fingerprint`] of the
//! watched paths and compares it with the previous one.

use std::path::PathBuf;
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Directory names never descended into
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", "logs"];

/// Summary of the state of a set of watched paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    /// Newest modification time seen
    latest: Option<SystemTime>,
    /// Number of entries seen (catches deletions)
    entries: u64,
}

/// Fingerprint a set of files or directories. Directories are walked
/// recursively; missing paths simply contribute nothing.
pub fn fingerprint(paths: &[PathBuf]) -> Fingerprint {
    let mut fp = Fingerprint::default();

    for path in paths {
        let walker = WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_ignored(entry));

        for entry in walker.filter_map(|e| e.ok()) {
            fp.entries += 1;
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            if let Some(modified) = modified {
                if fp.latest.map_or(true, |latest| modified > latest) {
                    fp.latest = Some(modified);
                }
            }
        }
    }

    fp
}

fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| IGNORED_DIRS.contains(&name))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn touch_later(path: &std::path::Path, content: &str) {
        // Make sure the mtime moves even on coarse-grained filesystems
        let before = fs::metadata(path).and_then(|m| m.modified()).ok();
        loop {
            fs::write(path, content).unwrap();
            let after = fs::metadata(path).and_then(|m| m.modified()).ok();
            if after != before {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_unchanged_tree_has_stable_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "a").unwrap();

        let paths = vec![dir.path().to_path_buf()];
        assert_eq!(fingerprint(&paths), fingerprint(&paths));
    }

    #[test]
    fn test_modification_changes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.js");
        fs::write(&file, "a").unwrap();

        let paths = vec![dir.path().to_path_buf()];
        let before = fingerprint(&paths);
        touch_later(&file, "b");
        assert_ne!(before, fingerprint(&paths));
    }

    #[test]
    fn test_new_file_changes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "a").unwrap();

        let paths = vec![dir.path().to_path_buf()];
        let before = fingerprint(&paths);
        fs::write(dir.path().join("other.js"), "b").unwrap();
        assert_ne!(before, fingerprint(&paths));
    }

    #[test]
    fn test_ignored_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("index.js"), "a").unwrap();

        let paths = vec![dir.path().to_path_buf()];
        let before = fingerprint(&paths);
        fs::write(dir.path().join("node_modules").join("dep.js"), "b").unwrap();
        assert_eq!(before.entries, fingerprint(&paths).entries);
    }

    #[test]
    fn test_missing_path() {
        let fp = fingerprint(&[PathBuf::from("/nonexistent/epm/configs")]);
        assert_eq!(fp, Fingerprint::default());
    }
}
