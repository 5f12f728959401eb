//! Durable list of known config file paths
//!
//! The registry is a newline-delimited file of absolute config paths. `start`
//! appends to it, `stop` removes from it, and every other action reads it.

use crate::error::{EpmError, Result};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Append-only log of registered config file paths
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all registered config paths in order, dropping blank lines and
    /// duplicate entries (first occurrence wins).
    pub fn load(&self) -> Result<Vec<PathBuf>> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|source| EpmError::RegistryUnreadable {
                path: self.path.clone(),
                source,
            })?;
        Ok(parse_entries(&content))
    }

    /// Register a config path. Creates the registry on first use and does
    /// nothing if the path is already present.
    pub fn append(&self, config_path: &Path) -> Result<bool> {
        let existing = self.load_or_empty()?;

        if existing.iter().any(|p| p == config_path) {
            debug!(path = %config_path.display(), "Config already registered");
            return Ok(false);
        }

        let write_err = |source| EpmError::RegistryWrite {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;
        writeln!(file, "{}", config_path.display()).map_err(write_err)?;

        info!(path = %config_path.display(), "Config registered");
        Ok(true)
    }

    /// Remove a config path, rewriting the registry atomically. A missing
    /// registry has nothing to remove.
    pub fn remove(&self, config_path: &Path) -> Result<bool> {
        let entries = self.load_or_empty()?;
        if !entries.iter().any(|p| p == config_path) {
            return Ok(false);
        }

        let write_err = |source| EpmError::RegistryWrite {
            path: self.path.clone(),
            source,
        };

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        for entry in entries.iter().filter(|p| *p != config_path) {
            writeln!(tmp, "{}", entry.display()).map_err(write_err)?;
        }
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        info!(path = %config_path.display(), "Config unregistered");
        Ok(true)
    }

    /// Like [`load`](Registry::load), but a registry that was never
    /// created reads as empty
    fn load_or_empty(&self) -> Result<Vec<PathBuf>> {
        match self.load() {
            Ok(entries) => Ok(entries),
            Err(EpmError::RegistryUnreadable { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

fn parse_entries(content: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(PathBuf::from)
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_in(dir: &tempfile::TempDir) -> Registry {
        Registry::new(dir.path().join("home").join("configs"))
    }

    #[test]
    fn test_missing_registry_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);

        assert!(matches!(
            registry.load(),
            Err(EpmError::RegistryUnreadable { .. })
        ));
    }

    #[test]
    fn test_first_append_creates_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);

        assert!(registry.append(Path::new("/srv/a.json")).unwrap());
        assert_eq!(registry.load().unwrap(), vec![PathBuf::from("/srv/a.json")]);
    }

    #[test]
    fn test_append_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);

        registry.append(Path::new("/srv/a.json")).unwrap();
        assert!(!registry.append(Path::new("/srv/a.json")).unwrap());
        registry.append(Path::new("/srv/b.json")).unwrap();

        assert_eq!(
            registry.load().unwrap(),
            vec![PathBuf::from("/srv/a.json"), PathBuf::from("/srv/b.json")]
        );
    }

    #[test]
    fn test_load_skips_blank_lines_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(
            registry.path(),
            "/srv/a.json\n\n   \n/srv/b.json\n/srv/a.json\n\t\n",
        )
        .unwrap();

        assert_eq!(
            registry.load().unwrap(),
            vec![PathBuf::from("/srv/a.json"), PathBuf::from("/srv/b.json")]
        );
    }

    #[test]
    fn test_remove_rewrites_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry.append(Path::new("/srv/a.json")).unwrap();
        registry.append(Path::new("/srv/b.json")).unwrap();

        assert!(registry.remove(Path::new("/srv/a.json")).unwrap());
        assert!(!registry.remove(Path::new("/srv/missing.json")).unwrap());
        assert_eq!(registry.load().unwrap(), vec![PathBuf::from("/srv/b.json")]);
    }

    #[test]
    fn test_remove_from_missing_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);

        assert!(!registry.remove(Path::new("/srv/a.json")).unwrap());
        assert!(!registry.path().exists());
    }
}
