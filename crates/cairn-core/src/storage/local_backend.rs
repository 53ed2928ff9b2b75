use std::fs;
use std::path::{Component, PathBuf};

use crate::error::{CairnError, Result};
use crate::storage::{RemoteEntry, StorageBackend};

/// Storage backend for a local filesystem directory using `std::fs`
/// directly. Volumes are flat files under the root.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Reject names that could escape the destination root.
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CairnError::InvalidFormat("unsafe remote name: empty".into()));
        }
        if name.starts_with('/') || name.contains('\\') {
            return Err(CairnError::InvalidFormat(format!(
                "unsafe remote name '{name}'"
            )));
        }
        let path = std::path::Path::new(name);
        for component in path.components() {
            if component == Component::ParentDir {
                return Err(CairnError::InvalidFormat(format!(
                    "unsafe remote name: parent traversal '{name}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(name)?;
        // Write to a sibling temp name then rename so a crashed upload never
        // leaves a truncated volume under its final name.
        let tmp = path.with_extension("partial");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(".partial") {
                continue;
            }
            entries.push(RemoteEntry {
                name,
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        let path = self.resolve(name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_unsafe() {
        assert!(LocalBackend::validate_name("/etc/passwd").is_err());
        assert!(LocalBackend::validate_name("../../outside").is_err());
        assert!(LocalBackend::validate_name("foo\\bar").is_err());
        assert!(LocalBackend::validate_name("").is_err());
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.put("vol-a.dblock.zst.raw", b"payload").unwrap();
        assert!(backend.exists("vol-a.dblock.zst.raw").unwrap());
        assert_eq!(
            backend.get("vol-a.dblock.zst.raw").unwrap().unwrap(),
            b"payload"
        );
        assert_eq!(backend.size("vol-a.dblock.zst.raw").unwrap(), Some(7));
        backend.delete("vol-a.dblock.zst.raw").unwrap();
        assert!(!backend.exists("vol-a.dblock.zst.raw").unwrap());
        // Deleting again is a no-op.
        backend.delete("vol-a.dblock.zst.raw").unwrap();
    }

    #[test]
    fn list_reports_sizes_and_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.put("b", b"22").unwrap();
        backend.put("a", b"1").unwrap();
        std::fs::write(dir.path().join("c.partial"), b"junk").unwrap();
        let listed = backend.list().unwrap();
        assert_eq!(
            listed,
            vec![
                RemoteEntry { name: "a".into(), size: 1 },
                RemoteEntry { name: "b".into(), size: 2 },
            ]
        );
    }
}
