use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::catalog::Catalog;
use crate::config::Options;
use crate::crypto::PlaintextEngine;
use crate::error::Result;
use crate::hashing::HashAlgorithm;
use crate::remote::RemoteManager;
use crate::storage::retry::RetryPolicy;
use crate::storage::{RemoteEntry, StorageBackend};

/// In-memory storage backend for testing. Thread-safe via Mutex.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn object_count(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    /// Remove an object behind the catalog's back (corruption tests).
    pub fn lose(&self, name: &str) {
        self.data.lock().unwrap().remove(name);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(name).cloned())
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.data.lock().unwrap().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().contains_key(name))
    }

    fn list(&self) -> Result<Vec<RemoteEntry>> {
        let map = self.data.lock().unwrap();
        let mut entries: Vec<RemoteEntry> = map
            .iter()
            .map(|(name, data)| RemoteEntry {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Options tuned for fast tests: tiny blocks and volumes so a handful of
/// kilobytes exercises rotation and blocklists.
pub fn test_options() -> Options {
    Options {
        blocksize: 1024,
        volume_size: 8 * 1024,
        ..Options::default()
    }
}

/// A catalog in a fresh tempdir.
pub fn test_catalog() -> (tempfile::TempDir, Catalog) {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(dir.path().join("catalog.sqlite")).unwrap();
    (dir, catalog)
}

pub fn test_manager<'a>(
    backend: &'a dyn StorageBackend,
    encryption: &'a PlaintextEngine,
) -> RemoteManager<'a> {
    RemoteManager::new(
        backend,
        encryption,
        crate::compress::Compression::Zstd { level: 3 },
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        HashAlgorithm::Sha256,
        2 * 60 * 60,
    )
}

/// Write a small source tree: plain files, a subdirectory and (on unix)
/// a symlink to a nonexistent target.
pub fn build_source_tree(root: &Path) -> Vec<PathBuf> {
    std::fs::create_dir_all(root.join("sub")).unwrap();
    std::fs::write(root.join("a.txt"), b"alpha file contents").unwrap();
    std::fs::write(root.join("sub/b.bin"), vec![0u8; 3000]).unwrap();
    std::fs::write(root.join("empty"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("dangling-target", root.join("sub/link")).unwrap();
    vec![root.to_path_buf()]
}

/// Compare two directory trees byte-for-byte (content and symlink
/// targets). Panics with a description on the first difference.
pub fn assert_trees_equal(left: &Path, right: &Path) {
    let mut left_entries = list_tree(left);
    let mut right_entries = list_tree(right);
    left_entries.sort();
    right_entries.sort();
    assert_eq!(
        left_entries, right_entries,
        "tree entry sets differ between {} and {}",
        left.display(),
        right.display()
    );
    for rel in &left_entries {
        let l = left.join(rel);
        let r = right.join(rel);
        let l_meta = std::fs::symlink_metadata(&l).unwrap();
        let r_meta = std::fs::symlink_metadata(&r).unwrap();
        if l_meta.file_type().is_symlink() {
            assert!(r_meta.file_type().is_symlink(), "{rel}: symlink vs not");
            assert_eq!(
                std::fs::read_link(&l).unwrap(),
                std::fs::read_link(&r).unwrap(),
                "{rel}: symlink targets differ"
            );
        } else if l_meta.is_file() {
            assert!(r_meta.is_file(), "{rel}: file vs not");
            assert_eq!(
                std::fs::read(&l).unwrap(),
                std::fs::read(&r).unwrap(),
                "{rel}: contents differ"
            );
        }
    }
}

fn list_tree(root: &Path) -> Vec<String> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.unwrap();
        if entry.path() == root {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        entries.push(rel);
    }
    entries
}
