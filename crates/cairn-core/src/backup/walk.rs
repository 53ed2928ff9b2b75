use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{HardlinkPolicy, Options, SymlinkPolicy};
use crate::error::{CairnError, Result};

/// Metadata blob stored per entry. Serialized deterministically (field
/// order) so its hash is the same-as-previous comparison key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Last-modified time, epoch seconds.
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
}

impl EntryMetadata {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One enumerated source entry.
#[derive(Debug)]
pub enum WalkEntry {
    File {
        abs_path: PathBuf,
        store_path: String,
        size: u64,
        metadata: EntryMetadata,
    },
    Folder {
        store_path: String,
        metadata: EntryMetadata,
    },
    Symlink {
        store_path: String,
        metadata: EntryMetadata,
    },
}

impl WalkEntry {
    pub fn store_path(&self) -> &str {
        match self {
            WalkEntry::File { store_path, .. }
            | WalkEntry::Folder { store_path, .. }
            | WalkEntry::Symlink { store_path, .. } => store_path,
        }
    }
}

pub fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = GlobBuilder::new(pat)
            .literal_separator(false)
            .build()
            .map_err(|e| {
                CairnError::UserInformation(format!("invalid exclude pattern '{pat}': {e}"))
            })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CairnError::UserInformation(format!("exclude matcher build failed: {e}")))
}

#[cfg(unix)]
fn summarize(meta: &std::fs::Metadata, mtime: i64, target: Option<String>) -> EntryMetadata {
    use std::os::unix::fs::MetadataExt;
    EntryMetadata {
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        mtime,
        symlink_target: target,
    }
}

#[cfg(not(unix))]
fn summarize(meta: &std::fs::Metadata, mtime: i64, target: Option<String>) -> EntryMetadata {
    EntryMetadata {
        mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
        uid: 0,
        gid: 0,
        mtime,
        symlink_target: target,
    }
}

#[cfg(unix)]
fn dev_inode(meta: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn dev_inode(_meta: &std::fs::Metadata) -> (u64, u64) {
    (0, 0)
}

#[cfg(unix)]
fn nlink(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn nlink(_meta: &std::fs::Metadata) -> u64 {
    1
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Source enumerator: walks each source in filename order, applying
/// exclude filters, the symlink and hardlink policies, the attribute
/// filter, the size cap, and the blacklist (which always contains the
/// catalog file and its journal sidecars).
pub struct Enumerator<'a> {
    options: &'a Options,
    excludes: GlobSet,
    blacklist: HashSet<PathBuf>,
    seen_inodes: HashSet<(u64, u64)>,
}

impl<'a> Enumerator<'a> {
    pub fn new(options: &'a Options, catalog_path: &Path) -> Result<Self> {
        let mut blacklist = HashSet::new();
        blacklist.insert(catalog_path.to_path_buf());
        // SQLite journal sidecars live next to the catalog file.
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut os = catalog_path.as_os_str().to_os_string();
            os.push(suffix);
            blacklist.insert(PathBuf::from(os));
        }
        Ok(Self {
            options,
            excludes: build_exclude_set(&options.exclude_filters)?,
            blacklist,
            seen_inodes: HashSet::new(),
        })
    }

    /// Walk all sources, invoking `emit` per entry. Soft per-file errors
    /// are counted and skipped; `emit` returning `Err` aborts the walk.
    pub fn walk(
        &mut self,
        sources: &[PathBuf],
        mut emit: impl FnMut(WalkEntry) -> Result<()>,
    ) -> Result<u64> {
        let mut soft_errors = 0u64;
        for source in sources {
            if !source.exists() {
                return Err(CairnError::UserInformation(format!(
                    "source path does not exist: {}",
                    source.display()
                )));
            }
            let follow = self.options.symlink_policy == SymlinkPolicy::Follow;
            let walker = WalkDir::new(source)
                .follow_links(follow)
                .sort_by_file_name();
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        let soft = e.io_error().is_some_and(|io| {
                            matches!(
                                io.kind(),
                                std::io::ErrorKind::NotFound
                                    | std::io::ErrorKind::PermissionDenied
                            )
                        });
                        if soft {
                            warn!("skipping unreadable entry: {e}");
                            soft_errors += 1;
                            continue;
                        }
                        return Err(CairnError::Other(format!("walk failed: {e}")));
                    }
                };
                match self.process_entry(&entry)? {
                    Some(walk_entry) => emit(walk_entry)?,
                    None => {}
                }
            }
        }
        Ok(soft_errors)
    }

    fn process_entry(&mut self, entry: &walkdir::DirEntry) -> Result<Option<WalkEntry>> {
        let path = entry.path();
        if self.blacklist.contains(path) {
            debug!(path = %path.display(), "blacklisted, skipping");
            return Ok(None);
        }
        let store_path = path.to_string_lossy().into_owned();
        if self.excludes.is_match(&store_path) {
            return Ok(None);
        }

        let file_type = entry.file_type();

        if file_type.is_symlink() {
            return match self.options.symlink_policy {
                SymlinkPolicy::Ignore => Ok(None),
                // With Follow, walkdir already resolved non-cyclic links.
                SymlinkPolicy::Follow => Ok(None),
                SymlinkPolicy::Store => {
                    let meta = std::fs::symlink_metadata(path)?;
                    let target = std::fs::read_link(path)
                        .map(|t| t.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let metadata = summarize(&meta, mtime_secs(&meta), Some(target));
                    Ok(Some(WalkEntry::Symlink {
                        store_path,
                        metadata,
                    }))
                }
            };
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), "stat failed, skipping: {e}");
                return Ok(None);
            }
        };

        if file_type.is_dir() {
            let mut dir_path = store_path;
            if !dir_path.ends_with('/') {
                dir_path.push('/');
            }
            return Ok(Some(WalkEntry::Folder {
                store_path: dir_path,
                metadata: summarize(&meta, mtime_secs(&meta), None),
            }));
        }

        if !file_type.is_file() {
            // Sockets, fifos, devices: not backed up.
            return Ok(None);
        }

        if self.options.file_attribute_filter != 0 {
            let metadata = summarize(&meta, 0, None);
            if metadata.mode & self.options.file_attribute_filter != 0 {
                debug!(path = %path.display(), "attribute-filtered, skipping");
                return Ok(None);
            }
        }

        if let Some(cap) = self.options.skip_files_larger_than {
            if meta.len() > cap {
                warn!(path = %path.display(), size = meta.len(), "over size cap, skipping");
                return Ok(None);
            }
        }

        if nlink(&meta) > 1 {
            match self.options.hardlink_policy {
                HardlinkPolicy::All => {}
                HardlinkPolicy::None => return Ok(None),
                HardlinkPolicy::First => {
                    if !self.seen_inodes.insert(dev_inode(&meta)) {
                        debug!(path = %path.display(), "hardlink already stored, skipping");
                        return Ok(None);
                    }
                }
            }
        }

        Ok(Some(WalkEntry::File {
            abs_path: path.to_path_buf(),
            store_path,
            size: meta.len(),
            metadata: summarize(&meta, mtime_secs(&meta), None),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(options: &Options, root: &Path) -> Vec<String> {
        let mut enumerator = Enumerator::new(options, Path::new("/nonexistent/cat.db")).unwrap();
        let mut paths = Vec::new();
        enumerator
            .walk(&[root.to_path_buf()], |entry| {
                paths.push(entry.store_path().to_string());
                Ok(())
            })
            .unwrap();
        paths
    }

    #[test]
    fn walk_collects_files_and_folders_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let paths = collect(&Options::default(), dir.path());
        assert_eq!(paths.len(), 4); // root dir + a.txt + sub/ + sub/b.txt
        assert!(paths[0].ends_with('/'));
        assert!(paths.iter().any(|p| p.ends_with("a.txt")));
        assert!(paths.iter().any(|p| p.ends_with("b.txt")));
    }

    #[test]
    fn excludes_filter_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(dir.path().join("skip.log"), b"s").unwrap();

        let options = Options {
            exclude_filters: vec!["*.log".into()],
            ..Options::default()
        };
        let paths = collect(&options, dir.path());
        assert!(paths.iter().any(|p| p.ends_with("keep.txt")));
        assert!(!paths.iter().any(|p| p.ends_with("skip.log")));
    }

    #[test]
    fn size_cap_skips_large_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("large"), vec![0u8; 1000]).unwrap();

        let options = Options {
            skip_files_larger_than: Some(100),
            ..Options::default()
        };
        let paths = collect(&options, dir.path());
        assert!(paths.iter().any(|p| p.ends_with("small")));
        assert!(!paths.iter().any(|p| p.ends_with("large")));
    }

    #[cfg(unix)]
    #[test]
    fn stored_symlinks_carry_target() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("missing-target", dir.path().join("link")).unwrap();

        let options = Options::default();
        let mut enumerator =
            Enumerator::new(&options, Path::new("/nonexistent/cat.db")).unwrap();
        let mut links = Vec::new();
        enumerator
            .walk(&[dir.path().to_path_buf()], |entry| {
                if let WalkEntry::Symlink { metadata, .. } = &entry {
                    links.push(metadata.symlink_target.clone().unwrap());
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(links, vec!["missing-target".to_string()]);
    }

    #[test]
    fn metadata_json_is_deterministic() {
        let meta = EntryMetadata {
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            mtime: 1_700_000_000,
            symlink_target: None,
        };
        assert_eq!(meta.to_json().unwrap(), meta.to_json().unwrap());
    }
}
