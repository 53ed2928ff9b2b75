use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

use super::archive::{VolumeReader, VolumeWriter};

const MANIFEST_ENTRY: &str = "manifest";
const FILELIST_ENTRY: &str = "filelist.json";

/// The `manifest` entry of a Files (dlist) volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub version: u32,
    /// Creation time, RFC 3339.
    pub created: String,
    pub encoding: String,
    pub blocksize: u32,
    #[serde(rename = "block-hash")]
    pub block_hash: String,
    #[serde(rename = "file-hash")]
    pub file_hash: String,
    #[serde(rename = "app-version")]
    pub app_version: String,
    /// Set when the backup was cancelled mid-run and the fileset reflects
    /// only what had been processed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

/// One entry of `filelist.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilelistEntry {
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub path: String,
    /// Content full hash, base64. Absent for folders and symlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub size: i64,
    /// Last-modified time, epoch seconds.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metahash: Option<String>,
    #[serde(default)]
    pub metasize: i64,
    /// First blocklist hash of a multi-block metadata set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metablockhash: Option<String>,
    /// Blocklist hashes of the content blockset; absent for files that
    /// fit in a single block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocklists: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Folder,
    Symlink,
}

/// Writer for a Files volume: manifest, filelist, optional `control/`
/// passthrough files.
pub struct FilelistWriter {
    archive: VolumeWriter,
    entries: Vec<FilelistEntry>,
    manifest: VolumeManifest,
}

impl FilelistWriter {
    pub fn new(manifest: VolumeManifest) -> Self {
        Self {
            archive: VolumeWriter::new(),
            entries: Vec::new(),
            manifest,
        }
    }

    pub fn add_entry(&mut self, entry: FilelistEntry) {
        self.entries.push(entry);
    }

    /// Untouched user files carried alongside the filelist.
    pub fn add_control_file(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        self.archive.add_entry(&format!("control/{name}"), payload)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        let manifest_json = serde_json::to_vec(&self.manifest)?;
        self.archive.add_entry(MANIFEST_ENTRY, &manifest_json)?;
        let filelist_json = serde_json::to_vec(&self.entries)?;
        self.archive.add_entry(FILELIST_ENTRY, &filelist_json)?;
        Ok(self.archive.finish())
    }
}

/// Parsed Files volume.
pub struct FilelistReader {
    pub manifest: VolumeManifest,
    pub entries: Vec<FilelistEntry>,
}

impl FilelistReader {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let reader = VolumeReader::parse(data)?;
        let manifest_bytes = reader
            .get(MANIFEST_ENTRY)
            .ok_or_else(|| CairnError::InvalidFormat("dlist volume missing manifest".into()))?;
        let manifest: VolumeManifest = serde_json::from_slice(manifest_bytes)
            .map_err(|e| CairnError::InvalidFormat(format!("bad dlist manifest: {e}")))?;
        let filelist_bytes = reader
            .get(FILELIST_ENTRY)
            .ok_or_else(|| CairnError::InvalidFormat("dlist volume missing filelist".into()))?;
        let entries: Vec<FilelistEntry> = serde_json::from_slice(filelist_bytes)
            .map_err(|e| CairnError::InvalidFormat(format!("bad filelist.json: {e}")))?;
        Ok(Self { manifest, entries })
    }
}

/// Reject path lists that mix separator conventions. A backup set is
/// either Unix-origin (forward slashes) or Windows-origin (backslashes);
/// reusing a destination across conventions is a policy violation.
pub fn check_path_separators<'a>(paths: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut saw_unix = false;
    let mut saw_windows = false;
    for path in paths {
        if path.contains('/') {
            saw_unix = true;
        }
        if path.contains('\\') {
            saw_windows = true;
        }
        if saw_unix && saw_windows {
            return Err(CairnError::PolicyViolation(
                "backup mixes Unix and Windows path separators".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manifest() -> VolumeManifest {
        VolumeManifest {
            version: 1,
            created: "2026-01-01T00:00:00Z".into(),
            encoding: "utf8".into(),
            blocksize: 102400,
            block_hash: "sha256".into(),
            file_hash: "sha256".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            partial: false,
        }
    }

    #[test]
    fn roundtrip_filelist() {
        let mut writer = FilelistWriter::new(test_manifest());
        writer.add_entry(FilelistEntry {
            entry_type: EntryType::File,
            path: "/data/a.bin".into(),
            hash: Some("aGFzaA==".into()),
            size: 1024,
            time: 1_700_000_000,
            metahash: Some("bWV0YQ==".into()),
            metasize: 64,
            metablockhash: None,
            blocklists: Some(vec!["bGlzdA==".into()]),
        });
        writer.add_entry(FilelistEntry {
            entry_type: EntryType::Folder,
            path: "/data/sub/".into(),
            hash: None,
            size: 0,
            time: 1_700_000_001,
            metahash: Some("Zm9sZGVy".into()),
            metasize: 48,
            metablockhash: None,
            blocklists: None,
        });
        writer.add_control_file("note.txt", b"user data").unwrap();

        let parsed = FilelistReader::parse(writer.finish().unwrap()).unwrap();
        assert_eq!(parsed.manifest.blocksize, 102400);
        assert!(!parsed.manifest.partial);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].entry_type, EntryType::File);
        assert_eq!(parsed.entries[0].blocklists.as_ref().unwrap().len(), 1);
        assert_eq!(parsed.entries[1].entry_type, EntryType::Folder);
        assert!(parsed.entries[1].hash.is_none());
    }

    #[test]
    fn partial_flag_roundtrips() {
        let mut manifest = test_manifest();
        manifest.partial = true;
        let writer = FilelistWriter::new(manifest);
        let parsed = FilelistReader::parse(writer.finish().unwrap()).unwrap();
        assert!(parsed.manifest.partial);
    }

    #[test]
    fn separator_mixing_rejected() {
        check_path_separators(["/a/b", "/c/d"].into_iter()).unwrap();
        check_path_separators(["C:\\a", "D:\\b"].into_iter()).unwrap();
        let err = check_path_separators(["/a/b", "C:\\x"].into_iter()).unwrap_err();
        assert!(matches!(err, CairnError::PolicyViolation(_)));
    }
}
