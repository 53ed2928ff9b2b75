use serde::{Deserialize, Serialize};

use cairn_types::block_hash::BlockHash;

use crate::error::{CairnError, Result};

use super::archive::{VolumeReader, VolumeWriter};

/// One (hash, size) tuple of a dblock manifest, as stored under `vol/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeManifestEntry {
    pub hash: String,
    pub size: u32,
}

/// Writer for an Index (dindex) volume: `vol/<dblockname>` entries list
/// the paired dblock's contents, `list/<blockhash>` entries carry
/// blocklist payloads (binary concatenation of raw block hashes).
pub struct IndexVolumeWriter {
    archive: VolumeWriter,
}

impl IndexVolumeWriter {
    pub fn new() -> Self {
        Self {
            archive: VolumeWriter::new(),
        }
    }

    pub fn add_volume_manifest(
        &mut self,
        dblock_name: &str,
        entries: &[(BlockHash, u32)],
    ) -> Result<()> {
        let manifest: Vec<VolumeManifestEntry> = entries
            .iter()
            .map(|(hash, size)| VolumeManifestEntry {
                hash: hash.to_base64(),
                size: *size,
            })
            .collect();
        let payload = serde_json::to_vec(&manifest)?;
        self.archive
            .add_entry(&format!("vol/{dblock_name}"), &payload)
    }

    pub fn add_blocklist(&mut self, hash: &BlockHash, payload: &[u8]) -> Result<()> {
        self.archive
            .add_entry(&format!("list/{}", hash.to_base64url()), payload)
    }

    pub fn finish(self) -> Vec<u8> {
        self.archive.finish()
    }
}

impl Default for IndexVolumeWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed Index volume.
pub struct IndexVolumeReader {
    reader: VolumeReader,
}

impl IndexVolumeReader {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        Ok(Self {
            reader: VolumeReader::parse(data)?,
        })
    }

    /// All `(dblock_name, entries)` manifests in this index volume.
    pub fn volume_manifests(&self) -> Result<Vec<(String, Vec<VolumeManifestEntry>)>> {
        let mut out = Vec::new();
        for (name, payload) in self.reader.entries() {
            if let Some(dblock_name) = name.strip_prefix("vol/") {
                let entries: Vec<VolumeManifestEntry> =
                    serde_json::from_slice(payload).map_err(|e| {
                        CairnError::InvalidFormat(format!(
                            "bad volume manifest '{name}': {e}"
                        ))
                    })?;
                out.push((dblock_name.to_string(), entries));
            }
        }
        Ok(out)
    }

    /// All `(blocklist_hash, raw payload)` entries.
    pub fn blocklists(&self) -> Result<Vec<(BlockHash, &[u8])>> {
        let mut out = Vec::new();
        for (name, payload) in self.reader.entries() {
            if let Some(encoded) = name.strip_prefix("list/") {
                let hash = BlockHash::from_base64url(encoded).ok_or_else(|| {
                    CairnError::InvalidFormat(format!("bad blocklist entry name '{name}'"))
                })?;
                out.push((hash, payload));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::HashAlgorithm;

    #[test]
    fn roundtrip_manifests_and_blocklists() {
        let h1 = HashAlgorithm::Sha256.digest(b"one");
        let h2 = HashAlgorithm::Sha256.digest(b"two");
        let blocklist_hash = HashAlgorithm::Sha256.digest(b"list");
        let blocklist_payload: Vec<u8> = [h1.as_bytes(), h2.as_bytes()].concat();

        let mut writer = IndexVolumeWriter::new();
        writer
            .add_volume_manifest(
                "cairn-20260101T000000Z-aa.dblock.zst.raw",
                &[(h1.clone(), 100), (h2.clone(), 52)],
            )
            .unwrap();
        writer
            .add_blocklist(&blocklist_hash, &blocklist_payload)
            .unwrap();

        let reader = IndexVolumeReader::parse(writer.finish()).unwrap();

        let manifests = reader.volume_manifests().unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].0, "cairn-20260101T000000Z-aa.dblock.zst.raw");
        assert_eq!(manifests[0].1[0].hash, h1.to_base64());
        assert_eq!(manifests[0].1[1].size, 52);

        let lists = reader.blocklists().unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].0, blocklist_hash);
        assert_eq!(lists[0].1, blocklist_payload.as_slice());
    }
}
