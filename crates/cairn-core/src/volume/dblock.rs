use cairn_types::block_hash::BlockHash;

use crate::error::{CairnError, Result};

use super::archive::{VolumeReader, VolumeWriter};

/// Writer for a Blocks (dblock) volume. Entry names are the url-safe
/// base64 block hashes; payloads are the raw block bytes. Payload bytes
/// (not framing) count against `volume_size`.
pub struct BlockVolumeWriter {
    archive: VolumeWriter,
    payload_bytes: u64,
    entries: Vec<(BlockHash, u32)>,
}

impl BlockVolumeWriter {
    pub fn new() -> Self {
        Self {
            archive: VolumeWriter::new(),
            payload_bytes: 0,
            entries: Vec::new(),
        }
    }

    pub fn add_block(&mut self, hash: &BlockHash, data: &[u8]) -> Result<()> {
        self.archive.add_entry(&hash.to_base64url(), data)?;
        self.payload_bytes += data.len() as u64;
        self.entries.push((hash.clone(), data.len() as u32));
        Ok(())
    }

    /// Payload bytes stored so far.
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the next block of `next_size` bytes would exceed the target.
    pub fn would_overflow(&self, next_size: u64, volume_size: u64) -> bool {
        !self.entries.is_empty() && self.payload_bytes + next_size > volume_size
    }

    /// Close the container. Returns the raw container bytes and the
    /// (hash, size) manifest used for the paired Index volume.
    pub fn finish(self) -> (Vec<u8>, Vec<(BlockHash, u32)>) {
        (self.archive.finish(), self.entries)
    }
}

impl Default for BlockVolumeWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed Blocks volume.
pub struct BlockVolumeReader {
    reader: VolumeReader,
}

impl BlockVolumeReader {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        Ok(Self {
            reader: VolumeReader::parse(data)?,
        })
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<&[u8]> {
        self.reader.get(&hash.to_base64url())
    }

    /// Iterate `(hash, payload)` in container order.
    pub fn blocks(&self) -> Result<Vec<(BlockHash, &[u8])>> {
        self.reader
            .entries()
            .map(|(name, payload)| {
                let hash = BlockHash::from_base64url(name).ok_or_else(|| {
                    CairnError::InvalidFormat(format!("bad block entry name '{name}'"))
                })?;
                Ok((hash, payload))
            })
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.reader.len()
    }
}
