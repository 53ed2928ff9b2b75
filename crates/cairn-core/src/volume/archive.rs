//! Streaming container format shared by all three volume kinds.
//!
//! Layout: 8-byte magic, 1-byte version, then a sequence of named entries
//! (`u16` name length, name bytes, `u32` payload length, payload bytes),
//! closed by a `0xFFFF` name-length terminator. Entries are written and
//! read in order; the format needs no seeking and no central directory.
//!
//! Compression and encryption are applied to the whole container by the
//! remote manager, so entry payloads here are raw bytes.

use crate::error::{CairnError, Result};

pub const VOLUME_MAGIC: &[u8; 8] = b"CAIRNVOL";
pub const VOLUME_VERSION: u8 = 1;

const TERMINATOR: u16 = 0xFFFF;
/// Entry names longer than this are rejected (terminator guard).
const MAX_NAME_LEN: usize = 0xFFFE;

pub struct VolumeWriter {
    buf: Vec<u8>,
    finished: bool,
}

impl VolumeWriter {
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(VOLUME_MAGIC);
        buf.push(VOLUME_VERSION);
        Self {
            buf,
            finished: false,
        }
    }

    pub fn add_entry(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        debug_assert!(!self.finished, "entry added after finish");
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() > MAX_NAME_LEN {
            return Err(CairnError::InvalidFormat(format!(
                "volume entry name length {} out of range",
                name_bytes.len()
            )));
        }
        if payload.len() > u32::MAX as usize {
            return Err(CairnError::InvalidFormat(format!(
                "volume entry '{name}' exceeds 4 GiB"
            )));
        }
        self.buf
            .extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(name_bytes);
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Container size so far, including framing.
    pub fn container_len(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&TERMINATOR.to_be_bytes());
        self.finished = true;
        self.buf
    }
}

impl Default for VolumeWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed view over a container byte buffer.
pub struct VolumeReader {
    data: Vec<u8>,
    /// (name, payload offset, payload length) per entry, in file order.
    entries: Vec<(String, usize, usize)>,
}

impl VolumeReader {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < VOLUME_MAGIC.len() + 1 || &data[..8] != VOLUME_MAGIC {
            return Err(CairnError::InvalidFormat("bad volume magic".into()));
        }
        let version = data[8];
        if version != VOLUME_VERSION {
            return Err(CairnError::InvalidFormat(format!(
                "unsupported volume version {version}"
            )));
        }

        let mut entries = Vec::new();
        let mut pos = 9usize;
        loop {
            let name_len = read_u16(&data, pos)? as usize;
            pos += 2;
            if name_len == TERMINATOR as usize {
                break;
            }
            let name_end = pos
                .checked_add(name_len)
                .filter(|&e| e <= data.len())
                .ok_or_else(|| CairnError::InvalidFormat("truncated entry name".into()))?;
            let name = std::str::from_utf8(&data[pos..name_end])
                .map_err(|_| CairnError::InvalidFormat("non-UTF-8 entry name".into()))?
                .to_string();
            pos = name_end;

            let payload_len = read_u32(&data, pos)? as usize;
            pos += 4;
            let payload_end = pos
                .checked_add(payload_len)
                .filter(|&e| e <= data.len())
                .ok_or_else(|| CairnError::InvalidFormat("truncated entry payload".into()))?;
            entries.push((name, pos, payload_len));
            pos = payload_end;
        }
        Ok(Self { data, entries })
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _, _)| name.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(move |(name, off, len)| (name.as_str(), &self.data[*off..*off + *len]))
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, off, len)| &self.data[*off..*off + *len])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| CairnError::InvalidFormat("truncated volume".into()))
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| CairnError::InvalidFormat("truncated volume".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let mut writer = VolumeWriter::new();
        writer.add_entry("manifest", b"{}").unwrap();
        writer.add_entry("filelist.json", b"[]").unwrap();
        writer.add_entry("empty", b"").unwrap();
        let bytes = writer.finish();

        let reader = VolumeReader::parse(bytes).unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.get("manifest").unwrap(), b"{}");
        assert_eq!(reader.get("filelist.json").unwrap(), b"[]");
        assert_eq!(reader.get("empty").unwrap(), b"");
        assert!(reader.get("missing").is_none());
        let names: Vec<&str> = reader.entry_names().collect();
        assert_eq!(names, vec!["manifest", "filelist.json", "empty"]);
    }

    #[test]
    fn empty_container() {
        let reader = VolumeReader::parse(VolumeWriter::new().finish()).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(VolumeReader::parse(b"NOTAVOLx\x01\xff\xff".to_vec()).is_err());
    }

    #[test]
    fn rejects_truncation() {
        let mut writer = VolumeWriter::new();
        writer.add_entry("a", b"0123456789").unwrap();
        let mut bytes = writer.finish();
        bytes.truncate(bytes.len() - 6);
        assert!(VolumeReader::parse(bytes).is_err());
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(VOLUME_MAGIC);
        bytes.push(VOLUME_VERSION);
        assert!(VolumeReader::parse(bytes).is_err());
    }

    #[test]
    fn container_len_tracks_framing() {
        let mut writer = VolumeWriter::new();
        let before = writer.container_len();
        writer.add_entry("abc", b"xyz").unwrap();
        // 2 (name len) + 3 (name) + 4 (payload len) + 3 (payload)
        assert_eq!(writer.container_len(), before + 12);
    }
}
