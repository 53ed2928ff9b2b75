use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_ZSTD: u8 = 0x02;

/// Cap on decompressed volume size. A Blocks volume is bounded by
/// `volume_size` payload plus container framing; anything past this is a
/// decompression bomb.
const MAX_DECOMPRESS_SIZE: u64 = 1024 * 1024 * 1024;

/// Whole-volume compression transform. The chosen codec is reflected in
/// the `<compression>` component of remote volume names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd { level: 3 }
    }
}

impl Compression {
    /// Parse from a config string like "zstd", "none".
    pub fn from_config(algorithm: &str, zstd_level: i32) -> Result<Self> {
        match algorithm {
            "none" | "raw" => Ok(Compression::None),
            "zstd" | "zst" => Ok(Compression::Zstd { level: zstd_level }),
            other => Err(CairnError::UserInformation(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    /// The `<compression>` component of a remote volume name.
    pub fn name_suffix(self) -> &'static str {
        match self {
            Compression::None => "raw",
            Compression::Zstd { .. } => "zst",
        }
    }
}

/// Compress data and prepend a 1-byte tag identifying the codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        Compression::Zstd { level } => {
            let compressed = zstd::bulk::compress(data, level)
                .map_err(|e| CairnError::Codec(format!("zstd compress: {e}")))?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let (&tag, payload) = data
        .split_first()
        .ok_or_else(|| CairnError::Codec("empty compressed payload".into()))?;

    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(payload)
                .map_err(|e| CairnError::Codec(format!("zstd init: {e}")))?;
            let mut out = Vec::new();
            decoder
                .take(MAX_DECOMPRESS_SIZE)
                .read_to_end(&mut out)
                .map_err(|e| CairnError::Codec(format!("zstd decompress: {e}")))?;
            Ok(out)
        }
        other => Err(CairnError::Codec(format!(
            "unknown compression tag: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_roundtrip() {
        let data = b"plain payload".to_vec();
        let packed = compress(Compression::None, &data).unwrap();
        assert_eq!(packed[0], TAG_NONE);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn zstd_roundtrip() {
        let data = vec![0x5a; 256 * 1024];
        let packed = compress(Compression::Zstd { level: 3 }, &data).unwrap();
        assert_eq!(packed[0], TAG_ZSTD);
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(decompress(&[]), Err(CairnError::Codec(_))));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(decompress(&[0x7f, 1, 2]), Err(CairnError::Codec(_))));
    }

    #[test]
    fn name_suffixes() {
        assert_eq!(Compression::None.name_suffix(), "raw");
        assert_eq!(Compression::Zstd { level: 3 }.name_suffix(), "zst");
        assert_eq!(
            Compression::from_config("zst", 3).unwrap(),
            Compression::Zstd { level: 3 }
        );
    }
}
