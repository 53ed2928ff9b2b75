use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Raw content digest of a block or blockset.
///
/// The catalog stores hashes base64-encoded (standard alphabet); volume
/// entry names use the url-safe alphabet without padding. Digest width
/// depends on the configured algorithm (32 bytes for SHA-256).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub Vec<u8>);

impl BlockHash {
    pub fn from_raw(bytes: impl Into<Vec<u8>>) -> Self {
        BlockHash(bytes.into())
    }

    /// Standard-alphabet base64, the catalog's storage encoding.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(s: &str) -> Option<Self> {
        STANDARD.decode(s).ok().map(BlockHash)
    }

    /// Url-safe base64 without padding, used for volume entry names.
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_base64url(s: &str) -> Option<Self> {
        URL_SAFE_NO_PAD.decode(s).ok().map(BlockHash)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        write!(f, "BlockHash({})", &b64[..b64.len().min(12)])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let hash = BlockHash::from_raw(vec![0u8, 1, 2, 255, 254, 63]);
        let encoded = hash.to_base64();
        assert_eq!(BlockHash::from_base64(&encoded).unwrap(), hash);
    }

    #[test]
    fn base64url_has_no_padding_or_slash() {
        let hash = BlockHash::from_raw(vec![0xfb; 32]);
        let name = hash.to_base64url();
        assert!(!name.contains('='));
        assert!(!name.contains('/'));
        assert!(!name.contains('+'));
        assert_eq!(BlockHash::from_base64url(&name).unwrap(), hash);
    }

    #[test]
    fn display_matches_catalog_encoding() {
        let hash = BlockHash::from_raw(vec![7u8; 32]);
        assert_eq!(hash.to_string(), hash.to_base64());
    }
}
