use sha2::{Digest, Sha256};

use cairn_types::block_hash::BlockHash;

use crate::error::{CairnError, Result};

/// Digest algorithms the catalog can record. The algorithm name is part of
/// the destination's fixed configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
}

impl HashAlgorithm {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            other => Err(CairnError::UserInformation(format!(
                "unsupported hash algorithm '{other}'"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// Digest width in bytes.
    pub fn hash_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
        }
    }

    pub fn digest(self, data: &[u8]) -> BlockHash {
        match self {
            HashAlgorithm::Sha256 => BlockHash::from_raw(Sha256::digest(data).to_vec()),
        }
    }
}

/// Incremental hasher for streaming over block boundaries (file hashes,
/// blockset full hashes).
pub struct StreamHasher {
    inner: Sha256,
}

impl StreamHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self {
                inner: Sha256::new(),
            },
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> BlockHash {
        BlockHash::from_raw(self.inner.finalize().to_vec())
    }
}
