//! Encryption seam. The actual ciphers are external collaborators; the
//! engine only requires a reversible byte-stream transform whose name is
//! reflected in the `<encryption>` component of remote volume names.

use crate::error::Result;

pub trait EncryptionEngine: Send + Sync {
    /// The `<encryption>` component of a remote volume name.
    fn name_suffix(&self) -> &'static str;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Identity transform used when no passphrase is configured.
pub struct PlaintextEngine;

impl EncryptionEngine for PlaintextEngine {
    fn name_suffix(&self) -> &'static str {
        "raw"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_is_identity() {
        let engine = PlaintextEngine;
        let data = b"volume bytes".to_vec();
        let sealed = engine.encrypt(&data).unwrap();
        assert_eq!(engine.decrypt(&sealed).unwrap(), data);
        assert_eq!(engine.name_suffix(), "raw");
    }
}
