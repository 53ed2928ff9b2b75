//! Remote volume manager: owns the volume state machine and brackets
//! every backend side effect with catalog-atomic transitions.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cairn_types::volume::{VolumeState, VolumeType};

use crate::catalog::Catalog;
use crate::compress::{self, Compression};
use crate::crypto::EncryptionEngine;
use crate::error::{CairnError, Result};
use crate::hashing::HashAlgorithm;
use crate::storage::retry::{with_retry, RetryPolicy};
use crate::storage::StorageBackend;

/// Outcome of comparing the catalog against the backend listing.
#[derive(Debug, Default)]
pub struct RemoteVerification {
    /// Catalog says Uploaded/Verified but the backend lacks the file.
    pub missing: Vec<String>,
    /// Backend files carrying our prefix that the catalog does not know.
    pub extra: Vec<String>,
    /// Present but with a different size than recorded.
    pub size_mismatch: Vec<String>,
}

impl RemoteVerification {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.size_mismatch.is_empty()
    }
}

pub struct RemoteManager<'a> {
    backend: &'a dyn StorageBackend,
    encryption: &'a dyn EncryptionEngine,
    compression: Compression,
    retry: RetryPolicy,
    file_hash: HashAlgorithm,
    grace: chrono::Duration,
}

impl<'a> RemoteManager<'a> {
    pub fn new(
        backend: &'a dyn StorageBackend,
        encryption: &'a dyn EncryptionEngine,
        compression: Compression,
        retry: RetryPolicy,
        file_hash: HashAlgorithm,
        grace_secs: i64,
    ) -> Self {
        Self {
            backend,
            encryption,
            compression,
            retry,
            file_hash,
            grace: chrono::Duration::seconds(grace_secs),
        }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend
    }

    /// Apply the outbound byte-stream transforms: compress, then encrypt.
    pub fn seal(&self, container: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress::compress(self.compression, container)?;
        self.encryption.encrypt(&compressed)
    }

    /// Reverse of [`seal`]: decrypt, then decompress.
    pub fn unseal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.encryption.decrypt(payload)?;
        compress::decompress(&compressed)
    }

    /// Seal a container and put it under `name`, retrying transient
    /// failures. Catalog-free so background upload threads can call it;
    /// the caller brackets it with the Uploading/Uploaded transitions.
    /// Returns the final (size, hash) as stored at the destination.
    pub fn seal_and_put(&self, name: &str, container: &[u8]) -> Result<(i64, String)> {
        let sealed = self.seal(container)?;
        let size = sealed.len() as i64;
        let hash = self.file_hash.digest(&sealed).to_base64();
        with_retry(&self.retry, "upload", || self.backend.put(name, &sealed))?;
        Ok((size, hash))
    }

    /// Upload a finalized container under the volume's recorded name.
    ///
    /// Transitions: Temporary → Uploading before the put; Uploading →
    /// Uploaded (with size and hash recorded) on success; Uploading →
    /// Temporary on failure so the volume can be reassigned or resumed.
    pub fn upload_volume(
        &self,
        catalog: &Catalog,
        volume_id: i64,
        container: &[u8],
    ) -> Result<(i64, String)> {
        let volume = catalog.volume_by_id(volume_id)?;
        catalog.transition_volume(volume_id, VolumeState::Uploading)?;

        match self.seal_and_put(&volume.name, container) {
            Ok((size, hash)) => {
                catalog.set_volume_info(volume_id, size, &hash)?;
                catalog.transition_volume(volume_id, VolumeState::Uploaded)?;
                info!(name = %volume.name, size, "uploaded volume");
                Ok((size, hash))
            }
            Err(e) => {
                warn!(name = %volume.name, "upload failed, rolling volume back: {e}");
                catalog.transition_volume(volume_id, VolumeState::Temporary)?;
                Err(e)
            }
        }
    }

    /// Fetch the sealed bytes of a remote file, retrying transient
    /// failures and verifying recorded size and hash when given.
    /// Catalog-free so downloader threads can call it.
    pub fn get_sealed(
        &self,
        name: &str,
        expected_size: Option<i64>,
        expected_hash: Option<&str>,
    ) -> Result<Vec<u8>> {
        let sealed = with_retry(&self.retry, "download", || self.backend.get(name))?
            .ok_or_else(|| CairnError::VolumeNotFound(name.to_string()))?;

        if let Some(expected) = expected_size {
            if sealed.len() as i64 != expected {
                return Err(CairnError::Integrity(format!(
                    "volume '{name}' is {} bytes, catalog records {expected}",
                    sealed.len()
                )));
            }
        }
        if let Some(expected) = expected_hash {
            let actual = self.file_hash.digest(&sealed).to_base64();
            if actual != expected {
                return Err(CairnError::Integrity(format!(
                    "volume '{name}' hash mismatch: got {actual}, catalog records {expected}"
                )));
            }
        }
        Ok(sealed)
    }

    /// The decrypt half of [`unseal`], exposed for the pipelined restore's
    /// decryptor stage.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.encryption.decrypt(sealed)
    }

    /// Download a volume, verify its recorded size and hash, and undo the
    /// byte-stream transforms.
    pub fn download_volume(&self, catalog: &Catalog, volume_id: i64) -> Result<Vec<u8>> {
        let volume = catalog.volume_by_id(volume_id)?;
        let sealed =
            self.get_sealed(&volume.name, volume.size, volume.hash.as_deref())?;
        self.unseal(&sealed)
    }

    /// Fetch and unseal a remote file by bare name (repair path, where the
    /// catalog has no row yet).
    pub fn fetch_by_name(&self, name: &str) -> Result<Vec<u8>> {
        let sealed = with_retry(&self.retry, "download", || self.backend.get(name))?
            .ok_or_else(|| CairnError::VolumeNotFound(name.to_string()))?;
        self.unseal(&sealed)
    }

    /// Begin deleting a volume: transition to Deleting with a grace
    /// deadline, issue the physical delete, and transition to Deleted only
    /// once the listing confirms absence. Eventually-consistent listings
    /// leave the row in Deleting until [`process_pending_deletes`].
    pub fn delete_volume(&self, catalog: &Catalog, volume_id: i64, now: DateTime<Utc>) -> Result<()> {
        let volume = catalog.volume_by_id(volume_id)?;
        if volume.state != VolumeState::Deleting {
            catalog.transition_volume(volume_id, VolumeState::Deleting)?;
            catalog.set_volume_grace(volume_id, (now + self.grace).timestamp())?;
        }

        with_retry(&self.retry, "delete", || self.backend.delete(&volume.name))?;

        if !self.backend.exists(&volume.name)? {
            catalog.transition_volume(volume_id, VolumeState::Deleted)?;
            debug!(name = %volume.name, "volume deleted and confirmed");
        } else {
            debug!(name = %volume.name, "delete issued, awaiting listing confirmation");
        }
        Ok(())
    }

    /// Re-check every Deleting volume: confirmed-absent rows transition to
    /// Deleted immediately, still-present rows past their grace deadline
    /// get the delete re-issued and transition as well.
    pub fn process_pending_deletes(&self, catalog: &Catalog, now: DateTime<Utc>) -> Result<usize> {
        let mut completed = 0;
        for volume in catalog.list_volumes(None, Some(VolumeState::Deleting))? {
            if !self.backend.exists(&volume.name)? {
                catalog.transition_volume(volume.id, VolumeState::Deleted)?;
                completed += 1;
                continue;
            }
            let grace_expired = volume
                .delete_grace_until
                .is_some_and(|until| until <= now.timestamp());
            if grace_expired {
                with_retry(&self.retry, "delete", || self.backend.delete(&volume.name))?;
                catalog.transition_volume(volume.id, VolumeState::Deleted)?;
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Compare the backend listing against the catalog. Volumes confirmed
    /// present with the recorded size advance Uploaded → Verified.
    /// `prefix` scopes the extra-file check to our own namespace.
    pub fn verify_listing(
        &self,
        catalog: &Catalog,
        prefix: &str,
    ) -> Result<RemoteVerification> {
        let listing = self.backend.list()?;
        let mut listed: std::collections::HashMap<&str, u64> = listing
            .iter()
            .map(|e| (e.name.as_str(), e.size))
            .collect();

        let mut report = RemoteVerification::default();

        for volume in catalog.list_volumes(None, None)? {
            match volume.state {
                VolumeState::Uploaded | VolumeState::Verified => {
                    match listed.remove(volume.name.as_str()) {
                        None => report.missing.push(volume.name.clone()),
                        Some(size) => {
                            if volume.size.is_some_and(|s| s as u64 != size) {
                                report.size_mismatch.push(volume.name.clone());
                            } else if volume.state == VolumeState::Uploaded {
                                catalog
                                    .transition_volume(volume.id, VolumeState::Verified)?;
                            }
                        }
                    }
                }
                // In-flight and dying volumes may legitimately be absent.
                _ => {
                    listed.remove(volume.name.as_str());
                }
            }
        }

        for (name, _) in listed {
            // Only files that look like our volumes count as extras; the
            // lock object and foreign files are ignored.
            let parsed = cairn_types::volume::VolumeName::parse(name);
            if parsed.is_ok_and(|n| n.prefix == prefix) {
                report.extra.push(name.to_string());
            }
        }
        report.extra.sort();
        report.missing.sort();
        report.size_mismatch.sort();
        Ok(report)
    }

    /// Turn a dirty verification into an error, or clean up the extras
    /// when `auto_cleanup` is set.
    pub fn enforce_verification(
        &self,
        _catalog: &Catalog,
        report: &RemoteVerification,
        auto_cleanup: bool,
    ) -> Result<()> {
        if report.is_clean() {
            return Ok(());
        }
        if !report.missing.is_empty() || !report.size_mismatch.is_empty() {
            return Err(CairnError::RemoteList(format!(
                "{} missing, {} size-mismatched volumes; run repair",
                report.missing.len(),
                report.size_mismatch.len()
            )));
        }
        if auto_cleanup {
            // Extras have no catalog row by definition; only the backend
            // needs touching.
            for name in &report.extra {
                warn!(name = %name, "auto-cleanup: deleting unknown remote file");
                with_retry(&self.retry, "delete", || self.backend.delete(name))?;
            }
            Ok(())
        } else {
            Err(CairnError::RemoteList(format!(
                "{} unknown files at the destination; run repair or enable auto-cleanup",
                report.extra.len()
            )))
        }
    }

    /// Register a fresh volume row and return (id, name).
    pub fn create_volume(
        &self,
        catalog: &Catalog,
        prefix: &str,
        kind: VolumeType,
        now: DateTime<Utc>,
    ) -> Result<(i64, String)> {
        // Name collisions are absurdly unlikely (128-bit guid) but the
        // unique index makes them loud rather than silent.
        let name = cairn_types::volume::VolumeName::generate(
            prefix,
            kind,
            self.compression.name_suffix(),
            self.encryption.name_suffix(),
            now,
        )
        .to_string();
        let id = catalog.register_remote_volume(&name, kind, VolumeState::Temporary)?;
        Ok((id, name))
    }
}
