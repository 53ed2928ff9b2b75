//! `test(samples)`: download a sample of remote volumes and verify them
//! against the catalog.

use rand::seq::SliceRandom;
use tracing::{info, warn};

use cairn_types::volume::{VolumeState, VolumeType};

use crate::crypto::PlaintextEngine;
use crate::error::{CairnError, Result};
use crate::hashing::HashAlgorithm;
use crate::volume::{BlockVolumeReader, IndexVolumeReader};

use super::{lock, OperationContext};

#[derive(Debug, Default)]
pub struct TestResult {
    pub verified: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl TestResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sample `samples` volumes (the newest dlist plus random dblocks with
/// their paired dindexes), download each, and verify the recorded hash
/// and contents. `full_block_verification` additionally hashes every
/// block inside sampled dblock volumes; otherwise the entry list is
/// checked against the paired dindex manifest.
pub fn run_test(ctx: &OperationContext<'_>, samples: usize) -> Result<TestResult> {
    ctx.options.validate()?;
    let _lock = lock::acquire(ctx.backend)?;
    let encryption = PlaintextEngine;
    let manager = ctx.manager(&encryption)?;
    let catalog = ctx.open_catalog()?;
    let block_algo = HashAlgorithm::parse(&ctx.options.block_hash_algorithm)?;

    let mut result = TestResult::default();
    let mut chosen = Vec::new();

    // Newest dlist first.
    if let Some(newest) = catalog.list_filesets()?.first() {
        chosen.push(catalog.volume_by_id(newest.volume_id)?);
    }

    let mut dblocks: Vec<_> = catalog
        .list_volumes(Some(VolumeType::Blocks), None)?
        .into_iter()
        .filter(|v| matches!(v.state, VolumeState::Uploaded | VolumeState::Verified))
        .collect();
    dblocks.shuffle(&mut rand::thread_rng());
    for dblock in dblocks.into_iter().take(samples.saturating_sub(chosen.len())) {
        for index in catalog.index_volumes_for(dblock.id)? {
            chosen.push(index);
        }
        chosen.push(dblock);
    }

    info!(count = chosen.len(), "testing remote volumes");
    for volume in chosen {
        // download_volume verifies recorded size and hash on the way in.
        let container = match manager.download_volume(&catalog, volume.id) {
            Ok(c) => c,
            Err(e) => {
                warn!(name = %volume.name, "verification failed: {e}");
                result.failed.push((volume.name.clone(), e.to_string()));
                continue;
            }
        };
        let outcome = match volume.kind {
            VolumeType::Blocks => verify_dblock(
                ctx,
                &catalog,
                &volume,
                container,
                block_algo,
            ),
            VolumeType::Index => IndexVolumeReader::parse(container).map(|_| ()),
            VolumeType::Files => {
                crate::volume::FilelistReader::parse(container).map(|_| ())
            }
        };
        match outcome {
            Ok(()) => result.verified.push(volume.name),
            Err(e) => {
                warn!(name = %volume.name, "verification failed: {e}");
                result.failed.push((volume.name, e.to_string()));
            }
        }
    }
    Ok(result)
}

fn verify_dblock(
    ctx: &OperationContext<'_>,
    catalog: &crate::catalog::Catalog,
    volume: &crate::catalog::RemoteVolumeRow,
    container: Vec<u8>,
    block_algo: HashAlgorithm,
) -> Result<()> {
    let reader = BlockVolumeReader::parse(container)?;

    if ctx.options.full_block_verification {
        for (hash, data) in reader.blocks()? {
            if block_algo.digest(data) != hash {
                return Err(CairnError::Integrity(format!(
                    "block {} content does not match its name",
                    hash.to_base64()
                )));
            }
        }
        return Ok(());
    }

    // Cheap mode: the volume must hold every live block the catalog homes
    // in it, at the recorded sizes.
    for block in catalog.blocks_in_volume(volume.id)? {
        let hash = cairn_types::block_hash::BlockHash::from_base64(&block.hash)
            .ok_or_else(|| {
                CairnError::DatabaseConsistency(format!("undecodable hash '{}'", block.hash))
            })?;
        match reader.get_block(&hash) {
            Some(data) if data.len() as i64 == block.size => {}
            Some(data) => {
                return Err(CairnError::Integrity(format!(
                    "block {} is {} bytes, catalog records {}",
                    block.hash,
                    data.len(),
                    block.size
                )));
            }
            None => {
                return Err(CairnError::Integrity(format!(
                    "live block {} missing from volume",
                    block.hash
                )));
            }
        }
    }
    Ok(())
}
