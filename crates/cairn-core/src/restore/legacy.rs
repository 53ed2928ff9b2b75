//! Legacy restore phase 3: single-threaded patching. Downloads each
//! needed Blocks volume in turn and writes every pending block into every
//! target file that still needs it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{CairnError, Result};
use crate::hashing::HashAlgorithm;
use crate::remote::RemoteManager;
use crate::volume::BlockVolumeReader;

use super::plan::{MetadataSink, RestorePlan};
use super::RestoreResult;

#[allow(clippy::too_many_arguments)]
pub(crate) fn patch_sequential(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    plan: &RestorePlan<'_>,
    block_algo: HashAlgorithm,
    sink: &mut MetadataSink,
    broken: &mut HashSet<i64>,
    result: &mut RestoreResult,
    cancel: &AtomicBool,
) -> Result<()> {
    for volume_id in plan.volumes_needed(catalog)? {
        if cancel.load(Ordering::SeqCst) {
            return Err(CairnError::Cancelled);
        }
        let needs = plan.blocks_in_volume(catalog, volume_id)?;
        if needs.is_empty() {
            continue;
        }
        debug!(volume_id, blocks = needs.len(), "patching from volume");
        let container = manager.download_volume(catalog, volume_id)?;
        result.volumes_downloaded += 1;
        let reader = BlockVolumeReader::parse(container)?;
        super::patch_from_volume(
            catalog, plan, &reader, &needs, block_algo, sink, broken, result,
        )?;
    }
    Ok(())
}
