//! Repair / recreate: rebuild the catalog from the remote listing, or
//! reconcile a divergent catalog against it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cairn_types::block_hash::BlockHash;
use cairn_types::volume::{VolumeName, VolumeState, VolumeType};

use crate::catalog::{Catalog, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};
use crate::config::Options;
use crate::error::{CairnError, Result};
use crate::hashing::HashAlgorithm;
use crate::remote::RemoteManager;
use crate::volume::dlist::EntryType;
use crate::volume::{BlockVolumeReader, FilelistReader, IndexVolumeReader};

#[derive(Debug, Default)]
pub struct RepairResult {
    pub filesets_recreated: usize,
    pub volumes_registered: usize,
    pub blocks_registered: usize,
    pub files_recreated: usize,
    pub dblocks_sampled: usize,
    pub orphans_reclaimed: usize,
    pub partial: bool,
}

/// Entry point: recreate from scratch when the catalog holds no filesets,
/// otherwise reconcile local state with the remote listing.
pub fn run_repair(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
    now: DateTime<Utc>,
) -> Result<RepairResult> {
    if catalog.list_filesets()?.is_empty() {
        recreate(catalog, manager, options)
    } else {
        reconcile(catalog, manager, options, now)
    }
}

/// Reconcile mode: reclaim interrupted volumes, finish pending deletes,
/// and verify the listing.
fn reconcile(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
    now: DateTime<Utc>,
) -> Result<RepairResult> {
    let mut result = RepairResult::default();

    result.orphans_reclaimed = reclaim_inflight_volumes(catalog, manager, now)?;

    manager.process_pending_deletes(catalog, now)?;

    let report = manager.verify_listing(catalog, &options.prefix)?;
    if !report.is_clean() {
        if !report.extra.is_empty() && options.auto_cleanup {
            manager.enforce_verification(catalog, &report, true)?;
        } else {
            return Err(CairnError::RemoteList(format!(
                "{} missing, {} extra, {} mismatched remote files",
                report.missing.len(),
                report.extra.len(),
                report.size_mismatch.len()
            )));
        }
    }
    Ok(result)
}

/// Reclaim orphaned Temporary/Uploading volumes left by an interrupted
/// run. Their staging data is gone, so files whose blocks were homed
/// there can never be restored: their entries are purged, the cascade
/// moves the orphaned blocks out, and the volume row is deleted. Also
/// invoked at backup start so stale blocks never satisfy dedup.
pub(crate) fn reclaim_inflight_volumes(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut reclaimed = 0;
    for state in [VolumeState::Temporary, VolumeState::Uploading] {
        for volume in catalog.list_volumes(None, Some(state))? {
            // A dlist volume still carrying a fileset is the synthetic-
            // filelist resume case; the next backup handles it.
            if volume.kind == VolumeType::Files
                && catalog.fileset_for_volume(volume.id)?.is_some()
            {
                continue;
            }
            warn!(name = %volume.name, "reclaiming orphaned in-flight volume");

            let stranded = catalog.files_using_volumes(&[volume.id])?;
            let mut by_fileset: HashMap<i64, Vec<i64>> = HashMap::new();
            for (fileset_id, file_id, path) in stranded {
                warn!(path = %path, "dropping file stranded by interrupted upload");
                by_fileset.entry(fileset_id).or_default().push(file_id);
            }
            for (fileset_id, file_ids) in by_fileset {
                catalog.remove_fileset_entries(fileset_id, &file_ids)?;
            }
            let mut cascade = crate::catalog::RetentionCascade::default();
            catalog.cascade_orphans(&mut cascade)?;

            let leftovers = catalog.blocks_in_volume(volume.id)?;
            if !leftovers.is_empty() {
                return Err(CairnError::DatabaseConsistency(format!(
                    "{} live blocks still reference reclaimed volume '{}'",
                    leftovers.len(),
                    volume.name
                )));
            }

            catalog.transition_volume(volume.id, VolumeState::Deleting)?;
            manager.delete_volume(catalog, volume.id, now)?;
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}

/// Full recreate: insert filesets, files, blocksets and blockset entries
/// from every dlist; blocks and volume linkage from every dindex; sample
/// dblocks only where dindex data is missing.
fn recreate(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
) -> Result<RepairResult> {
    let mut result = RepairResult::default();
    let block_algo = HashAlgorithm::parse(&options.block_hash_algorithm)?;

    let listing = manager.backend().list()?;
    let mut dlists = Vec::new();
    let mut dindexes = Vec::new();
    let mut dblocks = Vec::new();
    for entry in &listing {
        let Ok(name) = VolumeName::parse(&entry.name) else {
            debug!(name = %entry.name, "ignoring foreign remote file");
            continue;
        };
        if name.prefix != options.prefix {
            continue;
        }
        match name.kind {
            VolumeType::Files => dlists.push((entry.clone(), name)),
            VolumeType::Index => dindexes.push(entry.clone()),
            VolumeType::Blocks => dblocks.push(entry.clone()),
        }
    }
    if dlists.is_empty() && dindexes.is_empty() && dblocks.is_empty() {
        return Err(CairnError::UserInformation(
            "nothing to repair: the destination holds no cairn volumes".into(),
        ));
    }
    info!(
        dlists = dlists.len(),
        dindexes = dindexes.len(),
        dblocks = dblocks.len(),
        "recreating catalog from remote listing"
    );

    // Pass 1: dindex volumes establish blocks and volume linkage.
    let mut dblock_ids: HashMap<String, i64> = HashMap::new();
    let mut blocklist_payloads: HashMap<String, Vec<u8>> = HashMap::new();

    for entry in &dindexes {
        let index_id =
            catalog.register_remote_volume(&entry.name, VolumeType::Index, VolumeState::Verified)?;
        catalog.set_volume_info(index_id, entry.size as i64, "")?;
        result.volumes_registered += 1;

        let container = match manager.fetch_by_name(&entry.name) {
            Ok(c) => c,
            Err(e) => {
                warn!(name = %entry.name, "dindex unreadable, continuing: {e}");
                result.partial = true;
                continue;
            }
        };
        let reader = IndexVolumeReader::parse(container)?;

        for (dblock_name, manifest) in reader.volume_manifests()? {
            let dblock_id = match dblock_ids.get(&dblock_name) {
                Some(id) => *id,
                None => {
                    let listed = dblocks.iter().find(|e| e.name == dblock_name);
                    if listed.is_none() {
                        warn!(name = %dblock_name, "dindex references missing dblock");
                        result.partial = true;
                        continue;
                    }
                    let id = catalog.register_remote_volume(
                        &dblock_name,
                        VolumeType::Blocks,
                        VolumeState::Verified,
                    )?;
                    catalog.set_volume_info(id, listed.map(|e| e.size as i64).unwrap_or(0), "")?;
                    dblock_ids.insert(dblock_name.clone(), id);
                    result.volumes_registered += 1;
                    id
                }
            };
            catalog.add_index_link(index_id, dblock_id)?;
            for item in manifest {
                let Some(hash) = BlockHash::from_base64(&item.hash) else {
                    warn!(hash = %item.hash, "undecodable hash in dindex manifest");
                    result.partial = true;
                    continue;
                };
                let (_, is_new) =
                    catalog.register_block(&hash, item.size as i64, dblock_id)?;
                if is_new {
                    result.blocks_registered += 1;
                }
            }
        }
        for (hash, payload) in reader.blocklists()? {
            blocklist_payloads.insert(hash.to_base64(), payload.to_vec());
        }
    }

    // Pass 2: dblocks with no dindex coverage get sampled directly.
    for entry in &dblocks {
        if dblock_ids.contains_key(&entry.name) {
            continue;
        }
        warn!(name = %entry.name, "no dindex covers this dblock, sampling it");
        let dblock_id = catalog.register_remote_volume(
            &entry.name,
            VolumeType::Blocks,
            VolumeState::Verified,
        )?;
        catalog.set_volume_info(dblock_id, entry.size as i64, "")?;
        result.volumes_registered += 1;
        result.dblocks_sampled += 1;
        match manager.fetch_by_name(&entry.name) {
            Ok(container) => {
                let reader = BlockVolumeReader::parse(container)?;
                for (hash, data) in reader.blocks()? {
                    let (_, is_new) =
                        catalog.register_block(&hash, data.len() as i64, dblock_id)?;
                    if is_new {
                        result.blocks_registered += 1;
                    }
                    // A blocklist payload may only exist here.
                    blocklist_payloads
                        .entry(hash.to_base64())
                        .or_insert_with(|| data.to_vec());
                }
            }
            Err(e) => {
                warn!(name = %entry.name, "dblock unreadable: {e}");
                result.partial = true;
            }
        }
    }

    // Pass 3: dlists recreate filesets, files and blocksets.
    dlists.sort_by_key(|(_, name)| name.timestamp);
    let mut first = true;
    for (entry, parsed_name) in &dlists {
        let volume_id =
            catalog.register_remote_volume(&entry.name, VolumeType::Files, VolumeState::Verified)?;
        catalog.set_volume_info(volume_id, entry.size as i64, "")?;
        result.volumes_registered += 1;

        let container = match manager.fetch_by_name(&entry.name) {
            Ok(c) => c,
            Err(e) => {
                warn!(name = %entry.name, "dlist unreadable, skipping fileset: {e}");
                result.partial = true;
                continue;
            }
        };
        let filelist = FilelistReader::parse(container)?;

        let fileset_id =
            catalog.create_fileset(volume_id, parsed_name.timestamp.timestamp(), first)?;
        first = false;
        if filelist.manifest.partial {
            catalog.mark_fileset_partial(fileset_id)?;
        }
        result.filesets_recreated += 1;

        for file in &filelist.entries {
            match recreate_file_entry(
                catalog,
                options,
                block_algo,
                &blocklist_payloads,
                file,
                fileset_id,
            ) {
                Ok(()) => result.files_recreated += 1,
                Err(e) => {
                    warn!(path = %file.path, "could not recreate file entry: {e}");
                    result.partial = true;
                }
            }
        }
    }

    if result.partial {
        catalog.mark_partially_recreated()?;
        warn!("catalog recreated from an incomplete remote set");
    } else {
        catalog.clear_partially_recreated()?;
        catalog.verify_consistency(options.blocksize, block_algo.hash_len(), false)?;
        catalog.store_fixed_options(options)?;
        info!(
            filesets = result.filesets_recreated,
            blocks = result.blocks_registered,
            "catalog recreated"
        );
    }
    Ok(result)
}

/// Rebuild one file row: resolve its block sequence from the filelist
/// entry (hash for single-block files, blocklists otherwise), then the
/// blockset, metadataset and fileset entry.
fn recreate_file_entry(
    catalog: &Catalog,
    options: &Options,
    block_algo: HashAlgorithm,
    blocklist_payloads: &HashMap<String, Vec<u8>>,
    file: &crate::volume::FilelistEntry,
    fileset_id: i64,
) -> Result<()> {
    let metadata_id = match &file.metahash {
        Some(metahash) => {
            let meta_lists: Vec<String> =
                file.metablockhash.iter().cloned().collect();
            let meta_blockset = resolve_blockset(
                catalog,
                options,
                block_algo,
                blocklist_payloads,
                metahash,
                file.metasize,
                &meta_lists,
            )?;
            Some(catalog.register_metadataset(meta_blockset)?)
        }
        None => None,
    };

    let blockset_id = match file.entry_type {
        EntryType::Folder => FOLDER_BLOCKSET_ID,
        EntryType::Symlink => SYMLINK_BLOCKSET_ID,
        EntryType::File => {
            let hash = file.hash.as_deref().ok_or_else(|| {
                CairnError::InvalidFormat(format!("file entry '{}' lacks a hash", file.path))
            })?;
            let lists = file.blocklists.clone().unwrap_or_default();
            resolve_blockset(
                catalog,
                options,
                block_algo,
                blocklist_payloads,
                hash,
                file.size,
                &lists,
            )?
        }
    };

    let file_id = catalog.register_file(&file.path, blockset_id, metadata_id)?;
    catalog.add_fileset_entry(fileset_id, file_id, file.time)?;
    Ok(())
}

/// Resolve or register the blockset for a blob of `length` bytes whose
/// full hash is `full_hash_b64`. Multi-block sets resolve their member
/// hashes from the given blocklist hashes (one per span of
/// `blocksize / hash_len` blocks); single-block sets are their own block.
fn resolve_blockset(
    catalog: &Catalog,
    options: &Options,
    block_algo: HashAlgorithm,
    blocklist_payloads: &HashMap<String, Vec<u8>>,
    full_hash_b64: &str,
    length: i64,
    blocklists: &[String],
) -> Result<i64> {
    if let Some(id) = catalog.find_blockset(full_hash_b64, length)? {
        return Ok(id);
    }
    let full_hash = BlockHash::from_base64(full_hash_b64)
        .ok_or_else(|| CairnError::InvalidFormat(format!("bad hash '{full_hash_b64}'")))?;

    let blocksize = options.blocksize as i64;
    let block_count = if length == 0 {
        0
    } else {
        (length + blocksize - 1) / blocksize
    };

    let block_hashes: Vec<String> = if block_count == 0 {
        Vec::new()
    } else if block_count == 1 {
        // Single-block blobs are their own block when the two hash
        // algorithms agree; otherwise the blocklist entry names it.
        vec![full_hash_b64.to_string()]
    } else {
        let per_chunk = options.hashes_per_blocklist(block_algo.hash_len());
        let chunk_count = (block_count as usize).div_ceil(per_chunk);
        if blocklists.len() != chunk_count {
            return Err(CairnError::InvalidFormat(format!(
                "entry carries {} blocklists, expected {chunk_count} for {block_count} blocks",
                blocklists.len()
            )));
        }
        let mut hashes = Vec::with_capacity(block_count as usize);
        for list_hash in blocklists {
            let payload = blocklist_payloads.get(list_hash).ok_or_else(|| {
                CairnError::RemoteList(format!("blocklist {list_hash} not found in any dindex"))
            })?;
            for raw in payload.chunks(block_algo.hash_len()) {
                hashes.push(BlockHash::from_raw(raw.to_vec()).to_base64());
            }
        }
        if hashes.len() < block_count as usize {
            return Err(CairnError::InvalidFormat(format!(
                "blocklists carry {} hashes for {block_count} blocks",
                hashes.len()
            )));
        }
        hashes.truncate(block_count as usize);
        hashes
    };

    let mut block_ids = Vec::with_capacity(block_hashes.len());
    for (idx, hash) in block_hashes.iter().enumerate() {
        let size = if idx as i64 + 1 < block_count {
            blocksize
        } else {
            length - blocksize * (block_count - 1)
        };
        let row = BlockHash::from_base64(hash)
            .and_then(|h| catalog.find_block(&h, size).transpose())
            .transpose()?
            .ok_or_else(|| {
                CairnError::RemoteList(format!("block {hash} ({size} B) not found in any dindex"))
            })?;
        block_ids.push(row.id);
    }

    let (blockset_id, is_new) = catalog.register_blockset(&full_hash, length, &block_ids)?;
    if is_new && block_hashes.len() > 1 {
        let raw_hashes: Vec<BlockHash> = block_hashes
            .iter()
            .filter_map(|h| BlockHash::from_base64(h))
            .collect();
        let per_chunk = options.hashes_per_blocklist(block_algo.hash_len());
        let mut list_hashes = Vec::new();
        for span in raw_hashes.chunks(per_chunk) {
            let mut payload = Vec::with_capacity(span.len() * block_algo.hash_len());
            for hash in span {
                payload.extend_from_slice(hash.as_bytes());
            }
            list_hashes.push(block_algo.digest(&payload));
        }
        catalog.register_blocklist_hashes(blockset_id, &list_hashes)?;
    }
    Ok(blockset_id)
}
