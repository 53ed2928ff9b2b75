//! Compaction: reclaim wasted space in Blocks volumes while preserving
//! referential integrity. Live blocks stream out of shrinking volumes
//! into fresh ones; references re-home through the duplicate-block table;
//! old volumes and their index files are deleted in dependency order.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cairn_types::block_hash::BlockHash;
use cairn_types::volume::VolumeType;

use crate::catalog::{Catalog, VolumeUsage};
use crate::config::Options;
use crate::error::{CairnError, Result};
use crate::remote::RemoteManager;
use crate::volume::{BlockVolumeReader, BlockVolumeWriter, IndexVolumeWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Live data no larger than the waste: the volume is effectively
    /// garbage. Any surviving live blocks are still streamed out first.
    CleanDelete,
    /// Waste ratio over the threshold.
    Wasted,
    /// Compressed size below the small-file bound.
    Small,
    Healthy,
}

pub fn classify(usage: &VolumeUsage, options: &Options) -> Classification {
    if usage.data_size <= usage.wasted_size {
        return Classification::CleanDelete;
    }
    let threshold = options.threshold as i64;
    if usage.wasted_size * 100 >= threshold * usage.data_size
        || usage.wasted_size * 100 >= threshold * options.volume_size as i64
    {
        return Classification::Wasted;
    }
    if usage.compressed_size <= options.small_file_size as i64 {
        return Classification::Small;
    }
    Classification::Healthy
}

#[derive(Debug, Default)]
pub struct CompactStats {
    pub volumes_examined: u64,
    pub volumes_deleted: u64,
    pub volumes_rewritten: u64,
    pub new_volumes: u64,
    pub blocks_moved: u64,
    pub bytes_moved: u64,
    pub wasted_reclaimed: u64,
    pub triggered: bool,
}

/// Whether the report crosses any compaction trigger.
pub fn should_compact(report: &[(VolumeUsage, Classification)], options: &Options) -> bool {
    let clean = report
        .iter()
        .filter(|(_, c)| *c == Classification::CleanDelete)
        .count();
    if clean > 0 {
        return true;
    }

    let wasted: Vec<_> = report
        .iter()
        .filter(|(_, c)| *c == Classification::Wasted)
        .collect();
    let live_total: i64 = report.iter().map(|(u, _)| u.data_size).sum();
    let wasted_total: i64 = report.iter().map(|(u, _)| u.wasted_size).sum();
    if wasted.len() >= 2 && wasted_total * 100 >= options.threshold as i64 * live_total.max(1) {
        return true;
    }

    let small: Vec<_> = report
        .iter()
        .filter(|(_, c)| *c == Classification::Small)
        .collect();
    let small_total: i64 = small.iter().map(|(u, _)| u.compressed_size).sum();
    if small_total > options.volume_size as i64 {
        return true;
    }
    small.len() > options.max_small_volume_count
}

/// Select volumes to rewrite: wasted first, then small, oldest first.
/// Old data is assumed stable; new data is likelier to be re-garbaged.
fn select_volumes(
    report: Vec<(VolumeUsage, Classification)>,
) -> Vec<(VolumeUsage, Classification)> {
    let mut selected: Vec<_> = report
        .into_iter()
        .filter(|(_, c)| {
            matches!(
                c,
                Classification::CleanDelete | Classification::Wasted | Classification::Small
            )
        })
        .collect();
    selected.sort_by_key(|(usage, class)| {
        let rank = match class {
            Classification::CleanDelete => 0,
            Classification::Wasted => 1,
            Classification::Small => 2,
            Classification::Healthy => 3,
        };
        (rank, usage.oldest_fileset.unwrap_or(i64::MAX), usage.volume_id)
    });
    selected
}

/// The open replacement volume being filled with surviving blocks.
struct ReplacementVolume {
    volume_id: i64,
    name: String,
    writer: BlockVolumeWriter,
    blocklists: Vec<(BlockHash, Vec<u8>)>,
}

/// Run compaction inside the caller's catalog transaction. Returns stats;
/// a consistency failure aborts the whole run and the caller rolls back.
pub fn run_compact(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
    now: DateTime<Utc>,
    force: bool,
) -> Result<CompactStats> {
    let mut stats = CompactStats::default();

    let report: Vec<(VolumeUsage, Classification)> = catalog
        .wasted_space_report()?
        .into_iter()
        .map(|usage| {
            let class = classify(&usage, options);
            (usage, class)
        })
        .collect();
    stats.volumes_examined = report.len() as u64;

    if !force && !should_compact(&report, options) {
        debug!("no compaction trigger crossed");
        return Ok(stats);
    }
    stats.triggered = true;

    let selected = select_volumes(report);
    if selected.is_empty() {
        return Ok(stats);
    }
    let selected_ids: Vec<i64> = selected.iter().map(|(u, _)| u.volume_id).collect();
    info!(count = selected.len(), "compacting volumes");

    if options.dryrun {
        for (usage, class) in &selected {
            info!(
                volume = %usage.name,
                ?class,
                data = usage.data_size,
                wasted = usage.wasted_size,
                "would compact"
            );
        }
        return Ok(stats);
    }

    // Phase 1: stream surviving blocks into replacement volumes, recording
    // a duplicate-block row for each copy.
    let mut replacement: Option<ReplacementVolume> = None;
    let mut filled: Vec<ReplacementVolume> = Vec::new();

    for (usage, _) in &selected {
        let live = catalog.blocks_in_volume(usage.volume_id)?;
        if live.is_empty() {
            continue;
        }
        let container = manager.download_volume(catalog, usage.volume_id)?;
        let reader = BlockVolumeReader::parse(container)?;

        for block in live {
            let hash = BlockHash::from_base64(&block.hash).ok_or_else(|| {
                CairnError::DatabaseConsistency(format!(
                    "undecodable block hash '{}'",
                    block.hash
                ))
            })?;
            let data = reader.get_block(&hash).ok_or_else(|| {
                CairnError::Integrity(format!(
                    "live block {} missing from volume '{}'",
                    block.hash, usage.name
                ))
            })?;
            if data.len() as i64 != block.size {
                return Err(CairnError::Integrity(format!(
                    "block {} has {} bytes in volume '{}', catalog records {}",
                    block.hash,
                    data.len(),
                    usage.name,
                    block.size
                )));
            }

            let needs_new = match replacement.as_ref() {
                Some(open) => open
                    .writer
                    .would_overflow(data.len() as u64, options.volume_size),
                None => true,
            };
            if needs_new {
                if let Some(full) = replacement.take() {
                    filled.push(full);
                }
                let (volume_id, name) = manager.create_volume(
                    catalog,
                    &options.prefix,
                    VolumeType::Blocks,
                    now,
                )?;
                stats.new_volumes += 1;
                replacement = Some(ReplacementVolume {
                    volume_id,
                    name,
                    writer: BlockVolumeWriter::new(),
                    blocklists: Vec::new(),
                });
            }
            let target = replacement.as_mut().expect("replacement volume open");

            target.writer.add_block(&hash, data)?;
            if catalog.is_blocklist_hash(&block.hash)? {
                target.blocklists.push((hash, data.to_vec()));
            }
            catalog.add_duplicate_block(block.id, target.volume_id)?;
            stats.blocks_moved += 1;
            stats.bytes_moved += data.len() as u64;
        }
    }
    if let Some(open) = replacement.take() {
        filled.push(open);
    }

    // Upload replacements with their paired index volumes.
    for volume in filled {
        let (container, manifest) = volume.writer.finish();
        let (dindex_id, _) =
            manager.create_volume(catalog, &options.prefix, VolumeType::Index, now)?;
        let mut index_writer = IndexVolumeWriter::new();
        index_writer.add_volume_manifest(&volume.name, &manifest)?;
        for (hash, payload) in &volume.blocklists {
            index_writer.add_blocklist(hash, payload)?;
        }
        catalog.add_index_link(dindex_id, volume.volume_id)?;
        manager.upload_volume(catalog, volume.volume_id, &container)?;
        manager.upload_volume(catalog, dindex_id, &index_writer.finish())?;
    }

    // Phase 2: re-home references. Every live block of every old volume
    // must move, or the compaction aborts and rolls back.
    for (usage, _) in &selected {
        let counts = catalog.rehome_blocks(usage.volume_id, &selected_ids)?;
        if counts.target != counts.updated || counts.updated != counts.promoted {
            return Err(CairnError::DatabaseConsistency(format!(
                "re-homing volume '{}' accounted {} of {} blocks ({} promoted)",
                usage.name, counts.updated, counts.target, counts.promoted
            )));
        }
        stats.volumes_rewritten += 1;
        stats.wasted_reclaimed += usage.wasted_size.max(0) as u64;
    }

    // Phase 3: delete old volumes, Blocks before their Index files.
    for (usage, _) in &selected {
        let indexes = catalog.index_volumes_for(usage.volume_id)?;
        manager.delete_volume(catalog, usage.volume_id, now)?;
        stats.volumes_deleted += 1;
        for index in indexes {
            if catalog.index_link_count(index.id)? == 0 {
                manager.delete_volume(catalog, index.id, now)?;
                stats.volumes_deleted += 1;
            } else {
                warn!(
                    index = %index.name,
                    "index volume still referenced, deferring deletion"
                );
            }
        }
    }

    info!(
        rewritten = stats.volumes_rewritten,
        moved = stats.blocks_moved,
        reclaimed = stats.wasted_reclaimed,
        "compaction complete"
    );
    Ok(stats)
}
