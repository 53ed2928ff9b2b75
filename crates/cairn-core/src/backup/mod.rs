pub mod pipeline;
pub mod walk;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cairn_types::block_hash::BlockHash;
use cairn_types::volume::{VolumeState, VolumeType};

use crate::catalog::{Catalog, ChangeStatistics, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};
use crate::config::Options;
use crate::error::Result;
use crate::hashing::HashAlgorithm;
use crate::remote::RemoteManager;
use crate::volume::dlist::{check_path_separators, EntryType, FilelistEntry, FilelistWriter, VolumeManifest};
use crate::volume::{BlockVolumeWriter, IndexVolumeWriter};

/// Outcome of one backup run.
#[derive(Debug, Default)]
pub struct BackupResult {
    pub fileset_id: i64,
    pub timestamp: i64,
    pub files_examined: u64,
    pub bytes_examined: u64,
    pub files_added: u64,
    pub files_carried_forward: u64,
    pub blocks_added: u64,
    pub bytes_added: u64,
    pub volumes_uploaded: u64,
    pub soft_errors: u64,
    pub partial: bool,
    pub dryrun: bool,
    pub change_stats: Option<ChangeStatistics>,
}

/// A finalized Blocks volume with its paired Index volume, ready for a
/// background upload thread. Containers are raw (unsealed) bytes.
pub(crate) struct SealedVolume {
    pub dblock_id: i64,
    pub dblock_name: String,
    pub dblock_container: Vec<u8>,
    pub dindex_id: i64,
    pub dindex_name: String,
    pub dindex_container: Vec<u8>,
}

/// Consumer-side state of the backup pipeline: the open Blocks volume,
/// the current fileset, and all catalog registration. Runs on the single
/// thread that owns the catalog transaction; the catalog's
/// insert-or-return is the dedup serialization point.
pub(crate) struct BackupSession<'a> {
    pub catalog: &'a Catalog,
    pub manager: &'a RemoteManager<'a>,
    pub options: &'a Options,
    pub fileset_id: i64,
    pub result: BackupResult,

    block_algo: HashAlgorithm,
    file_algo: HashAlgorithm,
    writer: BlockVolumeWriter,
    current_volume_id: i64,
    /// Blocklist payloads physically stored in the open volume, emitted
    /// as `list/` entries of its paired Index volume.
    current_blocklists: Vec<(BlockHash, Vec<u8>)>,
    now: DateTime<Utc>,
}

impl<'a> BackupSession<'a> {
    pub fn new(
        catalog: &'a Catalog,
        manager: &'a RemoteManager<'a>,
        options: &'a Options,
        fileset_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let (volume_id, _) =
            manager.create_volume(catalog, &options.prefix, VolumeType::Blocks, now)?;
        Ok(Self {
            catalog,
            manager,
            options,
            fileset_id,
            result: BackupResult::default(),
            block_algo: HashAlgorithm::parse(&options.block_hash_algorithm)?,
            file_algo: HashAlgorithm::parse(&options.file_hash_algorithm)?,
            writer: BlockVolumeWriter::new(),
            current_volume_id: volume_id,
            current_blocklists: Vec::new(),
            now,
        })
    }

    /// Commit one block: dedup through the catalog, append to the open
    /// volume when new, rotating first if the volume would overflow.
    fn commit_block(
        &mut self,
        hash: &BlockHash,
        data: &[u8],
        is_blocklist: bool,
        out: &mut Vec<SealedVolume>,
    ) -> Result<i64> {
        if let Some(existing) = self.catalog.find_block(hash, data.len() as i64)? {
            return Ok(existing.id);
        }
        if self
            .writer
            .would_overflow(data.len() as u64, self.options.volume_size)
        {
            out.push(self.rotate_volume()?);
        }
        let (id, is_new) =
            self.catalog
                .register_block(hash, data.len() as i64, self.current_volume_id)?;
        debug_assert!(is_new, "find_block miss must insert");
        self.writer.add_block(hash, data)?;
        if is_blocklist {
            self.current_blocklists.push((hash.clone(), data.to_vec()));
        }
        self.result.blocks_added += 1;
        self.result.bytes_added += data.len() as u64;
        Ok(id)
    }

    /// Register a blockset (content or metadata blob): blocks, blocklist
    /// hashes when the set spans more than one block, then the set row.
    fn commit_blockset(
        &mut self,
        full_hash: &BlockHash,
        length: i64,
        blocks: &[(BlockHash, Vec<u8>)],
        out: &mut Vec<SealedVolume>,
    ) -> Result<i64> {
        if let Some(id) = self
            .catalog
            .find_blockset(&full_hash.to_base64(), length)?
        {
            return Ok(id);
        }

        let mut block_ids = Vec::with_capacity(blocks.len());
        for (hash, data) in blocks {
            block_ids.push(self.commit_block(hash, data, false, out)?);
        }

        let mut blocklist_hashes = Vec::new();
        if blocks.len() > 1 {
            let per_chunk = self.options.hashes_per_blocklist(self.block_algo.hash_len());
            for span in blocks.chunks(per_chunk) {
                let mut payload = Vec::with_capacity(span.len() * self.block_algo.hash_len());
                for (hash, _) in span {
                    payload.extend_from_slice(hash.as_bytes());
                }
                let list_hash = self.block_algo.digest(&payload);
                self.commit_block(&list_hash, &payload, true, out)?;
                blocklist_hashes.push(list_hash);
            }
        }

        let (blockset_id, is_new) =
            self.catalog
                .register_blockset(full_hash, length, &block_ids)?;
        if is_new && !blocklist_hashes.is_empty() {
            self.catalog
                .register_blocklist_hashes(blockset_id, &blocklist_hashes)?;
        }
        Ok(blockset_id)
    }

    /// Commit a small in-memory blob (metadata) through the block path.
    fn commit_metadata(
        &mut self,
        payload: &[u8],
        out: &mut Vec<SealedVolume>,
    ) -> Result<i64> {
        let blocksize = self.options.blocksize as usize;
        let blocks: Vec<(BlockHash, Vec<u8>)> = payload
            .chunks(blocksize.max(1))
            .map(|chunk| (self.block_algo.digest(chunk), chunk.to_vec()))
            .collect();
        let full_hash = self.file_algo.digest(payload);
        let blockset_id =
            self.commit_blockset(&full_hash, payload.len() as i64, &blocks, out)?;
        self.catalog.register_metadataset(blockset_id)
    }

    /// Consume one processed entry from the pipeline.
    pub fn consume(
        &mut self,
        entry: pipeline::Processed,
        out: &mut Vec<SealedVolume>,
    ) -> Result<()> {
        use pipeline::Processed;
        match entry {
            Processed::File {
                store_path,
                metadata_json,
                mtime,
                size,
                file_hash,
                blocks,
                ..
            } => {
                self.result.files_examined += 1;
                self.result.bytes_examined += size;
                let blockset_id =
                    self.commit_blockset(&file_hash, size as i64, &blocks, out)?;
                let metadata_id = self.commit_metadata(&metadata_json, out)?;
                let file_id =
                    self.catalog
                        .register_file(&store_path, blockset_id, Some(metadata_id))?;
                self.catalog
                    .add_fileset_entry(self.fileset_id, file_id, mtime)?;
                self.result.files_added += 1;
            }
            Processed::CarriedForward {
                store_path,
                file_id,
                last_modified,
                size,
            } => {
                self.result.files_examined += 1;
                self.result.bytes_examined += size as u64;
                self.catalog
                    .add_fileset_entry(self.fileset_id, file_id, last_modified)?;
                self.result.files_carried_forward += 1;
                debug!(path = %store_path, "unchanged, carried forward");
            }
            Processed::Folder {
                store_path,
                metadata_json,
                mtime,
                ..
            } => {
                let metadata_id = self.commit_metadata(&metadata_json, out)?;
                let file_id = self.catalog.register_file(
                    &store_path,
                    FOLDER_BLOCKSET_ID,
                    Some(metadata_id),
                )?;
                self.catalog
                    .add_fileset_entry(self.fileset_id, file_id, mtime)?;
            }
            Processed::Symlink {
                store_path,
                metadata_json,
                mtime,
                ..
            } => {
                let metadata_id = self.commit_metadata(&metadata_json, out)?;
                let file_id = self.catalog.register_file(
                    &store_path,
                    SYMLINK_BLOCKSET_ID,
                    Some(metadata_id),
                )?;
                self.catalog
                    .add_fileset_entry(self.fileset_id, file_id, mtime)?;
            }
            Processed::Skipped { store_path } => {
                warn!(path = %store_path, "skipped due to soft error");
                self.result.soft_errors += 1;
            }
        }
        Ok(())
    }

    /// Seal the open Blocks volume with its paired Index volume and open a
    /// fresh one. The caller hands the result to an upload thread.
    fn rotate_volume(&mut self) -> Result<SealedVolume> {
        let dblock = self.catalog.volume_by_id(self.current_volume_id)?;
        let writer = std::mem::take(&mut self.writer);
        let (container, manifest) = writer.finish();

        let (dindex_id, dindex_name) = self.manager.create_volume(
            self.catalog,
            &self.options.prefix,
            VolumeType::Index,
            self.now,
        )?;
        let mut index_writer = IndexVolumeWriter::new();
        index_writer.add_volume_manifest(&dblock.name, &manifest)?;
        for (hash, payload) in self.current_blocklists.drain(..) {
            index_writer.add_blocklist(&hash, &payload)?;
        }
        self.catalog.add_index_link(dindex_id, dblock.id)?;

        // Both rows move to Uploading before the upload thread touches the
        // backend; the join applies Uploaded in dblock-then-dindex order.
        self.catalog
            .transition_volume(dblock.id, VolumeState::Uploading)?;
        self.catalog
            .transition_volume(dindex_id, VolumeState::Uploading)?;

        let (new_id, _) = self.manager.create_volume(
            self.catalog,
            &self.options.prefix,
            VolumeType::Blocks,
            self.now,
        )?;
        self.current_volume_id = new_id;
        self.result.volumes_uploaded += 2;

        Ok(SealedVolume {
            dblock_id: dblock.id,
            dblock_name: dblock.name,
            dblock_container: container,
            dindex_id,
            dindex_name,
            dindex_container: index_writer.finish(),
        })
    }

    /// Drop the open (empty) volume row outright.
    fn forget_open_volume(&mut self) -> Result<()> {
        self.catalog
            .transition_volume(self.current_volume_id, VolumeState::Deleting)?;
        self.catalog
            .transition_volume(self.current_volume_id, VolumeState::Deleted)?;
        self.catalog.forget_volume(self.current_volume_id)
    }

    /// Spill collector: flush the still-open Blocks volume even if below
    /// `volume_size`. Returns `None` when no blocks are pending.
    pub fn finish_spill(&mut self) -> Result<Option<SealedVolume>> {
        if self.writer.is_empty() {
            self.forget_open_volume()?;
            return Ok(None);
        }
        let sealed = self.rotate_volume()?;
        // Rotation opened a replacement volume that the spill never uses.
        self.forget_open_volume()?;
        Ok(Some(sealed))
    }
}

/// Build the dlist container for a fileset from catalog rows.
pub(crate) fn build_filelist(
    catalog: &Catalog,
    options: &Options,
    fileset_id: i64,
    partial: bool,
    created: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let manifest = VolumeManifest {
        version: 1,
        created: created.to_rfc3339(),
        encoding: "utf8".into(),
        blocksize: options.blocksize,
        block_hash: options.block_hash_algorithm.clone(),
        file_hash: options.file_hash_algorithm.clone(),
        app_version: env!("CARGO_PKG_VERSION").into(),
        partial,
    };
    let mut writer = FilelistWriter::new(manifest);

    let files = catalog.fileset_files(fileset_id)?;
    check_path_separators(files.iter().map(|f| f.path.as_str()))?;

    for file in files {
        let entry_type = if file.is_folder() {
            EntryType::Folder
        } else if file.is_symlink() {
            EntryType::Symlink
        } else {
            EntryType::File
        };

        let (blocklists, metablockhash) = if entry_type == EntryType::File {
            let lists = catalog.blockset_blocklist_hashes(file.blockset_id)?;
            let meta_lists = match file.meta_blockset_id {
                Some(id) => catalog.blockset_blocklist_hashes(id)?,
                None => Vec::new(),
            };
            (
                if lists.is_empty() { None } else { Some(lists) },
                meta_lists.into_iter().next(),
            )
        } else {
            (None, None)
        };

        writer.add_entry(FilelistEntry {
            entry_type,
            path: file.path,
            hash: if entry_type == EntryType::File {
                file.file_hash
            } else {
                None
            },
            size: file.size,
            time: file.last_modified,
            metahash: file.meta_hash,
            metasize: file.meta_size,
            metablockhash,
            blocklists,
        });
    }
    writer.finish()
}

/// Upload the synthetic filelist closing out an interrupted previous
/// backup, if one exists. Runs before the new fileset is created.
pub(crate) fn upload_synthetic_filelist(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(volume) = catalog.find_last_incomplete_fileset_volume()? else {
        return Ok(false);
    };
    let Some(fileset) = catalog.fileset_for_volume(volume.id)? else {
        return Ok(false);
    };
    info!(volume = %volume.name, "uploading synthetic filelist for interrupted backup");
    catalog.mark_fileset_partial(fileset.id)?;
    let container = build_filelist(catalog, options, fileset.id, true, now)?;
    if volume.state == VolumeState::Uploading {
        // A previous attempt died mid-put; retry from Temporary.
        catalog.transition_volume(volume.id, VolumeState::Temporary)?;
    }
    manager.upload_volume(catalog, volume.id, &container)?;
    Ok(true)
}

/// Run the complete backup pipeline against an open catalog transaction.
/// The caller owns locking, the transaction, verification and retention.
pub fn run_backup(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
    sources: &[PathBuf],
    cancel: &AtomicBool,
    now: DateTime<Utc>,
) -> Result<BackupResult> {
    catalog.require_complete()?;
    check_path_separators(sources.iter().filter_map(|p| p.to_str()))?;
    if options.snapshot_policy == crate::config::SnapshotPolicy::Required {
        return Err(crate::error::CairnError::UserInformation(
            "snapshot_policy=Required, but no snapshot provider is available in this build"
                .into(),
        ));
    }
    if options.usn_policy == crate::config::UsnPolicy::Required {
        return Err(crate::error::CairnError::UserInformation(
            "usn_policy=Required, but no change-journal reader is available in this build"
                .into(),
        ));
    }

    // Resume work touches the backend, so a dry run leaves it alone.
    if !options.dryrun {
        upload_synthetic_filelist(catalog, manager, options, now)?;

        // Reclaim in-flight volumes from an interrupted run; their staged
        // blocks never reached the destination and must not satisfy dedup.
        crate::repair::reclaim_inflight_volumes(catalog, manager, now)?;
    }

    // Previous fileset for same-as-previous detection and change stats.
    let previous = catalog.list_filesets()?.into_iter().next();
    let prev_map = match &previous {
        Some(prev) => catalog.previous_file_map(prev.id)?,
        None => Default::default(),
    };

    let (dlist_id, _) =
        manager.create_volume(catalog, &options.prefix, VolumeType::Files, now)?;
    let fileset_id = catalog.create_fileset(dlist_id, now.timestamp(), previous.is_none())?;

    let mut session = BackupSession::new(catalog, manager, options, fileset_id, now)?;
    pipeline::run_pipeline(&mut session, sources, &prev_map, cancel)?;

    let cancelled = cancel.load(Ordering::SeqCst);
    if cancelled {
        catalog.mark_fileset_partial(fileset_id)?;
    }

    // Verify the catalog against its invariants before sealing the
    // version, unless explicitly disabled.
    if !options.disable_filelist_consistency_checks {
        let block_algo = HashAlgorithm::parse(&options.block_hash_algorithm)?;
        catalog.verify_consistency(options.blocksize, block_algo.hash_len(), false)?;
    }

    // The dlist is uploaded last, after every dblock/dindex it references.
    let container = build_filelist(catalog, options, fileset_id, cancelled, now)?;
    if !options.dryrun {
        manager.upload_volume(catalog, dlist_id, &container)?;
    }

    let mut result = std::mem::take(&mut session.result);
    result.fileset_id = fileset_id;
    result.timestamp = catalog
        .list_filesets()?
        .into_iter()
        .find(|f| f.id == fileset_id)
        .map(|f| f.timestamp)
        .unwrap_or_else(|| now.timestamp());
    result.partial = cancelled;
    result.dryrun = options.dryrun;

    if let Some(prev) = &previous {
        result.change_stats = Some(catalog.change_statistics(fileset_id, prev.id)?);
    }

    if cancelled {
        warn!("backup cancelled; fileset recorded as partial");
    }
    Ok(result)
}
