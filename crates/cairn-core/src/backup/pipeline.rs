//! Concurrent backup pipeline.
//!
//! Walk thread → bounded work channel → N hashing workers → bounded
//! result channel → reorder buffer → sequential consumer. The consumer
//! owns the catalog transaction; finalized volumes are handed to a
//! bounded pool of background upload threads.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel as channel;
use tracing::warn;

use cairn_types::block_hash::BlockHash;
use cairn_types::volume::VolumeState;

use crate::catalog::{Catalog, PreviousFileInfo};
use crate::error::{CairnError, Result};
use crate::hashing::{HashAlgorithm, StreamHasher};

use super::walk::{Enumerator, WalkEntry};
use super::{BackupSession, SealedVolume};

/// Result of processing one enumerated entry.
pub(crate) enum Processed {
    File {
        store_path: String,
        metadata_json: Vec<u8>,
        mtime: i64,
        size: u64,
        file_hash: BlockHash,
        blocks: Vec<(BlockHash, Vec<u8>)>,
    },
    CarriedForward {
        store_path: String,
        file_id: i64,
        last_modified: i64,
        size: i64,
    },
    Folder {
        store_path: String,
        metadata_json: Vec<u8>,
        mtime: i64,
    },
    Symlink {
        store_path: String,
        metadata_json: Vec<u8>,
        mtime: i64,
    },
    Skipped {
        store_path: String,
    },
}

enum WorkItem {
    /// Needs reading and chunking in a worker.
    ReadFile {
        abs_path: PathBuf,
        store_path: String,
        metadata_json: Vec<u8>,
        mtime: i64,
    },
    /// Already decided in the walk thread; workers pass it through so the
    /// sequence stays ordered.
    Ready(Box<Processed>),
}

enum PipelineMsg {
    Ok(usize, Box<Processed>),
    WorkerErr(usize, CairnError),
    WalkErr(CairnError),
}

/// Fill `buf` from `reader` until full or EOF; returns bytes read.
fn read_block(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Stream splitter: cut a file into fixed-size blocks and hash each,
/// accumulating the whole-file hash across block boundaries.
fn split_and_hash(
    abs_path: &PathBuf,
    blocksize: usize,
    block_algo: HashAlgorithm,
    file_algo: HashAlgorithm,
) -> Result<(u64, BlockHash, Vec<(BlockHash, Vec<u8>)>)> {
    let mut file = File::open(abs_path)?;
    let mut blocks = Vec::new();
    let mut file_hasher = StreamHasher::new(file_algo);
    let mut total = 0u64;
    loop {
        let mut buf = vec![0u8; blocksize];
        let n = read_block(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        buf.truncate(n);
        total += n as u64;
        file_hasher.update(&buf);
        blocks.push((block_algo.digest(&buf), buf));
        if n < blocksize {
            break;
        }
    }
    Ok((total, file_hasher.finalize(), blocks))
}

fn process_work_item(
    item: WorkItem,
    blocksize: usize,
    block_algo: HashAlgorithm,
    file_algo: HashAlgorithm,
) -> Result<Box<Processed>> {
    match item {
        WorkItem::Ready(processed) => Ok(processed),
        WorkItem::ReadFile {
            abs_path,
            store_path,
            metadata_json,
            mtime,
        } => match split_and_hash(&abs_path, blocksize, block_algo, file_algo) {
            Ok((size, file_hash, blocks)) => Ok(Box::new(Processed::File {
                store_path,
                metadata_json,
                mtime,
                size,
                file_hash,
                blocks,
            })),
            Err(e) if e.is_soft_file_error() => {
                warn!(path = %abs_path.display(), "skipping file (soft error): {e}");
                Ok(Box::new(Processed::Skipped { store_path }))
            }
            Err(e) => Err(e),
        },
    }
}

struct PendingUpload<'scope> {
    dblock_id: i64,
    dindex_id: i64,
    handle: std::thread::ScopedJoinHandle<'scope, Result<((i64, String), (i64, String))>>,
}

fn apply_finished_upload(catalog: &Catalog, pending: PendingUpload<'_>) -> Result<()> {
    let joined = pending
        .handle
        .join()
        .map_err(|_| CairnError::Other("upload thread panicked".into()))?;
    match joined {
        Ok((dblock_info, dindex_info)) => {
            // Blocks volume observes Uploaded before its paired Index.
            catalog.set_volume_info(pending.dblock_id, dblock_info.0, &dblock_info.1)?;
            catalog.transition_volume(pending.dblock_id, VolumeState::Uploaded)?;
            catalog.set_volume_info(pending.dindex_id, dindex_info.0, &dindex_info.1)?;
            catalog.transition_volume(pending.dindex_id, VolumeState::Uploaded)?;
            Ok(())
        }
        Err(e) => {
            catalog.transition_volume(pending.dblock_id, VolumeState::Temporary)?;
            catalog.transition_volume(pending.dindex_id, VolumeState::Temporary)?;
            Err(e)
        }
    }
}

/// Drive the full pipeline. On cancellation the consumer stops at its next
/// checkpoint, in-flight uploads land, and the open spill volume is left
/// Temporary for the next run to reclaim.
pub(crate) fn run_pipeline(
    session: &mut BackupSession<'_>,
    sources: &[PathBuf],
    prev_map: &HashMap<String, PreviousFileInfo>,
    cancel: &AtomicBool,
) -> Result<()> {
    let options = session.options;
    let manager = session.manager;
    let blocksize = options.blocksize as usize;
    let block_algo = HashAlgorithm::parse(&options.block_hash_algorithm)?;
    let file_algo = HashAlgorithm::parse(&options.file_hash_algorithm)?;
    let num_workers = options.concurrency.block_hashers.max(1);
    let max_uploads = options.concurrency.compressors.max(1);
    let dryrun = options.dryrun;

    let catalog_path = session.catalog.path().to_path_buf();
    let walk_soft_errors = AtomicU64::new(0);

    let work_cap = num_workers * 2;
    let result_cap = num_workers * 2;

    let mut pipeline_err: Option<CairnError> = None;

    std::thread::scope(|s| -> Result<()> {
        let (work_tx, work_rx) = channel::bounded::<(usize, WorkItem)>(work_cap);
        let (result_tx, result_rx) = channel::bounded::<PipelineMsg>(result_cap);

        // --- Walk thread: enumerate, pre-filter, same-as-previous ---
        let walk_result_tx = result_tx.clone();
        let soft_errors_ref = &walk_soft_errors;
        s.spawn(move || {
            let mut enumerator = match Enumerator::new(options, &catalog_path) {
                Ok(e) => e,
                Err(e) => {
                    let _ = walk_result_tx.send(PipelineMsg::WalkErr(e));
                    return;
                }
            };
            let mut seq = 0usize;
            let walk_outcome = enumerator.walk(sources, |entry| {
                if cancel.load(Ordering::Relaxed) {
                    return Err(CairnError::Cancelled);
                }
                let item = match entry {
                    WalkEntry::File {
                        abs_path,
                        store_path,
                        size,
                        metadata,
                    } => {
                        let metadata_json = metadata.to_json()?;
                        let meta_hash = file_algo.digest(&metadata_json).to_base64();
                        match prev_map.get(&store_path) {
                            // Same (size, mtime, metadata hash): inherit
                            // from the previous fileset without re-reading.
                            Some(prev)
                                if prev.size == size as i64
                                    && prev.last_modified == metadata.mtime
                                    && prev.meta_hash.as_deref() == Some(meta_hash.as_str()) =>
                            {
                                WorkItem::Ready(Box::new(Processed::CarriedForward {
                                    store_path,
                                    file_id: prev.file_id,
                                    last_modified: prev.last_modified,
                                    size: prev.size,
                                }))
                            }
                            _ => WorkItem::ReadFile {
                                abs_path,
                                store_path,
                                metadata_json,
                                mtime: metadata.mtime,
                            },
                        }
                    }
                    WalkEntry::Folder {
                        store_path,
                        metadata,
                    } => WorkItem::Ready(Box::new(Processed::Folder {
                        store_path,
                        metadata_json: metadata.to_json()?,
                        mtime: metadata.mtime,
                    })),
                    WalkEntry::Symlink {
                        store_path,
                        metadata,
                    } => WorkItem::Ready(Box::new(Processed::Symlink {
                        store_path,
                        metadata_json: metadata.to_json()?,
                        mtime: metadata.mtime,
                    })),
                };
                if work_tx.send((seq, item)).is_err() {
                    return Err(CairnError::Cancelled);
                }
                seq += 1;
                Ok(())
            });
            match walk_outcome {
                Ok(soft) => {
                    soft_errors_ref.fetch_add(soft, Ordering::Relaxed);
                }
                Err(CairnError::Cancelled) => {}
                Err(e) => {
                    let _ = walk_result_tx.send(PipelineMsg::WalkErr(e));
                }
            }
            // work_tx drops here; workers drain and exit.
        });

        // --- Hashing workers ---
        for _ in 0..num_workers {
            let rx = work_rx.clone();
            let tx = result_tx.clone();
            s.spawn(move || {
                for (seq, item) in rx {
                    let msg = match process_work_item(item, blocksize, block_algo, file_algo)
                    {
                        Ok(processed) => PipelineMsg::Ok(seq, processed),
                        Err(e) => PipelineMsg::WorkerErr(seq, e),
                    };
                    if tx.send(msg).is_err() {
                        return;
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        // --- Consumer: reorder, dedup, pack, upload ---
        let mut next_expected = 0usize;
        let mut reorder: BTreeMap<usize, std::result::Result<Box<Processed>, CairnError>> =
            BTreeMap::new();
        let mut pending_uploads: Vec<PendingUpload<'_>> = Vec::new();
        let mut sealed_out: Vec<SealedVolume> = Vec::new();

        'consume: for msg in &result_rx {
            if cancel.load(Ordering::SeqCst) {
                break 'consume;
            }
            match msg {
                PipelineMsg::Ok(seq, processed) => {
                    reorder.insert(seq, Ok(processed));
                }
                PipelineMsg::WorkerErr(seq, e) => {
                    reorder.insert(seq, Err(e));
                }
                PipelineMsg::WalkErr(e) => {
                    pipeline_err = Some(e);
                    break 'consume;
                }
            }

            while let Some(result) = reorder.remove(&next_expected) {
                next_expected += 1;
                let processed = match result {
                    Ok(p) => p,
                    Err(e) => {
                        pipeline_err = Some(e);
                        break 'consume;
                    }
                };
                if let Err(e) = session.consume(*processed, &mut sealed_out) {
                    pipeline_err = Some(e);
                    break 'consume;
                }
                for sealed in sealed_out.drain(..) {
                    // Cap in-flight uploads; join the oldest first.
                    if pending_uploads.len() >= max_uploads {
                        let oldest = pending_uploads.remove(0);
                        if let Err(e) = apply_finished_upload(session.catalog, oldest) {
                            pipeline_err = Some(e);
                            break 'consume;
                        }
                    }
                    let dblock_id = sealed.dblock_id;
                    let dindex_id = sealed.dindex_id;
                    let handle = s.spawn(move || {
                        if dryrun {
                            // Size it without touching the backend.
                            let db = manager.seal(&sealed.dblock_container)?;
                            let di = manager.seal(&sealed.dindex_container)?;
                            return Ok((
                                (db.len() as i64, String::new()),
                                (di.len() as i64, String::new()),
                            ));
                        }
                        let db = manager
                            .seal_and_put(&sealed.dblock_name, &sealed.dblock_container)?;
                        let di = manager
                            .seal_and_put(&sealed.dindex_name, &sealed.dindex_container)?;
                        Ok((db, di))
                    });
                    pending_uploads.push(PendingUpload {
                        dblock_id,
                        dindex_id,
                        handle,
                    });
                }
            }
        }
        drop(result_rx);

        // Spill collector: flush the open volume unless we are bailing out.
        if pipeline_err.is_none() && !cancel.load(Ordering::SeqCst) {
            match session.finish_spill() {
                Ok(Some(sealed)) => {
                    let dblock_id = sealed.dblock_id;
                    let dindex_id = sealed.dindex_id;
                    let handle = s.spawn(move || {
                        if dryrun {
                            let db = manager.seal(&sealed.dblock_container)?;
                            let di = manager.seal(&sealed.dindex_container)?;
                            return Ok((
                                (db.len() as i64, String::new()),
                                (di.len() as i64, String::new()),
                            ));
                        }
                        let db = manager
                            .seal_and_put(&sealed.dblock_name, &sealed.dblock_container)?;
                        let di = manager
                            .seal_and_put(&sealed.dindex_name, &sealed.dindex_container)?;
                        Ok((db, di))
                    });
                    pending_uploads.push(PendingUpload {
                        dblock_id,
                        dindex_id,
                        handle,
                    });
                }
                Ok(None) => {}
                Err(e) => pipeline_err = Some(e),
            }
        }

        // Join every in-flight upload so volumes land before the dlist.
        for pending in pending_uploads.drain(..) {
            match apply_finished_upload(session.catalog, pending) {
                Ok(()) => {}
                Err(e) => {
                    if pipeline_err.is_none() {
                        pipeline_err = Some(e);
                    }
                }
            }
        }

        Ok(())
    })?;

    session.result.soft_errors += walk_soft_errors.load(Ordering::Relaxed);

    match pipeline_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
