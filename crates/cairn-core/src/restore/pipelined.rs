//! Pipelined restore phase 3.
//!
//! A CSP-style network over bounded channels: the volume lister feeds a
//! downloader pool, whose sealed payloads flow through the decryptor and
//! decompressor stages into the block manager (the consumer). The block
//! manager batches each volume's pending requests and hands per-file
//! write batches to the file-processor pool; a decompressed volume lives
//! only until its requests are served, then drops. Catalog updates and
//! metadata assembly stay on the consumer thread.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel as channel;
use tracing::{debug, warn};

use cairn_types::block_hash::BlockHash;

use crate::catalog::Catalog;
use crate::config::Options;
use crate::error::{CairnError, Result};
use crate::hashing::HashAlgorithm;
use crate::remote::RemoteManager;
use crate::volume::BlockVolumeReader;

use super::plan::{BlockNeed, MetadataSink, RestorePlan};
use super::RestoreResult;

/// Work for the downloader pool.
struct VolumeRequest {
    volume_id: i64,
    name: String,
    size: Option<i64>,
    hash: Option<String>,
}

/// One file's pending writes from one decompressed volume.
struct PatchBatch {
    reader: Arc<BlockVolumeReader>,
    target: PathBuf,
    file_size: i64,
    needs: Vec<BlockNeed>,
}

/// Per-block outcome reported back to the block manager.
enum PatchOutcome {
    Written { need: BlockNeed, bytes: u64 },
    Corrupt { need: BlockNeed },
    WriteFailed { need: BlockNeed, error: CairnError },
}

fn patch_one_file(batch: PatchBatch, block_algo: HashAlgorithm) -> Vec<PatchOutcome> {
    let mut outcomes = Vec::with_capacity(batch.needs.len());
    for need in batch.needs {
        let data = BlockHash::from_base64(&need.hash)
            .and_then(|hash| batch.reader.get_block(&hash))
            .filter(|data| {
                data.len() as i64 == need.size
                    && block_algo.digest(data).to_base64() == need.hash
            });
        let Some(data) = data else {
            outcomes.push(PatchOutcome::Corrupt { need });
            continue;
        };
        match super::write_block(&batch.target, batch.file_size, need.offset, data) {
            Ok(()) => outcomes.push(PatchOutcome::Written {
                bytes: data.len() as u64,
                need,
            }),
            Err(error) => outcomes.push(PatchOutcome::WriteFailed { need, error }),
        }
    }
    outcomes
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn patch_pipelined(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
    plan: &RestorePlan<'_>,
    block_algo: HashAlgorithm,
    sink: &mut MetadataSink,
    broken: &mut HashSet<i64>,
    result: &mut RestoreResult,
    cancel: &AtomicBool,
) -> Result<()> {
    // Volume lister: resolve every needed volume row up front; the
    // catalog stays on this thread.
    let mut requests = Vec::new();
    for volume_id in plan.volumes_needed(catalog)? {
        let volume = catalog.volume_by_id(volume_id)?;
        requests.push(VolumeRequest {
            volume_id,
            name: volume.name,
            size: volume.size,
            hash: volume.hash,
        });
    }
    if requests.is_empty() {
        return Ok(());
    }
    let total_volumes = requests.len();

    let buffer = options.restore_channel_buffer_size.max(1);
    let downloaders = options.concurrency.downloaders.max(1);
    let decryptors = options.concurrency.decryptors.max(1);
    let decompressors = options.concurrency.decompressors.max(1);
    let file_processors = options.concurrency.file_processors.max(1);

    let mut first_err: Option<CairnError> = None;

    std::thread::scope(|s| {
        let (req_tx, req_rx) = channel::bounded::<VolumeRequest>(buffer);
        let (sealed_tx, sealed_rx) = channel::bounded::<(i64, Vec<u8>)>(buffer);
        let (decrypted_tx, decrypted_rx) = channel::bounded::<(i64, Vec<u8>)>(buffer);
        let (volume_tx, volume_rx) =
            channel::bounded::<(i64, std::result::Result<BlockVolumeReader, CairnError>)>(buffer);
        let (patch_tx, patch_rx) = channel::bounded::<PatchBatch>(file_processors * 2);
        // Unbounded so the block manager can finish dispatching a large
        // volume before draining outcomes without deadlocking the pool.
        let (outcome_tx, outcome_rx) = channel::unbounded::<PatchOutcome>();

        // Feeder.
        s.spawn(move || {
            for request in requests {
                if req_tx.send(request).is_err() {
                    return;
                }
            }
        });

        // Downloader pool.
        for _ in 0..downloaders {
            let rx = req_rx.clone();
            let tx = sealed_tx.clone();
            s.spawn(move || {
                for request in rx {
                    match manager.get_sealed(
                        &request.name,
                        request.size,
                        request.hash.as_deref(),
                    ) {
                        Ok(sealed) => {
                            if tx.send((request.volume_id, sealed)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(name = %request.name, "download failed: {e}");
                            // An empty payload is the in-band failure
                            // marker; the decompressor turns it into an
                            // error the consumer sees for this volume.
                            if tx.send((request.volume_id, Vec::new())).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        drop(req_rx);
        drop(sealed_tx);

        // Decryptor stage.
        for _ in 0..decryptors {
            let rx = sealed_rx.clone();
            let tx = decrypted_tx.clone();
            s.spawn(move || {
                for (volume_id, sealed) in rx {
                    if sealed.is_empty() {
                        if tx.send((volume_id, Vec::new())).is_err() {
                            return;
                        }
                        continue;
                    }
                    match manager.decrypt(&sealed) {
                        Ok(plain) => {
                            if tx.send((volume_id, plain)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(volume_id, "decrypt failed: {e}");
                            if tx.send((volume_id, Vec::new())).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        drop(sealed_rx);
        drop(decrypted_tx);

        // Decompressor stage: decompress and parse the container.
        for _ in 0..decompressors {
            let rx = decrypted_rx.clone();
            let tx = volume_tx.clone();
            s.spawn(move || {
                for (volume_id, compressed) in rx {
                    let parsed = if compressed.is_empty() {
                        Err(CairnError::Transient(format!(
                            "volume {volume_id} unavailable"
                        )))
                    } else {
                        crate::compress::decompress(&compressed)
                            .and_then(BlockVolumeReader::parse)
                    };
                    if tx.send((volume_id, parsed)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(decrypted_rx);
        drop(volume_tx);

        // File-processor pool.
        for _ in 0..file_processors {
            let rx = patch_rx.clone();
            let tx = outcome_tx.clone();
            s.spawn(move || {
                for batch in rx {
                    for outcome in patch_one_file(batch, block_algo) {
                        if tx.send(outcome).is_err() {
                            return;
                        }
                    }
                }
            });
        }
        drop(patch_rx);
        drop(outcome_tx);

        // Block manager (consumer): serve each volume's requests, then let
        // the decompressed volume drop out of the cache.
        let mut volumes_done = 0usize;
        'volumes: while volumes_done < total_volumes {
            if cancel.load(Ordering::SeqCst) {
                first_err = Some(CairnError::Cancelled);
                break;
            }
            let Ok((volume_id, parsed)) = volume_rx.recv() else {
                break;
            };
            volumes_done += 1;
            let reader = match parsed {
                Ok(reader) => Arc::new(reader),
                Err(e) => {
                    warn!(volume_id, "volume unusable, affected files marked broken: {e}");
                    for need in match plan.blocks_in_volume(catalog, volume_id) {
                        Ok(needs) => needs,
                        Err(e) => {
                            first_err = Some(e);
                            break 'volumes;
                        }
                    } {
                        broken.insert(need.file_row);
                    }
                    result.warnings += 1;
                    continue;
                }
            };
            result.volumes_downloaded += 1;

            let needs = match plan.blocks_in_volume(catalog, volume_id) {
                Ok(needs) => needs,
                Err(e) => {
                    first_err = Some(e);
                    break;
                }
            };

            // Metadata blocks are assembled inline; content blocks fan out
            // to the file processors per target file.
            let mut groups: HashMap<i64, Vec<BlockNeed>> = HashMap::new();
            let mut dispatched = 0usize;
            for need in needs {
                if need.is_meta {
                    let ok = BlockHash::from_base64(&need.hash)
                        .and_then(|hash| reader.get_block(&hash))
                        .filter(|data| block_algo.digest(data).to_base64() == need.hash)
                        .map(|data| {
                            sink.write(need.file_row, need.offset, data);
                        })
                        .is_some();
                    if ok {
                        if let Err(e) =
                            plan.mark_restored(catalog, need.file_row, need.offset, true)
                        {
                            first_err = Some(e);
                            break 'volumes;
                        }
                    } else {
                        warn!(hash = %need.hash, "metadata block unusable");
                        broken.insert(need.file_row);
                        result.warnings += 1;
                    }
                } else {
                    groups.entry(need.file_row).or_default().push(need);
                }
            }

            for (file_row, file_needs) in groups {
                let Some(file) = plan.file_by_row(file_row) else {
                    continue;
                };
                dispatched += file_needs.len();
                let batch = PatchBatch {
                    reader: Arc::clone(&reader),
                    target: file.target.clone(),
                    file_size: file.size,
                    needs: file_needs,
                };
                if patch_tx.send(batch).is_err() {
                    first_err = Some(CairnError::Other("file processors gone".into()));
                    break 'volumes;
                }
            }

            for _ in 0..dispatched {
                let Ok(outcome) = outcome_rx.recv() else {
                    first_err = Some(CairnError::Other("file processors gone".into()));
                    break 'volumes;
                };
                match outcome {
                    PatchOutcome::Written { need, bytes } => {
                        result.bytes_restored += bytes;
                        if let Err(e) =
                            plan.mark_restored(catalog, need.file_row, need.offset, false)
                        {
                            first_err = Some(e);
                            break 'volumes;
                        }
                    }
                    PatchOutcome::Corrupt { need } => {
                        warn!(hash = %need.hash, "block corrupt or missing in volume");
                        broken.insert(need.file_row);
                        result.warnings += 1;
                    }
                    PatchOutcome::WriteFailed { need, error } => {
                        if super::is_abort_error(&error) {
                            first_err = Some(error);
                            break 'volumes;
                        }
                        warn!(hash = %need.hash, "write failed: {error}");
                        broken.insert(need.file_row);
                        result.warnings += 1;
                    }
                }
            }
            debug!(volume_id, "volume served and evicted");
        }

        // Closing the channels unblocks every stage; the scope joins them.
        drop(volume_rx);
        drop(patch_tx);
        drop(outcome_rx);
    });

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
