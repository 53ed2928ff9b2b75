pub mod legacy;
pub mod pipelined;
pub mod plan;

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use globset::{GlobBuilder, GlobSetBuilder};
use tracing::{debug, info, warn};

use cairn_types::block_hash::BlockHash;

use crate::backup::walk::EntryMetadata;
use crate::catalog::Catalog;
use crate::config::Options;
use crate::error::{CairnError, Result};
use crate::hashing::{HashAlgorithm, StreamHasher};
use crate::remote::RemoteManager;

use plan::{BlockNeed, MetadataSink, PlanKind, RestorePlan};

/// Outcome of one restore run. Both implementations return the same
/// statistics.
#[derive(Debug, Default)]
pub struct RestoreResult {
    pub files_restored: u64,
    pub bytes_restored: u64,
    pub files_failed: u64,
    pub files_verified: u64,
    pub blocks_reused_locally: u64,
    pub volumes_downloaded: u64,
    pub warnings: u64,
    pub broken_files: Vec<String>,
}

/// Restore selection: which version and which paths.
#[derive(Debug, Default)]
pub struct RestoreRequest {
    pub paths: Vec<String>,
    pub version: Option<usize>,
    pub time: Option<i64>,
    pub restore_dir: Option<PathBuf>,
}

pub fn run_restore(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
    request: &RestoreRequest,
    cancel: &AtomicBool,
) -> Result<RestoreResult> {
    let fileset = catalog.resolve_fileset(request.version, request.time)?;
    info!(
        fileset = fileset.id,
        timestamp = fileset.timestamp,
        "restoring version"
    );

    let filter = if request.paths.is_empty() {
        None
    } else {
        let mut builder = GlobSetBuilder::new();
        for path in &request.paths {
            let glob = GlobBuilder::new(path)
                .literal_separator(false)
                .build()
                .map_err(|e| {
                    CairnError::UserInformation(format!("invalid restore filter '{path}': {e}"))
                })?;
            builder.add(glob);
        }
        Some(builder.build().map_err(|e| {
            CairnError::UserInformation(format!("restore filter build failed: {e}"))
        })?)
    };

    // Phase 1: plan and directory tree.
    let mut plan = plan::build_plan(
        catalog,
        fileset.id,
        filter.as_ref(),
        request.restore_dir.as_deref(),
        options.blocksize,
    )?;

    let block_algo = HashAlgorithm::parse(&options.block_hash_algorithm)?;
    let file_algo = HashAlgorithm::parse(&options.file_hash_algorithm)?;

    let mut result = RestoreResult::default();
    let mut sink = MetadataSink::default();
    let mut broken: HashSet<i64> = HashSet::new();
    for file in &plan.files {
        sink.prepare(file.row, file.meta_size);
    }

    // Phase 2: reuse what is already on disk.
    phase2_local_scan(catalog, &mut plan, options, block_algo, file_algo, &mut result)?;

    // Phase 3: patch from remote volumes.
    if options.restore_legacy {
        legacy::patch_sequential(
            catalog, manager, &plan, block_algo, &mut sink, &mut broken, &mut result, cancel,
        )?;
    } else {
        pipelined::patch_pipelined(
            catalog, manager, options, &plan, block_algo, &mut sink, &mut broken, &mut result,
            cancel,
        )?;
    }

    // Zero-length files have no blocks to patch; materialize them.
    for file in &plan.files {
        if file.kind == PlanKind::File && file.size == 0 && !file.target.exists() {
            std::fs::File::create(&file.target)?;
        }
    }

    // Phase 4: metadata, then optional end-to-end verification.
    apply_metadata(&plan, &mut sink, &mut result)?;
    if options.perform_restored_file_verification {
        verify_restored(&plan, file_algo, &mut broken, &mut result)?;
    }

    for row in &broken {
        if let Some(file) = plan.file_by_row(*row) {
            result.broken_files.push(file.path_in_backup.clone());
        }
    }
    result.broken_files.sort();
    result.files_failed = broken.len() as u64;
    result.files_restored = plan
        .files
        .iter()
        .filter(|f| f.kind == PlanKind::File && !broken.contains(&f.row))
        .count() as u64;

    Ok(result)
}

/// Whether an error must abort the whole restore rather than mark one
/// file broken.
fn is_abort_error(e: &CairnError) -> bool {
    match e {
        CairnError::Cancelled => true,
        CairnError::Io(io) => io.kind() == std::io::ErrorKind::StorageFull,
        _ => false,
    }
}

/// Phase 2: hash existing target content and mark matching blocks as
/// restored; fully matching files are verified outright. In overwrite
/// mode an oversized target is truncated before scanning; in
/// rename-on-conflict mode a length mismatch short-circuits to a full
/// re-download into a renamed target.
fn phase2_local_scan(
    catalog: &Catalog,
    plan: &mut RestorePlan<'_>,
    options: &Options,
    block_algo: HashAlgorithm,
    file_algo: HashAlgorithm,
    result: &mut RestoreResult,
) -> Result<()> {
    let use_local = options.use_local_blocks;
    let rows: Vec<i64> = plan
        .files
        .iter()
        .filter(|f| f.kind == PlanKind::File)
        .map(|f| f.row)
        .collect();

    for row in rows {
        let (target, size, file_hash, path_in_backup) = {
            let file = plan.file_by_row(row).expect("plan row");
            (
                file.target.clone(),
                file.size,
                file.file_hash.clone(),
                file.path_in_backup.clone(),
            )
        };
        let blocks = plan.content_blocks_of(catalog, row)?;

        let mut renamed: Option<PathBuf> = None;
        if target.exists() {
            let existing_len = std::fs::metadata(&target)?.len() as i64;
            if options.overwrite {
                clear_readonly(&target)?;
                if existing_len > size {
                    let file = OpenOptions::new().write(true).open(&target)?;
                    file.set_len(size as u64)?;
                }
                let matched =
                    scan_matching_blocks(&target, &blocks, block_algo, false)?;
                for need in &matched {
                    plan.mark_restored(catalog, row, need.offset, false)?;
                }
                if matched.len() == blocks.len()
                    && hash_file_equals(&target, file_hash.as_deref(), file_algo)?
                {
                    result.files_verified += 1;
                    debug!(target = %target.display(), "existing file verified in place");
                }
            } else if existing_len != size {
                renamed = Some(renamed_target(&target));
            } else {
                let matched =
                    scan_matching_blocks(&target, &blocks, block_algo, false)?;
                if matched.len() == blocks.len()
                    && hash_file_equals(&target, file_hash.as_deref(), file_algo)?
                {
                    for need in &matched {
                        plan.mark_restored(catalog, row, need.offset, false)?;
                    }
                    result.files_verified += 1;
                } else {
                    renamed = Some(renamed_target(&target));
                }
            }
        }

        if let Some(new_target) = renamed {
            debug!(
                from = %target.display(),
                to = %new_target.display(),
                "conflicting target, restoring to renamed file"
            );
            if let Some(file) = plan.files.iter_mut().find(|f| f.row == row) {
                file.target = new_target;
            }
        }

        // Optionally source still-missing blocks from the original path.
        if use_local {
            let source = Path::new(&path_in_backup);
            let effective_target = plan.file_by_row(row).expect("plan row").target.clone();
            if source.exists() && source != effective_target {
                let needed = plan.content_blocks_of(catalog, row)?;
                let matched = scan_matching_blocks(source, &needed, block_algo, true)?;
                if !matched.is_empty() {
                    for need in &matched {
                        let data = read_at(source, need.offset, need.size as usize)?;
                        write_block(&effective_target, size, need.offset, &data)?;
                        plan.mark_restored(catalog, row, need.offset, false)?;
                        result.blocks_reused_locally += 1;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Read blocks of `path` at the plan offsets and return those whose hash
/// matches. `ignore_len_mismatch` tolerates a source shorter than needed.
fn scan_matching_blocks(
    path: &Path,
    blocks: &[BlockNeed],
    block_algo: HashAlgorithm,
    ignore_len_mismatch: bool,
) -> Result<Vec<BlockNeed>> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    let mut matched = Vec::new();
    for need in blocks {
        let end = need.offset as u64 + need.size as u64;
        if end > len {
            if ignore_len_mismatch {
                continue;
            }
            break;
        }
        file.seek(SeekFrom::Start(need.offset as u64))?;
        let mut buf = vec![0u8; need.size as usize];
        file.read_exact(&mut buf)?;
        if block_algo.digest(&buf).to_base64() == need.hash {
            matched.push(need.clone());
        }
    }
    Ok(matched)
}

fn hash_file_equals(
    path: &Path,
    expected: Option<&str>,
    file_algo: HashAlgorithm,
) -> Result<bool> {
    let Some(expected) = expected else {
        return Ok(false);
    };
    let mut file = std::fs::File::open(path)?;
    let mut hasher = StreamHasher::new(file_algo);
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_base64() == expected)
}

fn renamed_target(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".restored");
    let mut candidate = target.with_file_name(&name);
    let mut counter = 1;
    while candidate.exists() {
        let mut numbered = name.clone();
        numbered.push(format!(".{counter}"));
        candidate = target.with_file_name(numbered);
        counter += 1;
    }
    candidate
}

fn clear_readonly(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)?;
    let mut perms = meta.permissions();
    if perms.readonly() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(perms.mode() | 0o200);
        }
        #[cfg(not(unix))]
        perms.set_readonly(false);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

pub(crate) fn read_at(path: &Path, offset: i64, len: usize) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset as u64))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write one block into the target at its offset, creating the file at
/// its full size on first touch.
pub(crate) fn write_block(path: &Path, file_size: i64, offset: i64, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    if file.metadata()?.len() < file_size as u64 {
        file.set_len(file_size as u64)?;
    }
    file.seek(SeekFrom::Start(offset as u64))?;
    file.write_all(data)?;
    Ok(())
}

/// Shared patching step: serve every pending block request of one
/// downloaded volume. Content mismatches are warnings that mark the file
/// broken; abort-class errors propagate.
pub(crate) fn patch_from_volume(
    catalog: &Catalog,
    plan: &RestorePlan<'_>,
    reader: &crate::volume::BlockVolumeReader,
    needs: &[BlockNeed],
    block_algo: HashAlgorithm,
    sink: &mut MetadataSink,
    broken: &mut HashSet<i64>,
    result: &mut RestoreResult,
) -> Result<()> {
    for need in needs {
        let Some(hash) = BlockHash::from_base64(&need.hash) else {
            return Err(CairnError::DatabaseConsistency(format!(
                "undecodable block hash '{}'",
                need.hash
            )));
        };
        let Some(data) = reader.get_block(&hash) else {
            warn!(hash = %need.hash, "block missing from volume, marking file broken");
            broken.insert(need.file_row);
            result.warnings += 1;
            continue;
        };
        if data.len() as i64 != need.size
            || block_algo.digest(data).to_base64() != need.hash
        {
            warn!(hash = %need.hash, "block hash mismatch, marking file broken");
            broken.insert(need.file_row);
            result.warnings += 1;
            continue;
        }

        if need.is_meta {
            sink.write(need.file_row, need.offset, data);
            plan.mark_restored(catalog, need.file_row, need.offset, true)?;
            continue;
        }

        let Some(file) = plan.file_by_row(need.file_row) else {
            continue;
        };
        match write_block(&file.target, file.size, need.offset, data) {
            Ok(()) => {
                plan.mark_restored(catalog, need.file_row, need.offset, false)?;
                result.bytes_restored += data.len() as u64;
            }
            Err(e) if is_abort_error(&e) => return Err(e),
            Err(e) => {
                warn!(target = %file.target.display(), "write failed: {e}");
                broken.insert(need.file_row);
                result.warnings += 1;
            }
        }
    }
    Ok(())
}

/// Phase 4: create symlinks and apply permissions and timestamps from the
/// restored metadata blobs.
fn apply_metadata(
    plan: &RestorePlan<'_>,
    sink: &mut MetadataSink,
    result: &mut RestoreResult,
) -> Result<()> {
    for file in &plan.files {
        let Some(raw) = sink.take(file.row) else {
            continue;
        };
        let metadata: EntryMetadata = match serde_json::from_slice(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %file.path_in_backup, "undecodable metadata blob: {e}");
                result.warnings += 1;
                continue;
            }
        };

        if file.kind == PlanKind::Symlink {
            let Some(target) = &metadata.symlink_target else {
                warn!(path = %file.path_in_backup, "symlink metadata lacks target");
                result.warnings += 1;
                continue;
            };
            // A dangling target is legal; recreate the link as stored.
            #[cfg(unix)]
            {
                let _ = std::fs::remove_file(&file.target);
                if let Err(e) = std::os::unix::fs::symlink(target, &file.target) {
                    warn!(path = %file.path_in_backup, "symlink creation failed: {e}");
                    result.warnings += 1;
                }
            }
            continue;
        }

        if let Err(e) = apply_file_metadata(&file.target, &metadata) {
            warn!(path = %file.path_in_backup, "metadata application failed: {e}");
            result.warnings += 1;
        }
    }
    Ok(())
}

fn apply_file_metadata(target: &Path, metadata: &EntryMetadata) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(metadata.mode))?;
    }
    if metadata.mtime > 0 {
        let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(metadata.mtime as u64);
        // A read handle suffices for futimens and also works on folders.
        let file = std::fs::File::open(target)?;
        file.set_modified(mtime)?;
    }
    Ok(())
}

/// Optional end-to-end verification of restored files.
fn verify_restored(
    plan: &RestorePlan<'_>,
    file_algo: HashAlgorithm,
    broken: &mut HashSet<i64>,
    result: &mut RestoreResult,
) -> Result<()> {
    for file in &plan.files {
        if file.kind != PlanKind::File || broken.contains(&file.row) {
            continue;
        }
        if !hash_file_equals(&file.target, file.file_hash.as_deref(), file_algo)? {
            warn!(target = %file.target.display(), "restored file failed verification");
            broken.insert(file.row);
            result.warnings += 1;
        } else {
            result.files_verified += 1;
        }
    }
    Ok(())
}
