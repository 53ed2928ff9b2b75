//! Operation entry points. Each operation acquires the destination lock,
//! opens the catalog, sweeps stale temp files, runs inside one write
//! transaction per phase, and verifies the remote listing afterwards.

pub mod list;
pub mod lock;
pub mod purge;
pub mod test;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use tracing::{info, warn};

use crate::backup::{self, BackupResult};
use crate::catalog::Catalog;
use crate::compact::{self, CompactStats};
use crate::config::Options;
use crate::crypto::PlaintextEngine;
use crate::error::Result;
use crate::hashing::HashAlgorithm;
use crate::remote::RemoteManager;
use crate::repair::{self, RepairResult};
use crate::restore::{self, RestoreRequest, RestoreResult};
use crate::retention::{self, DeleteStats};
use crate::storage::retry::RetryPolicy;
use crate::storage::StorageBackend;
use crate::tempfiles;

/// Everything an operation needs to reach one backup destination.
pub struct OperationContext<'a> {
    pub backend: &'a dyn StorageBackend,
    pub catalog_path: &'a Path,
    pub options: &'a Options,
}

impl<'a> OperationContext<'a> {
    pub fn new(
        backend: &'a dyn StorageBackend,
        catalog_path: &'a Path,
        options: &'a Options,
    ) -> Self {
        Self {
            backend,
            catalog_path,
            options,
        }
    }

    fn manager(&self, encryption: &'a PlaintextEngine) -> Result<RemoteManager<'a>> {
        Ok(RemoteManager::new(
            self.backend,
            encryption,
            Default::default(),
            RetryPolicy::new(self.options.retry_attempts, self.options.retry_delay_ms),
            HashAlgorithm::parse(&self.options.file_hash_algorithm)?,
            self.options.delete_grace_secs,
        ))
    }

    fn open_catalog(&self) -> Result<Catalog> {
        let catalog = Catalog::open(self.catalog_path)?;
        catalog.check_fixed_options(self.options)?;
        Ok(catalog)
    }
}

/// `backup(sources, options)`: the full pipeline plus post-backup
/// verification, retention and compaction.
pub fn backup(
    ctx: &OperationContext<'_>,
    sources: &[PathBuf],
    cancel: &AtomicBool,
) -> Result<BackupResult> {
    ctx.options.validate()?;
    tempfiles::sweep_stale_temp_files(ctx.options.tempdir.as_deref());
    let _lock = lock::acquire(ctx.backend)?;
    let encryption = PlaintextEngine;
    let manager = ctx.manager(&encryption)?;
    let mut catalog = ctx.open_catalog()?;
    let now = Utc::now();

    catalog.begin()?;
    let result = match backup::run_backup(&catalog, &manager, ctx.options, sources, cancel, now)
    {
        Ok(result) => result,
        Err(e) => {
            catalog.rollback_if_active();
            return Err(e);
        }
    };
    catalog.store_fixed_options(ctx.options)?;
    if ctx.options.dryrun {
        catalog.rollback()?;
        info!("dry run: catalog rolled back, nothing uploaded");
        return Ok(result);
    }
    catalog.commit()?;

    if !ctx.options.no_backend_verification {
        let report = manager.verify_listing(&catalog, &ctx.options.prefix)?;
        if !report.is_clean() && ctx.options.auto_repair {
            warn!("remote listing disagrees with catalog; auto-repair enabled");
            catalog.begin()?;
            match repair::run_repair(&catalog, &manager, ctx.options, now) {
                Ok(_) => catalog.commit()?,
                Err(e) => {
                    catalog.rollback_if_active();
                    return Err(e);
                }
            }
        } else {
            manager.enforce_verification(&catalog, &report, ctx.options.auto_cleanup)?;
        }
    }

    // Retention and auto-compaction run as a sub-operation under the same
    // destination lock.
    if ctx.options.has_retention() && !result.partial {
        catalog.begin()?;
        let outcome = retention::apply_retention(&catalog, &manager, ctx.options, now)
            .and_then(|stats| {
                if stats.filesets_deleted > 0 {
                    compact::run_compact(&catalog, &manager, ctx.options, now, false)?;
                }
                Ok(stats)
            });
        match outcome {
            Ok(_) => catalog.commit()?,
            Err(e) => {
                catalog.rollback_if_active();
                warn!("post-backup retention failed: {e}");
            }
        }
    }

    manager.process_pending_deletes(&catalog, now)?;
    Ok(result)
}

/// `restore(paths, options)`.
pub fn restore(
    ctx: &OperationContext<'_>,
    request: &RestoreRequest,
    cancel: &AtomicBool,
) -> Result<RestoreResult> {
    ctx.options.validate()?;
    tempfiles::sweep_stale_temp_files(ctx.options.tempdir.as_deref());
    let _lock = lock::acquire(ctx.backend)?;
    let encryption = PlaintextEngine;
    let manager = ctx.manager(&encryption)?;
    let catalog = ctx.open_catalog()?;
    restore::run_restore(&catalog, &manager, ctx.options, request, cancel)
}

/// `delete(version|time|policy)`: explicit versions win; otherwise the
/// configured retention rules apply. Compaction triggers afterwards.
pub fn delete(
    ctx: &OperationContext<'_>,
    versions: &[usize],
) -> Result<DeleteStats> {
    ctx.options.validate()?;
    let _lock = lock::acquire(ctx.backend)?;
    let encryption = PlaintextEngine;
    let manager = ctx.manager(&encryption)?;
    let mut catalog = ctx.open_catalog()?;
    let now = Utc::now();

    catalog.begin()?;
    let outcome = (|| {
        let stats = if versions.is_empty() {
            retention::apply_retention(&catalog, &manager, ctx.options, now)?
        } else {
            let filesets = catalog.list_filesets()?;
            let mut ids = Vec::with_capacity(versions.len());
            for &v in versions {
                let fileset = filesets.get(v).ok_or_else(|| {
                    crate::error::CairnError::UserInformation(format!(
                        "version {v} does not exist ({} versions total)",
                        filesets.len()
                    ))
                })?;
                ids.push(fileset.id);
            }
            retention::delete_filesets(&catalog, &manager, &ids, now, ctx.options.dryrun)?
        };
        if stats.filesets_deleted > 0 && !ctx.options.dryrun {
            compact::run_compact(&catalog, &manager, ctx.options, now, false)?;
        }
        Ok(stats)
    })();
    match outcome {
        Ok(stats) => {
            if ctx.options.dryrun {
                catalog.rollback()?;
            } else {
                catalog.commit()?;
                manager.process_pending_deletes(&catalog, now)?;
            }
            Ok(stats)
        }
        Err(e) => {
            catalog.rollback_if_active();
            Err(e)
        }
    }
}

/// `compact()`: explicit compaction; `force` skips the trigger checks.
pub fn compact(ctx: &OperationContext<'_>, force: bool) -> Result<CompactStats> {
    ctx.options.validate()?;
    let _lock = lock::acquire(ctx.backend)?;
    let encryption = PlaintextEngine;
    let manager = ctx.manager(&encryption)?;
    let mut catalog = ctx.open_catalog()?;
    let now = Utc::now();

    catalog.begin()?;
    match compact::run_compact(&catalog, &manager, ctx.options, now, force) {
        Ok(stats) => {
            if ctx.options.dryrun {
                catalog.rollback()?;
            } else {
                catalog.commit()?;
                manager.process_pending_deletes(&catalog, now)?;
            }
            Ok(stats)
        }
        Err(e) => {
            catalog.rollback_if_active();
            Err(e)
        }
    }
}

/// `repair()`: recreate the catalog from the remote, or reconcile.
pub fn repair(ctx: &OperationContext<'_>) -> Result<RepairResult> {
    ctx.options.validate()?;
    let _lock = lock::acquire(ctx.backend)?;
    let encryption = PlaintextEngine;
    let manager = ctx.manager(&encryption)?;
    let mut catalog = ctx.open_catalog()?;
    let now = Utc::now();

    catalog.begin()?;
    match repair::run_repair(&catalog, &manager, ctx.options, now) {
        Ok(result) => {
            catalog.commit()?;
            Ok(result)
        }
        Err(e) => {
            catalog.rollback_if_active();
            Err(e)
        }
    }
}

/// `verify_consistency` as an operation (used by tests and the CLI).
pub fn verify(ctx: &OperationContext<'_>, strict: bool) -> Result<()> {
    let catalog = ctx.open_catalog()?;
    let block_algo = HashAlgorithm::parse(&ctx.options.block_hash_algorithm)?;
    catalog.verify_consistency(ctx.options.blocksize, block_algo.hash_len(), strict)
}
