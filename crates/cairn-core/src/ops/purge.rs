//! `purge-broken-files()`: drop file entries whose data depends on
//! missing remote volumes, rewrite the affected dlist volumes, and
//! cascade-clean the orphans.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use cairn_types::volume::VolumeType;

use crate::backup::build_filelist;
use crate::catalog::RetentionCascade;
use crate::crypto::PlaintextEngine;
use crate::error::Result;

use super::list::{list_broken, BrokenFile};
use super::{lock, OperationContext};

#[derive(Debug, Default)]
pub struct PurgeResult {
    pub files_purged: usize,
    pub filesets_rewritten: usize,
    pub cascade: RetentionCascade,
}

pub fn purge_broken_files(ctx: &OperationContext<'_>) -> Result<PurgeResult> {
    ctx.options.validate()?;
    let broken = list_broken(ctx)?;

    let _lock = lock::acquire(ctx.backend)?;
    let encryption = PlaintextEngine;
    let manager = ctx.manager(&encryption)?;
    let mut catalog = ctx.open_catalog()?;
    // A partially recreated catalog cannot distinguish broken from
    // not-yet-recreated; refuse.
    catalog.require_complete()?;
    let now = Utc::now();

    let mut result = PurgeResult::default();
    if broken.is_empty() {
        info!("no broken files to purge");
        return Ok(result);
    }

    let mut by_fileset: BTreeMap<i64, Vec<BrokenFile>> = BTreeMap::new();
    for file in broken {
        by_fileset.entry(file.fileset_id).or_default().push(file);
    }

    catalog.begin()?;
    let outcome = (|| {
        for (fileset_id, files) in &by_fileset {
            let file_ids: Vec<i64> = files.iter().map(|f| f.file_id).collect();
            for file in files {
                warn!(path = %file.path, "purging broken file");
            }
            result.files_purged +=
                catalog.remove_fileset_entries(*fileset_id, &file_ids)?;

            // Replace the fileset's dlist with one reflecting the purge.
            let old_volume = {
                let fileset = catalog
                    .list_filesets()?
                    .into_iter()
                    .find(|f| f.id == *fileset_id);
                fileset.map(|f| f.volume_id)
            };
            let (new_volume_id, _) = manager.create_volume(
                &catalog,
                &ctx.options.prefix,
                VolumeType::Files,
                now,
            )?;
            catalog.update_fileset_volume(*fileset_id, new_volume_id)?;
            let container =
                build_filelist(&catalog, ctx.options, *fileset_id, false, now)?;
            if !ctx.options.dryrun {
                manager.upload_volume(&catalog, new_volume_id, &container)?;
                if let Some(old_id) = old_volume {
                    manager.delete_volume(&catalog, old_id, now)?;
                }
            }
            result.filesets_rewritten += 1;
        }
        catalog.cascade_orphans(&mut result.cascade)?;
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            if ctx.options.dryrun {
                catalog.rollback()?;
            } else {
                catalog.commit()?;
                manager.process_pending_deletes(&catalog, now)?;
            }
            info!(
                purged = result.files_purged,
                filesets = result.filesets_rewritten,
                "purge complete"
            );
            Ok(result)
        }
        Err(e) => {
            catalog.rollback_if_active();
            Err(e)
        }
    }
}
