//! Listing operations: versions, files within a version, broken files,
//! and the remote-volume → affected-files mapping.

use std::collections::BTreeMap;

use globset::GlobBuilder;

use cairn_types::volume::VolumeState;

use crate::catalog::FilesetFileRow;
use crate::error::{CairnError, Result};

use super::OperationContext;

/// One row of `list` without a version filter.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: usize,
    pub fileset_id: i64,
    pub timestamp: i64,
    pub is_full_backup: bool,
    pub is_partial: bool,
    pub file_count: i64,
    pub total_bytes: i64,
}

/// `list(filters)`: all versions, newest first.
pub fn list_versions(ctx: &OperationContext<'_>) -> Result<Vec<VersionInfo>> {
    let catalog = ctx.open_catalog()?;
    let mut versions = Vec::new();
    for (index, fileset) in catalog.list_filesets()?.into_iter().enumerate() {
        let (file_count, total_bytes) = catalog.fileset_summary(fileset.id)?;
        versions.push(VersionInfo {
            version: index,
            fileset_id: fileset.id,
            timestamp: fileset.timestamp,
            is_full_backup: fileset.is_full_backup,
            is_partial: fileset.is_partial,
            file_count,
            total_bytes,
        });
    }
    Ok(versions)
}

/// `list(filters)` within one version: matching file rows in path order.
pub fn list_files(
    ctx: &OperationContext<'_>,
    version: Option<usize>,
    filter: Option<&str>,
) -> Result<Vec<FilesetFileRow>> {
    let catalog = ctx.open_catalog()?;
    let fileset = catalog.resolve_fileset(version, None)?;
    let matcher = filter
        .map(|pattern| {
            GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map(|g| g.compile_matcher())
                .map_err(|e| {
                    CairnError::UserInformation(format!("invalid list filter '{pattern}': {e}"))
                })
        })
        .transpose()?;
    Ok(catalog
        .fileset_files(fileset.id)?
        .into_iter()
        .filter(|f| matcher.as_ref().is_none_or(|m| m.is_match(&f.path)))
        .collect())
}

/// A file whose data depends on an unavailable remote volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenFile {
    pub fileset_id: i64,
    pub file_id: i64,
    pub path: String,
}

/// `list-broken(filters)`: compare the catalog with the remote listing
/// and name every file whose blocks live in a missing volume.
pub fn list_broken(ctx: &OperationContext<'_>) -> Result<Vec<BrokenFile>> {
    let catalog = ctx.open_catalog()?;
    let listing = ctx.backend.list()?;
    let present: std::collections::HashSet<&str> =
        listing.iter().map(|e| e.name.as_str()).collect();

    let mut missing_volumes = Vec::new();
    for volume in catalog.list_volumes(None, None)? {
        let should_exist = matches!(
            volume.state,
            VolumeState::Uploaded | VolumeState::Verified
        );
        if should_exist && !present.contains(volume.name.as_str()) {
            missing_volumes.push(volume.id);
        }
    }

    Ok(catalog
        .files_using_volumes(&missing_volumes)?
        .into_iter()
        .map(|(fileset_id, file_id, path)| BrokenFile {
            fileset_id,
            file_id,
            path,
        })
        .collect())
}

/// `list-affected(targets)`: map remote volume names to the filesets and
/// files that depend on them.
#[derive(Debug, Default)]
pub struct AffectedReport {
    /// Fileset ids whose dlist volume was named directly.
    pub filesets: Vec<i64>,
    /// Files depending on the named dblock volumes, keyed by fileset.
    pub files: BTreeMap<i64, Vec<String>>,
}

pub fn list_affected(
    ctx: &OperationContext<'_>,
    targets: &[String],
) -> Result<AffectedReport> {
    let catalog = ctx.open_catalog()?;
    let mut report = AffectedReport::default();
    let mut volume_ids = Vec::new();

    for name in targets {
        let Some(volume) = catalog.volume_by_name(name)? else {
            return Err(CairnError::UserInformation(format!(
                "'{name}' is not a known remote volume"
            )));
        };
        if let Some(fileset) = catalog.fileset_for_volume(volume.id)? {
            report.filesets.push(fileset.id);
        }
        volume_ids.push(volume.id);
    }

    for (fileset_id, _, path) in catalog.files_using_volumes(&volume_ids)? {
        report.files.entry(fileset_id).or_default().push(path);
    }
    Ok(report)
}
