//! Restore phase 1: plan temp tables, target mapping, directory tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use globset::GlobSet;
use rusqlite::params;
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{CairnError, Result};

/// Guard owning the per-operation scratch tables; drops them on every
/// exit path.
pub struct PlanTables<'a> {
    catalog: &'a Catalog,
    pub files_table: String,
    pub blocks_table: String,
}

impl Drop for PlanTables<'_> {
    fn drop(&mut self) {
        self.catalog.drop_temp_table(&self.files_table);
        self.catalog.drop_temp_table(&self.blocks_table);
    }
}

/// What kind of plan row a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    File,
    Folder,
    Symlink,
}

/// One file (or folder/symlink) of the restore plan.
#[derive(Debug)]
pub struct FilePlan {
    /// Rowid in the files scratch table.
    pub row: i64,
    pub kind: PlanKind,
    pub path_in_backup: String,
    pub target: PathBuf,
    pub size: i64,
    pub file_hash: Option<String>,
    pub meta_size: i64,
}

/// One needed block: where it lives remotely and where its bytes go.
#[derive(Debug, Clone)]
pub struct BlockNeed {
    pub file_row: i64,
    pub hash: String,
    pub size: i64,
    pub offset: i64,
    pub volume_id: i64,
    /// Block of the metadata blob rather than file content.
    pub is_meta: bool,
}

pub struct RestorePlan<'a> {
    pub tables: PlanTables<'a>,
    pub files: Vec<FilePlan>,
    pub fileset_id: i64,
}

/// Strip the largest common directory prefix from the selected paths.
pub fn largest_common_prefix(paths: &[&str]) -> String {
    let mut iter = paths.iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let mut prefix: &str = first;
    for path in iter {
        while !path.starts_with(prefix) {
            match prefix.rfind('/') {
                Some(pos) => prefix = &prefix[..pos],
                None => return String::new(),
            }
        }
    }
    // Cut back to a directory boundary.
    match prefix.rfind('/') {
        Some(pos) => prefix[..=pos].to_string(),
        None => String::new(),
    }
}

fn map_target(
    path_in_backup: &str,
    common_prefix: &str,
    restore_dir: Option<&Path>,
) -> PathBuf {
    match restore_dir {
        None => PathBuf::from(path_in_backup),
        Some(dir) => {
            let relative = path_in_backup
                .strip_prefix(common_prefix)
                .unwrap_or(path_in_backup)
                .trim_start_matches('/');
            dir.join(relative)
        }
    }
}

/// Build the FILES/BLOCKS scratch tables for a restore of `fileset_id`,
/// honoring the path filter, and create the target directory tree.
pub fn build_plan<'a>(
    catalog: &'a Catalog,
    fileset_id: i64,
    filter: Option<&GlobSet>,
    restore_dir: Option<&Path>,
    blocksize: u32,
) -> Result<RestorePlan<'a>> {
    let files_table = catalog.temp_table_name("restore_files");
    let blocks_table = catalog.temp_table_name("restore_blocks");
    catalog.conn().execute_batch(&format!(
        "CREATE TEMP TABLE {files_table} (
           id INTEGER PRIMARY KEY,
           kind INTEGER NOT NULL,
           path TEXT NOT NULL,
           target TEXT NOT NULL,
           size INTEGER NOT NULL,
           file_hash TEXT,
           meta_size INTEGER NOT NULL,
           blockset_id INTEGER NOT NULL,
           meta_blockset_id INTEGER
         );
         CREATE TEMP TABLE {blocks_table} (
           id INTEGER PRIMARY KEY,
           file_row INTEGER NOT NULL,
           hash TEXT NOT NULL,
           size INTEGER NOT NULL,
           offset INTEGER NOT NULL,
           volume_id INTEGER NOT NULL,
           is_meta INTEGER NOT NULL,
           restored INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX {blocks_table}_vol ON {blocks_table} (volume_id, restored);"
    ))?;
    let tables = PlanTables {
        catalog,
        files_table,
        blocks_table,
    };

    let all_files = catalog.fileset_files(fileset_id)?;
    let selected: Vec<_> = all_files
        .into_iter()
        .filter(|f| filter.is_none_or(|g| g.is_match(&f.path)))
        .collect();
    if selected.is_empty() {
        return Err(CairnError::UserInformation(
            "no files in the selected version match the restore filter".into(),
        ));
    }

    let path_refs: Vec<&str> = selected.iter().map(|f| f.path.as_str()).collect();
    let common_prefix = largest_common_prefix(&path_refs);
    debug!(prefix = %common_prefix, files = selected.len(), "restore plan scope");

    let mut files = Vec::with_capacity(selected.len());
    for file in &selected {
        let kind = if file.is_folder() {
            PlanKind::Folder
        } else if file.is_symlink() {
            PlanKind::Symlink
        } else {
            PlanKind::File
        };
        let target = map_target(&file.path, &common_prefix, restore_dir);

        catalog.conn().execute(
            &format!(
                "INSERT INTO {} (kind, path, target, size, file_hash, meta_size,
                                 blockset_id, meta_blockset_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                tables.files_table
            ),
            params![
                kind as i64,
                file.path,
                target.to_string_lossy(),
                file.size,
                file.file_hash,
                file.meta_size,
                file.blockset_id,
                file.meta_blockset_id,
            ],
        )?;
        let row = catalog.conn().last_insert_rowid();

        if kind == PlanKind::File {
            for block in catalog.blockset_blocks(file.blockset_id)? {
                catalog.conn().execute(
                    &format!(
                        "INSERT INTO {} (file_row, hash, size, offset, volume_id, is_meta)
                         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                        tables.blocks_table
                    ),
                    params![
                        row,
                        block.hash,
                        block.size,
                        block.index * blocksize as i64,
                        block.volume_id,
                    ],
                )?;
            }
        }
        if let Some(meta_blockset) = file.meta_blockset_id {
            for block in catalog.blockset_blocks(meta_blockset)? {
                catalog.conn().execute(
                    &format!(
                        "INSERT INTO {} (file_row, hash, size, offset, volume_id, is_meta)
                         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                        tables.blocks_table
                    ),
                    params![
                        row,
                        block.hash,
                        block.size,
                        block.index * blocksize as i64,
                        block.volume_id,
                    ],
                )?;
            }
        }

        files.push(FilePlan {
            row,
            kind,
            path_in_backup: file.path.clone(),
            target,
            size: file.size,
            file_hash: file.file_hash.clone(),
            meta_size: file.meta_size,
        });
    }

    // Create the directory tree (folders sort before their contents).
    for plan in &files {
        match plan.kind {
            PlanKind::Folder => std::fs::create_dir_all(&plan.target)?,
            PlanKind::File | PlanKind::Symlink => {
                if let Some(parent) = plan.target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
    }

    Ok(RestorePlan {
        tables,
        files,
        fileset_id,
    })
}

impl RestorePlan<'_> {
    /// Unrestored blocks grouped by remote volume, ordered by volume id.
    pub fn volumes_needed(&self, catalog: &Catalog) -> Result<Vec<i64>> {
        let mut stmt = catalog.conn().prepare(&format!(
            "SELECT DISTINCT volume_id FROM {} WHERE restored = 0 ORDER BY volume_id",
            self.tables.blocks_table
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Unrestored blocks homed in one volume.
    pub fn blocks_in_volume(&self, catalog: &Catalog, volume_id: i64) -> Result<Vec<BlockNeed>> {
        let mut stmt = catalog.conn().prepare(&format!(
            "SELECT file_row, hash, size, offset, volume_id, is_meta
             FROM {} WHERE restored = 0 AND volume_id = ?1 ORDER BY file_row, offset",
            self.tables.blocks_table
        ))?;
        let rows = stmt.query_map([volume_id], |row| {
            Ok(BlockNeed {
                file_row: row.get(0)?,
                hash: row.get(1)?,
                size: row.get(2)?,
                offset: row.get(3)?,
                volume_id: row.get(4)?,
                is_meta: row.get::<_, i64>(5)? != 0,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Content blocks of one file, for the local-reuse scan.
    pub fn content_blocks_of(&self, catalog: &Catalog, file_row: i64) -> Result<Vec<BlockNeed>> {
        let mut stmt = catalog.conn().prepare(&format!(
            "SELECT file_row, hash, size, offset, volume_id, is_meta
             FROM {} WHERE file_row = ?1 AND is_meta = 0 ORDER BY offset",
            self.tables.blocks_table
        ))?;
        let rows = stmt.query_map([file_row], |row| {
            Ok(BlockNeed {
                file_row: row.get(0)?,
                hash: row.get(1)?,
                size: row.get(2)?,
                offset: row.get(3)?,
                volume_id: row.get(4)?,
                is_meta: row.get::<_, i64>(5)? != 0,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn mark_restored(&self, catalog: &Catalog, file_row: i64, offset: i64, is_meta: bool) -> Result<()> {
        catalog.conn().execute(
            &format!(
                "UPDATE {} SET restored = 1
                 WHERE file_row = ?1 AND offset = ?2 AND is_meta = ?3",
                self.tables.blocks_table
            ),
            params![file_row, offset, is_meta as i64],
        )?;
        Ok(())
    }

    pub fn unrestored_count(&self, catalog: &Catalog, file_row: i64) -> Result<i64> {
        Ok(catalog.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE file_row = ?1 AND restored = 0 AND is_meta = 0",
                self.tables.blocks_table
            ),
            [file_row],
            |row| row.get(0),
        )?)
    }

    pub fn file_by_row(&self, row: i64) -> Option<&FilePlan> {
        self.files.iter().find(|f| f.row == row)
    }
}

/// In-memory assembly buffers for metadata blobs, filled during patching
/// alongside file content and consumed by the metadata phase.
#[derive(Default)]
pub struct MetadataSink {
    buffers: HashMap<i64, Vec<u8>>,
}

impl MetadataSink {
    pub fn prepare(&mut self, file_row: i64, meta_size: i64) {
        self.buffers
            .entry(file_row)
            .or_insert_with(|| vec![0u8; meta_size.max(0) as usize]);
    }

    pub fn write(&mut self, file_row: i64, offset: i64, data: &[u8]) {
        if let Some(buf) = self.buffers.get_mut(&file_row) {
            let start = offset as usize;
            let end = (start + data.len()).min(buf.len());
            if start < end {
                buf[start..end].copy_from_slice(&data[..end - start]);
            }
        }
    }

    pub fn take(&mut self, file_row: i64) -> Option<Vec<u8>> {
        self.buffers.remove(&file_row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_prefix_of_siblings() {
        assert_eq!(
            largest_common_prefix(&["/data/a/x.txt", "/data/b/y.txt"]),
            "/data/"
        );
    }

    #[test]
    fn common_prefix_single_path_is_its_directory() {
        assert_eq!(largest_common_prefix(&["/data/a/x.txt"]), "/data/a/");
    }

    #[test]
    fn common_prefix_disjoint_is_empty() {
        assert_eq!(largest_common_prefix(&["/data/a", "relative/b"]), "");
    }

    #[test]
    fn target_mapping_strips_prefix() {
        let target = map_target("/data/a/x.txt", "/data/", Some(Path::new("/restore")));
        assert_eq!(target, PathBuf::from("/restore/a/x.txt"));
    }

    #[test]
    fn target_mapping_without_dir_is_original() {
        let target = map_target("/data/a/x.txt", "/data/", None);
        assert_eq!(target, PathBuf::from("/data/a/x.txt"));
    }

    #[test]
    fn metadata_sink_assembles_at_offsets() {
        let mut sink = MetadataSink::default();
        sink.prepare(1, 8);
        sink.write(1, 4, b"tail");
        sink.write(1, 0, b"head");
        assert_eq!(sink.take(1).unwrap(), b"headtail");
        assert!(sink.take(1).is_none());
    }
}
