use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::error::{CairnError, Result};

use super::{Catalog, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};

/// Maximum +1 s probes when two filesets collide at second resolution.
const TIMESTAMP_RETRY_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesetRow {
    pub id: i64,
    pub timestamp: i64,
    pub volume_id: i64,
    pub is_full_backup: bool,
    pub is_partial: bool,
}

/// One file row of a fileset, joined through to its blockset and metadata.
#[derive(Debug, Clone)]
pub struct FilesetFileRow {
    pub file_id: i64,
    pub path: String,
    pub blockset_id: i64,
    pub metadata_id: Option<i64>,
    pub last_modified: i64,
    /// Content size; 0 for folders and symlinks.
    pub size: i64,
    /// Content full hash; `None` for folders and symlinks.
    pub file_hash: Option<String>,
    pub meta_blockset_id: Option<i64>,
    pub meta_hash: Option<String>,
    pub meta_size: i64,
}

impl FilesetFileRow {
    pub fn is_folder(&self) -> bool {
        self.blockset_id == FOLDER_BLOCKSET_ID
    }

    pub fn is_symlink(&self) -> bool {
        self.blockset_id == SYMLINK_BLOCKSET_ID
    }
}

/// Previous-fileset lookup used by the metadata pre-processor to decide
/// same-as-previous without re-reading the file.
#[derive(Debug, Clone)]
pub struct PreviousFileInfo {
    pub file_id: i64,
    pub blockset_id: i64,
    pub metadata_id: Option<i64>,
    pub size: i64,
    pub last_modified: i64,
    pub meta_hash: Option<String>,
}

/// Row counts from a retention cascade, for logging and for the
/// update-count invariants.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionCascade {
    pub filesets_deleted: usize,
    pub files_deleted: usize,
    pub blocksets_deleted: usize,
    pub blocks_marked_deleted: usize,
    pub dlist_volumes_deleting: usize,
}

/// Split a full path into (directory prefix incl. trailing separator, name).
fn split_prefix(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => path.split_at(pos + 1),
        None => ("", path),
    }
}

impl Catalog {
    /// Create a fileset row, bumping the timestamp by one-second increments
    /// on collision. Fails hard after 100 probes.
    pub fn create_fileset(
        &self,
        volume_id: i64,
        timestamp: i64,
        is_full_backup: bool,
    ) -> Result<i64> {
        for probe in 0..=TIMESTAMP_RETRY_LIMIT {
            let candidate = timestamp + probe;
            let taken: i64 = self.conn().query_row(
                "SELECT COUNT(*) FROM fileset WHERE timestamp = ?1",
                [candidate],
                |row| row.get(0),
            )?;
            if taken == 0 {
                self.conn().execute(
                    "INSERT INTO fileset (timestamp, volume_id, is_full_backup, is_partial)
                     VALUES (?1, ?2, ?3, 0)",
                    params![candidate, volume_id, is_full_backup as i64],
                )?;
                if probe > 0 {
                    debug!(probe, "fileset timestamp bumped to avoid collision");
                }
                return Ok(self.conn().last_insert_rowid());
            }
        }
        Err(CairnError::UserInformation(format!(
            "could not find a unique fileset timestamp within {TIMESTAMP_RETRY_LIMIT} seconds \
             of {timestamp}"
        )))
    }

    pub fn mark_fileset_partial(&self, fileset_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE fileset SET is_partial = 1 WHERE id = ?1",
            [fileset_id],
        )?;
        Ok(())
    }

    /// Insert-once file row with interned directory prefix; returns the id.
    pub fn register_file(
        &self,
        path: &str,
        blockset_id: i64,
        metadata_id: Option<i64>,
    ) -> Result<i64> {
        let (prefix, name) = split_prefix(path);
        let prefix_id = self.intern_prefix(prefix)?;

        if let Some(id) = self
            .conn()
            .query_row(
                "SELECT id FROM file_lookup
                 WHERE prefix_id = ?1 AND path = ?2 AND blockset_id = ?3
                   AND COALESCE(metadata_id, -1) = COALESCE(?4, -1)",
                params![prefix_id, name, blockset_id, metadata_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(id);
        }
        self.conn().execute(
            "INSERT INTO file_lookup (prefix_id, path, blockset_id, metadata_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![prefix_id, name, blockset_id, metadata_id],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    fn intern_prefix(&self, prefix: &str) -> Result<i64> {
        if let Some(id) = self
            .conn()
            .query_row(
                "SELECT id FROM path_prefix WHERE prefix = ?1",
                [prefix],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(id);
        }
        self.conn()
            .execute("INSERT INTO path_prefix (prefix) VALUES (?1)", [prefix])?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Bind a file to a fileset version.
    pub fn add_fileset_entry(
        &self,
        fileset_id: i64,
        file_id: i64,
        last_modified: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO fileset_entry (fileset_id, file_id, last_modified)
             VALUES (?1, ?2, ?3)",
            params![fileset_id, file_id, last_modified],
        )?;
        Ok(())
    }

    /// All filesets, newest first.
    pub fn list_filesets(&self) -> Result<Vec<FilesetRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT id, timestamp, volume_id, is_full_backup, is_partial
             FROM fileset ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FilesetRow {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                volume_id: row.get(2)?,
                is_full_backup: row.get::<_, i64>(3)? != 0,
                is_partial: row.get::<_, i64>(4)? != 0,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Select a fileset by version index (0 = newest) or by the newest
    /// fileset at or before `time`. With neither, the newest wins.
    pub fn resolve_fileset(
        &self,
        version: Option<usize>,
        time: Option<i64>,
    ) -> Result<FilesetRow> {
        let filesets = self.list_filesets()?;
        if filesets.is_empty() {
            return Err(CairnError::UserInformation(
                "no backup versions exist in this catalog".into(),
            ));
        }
        match (version, time) {
            (Some(v), _) => filesets.get(v).cloned().ok_or_else(|| {
                CairnError::UserInformation(format!(
                    "version {v} does not exist ({} versions total)",
                    filesets.len()
                ))
            }),
            (None, Some(t)) => filesets
                .iter()
                .find(|f| f.timestamp <= t)
                .cloned()
                .ok_or_else(|| {
                    CairnError::UserInformation(format!("no backup version at or before {t}"))
                }),
            (None, None) => Ok(filesets[0].clone()),
        }
    }

    /// The most recent Temporary/Uploading Files volume, used to resume an
    /// interrupted backup with a synthetic filelist.
    pub fn find_last_incomplete_fileset_volume(
        &self,
    ) -> Result<Option<super::RemoteVolumeRow>> {
        let id: Option<i64> = self
            .conn()
            .query_row(
                "SELECT rv.id FROM remote_volume rv
                 JOIN fileset f ON f.volume_id = rv.id
                 WHERE rv.type = 'dlist' AND rv.state IN ('Temporary', 'Uploading')
                 ORDER BY f.timestamp DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => Ok(Some(self.volume_by_id(id)?)),
            None => Ok(None),
        }
    }

    pub fn fileset_for_volume(&self, volume_id: i64) -> Result<Option<FilesetRow>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, timestamp, volume_id, is_full_backup, is_partial
                 FROM fileset WHERE volume_id = ?1",
                [volume_id],
                |row| {
                    Ok(FilesetRow {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        volume_id: row.get(2)?,
                        is_full_backup: row.get::<_, i64>(3)? != 0,
                        is_partial: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()?)
    }

    /// Stream the file rows of a fileset in path order, `page` rows at a
    /// time. The callback drives cancellation by returning `false`.
    pub fn fileset_files(&self, fileset_id: i64) -> Result<Vec<FilesetFileRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT f.id, p.prefix || f.path, f.blockset_id, f.metadata_id, fe.last_modified,
                    COALESCE(cs.length, 0), cs.full_hash,
                    m.blockset_id, ms.full_hash, COALESCE(ms.length, 0)
             FROM fileset_entry fe
             JOIN file_lookup f ON f.id = fe.file_id
             JOIN path_prefix p ON p.id = f.prefix_id
             LEFT JOIN blockset cs ON cs.id = f.blockset_id
             LEFT JOIN metadataset m ON m.id = f.metadata_id
             LEFT JOIN blockset ms ON ms.id = m.blockset_id
             WHERE fe.fileset_id = ?1
             ORDER BY p.prefix || f.path",
        )?;
        let rows = stmt.query_map([fileset_id], |row| {
            Ok(FilesetFileRow {
                file_id: row.get(0)?,
                path: row.get(1)?,
                blockset_id: row.get(2)?,
                metadata_id: row.get(3)?,
                last_modified: row.get(4)?,
                size: row.get(5)?,
                file_hash: row.get(6)?,
                meta_blockset_id: row.get(7)?,
                meta_hash: row.get(8)?,
                meta_size: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Load the previous fileset's files keyed by full path.
    pub fn previous_file_map(
        &self,
        fileset_id: i64,
    ) -> Result<HashMap<String, PreviousFileInfo>> {
        let mut map = HashMap::new();
        for row in self.fileset_files(fileset_id)? {
            map.insert(
                row.path.clone(),
                PreviousFileInfo {
                    file_id: row.file_id,
                    blockset_id: row.blockset_id,
                    metadata_id: row.metadata_id,
                    size: row.size,
                    last_modified: row.last_modified,
                    meta_hash: row.meta_hash,
                },
            );
        }
        Ok(map)
    }

    /// Drop filesets and cascade-clean every orphaned row. Orphaned blocks
    /// are first moved to the deleted-block ledger so volume accounting
    /// stays correct. The Files volumes of the dropped filesets transition
    /// to Deleting in one update whose count must equal the fileset count.
    pub fn delete_filesets(&self, ids: &[i64]) -> Result<RetentionCascade> {
        if ids.is_empty() {
            return Ok(RetentionCascade::default());
        }
        let id_list = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut cascade = RetentionCascade::default();

        // Files volumes first, while the fileset rows still exist.
        cascade.dlist_volumes_deleting = self.conn().execute(
            &format!(
                "UPDATE remote_volume SET state = 'Deleting'
                 WHERE type = 'dlist' AND state != 'Deleting'
                   AND id IN (SELECT volume_id FROM fileset WHERE id IN ({id_list}))"
            ),
            [],
        )?;
        if cascade.dlist_volumes_deleting != ids.len() {
            return Err(CairnError::DatabaseConsistency(format!(
                "retention moved {} dlist volumes to Deleting for {} filesets",
                cascade.dlist_volumes_deleting,
                ids.len()
            )));
        }

        self.conn().execute(
            &format!("DELETE FROM fileset_entry WHERE fileset_id IN ({id_list})"),
            [],
        )?;
        cascade.filesets_deleted = self
            .conn()
            .execute(&format!("DELETE FROM fileset WHERE id IN ({id_list})"), [])?;

        self.cascade_orphans(&mut cascade)?;
        debug!(?cascade, "retention cascade complete");
        Ok(cascade)
    }

    /// Delete every row no longer reachable from a fileset entry: files,
    /// metadatasets, blocksets and finally blocks. Orphaned blocks move to
    /// the deleted-block ledger first so volume waste accounting holds.
    pub fn cascade_orphans(&self, cascade: &mut RetentionCascade) -> Result<()> {
        cascade.files_deleted += self.conn().execute(
            "DELETE FROM file_lookup
             WHERE id NOT IN (SELECT file_id FROM fileset_entry)",
            [],
        )?;

        self.conn().execute(
            "DELETE FROM metadataset
             WHERE id NOT IN (SELECT metadata_id FROM file_lookup
                              WHERE metadata_id IS NOT NULL)",
            [],
        )?;

        cascade.blocksets_deleted += self.conn().execute(
            "DELETE FROM blockset
             WHERE id NOT IN (SELECT blockset_id FROM file_lookup WHERE blockset_id >= 0)
               AND id NOT IN (SELECT blockset_id FROM metadataset)",
            [],
        )?;
        self.conn().execute(
            "DELETE FROM blockset_entry
             WHERE blockset_id NOT IN (SELECT id FROM blockset)",
            [],
        )?;
        self.conn().execute(
            "DELETE FROM blocklist_hash
             WHERE blockset_id NOT IN (SELECT id FROM blockset)",
            [],
        )?;

        // Orphaned blocks: no blockset entry references them and their hash
        // is not a live blocklist. Ledger first, then delete.
        cascade.blocks_marked_deleted += self.conn().execute(
            "INSERT INTO deleted_block (hash, size, volume_id)
             SELECT hash, size, volume_id FROM block
             WHERE id NOT IN (SELECT block_id FROM blockset_entry)
               AND hash NOT IN (SELECT hash FROM blocklist_hash)",
            [],
        )?;
        self.conn().execute(
            "DELETE FROM block
             WHERE id NOT IN (SELECT block_id FROM blockset_entry)
               AND hash NOT IN (SELECT hash FROM blocklist_hash)",
            [],
        )?;
        Ok(())
    }

    /// Repoint a fileset at a replacement dlist volume (purge-broken).
    pub fn update_fileset_volume(&self, fileset_id: i64, volume_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE fileset SET volume_id = ?2 WHERE id = ?1",
            params![fileset_id, volume_id],
        )?;
        Ok(())
    }

    /// Remove specific fileset entries (purge-broken).
    pub fn remove_fileset_entries(&self, fileset_id: i64, file_ids: &[i64]) -> Result<usize> {
        let mut removed = 0;
        let mut stmt = self.conn().prepare_cached(
            "DELETE FROM fileset_entry WHERE fileset_id = ?1 AND file_id = ?2",
        )?;
        for file_id in file_ids {
            removed += stmt.execute(params![fileset_id, file_id])?;
        }
        Ok(removed)
    }

    /// Files whose content, metadata or blocklists live in any of the
    /// given volumes, as (fileset_id, file_id, path) triples.
    pub fn files_using_volumes(&self, volume_ids: &[i64]) -> Result<Vec<(i64, i64, String)>> {
        if volume_ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = volume_ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT DISTINCT fe.fileset_id, f.id, p.prefix || f.path
             FROM fileset_entry fe
             JOIN file_lookup f ON f.id = fe.file_id
             JOIN path_prefix p ON p.id = f.prefix_id
             WHERE f.blockset_id IN
                   (SELECT be.blockset_id FROM blockset_entry be
                    JOIN block b ON b.id = be.block_id WHERE b.volume_id IN ({list}))
                OR f.metadata_id IN
                   (SELECT m.id FROM metadataset m
                    JOIN blockset_entry be ON be.blockset_id = m.blockset_id
                    JOIN block b ON b.id = be.block_id WHERE b.volume_id IN ({list}))
                OR f.blockset_id IN
                   (SELECT bh.blockset_id FROM blocklist_hash bh
                    JOIN block b ON b.hash = bh.hash WHERE b.volume_id IN ({list}))
             ORDER BY fe.fileset_id, p.prefix || f.path"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Entry count and total content bytes of one fileset, for listings.
    pub fn fileset_summary(&self, fileset_id: i64) -> Result<(i64, i64)> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN bs.length IS NULL THEN 0
                                               ELSE bs.length END), 0)
             FROM fileset_entry fe
             JOIN file_lookup f ON f.id = fe.file_id
             LEFT JOIN blockset bs ON bs.id = f.blockset_id
             WHERE fe.fileset_id = ?1",
            [fileset_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::split_prefix;

    #[test]
    fn prefix_split() {
        assert_eq!(split_prefix("/a/b/c.txt"), ("/a/b/", "c.txt"));
        assert_eq!(split_prefix("c.txt"), ("", "c.txt"));
        assert_eq!(split_prefix("/a/b/"), ("/a/b/", ""));
    }
}
