use crate::error::Result;

use super::{Catalog, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};

/// Added/deleted/modified counts between two filesets, split by entry kind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeStatistics {
    pub added_files: i64,
    pub added_folders: i64,
    pub added_symlinks: i64,
    pub deleted_files: i64,
    pub deleted_folders: i64,
    pub deleted_symlinks: i64,
    pub modified_files: i64,
    pub modified_folders: i64,
    pub modified_symlinks: i64,
}

impl ChangeStatistics {
    pub fn total_changes(&self) -> i64 {
        self.added_files
            + self.added_folders
            + self.added_symlinks
            + self.deleted_files
            + self.deleted_folders
            + self.deleted_symlinks
            + self.modified_files
            + self.modified_folders
            + self.modified_symlinks
    }
}

/// CTE joining one fileset's entries to full path, kind and hashes.
/// Kind: 0 = file, 1 = folder, 2 = symlink.
const FILESET_VIEW: &str = "
    SELECT p.prefix || f.path AS full_path,
           CASE f.blockset_id
             WHEN {FOLDER} THEN 1
             WHEN {SYMLINK} THEN 2
             ELSE 0
           END AS kind,
           f.blockset_id AS blockset_id,
           ms.full_hash AS meta_hash
    FROM fileset_entry fe
    JOIN file_lookup f ON f.id = fe.file_id
    JOIN path_prefix p ON p.id = f.prefix_id
    LEFT JOIN metadataset m ON m.id = f.metadata_id
    LEFT JOIN blockset ms ON ms.id = m.blockset_id
    WHERE fe.fileset_id = ";

fn fileset_view(param: &str) -> String {
    FILESET_VIEW
        .replace("{FOLDER}", &FOLDER_BLOCKSET_ID.to_string())
        .replace("{SYMLINK}", &SYMLINK_BLOCKSET_ID.to_string())
        + param
}

impl Catalog {
    /// Compare `current` against `previous` and count added, deleted and
    /// modified entries per kind.
    ///
    /// Added/deleted compare on full path. A file is modified when either
    /// its content blockset or its metadata hash changed; folders and
    /// symlinks have no content blockset, so only the metadata hash counts.
    pub fn change_statistics(
        &self,
        current: i64,
        previous: i64,
    ) -> Result<ChangeStatistics> {
        let cur = fileset_view("?1");
        let prev = fileset_view("?2");

        let mut stats = ChangeStatistics::default();

        // Added: present now, absent before.
        let sql = format!(
            "WITH cur AS ({cur}), prev AS ({prev})
             SELECT cur.kind, COUNT(*) FROM cur
             WHERE cur.full_path NOT IN (SELECT full_path FROM prev)
             GROUP BY cur.kind"
        );
        self.kind_counts(&sql, current, previous, |kind, count| match kind {
            1 => stats.added_folders = count,
            2 => stats.added_symlinks = count,
            _ => stats.added_files = count,
        })?;

        // Deleted: present before, absent now.
        let sql = format!(
            "WITH cur AS ({cur}), prev AS ({prev})
             SELECT prev.kind, COUNT(*) FROM prev
             WHERE prev.full_path NOT IN (SELECT full_path FROM cur)
             GROUP BY prev.kind"
        );
        self.kind_counts(&sql, current, previous, |kind, count| match kind {
            1 => stats.deleted_folders = count,
            2 => stats.deleted_symlinks = count,
            _ => stats.deleted_files = count,
        })?;

        // Modified: same path, differing content blockset or metadata hash.
        let sql = format!(
            "WITH cur AS ({cur}), prev AS ({prev})
             SELECT cur.kind, COUNT(*) FROM cur
             JOIN prev ON prev.full_path = cur.full_path
             WHERE (cur.kind = 0 AND (cur.blockset_id != prev.blockset_id
                                      OR COALESCE(cur.meta_hash, '') != COALESCE(prev.meta_hash, '')))
                OR (cur.kind != 0 AND COALESCE(cur.meta_hash, '') != COALESCE(prev.meta_hash, ''))
             GROUP BY cur.kind"
        );
        self.kind_counts(&sql, current, previous, |kind, count| match kind {
            1 => stats.modified_folders = count,
            2 => stats.modified_symlinks = count,
            _ => stats.modified_files = count,
        })?;

        Ok(stats)
    }

    fn kind_counts(
        &self,
        sql: &str,
        current: i64,
        previous: i64,
        mut apply: impl FnMut(i64, i64),
    ) -> Result<()> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params![current, previous], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            apply(kind, count);
        }
        Ok(())
    }
}
