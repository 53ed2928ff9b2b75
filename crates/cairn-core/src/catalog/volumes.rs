use rusqlite::{params, OptionalExtension};
use tracing::debug;

use cairn_types::volume::{VolumeState, VolumeType};

use crate::error::{CairnError, Result};

use super::Catalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVolumeRow {
    pub id: i64,
    pub name: String,
    pub kind: VolumeType,
    pub state: VolumeState,
    pub size: Option<i64>,
    pub hash: Option<String>,
    pub delete_grace_until: Option<i64>,
}

/// Per-volume waste accounting, the compaction planner's input.
#[derive(Debug, Clone)]
pub struct VolumeUsage {
    pub volume_id: i64,
    pub name: String,
    /// Sum of live block sizes homed in the volume.
    pub data_size: i64,
    /// Sum of deleted-block ledger sizes for the volume.
    pub wasted_size: i64,
    /// Size of the finalized volume as recorded on upload.
    pub compressed_size: i64,
    /// Timestamp of the oldest fileset still referencing any block here.
    pub oldest_fileset: Option<i64>,
}

/// Counts from re-homing one volume's blocks during compaction. The three
/// must be equal or the compaction aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RehomeCounts {
    pub target: usize,
    pub updated: usize,
    pub promoted: usize,
}

fn row_to_volume(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemoteVolumeRow> {
    let kind_str: String = row.get(2)?;
    let state_str: String = row.get(3)?;
    Ok(RemoteVolumeRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: VolumeType::from_suffix(&kind_str).unwrap_or(VolumeType::Blocks),
        state: VolumeState::parse(&state_str).unwrap_or(VolumeState::Deleted),
        size: row.get(4)?,
        hash: row.get(5)?,
        delete_grace_until: row.get(6)?,
    })
}

const VOLUME_COLS: &str = "id, name, type, state, size, hash, delete_grace_until";

impl Catalog {
    /// Insert a remote volume row. Exactly one row per remote filename
    /// (invariant 2) is enforced by the unique index.
    pub fn register_remote_volume(
        &self,
        name: &str,
        kind: VolumeType,
        state: VolumeState,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO remote_volume (name, type, state) VALUES (?1, ?2, ?3)",
            params![name, kind.suffix(), state.as_str()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn volume_by_id(&self, id: i64) -> Result<RemoteVolumeRow> {
        Ok(self.conn().query_row(
            &format!("SELECT {VOLUME_COLS} FROM remote_volume WHERE id = ?1"),
            [id],
            |row| row_to_volume(row),
        )?)
    }

    pub fn volume_by_name(&self, name: &str) -> Result<Option<RemoteVolumeRow>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {VOLUME_COLS} FROM remote_volume WHERE name = ?1"),
                [name],
                |row| row_to_volume(row),
            )
            .optional()?)
    }

    /// Volumes filtered by kind and/or state, oldest id first.
    pub fn list_volumes(
        &self,
        kind: Option<VolumeType>,
        state: Option<VolumeState>,
    ) -> Result<Vec<RemoteVolumeRow>> {
        let mut sql = format!("SELECT {VOLUME_COLS} FROM remote_volume WHERE 1=1");
        if let Some(k) = kind {
            sql.push_str(&format!(" AND type = '{}'", k.suffix()));
        }
        if let Some(s) = state {
            sql.push_str(&format!(" AND state = '{}'", s.as_str()));
        }
        sql.push_str(" ORDER BY id");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], |row| row_to_volume(row))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Advance the volume state machine. Illegal transitions are catalog
    /// consistency errors; backend side effects must be bracketed by the
    /// transitions on either side.
    pub fn transition_volume(&self, id: i64, next: VolumeState) -> Result<()> {
        let current = self.volume_by_id(id)?;
        if !current.state.can_transition_to(next) {
            return Err(CairnError::DatabaseConsistency(format!(
                "illegal volume transition {} -> {} for '{}'",
                current.state, next, current.name
            )));
        }
        self.conn().execute(
            "UPDATE remote_volume SET state = ?2 WHERE id = ?1",
            params![id, next.as_str()],
        )?;

        if next == VolumeState::Deleted {
            // Invariants 5 and 6: duplicate and deleted-block rows must not
            // outlive the volume.
            self.conn()
                .execute("DELETE FROM duplicate_block WHERE volume_id = ?1", [id])?;
            self.conn()
                .execute("DELETE FROM deleted_block WHERE volume_id = ?1", [id])?;
            self.conn().execute(
                "DELETE FROM index_block_link
                 WHERE index_volume_id = ?1 OR block_volume_id = ?1",
                [id],
            )?;
        }
        debug!(volume = %current.name, from = %current.state, to = %next, "volume transition");
        Ok(())
    }

    /// Record size and hash once a volume is finalized.
    pub fn set_volume_info(&self, id: i64, size: i64, hash: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE remote_volume SET size = ?2, hash = ?3 WHERE id = ?1",
            params![id, size, hash],
        )?;
        Ok(())
    }

    pub fn set_volume_grace(&self, id: i64, until: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE remote_volume SET delete_grace_until = ?2 WHERE id = ?1",
            params![id, until],
        )?;
        Ok(())
    }

    /// Drop a Deleted volume's row entirely (repair cleanup).
    pub fn forget_volume(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM remote_volume WHERE id = ?1", [id])?;
        Ok(())
    }

    // ----- index links -----

    pub fn add_index_link(&self, index_volume_id: i64, block_volume_id: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO index_block_link (index_volume_id, block_volume_id)
             VALUES (?1, ?2)",
            params![index_volume_id, block_volume_id],
        )?;
        Ok(())
    }

    /// Index volumes paired with a Blocks volume.
    pub fn index_volumes_for(&self, block_volume_id: i64) -> Result<Vec<RemoteVolumeRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT index_volume_id FROM index_block_link WHERE block_volume_id = ?1",
        )?;
        let ids: Vec<i64> = stmt
            .query_map([block_volume_id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        ids.into_iter().map(|id| self.volume_by_id(id)).collect()
    }

    /// Number of Blocks volumes still linked to an Index volume.
    pub fn index_link_count(&self, index_volume_id: i64) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM index_block_link WHERE index_volume_id = ?1",
            [index_volume_id],
            |row| row.get(0),
        )?)
    }

    // ----- duplicate blocks -----

    /// Record that `block_id` also physically exists in `volume_id`.
    pub fn add_duplicate_block(&self, block_id: i64, volume_id: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO duplicate_block (block_id, volume_id) VALUES (?1, ?2)",
            params![block_id, volume_id],
        )?;
        Ok(())
    }

    /// Re-home every block of `old_volume_id` to its best duplicate copy:
    /// the MAX volume id among candidates not in `excluded` (the other
    /// volumes being compacted away). The returned counts must agree or
    /// the caller aborts and rolls back.
    pub fn rehome_blocks(&self, old_volume_id: i64, excluded: &[i64]) -> Result<RehomeCounts> {
        let excluded_list = if excluded.is_empty() {
            "-1".to_string()
        } else {
            excluded
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };

        let target: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM block WHERE volume_id = ?1",
            [old_volume_id],
            |row| row.get(0),
        )?;

        let updated = self.conn().execute(
            &format!(
                "UPDATE block SET volume_id =
                   (SELECT MAX(d.volume_id) FROM duplicate_block d
                    WHERE d.block_id = block.id
                      AND d.volume_id NOT IN ({excluded_list})
                      AND d.volume_id != ?1)
                 WHERE volume_id = ?1
                   AND EXISTS (SELECT 1 FROM duplicate_block d2
                               WHERE d2.block_id = block.id
                                 AND d2.volume_id NOT IN ({excluded_list})
                                 AND d2.volume_id != ?1)"
            ),
            [old_volume_id],
        )?;

        // Remove the duplicate rows just promoted to primary homes.
        let promoted = self.conn().execute(
            "DELETE FROM duplicate_block
             WHERE (block_id, volume_id) IN
               (SELECT b.id, b.volume_id FROM block b
                JOIN duplicate_block d
                  ON d.block_id = b.id AND d.volume_id = b.volume_id)",
            [],
        )?;

        Ok(RehomeCounts {
            target: target as usize,
            updated,
            promoted,
        })
    }

    // ----- waste accounting -----

    /// Build the compaction report over all Blocks volumes.
    pub fn wasted_space_report(&self) -> Result<Vec<VolumeUsage>> {
        let mut stmt = self.conn().prepare(
            "SELECT rv.id, rv.name, COALESCE(rv.size, 0),
                    COALESCE((SELECT SUM(b.size) FROM block b WHERE b.volume_id = rv.id), 0),
                    COALESCE((SELECT SUM(d.size) FROM deleted_block d
                              WHERE d.volume_id = rv.id), 0),
                    (SELECT MIN(f.timestamp)
                     FROM fileset f
                     JOIN fileset_entry fe ON fe.fileset_id = f.id
                     JOIN file_lookup fl ON fl.id = fe.file_id
                     JOIN blockset_entry be ON be.blockset_id = fl.blockset_id
                     JOIN block b2 ON b2.id = be.block_id
                     WHERE b2.volume_id = rv.id)
             FROM remote_volume rv
             WHERE rv.type = 'dblock' AND rv.state IN ('Uploaded', 'Verified')
             ORDER BY rv.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(VolumeUsage {
                volume_id: row.get(0)?,
                name: row.get(1)?,
                compressed_size: row.get(2)?,
                data_size: row.get(3)?,
                wasted_size: row.get(4)?,
                oldest_fileset: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Deleted-block ledger rows for one volume.
    pub fn deleted_blocks_of_volume(&self, volume_id: i64) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT hash, size FROM deleted_block WHERE volume_id = ?1",
        )?;
        let rows = stmt.query_map([volume_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
