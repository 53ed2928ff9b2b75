use rusqlite::{params, OptionalExtension};

use cairn_types::block_hash::BlockHash;

use crate::error::{CairnError, Result};

use super::Catalog;

/// A catalog block row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub id: i64,
    pub hash: String,
    pub size: i64,
    pub volume_id: i64,
}

/// (block, position) pair used when planning restores.
#[derive(Debug, Clone)]
pub struct BlockLocation {
    pub block_id: i64,
    pub hash: String,
    pub size: i64,
    pub volume_id: i64,
    pub index: i64,
}

impl Catalog {
    /// Idempotent block registration: the single serialization point for
    /// concurrent dedup. Returns `(block_id, is_new)`; a new block is
    /// bound to `volume_id`, the currently open Blocks volume.
    pub fn register_block(
        &self,
        hash: &BlockHash,
        size: i64,
        volume_id: i64,
    ) -> Result<(i64, bool)> {
        let encoded = hash.to_base64();
        if let Some(id) = self
            .conn()
            .query_row(
                "SELECT id FROM block WHERE hash = ?1 AND size = ?2",
                params![encoded, size],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok((id, false));
        }
        self.conn().execute(
            "INSERT INTO block (hash, size, volume_id) VALUES (?1, ?2, ?3)",
            params![encoded, size, volume_id],
        )?;
        Ok((self.conn().last_insert_rowid(), true))
    }

    pub fn find_block(&self, hash: &BlockHash, size: i64) -> Result<Option<BlockRow>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, hash, size, volume_id FROM block
                 WHERE hash = ?1 AND size = ?2",
                params![hash.to_base64(), size],
                |row| {
                    Ok(BlockRow {
                        id: row.get(0)?,
                        hash: row.get(1)?,
                        size: row.get(2)?,
                        volume_id: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Idempotent blockset registration, keyed by (full_hash, length).
    /// Returns `(blockset_id, is_new)`; entries are recorded in the order
    /// given, which is the byte order of the reconstructed stream.
    pub fn register_blockset(
        &self,
        full_hash: &BlockHash,
        length: i64,
        block_ids: &[i64],
    ) -> Result<(i64, bool)> {
        let encoded = full_hash.to_base64();
        if let Some(id) = self
            .conn()
            .query_row(
                "SELECT id FROM blockset WHERE full_hash = ?1 AND length = ?2",
                params![encoded, length],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok((id, false));
        }

        self.assert_blocks_exist(block_ids)?;
        self.conn().execute(
            "INSERT INTO blockset (length, full_hash) VALUES (?1, ?2)",
            params![length, encoded],
        )?;
        let blockset_id = self.conn().last_insert_rowid();

        let mut stmt = self.conn().prepare_cached(
            "INSERT INTO blockset_entry (blockset_id, idx, block_id) VALUES (?1, ?2, ?3)",
        )?;
        for (idx, block_id) in block_ids.iter().enumerate() {
            stmt.execute(params![blockset_id, idx as i64, block_id])?;
        }
        Ok((blockset_id, true))
    }

    /// Record the blocklist hashes of a long blockset, in span order.
    pub fn register_blocklist_hashes(
        &self,
        blockset_id: i64,
        hashes: &[BlockHash],
    ) -> Result<()> {
        let mut stmt = self.conn().prepare_cached(
            "INSERT OR IGNORE INTO blocklist_hash (blockset_id, idx, hash)
             VALUES (?1, ?2, ?3)",
        )?;
        for (idx, hash) in hashes.iter().enumerate() {
            stmt.execute(params![blockset_id, idx as i64, hash.to_base64()])?;
        }
        Ok(())
    }

    /// Metadataset indirection, deduplicated on the underlying blockset.
    pub fn register_metadataset(&self, blockset_id: i64) -> Result<i64> {
        if let Some(id) = self
            .conn()
            .query_row(
                "SELECT id FROM metadataset WHERE blockset_id = ?1",
                [blockset_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(id);
        }
        self.conn().execute(
            "INSERT INTO metadataset (blockset_id) VALUES (?1)",
            [blockset_id],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn blockset_length_and_hash(&self, blockset_id: i64) -> Result<(i64, String)> {
        Ok(self.conn().query_row(
            "SELECT length, full_hash FROM blockset WHERE id = ?1",
            [blockset_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }

    /// Ordered (hash, size, volume_id, block_id) tuples of a blockset.
    pub fn blockset_blocks(&self, blockset_id: i64) -> Result<Vec<BlockLocation>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT b.id, b.hash, b.size, b.volume_id, be.idx
             FROM blockset_entry be JOIN block b ON b.id = be.block_id
             WHERE be.blockset_id = ?1 ORDER BY be.idx",
        )?;
        let rows = stmt.query_map([blockset_id], |row| {
            Ok(BlockLocation {
                block_id: row.get(0)?,
                hash: row.get(1)?,
                size: row.get(2)?,
                volume_id: row.get(3)?,
                index: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Blocklist hashes of a blockset in span order (empty for short sets).
    pub fn blockset_blocklist_hashes(&self, blockset_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT hash FROM blocklist_hash WHERE blockset_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt.query_map([blockset_id], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// All blocks currently homed in a volume.
    pub fn blocks_in_volume(&self, volume_id: i64) -> Result<Vec<BlockRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT id, hash, size, volume_id FROM block WHERE volume_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([volume_id], |row| {
            Ok(BlockRow {
                id: row.get(0)?,
                hash: row.get(1)?,
                size: row.get(2)?,
                volume_id: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Reassign every block in `volume_id` to `new_volume_id`. Used when a
    /// failed upload rolls a Temporary volume back and its blocks move to
    /// a fresh replacement volume.
    pub fn reassign_volume_blocks(&self, volume_id: i64, new_volume_id: i64) -> Result<usize> {
        Ok(self.conn().execute(
            "UPDATE block SET volume_id = ?2 WHERE volume_id = ?1",
            params![volume_id, new_volume_id],
        )?)
    }

    /// Move a block's catalog row into the deleted-block ledger. The bytes
    /// remain in the volume until it is compacted or deleted (invariant 6).
    pub fn record_deleted_block(&self, hash: &str, size: i64, volume_id: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO deleted_block (hash, size, volume_id) VALUES (?1, ?2, ?3)",
            params![hash, size, volume_id],
        )?;
        Ok(())
    }

    /// Whether a hash is referenced as a blocklist anywhere. Blocklist
    /// blocks are live even though no BlocksetEntry references them.
    pub fn is_blocklist_hash(&self, hash: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blocklist_hash WHERE hash = ?1",
            [hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Total number of catalog blocks.
    pub fn block_count(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM block", [], |row| row.get(0))?)
    }

    /// Consistency helper: a blockset id must exist or be a sentinel.
    pub fn blockset_exists(&self, blockset_id: i64) -> Result<bool> {
        if blockset_id == super::FOLDER_BLOCKSET_ID || blockset_id == super::SYMLINK_BLOCKSET_ID {
            return Ok(true);
        }
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blockset WHERE id = ?1",
            [blockset_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Look up a blockset by its full hash and length.
    pub fn find_blockset(&self, full_hash: &str, length: i64) -> Result<Option<i64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id FROM blockset WHERE full_hash = ?1 AND length = ?2",
                params![full_hash, length],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Fail unless every listed block id exists (used by register paths
    /// that accept caller-supplied ids).
    pub fn assert_blocks_exist(&self, block_ids: &[i64]) -> Result<()> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT COUNT(*) FROM block WHERE id = ?1")?;
        for id in block_ids {
            let count: i64 = stmt.query_row([id], |row| row.get(0))?;
            if count == 0 {
                return Err(CairnError::DatabaseConsistency(format!(
                    "blockset references missing block id {id}"
                )));
            }
        }
        Ok(())
    }
}
