use rusqlite::params;

use cairn_types::block_hash::BlockHash;

use crate::error::{CairnError, Result};
use crate::hashing::HashAlgorithm;

use super::{Catalog, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};

impl Catalog {
    /// Check catalog invariants 1-5 plus blockset length/blocklist
    /// accounting. `strict` additionally recomputes every blocklist hash
    /// from the member block hashes.
    ///
    /// Any failure is a `DatabaseConsistency` error naming the first
    /// violation found.
    pub fn verify_consistency(
        &self,
        blocksize: u32,
        blockhash_size: usize,
        strict: bool,
    ) -> Result<()> {
        self.check_entries_reference_blocks()?;
        self.check_blocks_reference_volumes()?;
        self.check_volume_names_unique()?;
        self.check_fileset_volumes()?;
        self.check_blockset_accounting(blocksize)?;
        self.check_blocklist_counts(blocksize, blockhash_size)?;
        self.check_duplicate_blocks()?;
        self.check_file_blocksets()?;
        if strict {
            self.check_blocklist_hashes(blocksize, blockhash_size)?;
        }
        Ok(())
    }

    fn check_entries_reference_blocks(&self) -> Result<()> {
        let dangling: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blockset_entry be
             LEFT JOIN block b ON b.id = be.block_id
             WHERE b.id IS NULL",
            [],
            |row| row.get(0),
        )?;
        if dangling > 0 {
            return Err(CairnError::DatabaseConsistency(format!(
                "{dangling} blockset entries reference missing blocks"
            )));
        }
        Ok(())
    }

    fn check_blocks_reference_volumes(&self) -> Result<()> {
        // Invariant 1: a block's volume must exist and not be Deleted.
        let bad: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM block b
             LEFT JOIN remote_volume rv ON rv.id = b.volume_id
             WHERE rv.id IS NULL OR rv.state = 'Deleted'",
            [],
            |row| row.get(0),
        )?;
        if bad > 0 {
            return Err(CairnError::DatabaseConsistency(format!(
                "{bad} blocks reference missing or deleted volumes"
            )));
        }
        Ok(())
    }

    fn check_volume_names_unique(&self) -> Result<()> {
        let (total, distinct): (i64, i64) = self.conn().query_row(
            "SELECT COUNT(*), COUNT(DISTINCT name) FROM remote_volume",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if total != distinct {
            return Err(CairnError::DatabaseConsistency(format!(
                "{} duplicate remote volume names",
                total - distinct
            )));
        }
        Ok(())
    }

    fn check_fileset_volumes(&self) -> Result<()> {
        // Invariant 3: every fileset's volume is a live dlist volume.
        let bad: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM fileset f
             LEFT JOIN remote_volume rv ON rv.id = f.volume_id
             WHERE rv.id IS NULL OR rv.type != 'dlist'
                OR rv.state IN ('Deleted', 'Deleting')",
            [],
            |row| row.get(0),
        )?;
        if bad > 0 {
            return Err(CairnError::DatabaseConsistency(format!(
                "{bad} filesets reference missing, mistyped or deleted dlist volumes"
            )));
        }
        Ok(())
    }

    fn check_blockset_accounting(&self, blocksize: u32) -> Result<()> {
        // Invariant 4a: blockset length equals the sum of its block sizes.
        let bad_length: Option<i64> = {
            let mut stmt = self.conn().prepare(
                "SELECT bs.id FROM blockset bs
                 LEFT JOIN (SELECT be.blockset_id, SUM(b.size) AS total
                            FROM blockset_entry be JOIN block b ON b.id = be.block_id
                            GROUP BY be.blockset_id) agg ON agg.blockset_id = bs.id
                 WHERE bs.length != COALESCE(agg.total, 0)
                 LIMIT 1",
            )?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        if let Some(id) = bad_length {
            return Err(CairnError::DatabaseConsistency(format!(
                "blockset {id} length disagrees with its block sizes"
            )));
        }

        // Invariant 4b: every non-final block is exactly one blocksize.
        let short_interior: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blockset_entry be
             JOIN block b ON b.id = be.block_id
             WHERE b.size != ?1
               AND be.idx != (SELECT MAX(be2.idx) FROM blockset_entry be2
                              WHERE be2.blockset_id = be.blockset_id)",
            [blocksize as i64],
            |row| row.get(0),
        )?;
        if short_interior > 0 {
            return Err(CairnError::DatabaseConsistency(format!(
                "{short_interior} interior blocks are not exactly {blocksize} bytes"
            )));
        }

        let oversized: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM block WHERE size > ?1",
            [blocksize as i64],
            |row| row.get(0),
        )?;
        if oversized > 0 {
            return Err(CairnError::DatabaseConsistency(format!(
                "{oversized} blocks exceed the configured blocksize {blocksize}"
            )));
        }
        Ok(())
    }

    fn check_blocklist_counts(&self, blocksize: u32, blockhash_size: usize) -> Result<()> {
        let hashes_per_chunk = (blocksize as i64) / blockhash_size as i64;
        // Multi-block blocksets must carry ceil(count / hashes_per_chunk)
        // blocklist hashes; single-block and empty sets carry none.
        let mut stmt = self.conn().prepare(
            "SELECT bs.id,
                    COALESCE((SELECT COUNT(*) FROM blockset_entry be
                              WHERE be.blockset_id = bs.id), 0),
                    COALESCE((SELECT COUNT(*) FROM blocklist_hash bh
                              WHERE bh.blockset_id = bs.id), 0)
             FROM blockset bs",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (id, blocks, blocklists) = row?;
            let expected = if blocks <= 1 {
                0
            } else {
                (blocks + hashes_per_chunk - 1) / hashes_per_chunk
            };
            if blocklists != expected {
                return Err(CairnError::DatabaseConsistency(format!(
                    "blockset {id} has {blocklists} blocklist hashes, expected {expected} \
                     for {blocks} blocks"
                )));
            }
        }
        Ok(())
    }

    fn check_duplicate_blocks(&self) -> Result<()> {
        // Invariant 5: duplicate rows never reference a vanished volume.
        let bad: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM duplicate_block d
             LEFT JOIN remote_volume rv ON rv.id = d.volume_id
             WHERE rv.id IS NULL OR rv.state = 'Deleted'",
            [],
            |row| row.get(0),
        )?;
        if bad > 0 {
            return Err(CairnError::DatabaseConsistency(format!(
                "{bad} duplicate-block rows reference missing volumes"
            )));
        }
        Ok(())
    }

    fn check_file_blocksets(&self) -> Result<()> {
        let bad: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM file_lookup f
             WHERE f.blockset_id NOT IN (?1, ?2)
               AND f.blockset_id NOT IN (SELECT id FROM blockset)",
            params![FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID],
            |row| row.get(0),
        )?;
        if bad > 0 {
            return Err(CairnError::DatabaseConsistency(format!(
                "{bad} file entries reference missing blocksets"
            )));
        }
        Ok(())
    }

    /// Strict pass: recompute each blocklist hash from the raw hashes of
    /// its span of blocks.
    fn check_blocklist_hashes(&self, blocksize: u32, blockhash_size: usize) -> Result<()> {
        let hashes_per_chunk = (blocksize as usize) / blockhash_size;
        let algorithm = HashAlgorithm::Sha256;

        let blockset_ids: Vec<i64> = {
            let mut stmt = self
                .conn()
                .prepare("SELECT DISTINCT blockset_id FROM blocklist_hash")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        for blockset_id in blockset_ids {
            let blocks = self.blockset_blocks(blockset_id)?;
            let stored = self.blockset_blocklist_hashes(blockset_id)?;

            for (chunk_idx, span) in blocks.chunks(hashes_per_chunk).enumerate() {
                let mut concat = Vec::with_capacity(span.len() * blockhash_size);
                for entry in span {
                    let raw = BlockHash::from_base64(&entry.hash).ok_or_else(|| {
                        CairnError::DatabaseConsistency(format!(
                            "undecodable block hash in blockset {blockset_id}"
                        ))
                    })?;
                    concat.extend_from_slice(raw.as_bytes());
                }
                let computed = algorithm.digest(&concat).to_base64();
                match stored.get(chunk_idx) {
                    Some(stored_hash) if *stored_hash == computed => {}
                    Some(stored_hash) => {
                        return Err(CairnError::DatabaseConsistency(format!(
                            "blocklist hash mismatch for blockset {blockset_id} chunk \
                             {chunk_idx}: stored {stored_hash}, computed {computed}"
                        )));
                    }
                    None => {
                        return Err(CairnError::DatabaseConsistency(format!(
                            "missing blocklist hash for blockset {blockset_id} chunk {chunk_idx}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
