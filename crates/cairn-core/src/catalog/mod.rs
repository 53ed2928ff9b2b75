mod blocks;
mod filesets;
mod schema;
mod stats;
mod verify;
mod volumes;

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::config::Options;
use crate::error::{CairnError, Result};

pub use blocks::{BlockLocation, BlockRow};
pub use filesets::{FilesetRow, FilesetFileRow, PreviousFileInfo, RetentionCascade};
pub use stats::ChangeStatistics;
pub use volumes::{RehomeCounts, RemoteVolumeRow, VolumeUsage};

/// Sentinel blockset id marking a directory entry.
pub const FOLDER_BLOCKSET_ID: i64 = -100;
/// Sentinel blockset id marking a symlink entry.
pub const SYMLINK_BLOCKSET_ID: i64 = -200;

const CONFIG_PARTIAL_RECREATE: &str = "partial-recreate";

/// The local catalog: a single SQLite file indexing every block, fileset
/// and remote volume of one backup destination.
///
/// Mutations happen inside one long-lived write transaction per operation
/// phase (`begin` / `commit` / `rollback`); reads inside that transaction
/// see its writes. Only one process may hold the catalog open for write;
/// the destination-scoped operation lock enforces this.
pub struct Catalog {
    conn: Connection,
    path: PathBuf,
    in_tx: bool,
}

impl Catalog {
    /// Open the catalog at `path`, creating schema on first use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        schema::migrate(&conn)?;
        debug!(path = %path.display(), "opened catalog");
        Ok(Self {
            conn,
            path,
            in_tx: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ----- transactional batch -----

    pub fn begin(&mut self) -> Result<()> {
        if self.in_tx {
            return Err(CairnError::DatabaseConsistency(
                "nested catalog transaction".into(),
            ));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_tx = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.in_tx {
            return Err(CairnError::DatabaseConsistency(
                "commit outside a catalog transaction".into(),
            ));
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_tx = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_tx {
            return Err(CairnError::DatabaseConsistency(
                "rollback outside a catalog transaction".into(),
            ));
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.in_tx = false;
        Ok(())
    }

    /// Roll back if a transaction is still active. Used on error exits;
    /// failures are swallowed since the original error takes precedence.
    pub fn rollback_if_active(&mut self) {
        if self.in_tx {
            let _ = self.conn.execute_batch("ROLLBACK");
            self.in_tx = false;
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_tx
    }

    // ----- fixed configuration -----

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM configuration WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO configuration (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Persist the fixed per-destination settings on first backup.
    pub fn store_fixed_options(&self, opts: &Options) -> Result<()> {
        self.set_config("blocksize", &opts.blocksize.to_string())?;
        self.set_config("block-hash-algorithm", &opts.block_hash_algorithm)?;
        self.set_config("file-hash-algorithm", &opts.file_hash_algorithm)?;
        Ok(())
    }

    /// Verify that `opts` matches the fixed settings recorded at first
    /// backup. A mismatch would silently corrupt dedup identities.
    pub fn check_fixed_options(&self, opts: &Options) -> Result<()> {
        let checks: [(&str, String); 3] = [
            ("blocksize", opts.blocksize.to_string()),
            ("block-hash-algorithm", opts.block_hash_algorithm.clone()),
            ("file-hash-algorithm", opts.file_hash_algorithm.clone()),
        ];
        for (key, expected) in checks {
            if let Some(stored) = self.get_config(key)? {
                if stored != expected {
                    return Err(CairnError::UserInformation(format!(
                        "option '{key}' is fixed at '{stored}' for this destination \
                         (got '{expected}')"
                    )));
                }
            }
        }
        Ok(())
    }

    // ----- partial recreate marker -----

    pub fn mark_partially_recreated(&self) -> Result<()> {
        self.set_config(CONFIG_PARTIAL_RECREATE, "1")
    }

    pub fn clear_partially_recreated(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM configuration WHERE key = ?1",
            [CONFIG_PARTIAL_RECREATE],
        )?;
        Ok(())
    }

    pub fn is_partially_recreated(&self) -> Result<bool> {
        Ok(self.get_config(CONFIG_PARTIAL_RECREATE)?.is_some())
    }

    /// Guard used by operations that refuse to run on an incomplete
    /// catalog (backup, purge-broken-files).
    pub fn require_complete(&self) -> Result<()> {
        if self.is_partially_recreated()? {
            return Err(CairnError::PartialRecreate);
        }
        Ok(())
    }

    // ----- scratch tables -----

    /// Name for a per-operation scratch table: base plus a random suffix.
    /// Callers must drop it on every exit path.
    pub fn temp_table_name(&self, base: &str) -> String {
        format!("{base}_{:016x}", rand::random::<u64>())
    }

    pub fn drop_temp_table(&self, name: &str) {
        // Best effort: the table may not have been created yet.
        let _ = self
            .conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {name}"));
    }

    // ----- change journal cursors -----

    pub fn set_change_journal(
        &self,
        fileset_id: i64,
        volume: &str,
        journal_id: i64,
        next_usn: i64,
        config_hash: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO change_journal_data
               (fileset_id, volume, journal_id, next_usn, config_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(fileset_id, volume) DO UPDATE SET
               journal_id = excluded.journal_id,
               next_usn = excluded.next_usn,
               config_hash = excluded.config_hash",
            rusqlite::params![fileset_id, volume, journal_id, next_usn, config_hash],
        )?;
        Ok(())
    }

    pub fn get_change_journal(
        &self,
        fileset_id: i64,
        volume: &str,
    ) -> Result<Option<(i64, i64, String)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT journal_id, next_usn, config_hash
                 FROM change_journal_data WHERE fileset_id = ?1 AND volume = ?2",
                rusqlite::params![fileset_id, volume],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?)
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        self.rollback_if_active();
    }
}
