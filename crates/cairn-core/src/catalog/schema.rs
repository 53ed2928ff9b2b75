use rusqlite::Connection;

use crate::error::Result;

/// Current schema version, stored in the `configuration` table.
pub const SCHEMA_VERSION: i64 = 1;

/// Create all tables and indexes. Idempotent.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=FULL;

        CREATE TABLE IF NOT EXISTS configuration (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS remote_volume (
          id INTEGER PRIMARY KEY,
          name TEXT NOT NULL UNIQUE,
          type TEXT NOT NULL,
          state TEXT NOT NULL,
          size INTEGER,
          hash TEXT,
          delete_grace_until INTEGER
        );
        CREATE INDEX IF NOT EXISTS remote_volume_state ON remote_volume (state);

        CREATE TABLE IF NOT EXISTS block (
          id INTEGER PRIMARY KEY,
          hash TEXT NOT NULL,
          size INTEGER NOT NULL,
          volume_id INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS block_hash_size ON block (hash, size);
        CREATE INDEX IF NOT EXISTS block_volume ON block (volume_id);

        CREATE TABLE IF NOT EXISTS blockset (
          id INTEGER PRIMARY KEY,
          length INTEGER NOT NULL,
          full_hash TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS blockset_hash_length
          ON blockset (full_hash, length);

        CREATE TABLE IF NOT EXISTS blockset_entry (
          blockset_id INTEGER NOT NULL,
          idx INTEGER NOT NULL,
          block_id INTEGER NOT NULL,
          PRIMARY KEY (blockset_id, idx)
        );
        CREATE INDEX IF NOT EXISTS blockset_entry_block ON blockset_entry (block_id);

        CREATE TABLE IF NOT EXISTS blocklist_hash (
          blockset_id INTEGER NOT NULL,
          idx INTEGER NOT NULL,
          hash TEXT NOT NULL,
          PRIMARY KEY (blockset_id, idx)
        );
        CREATE INDEX IF NOT EXISTS blocklist_hash_hash ON blocklist_hash (hash);

        CREATE TABLE IF NOT EXISTS metadataset (
          id INTEGER PRIMARY KEY,
          blockset_id INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS metadataset_blockset ON metadataset (blockset_id);

        CREATE TABLE IF NOT EXISTS path_prefix (
          id INTEGER PRIMARY KEY,
          prefix TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS file_lookup (
          id INTEGER PRIMARY KEY,
          prefix_id INTEGER NOT NULL,
          path TEXT NOT NULL,
          blockset_id INTEGER NOT NULL,
          metadata_id INTEGER
        );
        CREATE UNIQUE INDEX IF NOT EXISTS file_lookup_identity
          ON file_lookup (prefix_id, path, blockset_id, COALESCE(metadata_id, -1));

        CREATE TABLE IF NOT EXISTS fileset (
          id INTEGER PRIMARY KEY,
          timestamp INTEGER NOT NULL UNIQUE,
          volume_id INTEGER NOT NULL,
          is_full_backup INTEGER NOT NULL DEFAULT 0,
          is_partial INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS fileset_entry (
          fileset_id INTEGER NOT NULL,
          file_id INTEGER NOT NULL,
          last_modified INTEGER NOT NULL,
          PRIMARY KEY (fileset_id, file_id)
        );
        CREATE INDEX IF NOT EXISTS fileset_entry_file ON fileset_entry (file_id);

        CREATE TABLE IF NOT EXISTS index_block_link (
          index_volume_id INTEGER NOT NULL,
          block_volume_id INTEGER NOT NULL,
          PRIMARY KEY (index_volume_id, block_volume_id)
        );
        CREATE INDEX IF NOT EXISTS index_block_link_block
          ON index_block_link (block_volume_id);

        CREATE TABLE IF NOT EXISTS duplicate_block (
          block_id INTEGER NOT NULL,
          volume_id INTEGER NOT NULL,
          PRIMARY KEY (block_id, volume_id)
        );
        CREATE INDEX IF NOT EXISTS duplicate_block_volume ON duplicate_block (volume_id);

        CREATE TABLE IF NOT EXISTS deleted_block (
          id INTEGER PRIMARY KEY,
          hash TEXT NOT NULL,
          size INTEGER NOT NULL,
          volume_id INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS deleted_block_volume ON deleted_block (volume_id);

        CREATE TABLE IF NOT EXISTS change_journal_data (
          fileset_id INTEGER NOT NULL,
          volume TEXT NOT NULL,
          journal_id INTEGER NOT NULL,
          next_usn INTEGER NOT NULL,
          config_hash TEXT NOT NULL,
          PRIMARY KEY (fileset_id, volume)
        );
        "#,
    )?;
    Ok(())
}
