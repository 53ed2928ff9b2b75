use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

pub const DEFAULT_BLOCKSIZE: u32 = 100 * 1024;
pub const DEFAULT_VOLUME_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_DELETE_GRACE_SECS: i64 = 2 * 60 * 60;
pub const DEFAULT_RESTORE_CHANNEL_BUFFER: usize = 64;

/// How symlinks encountered during enumeration are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymlinkPolicy {
    /// Record the symlink itself (target string in metadata).
    Store,
    /// Descend into the target as if it were a plain directory/file.
    Follow,
    /// Skip symlinks entirely.
    Ignore,
}

/// How hardlinked files are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardlinkPolicy {
    /// Every path is stored as an independent file.
    All,
    /// Only the first path for an inode is stored; later ones are skipped.
    First,
    /// Hardlinked files are skipped entirely.
    None,
}

/// Whether to acquire a filesystem snapshot (VSS/LVM) before enumerating.
/// The snapshot providers themselves are external collaborators; a build
/// without one refuses `Required`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    Off,
    Auto,
    Required,
}

/// Whether to consult the Windows USN change journal for cheap change
/// detection. The journal reader is an external collaborator; the catalog
/// only stores its cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsnPolicy {
    Off,
    Auto,
    Required,
}

/// Bucketed keep rules applied newest-first, borg-style.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_within: Option<String>,
    pub keep_last: Option<usize>,
    pub keep_hourly: Option<usize>,
    pub keep_daily: Option<usize>,
    pub keep_weekly: Option<usize>,
    pub keep_monthly: Option<usize>,
    pub keep_yearly: Option<usize>,
}

impl RetentionPolicy {
    pub fn has_any_rule(&self) -> bool {
        self.keep_within.is_some()
            || self.keep_last.is_some()
            || self.keep_hourly.is_some()
            || self.keep_daily.is_some()
            || self.keep_weekly.is_some()
            || self.keep_monthly.is_some()
            || self.keep_yearly.is_some()
    }
}

/// Worker counts for the fan-out stages of the two pipelines.
///
/// Backup uses `block_hashers` (stream splitter / hashing workers) and
/// `compressors` (volume transform + upload threads). Restore uses
/// `downloaders`, `decryptors`, `decompressors` and `file_processors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concurrency {
    pub block_hashers: usize,
    pub compressors: usize,
    pub file_processors: usize,
    pub downloaders: usize,
    pub decryptors: usize,
    pub decompressors: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            block_hashers: 2,
            compressors: 2,
            file_processors: 2,
            downloaders: 2,
            decryptors: 1,
            decompressors: 1,
        }
    }
}

/// Complete option set for one operation against one destination.
///
/// `blocksize` and the hash algorithm names are fixed per destination: the
/// values used by the first backup are persisted in the catalog and every
/// later open must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Remote filename prefix (`<prefix>-<timestamp>-<guid>...`).
    pub prefix: String,
    /// Fixed block size in bytes; the last block of a blockset may be short.
    pub blocksize: u32,
    pub block_hash_algorithm: String,
    pub file_hash_algorithm: String,
    /// Target payload size of a Blocks volume before it is finalized.
    pub volume_size: u64,

    /// Drop filesets older than this duration (e.g. "30d", "12h").
    pub keep_time: Option<String>,
    /// Keep only the newest N filesets.
    pub keep_versions: Option<usize>,
    pub retention_policy: Option<RetentionPolicy>,

    /// Wasted-space percentage that classifies a Blocks volume as compactable.
    pub threshold: u32,
    /// Volumes at or below this compressed size count as "small".
    pub small_file_size: u64,
    /// More small volumes than this triggers compaction.
    pub max_small_volume_count: usize,

    pub concurrency: Concurrency,
    pub restore_channel_buffer_size: usize,

    pub symlink_policy: SymlinkPolicy,
    pub hardlink_policy: HardlinkPolicy,
    pub snapshot_policy: SnapshotPolicy,
    pub usn_policy: UsnPolicy,
    /// Glob patterns excluded from enumeration.
    pub exclude_filters: Vec<String>,
    /// Skip files whose unix mode matches any of these bits (e.g. sticky).
    pub file_attribute_filter: u32,
    pub skip_files_larger_than: Option<u64>,

    /// Select the single-threaded patching restore instead of the
    /// pipelined one.
    pub restore_legacy: bool,
    /// Plan and log everything, upload and mutate nothing.
    pub dryrun: bool,
    /// Skip the post-operation remote listing verification.
    pub no_backend_verification: bool,
    /// Remove unexpected remote leftovers instead of erroring.
    pub auto_cleanup: bool,
    /// Run repair automatically when the remote and catalog disagree.
    pub auto_repair: bool,
    pub disable_filelist_consistency_checks: bool,
    /// During `test`, hash every block inside sampled dblock volumes.
    pub full_block_verification: bool,
    /// During restore, scan the original source paths for reusable blocks.
    pub use_local_blocks: bool,
    /// Overwrite existing target files instead of renaming on conflict.
    pub overwrite: bool,
    pub perform_restored_file_verification: bool,

    pub passphrase: Option<String>,
    pub retry_attempts: u32,
    /// Base delay between remote retries, in milliseconds.
    pub retry_delay_ms: u64,
    /// Grace window before a Deleting volume may transition to Deleted.
    pub delete_grace_secs: i64,
    /// Override for the system temp directory.
    pub tempdir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            prefix: "cairn".into(),
            blocksize: DEFAULT_BLOCKSIZE,
            block_hash_algorithm: "sha256".into(),
            file_hash_algorithm: "sha256".into(),
            volume_size: DEFAULT_VOLUME_SIZE,
            keep_time: None,
            keep_versions: None,
            retention_policy: None,
            threshold: 25,
            small_file_size: DEFAULT_VOLUME_SIZE / 20,
            max_small_volume_count: 20,
            concurrency: Concurrency::default(),
            restore_channel_buffer_size: DEFAULT_RESTORE_CHANNEL_BUFFER,
            symlink_policy: SymlinkPolicy::Store,
            hardlink_policy: HardlinkPolicy::All,
            snapshot_policy: SnapshotPolicy::Off,
            usn_policy: UsnPolicy::Off,
            exclude_filters: Vec::new(),
            file_attribute_filter: 0,
            skip_files_larger_than: None,
            restore_legacy: false,
            dryrun: false,
            no_backend_verification: false,
            auto_cleanup: false,
            auto_repair: false,
            disable_filelist_consistency_checks: false,
            full_block_verification: false,
            use_local_blocks: false,
            overwrite: false,
            perform_restored_file_verification: false,
            passphrase: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: 500,
            delete_grace_secs: DEFAULT_DELETE_GRACE_SECS,
            tempdir: None,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.blocksize < 1024 {
            return Err(CairnError::UserInformation(format!(
                "blocksize {} is below the 1 KiB minimum",
                self.blocksize
            )));
        }
        if self.volume_size < self.blocksize as u64 {
            return Err(CairnError::UserInformation(format!(
                "volume_size {} is smaller than blocksize {}",
                self.volume_size, self.blocksize
            )));
        }
        if self.threshold > 100 {
            return Err(CairnError::UserInformation(format!(
                "threshold {}% is not a percentage",
                self.threshold
            )));
        }
        if self.concurrency.block_hashers == 0 || self.concurrency.downloaders == 0 {
            return Err(CairnError::UserInformation(
                "concurrency settings must be at least 1".into(),
            ));
        }
        crate::hashing::HashAlgorithm::parse(&self.block_hash_algorithm)?;
        crate::hashing::HashAlgorithm::parse(&self.file_hash_algorithm)?;
        Ok(())
    }

    /// True if a successful backup should be followed by retention +
    /// compaction.
    pub fn has_retention(&self) -> bool {
        self.keep_time.is_some()
            || self.keep_versions.is_some()
            || self
                .retention_policy
                .as_ref()
                .is_some_and(RetentionPolicy::has_any_rule)
    }

    /// Number of raw hashes that fit into one blocklist block.
    pub fn hashes_per_blocklist(&self, hash_len: usize) -> usize {
        (self.blocksize as usize) / hash_len
    }
}
