use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cairn",
    version,
    about = "Deduplicating, encrypted, versioned backups to untrusted remotes",
    after_help = "\
Environment variables:
  CAIRN_PASSPHRASE  Destination passphrase (instead of --passphrase)
  TMPDIR            Temporary file location (30-day stale sweep applies)"
)]
pub(crate) struct Cli {
    /// Backup destination (a local directory; remote transports plug in
    /// behind the same interface)
    #[arg(short, long, global = true)]
    pub destination: Option<String>,

    /// Path to the local catalog file (default: derived from destination)
    #[arg(long, global = true)]
    pub catalog: Option<String>,

    /// Remote filename prefix
    #[arg(long, global = true, default_value = "cairn")]
    pub prefix: String,

    /// Block size in KiB
    #[arg(long, global = true)]
    pub blocksize_kib: Option<u32>,

    /// Target volume size in MiB
    #[arg(long, global = true)]
    pub volume_size_mib: Option<u64>,

    /// Destination passphrase (prefer CAIRN_PASSPHRASE)
    #[arg(long, global = true)]
    pub passphrase: Option<String>,

    /// Plan and log everything, change nothing
    #[arg(long, global = true)]
    pub dryrun: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Back up sources into a new version
    Backup {
        /// Paths to back up
        #[arg(required = true)]
        sources: Vec<String>,

        /// Exclude glob patterns (repeatable)
        #[arg(long = "exclude")]
        excludes: Vec<String>,

        /// Skip files larger than this many bytes
        #[arg(long)]
        skip_files_larger_than: Option<u64>,

        /// Keep only the newest N versions after a successful backup
        #[arg(long)]
        keep_versions: Option<usize>,

        /// Drop versions older than this (e.g. "30d", "12h")
        #[arg(long)]
        keep_time: Option<String>,

        /// Skip the post-backup remote listing verification
        #[arg(long)]
        no_backend_verification: bool,
    },

    /// Restore files from a version
    Restore {
        /// Glob patterns selecting files (all when omitted)
        paths: Vec<String>,

        /// Version to restore (0 = newest)
        #[arg(long, default_value_t = 0)]
        version: usize,

        /// Directory to restore into (original locations when omitted)
        #[arg(long)]
        restore_path: Option<String>,

        /// Overwrite existing files instead of renaming on conflict
        #[arg(long)]
        overwrite: bool,

        /// Use the single-threaded restore implementation
        #[arg(long)]
        legacy: bool,

        /// Scan original source paths for reusable blocks
        #[arg(long)]
        use_local_blocks: bool,

        /// Hash every restored file end-to-end afterwards
        #[arg(long)]
        verify: bool,
    },

    /// Delete versions by index, or apply the configured retention rules
    Delete {
        /// Version indices to delete (0 = newest)
        #[arg(long = "version")]
        versions: Vec<usize>,

        /// Keep only the newest N versions
        #[arg(long)]
        keep_versions: Option<usize>,

        /// Drop versions older than this
        #[arg(long)]
        keep_time: Option<String>,
    },

    /// Reclaim wasted space in remote volumes
    Compact {
        /// Compact even when no trigger threshold is crossed
        #[arg(long)]
        force: bool,
    },

    /// Download and verify a sample of remote volumes
    Test {
        /// Number of volumes to sample
        #[arg(default_value_t = 1)]
        samples: usize,

        /// Hash every block inside sampled volumes
        #[arg(long)]
        full_block_verification: bool,
    },

    /// Rebuild the catalog from the remote, or reconcile divergence
    Repair,

    /// List versions, or the files of one version
    List {
        /// Show files of this version instead of the version list
        #[arg(long)]
        version: Option<usize>,

        /// Glob filter for file listings
        #[arg(long)]
        filter: Option<String>,
    },

    /// List files that depend on missing remote volumes
    ListBroken,

    /// Remove files that depend on missing remote volumes
    PurgeBrokenFiles,

    /// Show which versions and files depend on the named remote volumes
    ListAffected {
        /// Remote volume names
        #[arg(required = true)]
        targets: Vec<String>,
    },
}
