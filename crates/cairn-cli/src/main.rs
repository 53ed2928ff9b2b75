mod cli;
mod signal;

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use chrono::{TimeZone, Utc};
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing::error;

use cairn_core::config::Options;
use cairn_core::ops::{self, OperationContext};
use cairn_core::restore::RestoreRequest;
use cairn_core::storage::local_backend::LocalBackend;
use cairn_types::error::CairnError;

use cli::{Cli, Commands};

/// Exit codes of the operation surface.
const EXIT_OK: i32 = 0;
const EXIT_WARNINGS: i32 = 1;
const EXIT_ERRORS: i32 = 2;
const EXIT_CANCELLED: i32 = 50;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    signal::install_signal_handlers();
    let code = run(cli).unwrap_or_else(|e| {
        error!("{e}");
        e.exit_code()
    });
    std::process::exit(code);
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Default catalog location: one file per destination under the user's
/// data directory, keyed by a digest of the destination path.
fn default_catalog_path(destination: &str) -> PathBuf {
    let digest = Sha256::digest(destination.as_bytes());
    let key: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("cairn").join(format!("{key}.sqlite"))
}

fn build_options(cli: &Cli) -> Options {
    let mut options = Options {
        prefix: cli.prefix.clone(),
        dryrun: cli.dryrun,
        ..Options::default()
    };
    if let Some(kib) = cli.blocksize_kib {
        options.blocksize = kib * 1024;
    }
    if let Some(mib) = cli.volume_size_mib {
        options.volume_size = mib * 1024 * 1024;
    }
    options.passphrase = cli
        .passphrase
        .clone()
        .or_else(|| std::env::var("CAIRN_PASSPHRASE").ok());
    if let Ok(tmp) = std::env::var("TMPDIR") {
        options.tempdir = Some(PathBuf::from(tmp));
    }
    options
}

fn run(cli: Cli) -> Result<i32, CairnError> {
    let destination = cli.destination.clone().ok_or_else(|| {
        CairnError::UserInformation("--destination is required".into())
    })?;
    let catalog_path = cli
        .catalog
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_catalog_path(&destination));
    let mut options = build_options(&cli);
    let backend = LocalBackend::new(destination.as_str())?;
    // SIGINT/SIGTERM flip this token; operations stop at their next
    // checkpoint.
    let cancel = &signal::SHUTDOWN;

    match cli.command {
        Commands::Backup {
            sources,
            excludes,
            skip_files_larger_than,
            keep_versions,
            keep_time,
            no_backend_verification,
        } => {
            options.exclude_filters = excludes;
            options.skip_files_larger_than = skip_files_larger_than;
            options.keep_versions = keep_versions;
            options.keep_time = keep_time;
            options.no_backend_verification = no_backend_verification;
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let source_paths: Vec<PathBuf> = sources.iter().map(PathBuf::from).collect();
            let result = ops::backup(&ctx, &source_paths, cancel)?;
            println!(
                "Backed up {} files ({} examined, {} carried forward, {} new blocks, {} bytes)",
                result.files_added,
                result.files_examined,
                result.files_carried_forward,
                result.blocks_added,
                result.bytes_added,
            );
            if let Some(stats) = &result.change_stats {
                println!(
                    "Changes: +{} ~{} -{} files",
                    stats.added_files, stats.modified_files, stats.deleted_files
                );
            }
            if result.partial {
                println!("Backup was cancelled; version recorded as partial");
            }
            Ok(if result.partial && signal::SHUTDOWN.load(Ordering::SeqCst) {
                EXIT_CANCELLED
            } else if result.soft_errors > 0 || result.partial {
                EXIT_WARNINGS
            } else {
                EXIT_OK
            })
        }

        Commands::Restore {
            paths,
            version,
            restore_path,
            overwrite,
            legacy,
            use_local_blocks,
            verify,
        } => {
            options.overwrite = overwrite;
            options.restore_legacy = legacy;
            options.use_local_blocks = use_local_blocks;
            options.perform_restored_file_verification = verify;
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let request = RestoreRequest {
                paths,
                version: Some(version),
                time: None,
                restore_dir: restore_path.map(PathBuf::from),
            };
            let result = ops::restore(&ctx, &request, cancel)?;
            println!(
                "Restored {} files ({} bytes, {} verified, {} reused local blocks)",
                result.files_restored,
                result.bytes_restored,
                result.files_verified,
                result.blocks_reused_locally,
            );
            for path in &result.broken_files {
                println!("broken: {path}");
            }
            Ok(if result.files_failed > 0 || result.warnings > 0 {
                EXIT_WARNINGS
            } else {
                EXIT_OK
            })
        }

        Commands::Delete {
            versions,
            keep_versions,
            keep_time,
        } => {
            options.keep_versions = keep_versions;
            options.keep_time = keep_time;
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let stats = ops::delete(&ctx, &versions)?;
            println!(
                "Deleted {} versions ({} blocks marked as waste)",
                stats.filesets_deleted, stats.cascade.blocks_marked_deleted
            );
            Ok(EXIT_OK)
        }

        Commands::Compact { force } => {
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let stats = ops::compact(&ctx, force)?;
            if stats.triggered {
                println!(
                    "Compacted {} volumes into {} ({} blocks moved, {} bytes reclaimed)",
                    stats.volumes_rewritten,
                    stats.new_volumes,
                    stats.blocks_moved,
                    stats.wasted_reclaimed,
                );
            } else {
                println!("No compaction needed");
            }
            Ok(EXIT_OK)
        }

        Commands::Test {
            samples,
            full_block_verification,
        } => {
            options.full_block_verification = full_block_verification;
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let result = ops::test::run_test(&ctx, samples)?;
            for name in &result.verified {
                println!("ok: {name}");
            }
            for (name, reason) in &result.failed {
                println!("FAILED: {name}: {reason}");
            }
            Ok(if result.is_clean() { EXIT_OK } else { EXIT_ERRORS })
        }

        Commands::Repair => {
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let result = ops::repair(&ctx)?;
            println!(
                "Repair complete: {} filesets, {} volumes, {} blocks{}",
                result.filesets_recreated,
                result.volumes_registered,
                result.blocks_registered,
                if result.partial {
                    " (PARTIAL: remote set incomplete)"
                } else {
                    ""
                },
            );
            Ok(if result.partial { EXIT_WARNINGS } else { EXIT_OK })
        }

        Commands::List { version, filter } => {
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            if version.is_some() || filter.is_some() {
                for file in ops::list::list_files(&ctx, version, filter.as_deref())? {
                    println!("{:>12}  {}", file.size, file.path);
                }
            } else {
                for info in ops::list::list_versions(&ctx)? {
                    let when = Utc
                        .timestamp_opt(info.timestamp, 0)
                        .single()
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| info.timestamp.to_string());
                    println!(
                        "{:>3}  {}  {:>8} files  {:>12} bytes{}{}",
                        info.version,
                        when,
                        info.file_count,
                        info.total_bytes,
                        if info.is_full_backup { "  full" } else { "" },
                        if info.is_partial { "  PARTIAL" } else { "" },
                    );
                }
            }
            Ok(EXIT_OK)
        }

        Commands::ListBroken => {
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let broken = ops::list::list_broken(&ctx)?;
            for file in &broken {
                println!("fileset {}: {}", file.fileset_id, file.path);
            }
            Ok(if broken.is_empty() { EXIT_OK } else { EXIT_WARNINGS })
        }

        Commands::PurgeBrokenFiles => {
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let result = ops::purge::purge_broken_files(&ctx)?;
            println!(
                "Purged {} files, rewrote {} filesets",
                result.files_purged, result.filesets_rewritten
            );
            Ok(EXIT_OK)
        }

        Commands::ListAffected { targets } => {
            let ctx = OperationContext::new(&backend, &catalog_path, &options);
            let report = ops::list::list_affected(&ctx, &targets)?;
            for fileset in &report.filesets {
                println!("fileset {fileset}: version manifest");
            }
            for (fileset, files) in &report.files {
                for path in files {
                    println!("fileset {fileset}: {path}");
                }
            }
            Ok(EXIT_OK)
        }
    }
}
