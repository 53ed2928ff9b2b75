use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use crate::config::Options;
use crate::ops::{self, OperationContext};
use crate::restore::RestoreRequest;
use crate::testutil::{
    assert_trees_equal, build_source_tree, test_options, MemoryBackend,
};

struct Fixture {
    _dirs: Vec<tempfile::TempDir>,
    backend: MemoryBackend,
    catalog_path: PathBuf,
    source: PathBuf,
    restore_dir: PathBuf,
    options: Options,
}

fn fixture() -> Fixture {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    let restore_dir = work.path().join("restored");
    Fixture {
        catalog_path: work.path().join("catalog.sqlite"),
        source,
        restore_dir,
        _dirs: vec![work],
        backend: MemoryBackend::new(),
        options: test_options(),
    }
}

impl Fixture {
    fn ctx(&self) -> OperationContext<'_> {
        OperationContext::new(&self.backend, &self.catalog_path, &self.options)
    }

    fn backup(&self) -> crate::backup::BackupResult {
        ops::backup(&self.ctx(), &[self.source.clone()], &AtomicBool::new(false)).unwrap()
    }

    fn restore_version(&self, version: usize, dest: &std::path::Path) {
        let request = RestoreRequest {
            version: Some(version),
            restore_dir: Some(dest.to_path_buf()),
            ..RestoreRequest::default()
        };
        ops::restore(&self.ctx(), &request, &AtomicBool::new(false)).unwrap();
    }

    fn volume_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for entry in crate::storage::StorageBackend::list(&self.backend).unwrap() {
            if entry.name.contains(".dblock.") {
                counts.0 += 1;
            } else if entry.name.contains(".dindex.") {
                counts.1 += 1;
            } else if entry.name.contains(".dlist.") {
                counts.2 += 1;
            }
        }
        counts
    }
}

#[test]
fn backup_then_restore_roundtrips_tree() {
    let fx = fixture();
    build_source_tree(&fx.source);

    let result = fx.backup();
    assert!(!result.partial);
    assert!(result.files_added >= 3);
    assert_eq!(result.soft_errors, 0);

    fx.restore_version(0, &fx.restore_dir);
    assert_trees_equal(&fx.source, &fx.restore_dir);

    ops::verify(&fx.ctx(), true).unwrap();
}

/// A 16 KiB zero file with 1 KiB blocks: sixteen identical blocks are
/// recorded as a single catalog block, and the run produces exactly one
/// dblock, one dindex and one dlist.
#[test]
fn identical_blocks_deduplicate_into_one_volume_set() {
    let fx = fixture();
    std::fs::write(fx.source.join("a.bin"), vec![0u8; 16 * 1024]).unwrap();

    fx.backup();
    assert_eq!(fx.volume_counts(), (1, 1, 1));

    let catalog = crate::catalog::Catalog::open(&fx.catalog_path).unwrap();
    // One content block, one blocklist block, one metadata block per
    // distinct metadata blob.
    let fileset = &catalog.list_filesets().unwrap()[0];
    let files = catalog.fileset_files(fileset.id).unwrap();
    let file = files.iter().find(|f| f.path.ends_with("a.bin")).unwrap();
    let blocks = catalog.blockset_blocks(file.blockset_id).unwrap();
    assert_eq!(blocks.len(), 16);
    let first_hash = &blocks[0].hash;
    assert!(blocks.iter().all(|b| &b.hash == first_hash));
    assert!(blocks.iter().all(|b| b.block_id == blocks[0].block_id));

    let restored = fx._dirs[0].path().join("r");
    fx.restore_version(0, &restored);
    assert_eq!(
        std::fs::read(restored.join("a.bin")).unwrap(),
        vec![0u8; 16 * 1024]
    );
}

/// backup ∘ backup with no source change uploads only a new dlist.
#[test]
fn unchanged_backup_adds_only_a_dlist() {
    let fx = fixture();
    build_source_tree(&fx.source);

    let first = fx.backup();
    let (dblocks, dindexes, dlists) = fx.volume_counts();
    let second = fx.backup();
    assert_eq!(fx.volume_counts(), (dblocks, dindexes, dlists + 1));

    assert!(second.files_carried_forward >= first.files_added - 1);
    assert_eq!(second.blocks_added, 0);
    let stats = second.change_stats.unwrap();
    assert_eq!(stats.total_changes(), 0);
}

#[test]
fn added_file_shows_in_change_stats() {
    let fx = fixture();
    build_source_tree(&fx.source);
    fx.backup();

    std::fs::write(fx.source.join("b.txt"), b"hello").unwrap();
    let second = fx.backup();
    let stats = second.change_stats.unwrap();
    assert_eq!(stats.added_files, 1);
    assert_eq!(stats.modified_files, 0);
    assert_eq!(stats.deleted_files, 0);

    let restored = fx._dirs[0].path().join("r2");
    fx.restore_version(0, &restored);
    assert_eq!(std::fs::read(restored.join("b.txt")).unwrap(), b"hello");
}

/// Boundary: a file of exactly one blocksize has a single block and no
/// blocklist; an empty file has an empty blockset.
#[test]
fn blocksize_boundaries() {
    let fx = fixture();
    std::fs::write(fx.source.join("exact"), vec![3u8; 1024]).unwrap();
    std::fs::write(fx.source.join("empty"), b"").unwrap();
    fx.backup();

    let catalog = crate::catalog::Catalog::open(&fx.catalog_path).unwrap();
    let fileset = &catalog.list_filesets().unwrap()[0];
    let files = catalog.fileset_files(fileset.id).unwrap();

    let exact = files.iter().find(|f| f.path.ends_with("exact")).unwrap();
    assert_eq!(exact.size, 1024);
    assert_eq!(catalog.blockset_blocks(exact.blockset_id).unwrap().len(), 1);
    assert!(catalog
        .blockset_blocklist_hashes(exact.blockset_id)
        .unwrap()
        .is_empty());

    let empty = files.iter().find(|f| f.path.ends_with("empty")).unwrap();
    assert_eq!(empty.size, 0);
    assert!(catalog.blockset_blocks(empty.blockset_id).unwrap().is_empty());

    let restored = fx._dirs[0].path().join("r");
    fx.restore_version(0, &restored);
    assert_trees_equal(&fx.source, &restored);
}

/// Boundary: more blocks than fit in one blocklist chunk forces a
/// multi-chunk blocklist. 1 KiB blocks and 32-byte hashes give 32 hashes
/// per chunk, so 40 distinct blocks need two.
#[test]
fn large_file_gets_multi_chunk_blocklist() {
    let fx = fixture();
    let mut data = Vec::new();
    for i in 0..40u32 {
        data.extend_from_slice(&vec![(i % 251) as u8 ^ (i / 7) as u8; 1024]);
    }
    // Make every block distinct.
    for (i, chunk) in data.chunks_mut(1024).enumerate() {
        chunk[0] = (i * 3 % 256) as u8;
        chunk[1] = (i / 2) as u8;
    }
    std::fs::write(fx.source.join("big.bin"), &data).unwrap();
    fx.backup();

    let catalog = crate::catalog::Catalog::open(&fx.catalog_path).unwrap();
    let fileset = &catalog.list_filesets().unwrap()[0];
    let files = catalog.fileset_files(fileset.id).unwrap();
    let big = files.iter().find(|f| f.path.ends_with("big.bin")).unwrap();
    assert_eq!(catalog.blockset_blocks(big.blockset_id).unwrap().len(), 40);
    assert_eq!(
        catalog
            .blockset_blocklist_hashes(big.blockset_id)
            .unwrap()
            .len(),
        2
    );
    ops::verify(&fx.ctx(), true).unwrap();

    let restored = fx._dirs[0].path().join("r");
    fx.restore_version(0, &restored);
    assert_eq!(std::fs::read(restored.join("big.bin")).unwrap(), data);
}

/// Multiple volumes: content larger than volume_size forces rotation and
/// every volume still restores.
#[test]
fn content_spanning_multiple_volumes_restores() {
    let fx = fixture();
    // ~24 KiB of distinct randomish data vs 8 KiB volumes.
    let mut data = vec![0u8; 24 * 1024];
    let mut state = 0x12345678u32;
    for byte in data.iter_mut() {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        *byte = (state >> 24) as u8;
    }
    std::fs::write(fx.source.join("spread.bin"), &data).unwrap();
    fx.backup();

    let (dblocks, dindexes, _) = fx.volume_counts();
    assert!(dblocks >= 2, "expected volume rotation, got {dblocks}");
    assert_eq!(dblocks, dindexes);

    let restored = fx._dirs[0].path().join("r");
    fx.restore_version(0, &restored);
    assert_eq!(std::fs::read(restored.join("spread.bin")).unwrap(), data);
}

/// Both restore implementations produce identical results.
#[test]
fn legacy_and_pipelined_restores_agree() {
    let mut fx = fixture();
    build_source_tree(&fx.source);
    std::fs::write(fx.source.join("extra.bin"), vec![9u8; 5000]).unwrap();
    fx.backup();

    let pipelined_dir = fx._dirs[0].path().join("pipelined");
    fx.restore_version(0, &pipelined_dir);

    fx.options.restore_legacy = true;
    let legacy_dir = fx._dirs[0].path().join("legacy");
    fx.restore_version(0, &legacy_dir);

    assert_trees_equal(&pipelined_dir, &legacy_dir);
    assert_trees_equal(&fx.source, &legacy_dir);
}

/// Phase 2 reuse: restoring over an existing identical tree re-downloads
/// nothing for content and verifies files in place.
#[test]
fn restore_over_identical_tree_verifies_in_place() {
    let mut fx = fixture();
    build_source_tree(&fx.source);
    fx.backup();

    let dest = fx._dirs[0].path().join("r");
    fx.restore_version(0, &dest);

    fx.options.overwrite = true;
    let request = RestoreRequest {
        version: Some(0),
        restore_dir: Some(dest.clone()),
        ..RestoreRequest::default()
    };
    let second = ops::restore(&fx.ctx(), &request, &AtomicBool::new(false)).unwrap();
    assert!(second.files_verified >= 2);
    assert_trees_equal(&fx.source, &dest);
}

/// Cancellation: the fileset is recorded partial and its dlist is still
/// uploaded; the next run completes normally.
#[test]
fn cancelled_backup_records_partial_fileset() {
    let fx = fixture();
    build_source_tree(&fx.source);

    let cancel = AtomicBool::new(true);
    let result =
        ops::backup(&fx.ctx(), &[fx.source.clone()], &cancel).unwrap();
    assert!(result.partial);
    let (_, _, dlists) = fx.volume_counts();
    assert_eq!(dlists, 1, "partial dlist must still be uploaded");

    let catalog = crate::catalog::Catalog::open(&fx.catalog_path).unwrap();
    assert!(catalog.list_filesets().unwrap()[0].is_partial);
    drop(catalog);

    let complete = fx.backup();
    assert!(!complete.partial);
    fx.restore_version(0, &fx.restore_dir);
    assert_trees_equal(&fx.source, &fx.restore_dir);
}

#[test]
fn restore_with_path_filter_selects_subset() {
    let fx = fixture();
    build_source_tree(&fx.source);
    fx.backup();

    let dest = fx._dirs[0].path().join("only-a");
    let request = RestoreRequest {
        version: Some(0),
        paths: vec!["**/a.txt".into()],
        restore_dir: Some(dest.clone()),
        ..RestoreRequest::default()
    };
    ops::restore(&fx.ctx(), &request, &AtomicBool::new(false)).unwrap();

    assert_eq!(
        std::fs::read(dest.join("a.txt")).unwrap(),
        b"alpha file contents"
    );
    assert!(!dest.join("sub").exists());
}

#[test]
fn dryrun_uploads_nothing_and_rolls_back() {
    let mut fx = fixture();
    build_source_tree(&fx.source);
    fx.options.dryrun = true;
    let result = fx.backup();
    assert!(result.dryrun);
    assert_eq!(fx.backend.object_count(), 0);

    let catalog = crate::catalog::Catalog::open(&fx.catalog_path).unwrap();
    assert!(catalog.list_filesets().unwrap().is_empty());
}
