use std::sync::atomic::AtomicBool;

use crate::ops::{self, OperationContext};
use crate::restore::RestoreRequest;
use crate::testutil::{assert_trees_equal, build_source_tree, test_options, MemoryBackend};

/// repair ∘ drop-local-catalog = identity on restorable content.
#[test]
fn recreated_catalog_restores_identically() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    build_source_tree(&source);
    std::fs::write(source.join("more.bin"), vec![0x42u8; 10_000]).unwrap();

    let backend = MemoryBackend::new();
    let catalog_path = work.path().join("catalog.sqlite");
    let options = test_options();
    let ctx = OperationContext::new(&backend, &catalog_path, &options);
    let cancel = AtomicBool::new(false);

    ops::backup(&ctx, &[source.clone()], &cancel).unwrap();

    // Lose the catalog entirely, then rebuild it from the remote volumes.
    drop(std::fs::remove_file(&catalog_path));
    for sidecar in ["-wal", "-shm", "-journal"] {
        let mut os = catalog_path.as_os_str().to_os_string();
        os.push(sidecar);
        let _ = std::fs::remove_file(std::path::PathBuf::from(os));
    }

    let result = ops::repair(&ctx).unwrap();
    assert!(!result.partial);
    assert_eq!(result.filesets_recreated, 1);
    assert!(result.blocks_registered > 0);

    ops::verify(&ctx, true).unwrap();

    let restored = work.path().join("restored");
    let request = RestoreRequest {
        restore_dir: Some(restored.clone()),
        ..RestoreRequest::default()
    };
    ops::restore(&ctx, &request, &cancel).unwrap();
    assert_trees_equal(&source, &restored);
}

/// A second backup after recreate behaves like any other incremental.
#[test]
fn backup_continues_after_recreate() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("steady.txt"), b"unchanging contents").unwrap();

    let backend = MemoryBackend::new();
    let catalog_path = work.path().join("catalog.sqlite");
    let options = test_options();
    let ctx = OperationContext::new(&backend, &catalog_path, &options);
    let cancel = AtomicBool::new(false);

    ops::backup(&ctx, &[source.clone()], &cancel).unwrap();
    drop(std::fs::remove_file(&catalog_path));
    ops::repair(&ctx).unwrap();

    let second = ops::backup(&ctx, &[source.clone()], &cancel).unwrap();
    assert_eq!(second.blocks_added, 0, "recreated catalog must dedup");
}

/// A recreate over an incomplete remote set marks the catalog and backup
/// refuses to run.
#[test]
fn partial_recreate_refuses_backup() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    // Distinct multi-volume content so losing one dblock is detectable.
    let mut data = vec![0u8; 20 * 1024];
    let mut state = 7u32;
    for byte in data.iter_mut() {
        state = state.wrapping_mul(48271) % 0x7fffffff;
        *byte = state as u8;
    }
    std::fs::write(source.join("wide.bin"), &data).unwrap();

    let backend = MemoryBackend::new();
    let catalog_path = work.path().join("catalog.sqlite");
    let options = test_options();
    let ctx = OperationContext::new(&backend, &catalog_path, &options);
    let cancel = AtomicBool::new(false);

    ops::backup(&ctx, &[source.clone()], &cancel).unwrap();

    // Lose one dindex AND its dblock, then the catalog.
    let victim_block = crate::storage::StorageBackend::list(&backend)
        .unwrap()
        .into_iter()
        .find(|e| e.name.contains(".dblock."))
        .unwrap();
    backend.lose(&victim_block.name);
    let victim_index = crate::storage::StorageBackend::list(&backend)
        .unwrap()
        .into_iter()
        .find(|e| e.name.contains(".dindex."))
        .unwrap();
    backend.lose(&victim_index.name);
    drop(std::fs::remove_file(&catalog_path));

    let result = ops::repair(&ctx).unwrap();
    assert!(result.partial);

    let err = ops::backup(&ctx, &[source.clone()], &cancel).unwrap_err();
    assert!(matches!(err, crate::CairnError::PartialRecreate));
}

/// Reconcile mode: an orphaned Temporary volume row left by an
/// interrupted run is reclaimed.
#[test]
fn reconcile_reclaims_orphaned_volumes() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("f.txt"), b"payload").unwrap();

    let backend = MemoryBackend::new();
    let catalog_path = work.path().join("catalog.sqlite");
    let options = test_options();
    let ctx = OperationContext::new(&backend, &catalog_path, &options);
    let cancel = AtomicBool::new(false);
    ops::backup(&ctx, &[source.clone()], &cancel).unwrap();

    // Fake an interrupted run: a Temporary dblock row with no backing file.
    {
        let catalog = crate::catalog::Catalog::open(&catalog_path).unwrap();
        catalog
            .register_remote_volume(
                "cairn-20260101T000000Z-ffff.dblock.zst.raw",
                cairn_types::volume::VolumeType::Blocks,
                cairn_types::volume::VolumeState::Temporary,
            )
            .unwrap();
    }

    let result = ops::repair(&ctx).unwrap();
    assert_eq!(result.orphans_reclaimed, 1);
    ops::verify(&ctx, true).unwrap();
}
