use cairn_types::volume::{VolumeState, VolumeType};

use crate::catalog::{FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};
use crate::hashing::HashAlgorithm;
use crate::testutil::test_catalog;

fn hash(data: &[u8]) -> cairn_types::block_hash::BlockHash {
    HashAlgorithm::Sha256.digest(data)
}

#[test]
fn register_block_is_idempotent() {
    let (_dir, catalog) = test_catalog();
    let volume = catalog
        .register_remote_volume("v1.dblock.zst.raw", VolumeType::Blocks, VolumeState::Temporary)
        .unwrap();

    let (id1, new1) = catalog.register_block(&hash(b"data"), 4, volume).unwrap();
    let (id2, new2) = catalog.register_block(&hash(b"data"), 4, volume).unwrap();
    assert!(new1);
    assert!(!new2);
    assert_eq!(id1, id2);
    assert_eq!(catalog.block_count().unwrap(), 1);

    // Same hash, different size is a different logical block.
    let (id3, new3) = catalog.register_block(&hash(b"data"), 5, volume).unwrap();
    assert!(new3);
    assert_ne!(id1, id3);
}

#[test]
fn register_blockset_is_idempotent_and_ordered() {
    let (_dir, catalog) = test_catalog();
    let volume = catalog
        .register_remote_volume("v1.dblock.zst.raw", VolumeType::Blocks, VolumeState::Temporary)
        .unwrap();
    let (a, _) = catalog.register_block(&hash(b"aa"), 2, volume).unwrap();
    let (b, _) = catalog.register_block(&hash(b"bb"), 2, volume).unwrap();

    let full = hash(b"aabb");
    let (set1, new1) = catalog.register_blockset(&full, 4, &[a, b]).unwrap();
    let (set2, new2) = catalog.register_blockset(&full, 4, &[a, b]).unwrap();
    assert!(new1);
    assert!(!new2);
    assert_eq!(set1, set2);

    let blocks = catalog.blockset_blocks(set1).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].block_id, a);
    assert_eq!(blocks[1].block_id, b);
    assert_eq!(blocks[0].index, 0);
}

#[test]
fn fileset_timestamp_collision_bumps_by_one_second() {
    let (_dir, catalog) = test_catalog();
    let v1 = catalog
        .register_remote_volume("a.dlist.zst.raw", VolumeType::Files, VolumeState::Temporary)
        .unwrap();
    let v2 = catalog
        .register_remote_volume("b.dlist.zst.raw", VolumeType::Files, VolumeState::Temporary)
        .unwrap();

    catalog.create_fileset(v1, 1_700_000_000, true).unwrap();
    catalog.create_fileset(v2, 1_700_000_000, false).unwrap();

    let filesets = catalog.list_filesets().unwrap();
    assert_eq!(filesets.len(), 2);
    // Descending by timestamp: the bumped one first.
    assert_eq!(filesets[0].timestamp, 1_700_000_001);
    assert_eq!(filesets[1].timestamp, 1_700_000_000);
}

#[test]
fn fileset_timestamp_collision_fails_past_retry_bound() {
    let (_dir, catalog) = test_catalog();
    for i in 0..=100 {
        let volume = catalog
            .register_remote_volume(
                &format!("fs{i}.dlist.zst.raw"),
                VolumeType::Files,
                VolumeState::Temporary,
            )
            .unwrap();
        catalog.create_fileset(volume, 1_700_000_000, false).unwrap();
    }
    let volume = catalog
        .register_remote_volume("last.dlist.zst.raw", VolumeType::Files, VolumeState::Temporary)
        .unwrap();
    let err = catalog
        .create_fileset(volume, 1_700_000_000, false)
        .unwrap_err();
    assert!(matches!(err, crate::CairnError::UserInformation(_)));
}

#[test]
fn illegal_volume_transition_is_consistency_error() {
    let (_dir, catalog) = test_catalog();
    let volume = catalog
        .register_remote_volume("v.dblock.zst.raw", VolumeType::Blocks, VolumeState::Temporary)
        .unwrap();
    let err = catalog
        .transition_volume(volume, VolumeState::Verified)
        .unwrap_err();
    assert!(matches!(err, crate::CairnError::DatabaseConsistency(_)));
}

#[test]
fn deleted_volume_clears_duplicate_and_deleted_blocks() {
    let (_dir, catalog) = test_catalog();
    let keep = catalog
        .register_remote_volume("keep.dblock.zst.raw", VolumeType::Blocks, VolumeState::Uploaded)
        .unwrap();
    let doomed = catalog
        .register_remote_volume("gone.dblock.zst.raw", VolumeType::Blocks, VolumeState::Uploaded)
        .unwrap();
    let (block, _) = catalog.register_block(&hash(b"x"), 1, keep).unwrap();
    catalog.add_duplicate_block(block, doomed).unwrap();
    catalog.record_deleted_block("h", 10, doomed).unwrap();

    catalog.transition_volume(doomed, VolumeState::Deleting).unwrap();
    catalog.transition_volume(doomed, VolumeState::Deleted).unwrap();

    assert!(catalog.deleted_blocks_of_volume(doomed).unwrap().is_empty());
    // Invariant 5 holds: nothing references the deleted volume anymore.
    catalog.verify_consistency(1024, 32, false).unwrap();
}

#[test]
fn verify_consistency_passes_on_valid_catalog() {
    let (_dir, catalog) = test_catalog();
    let dblock = catalog
        .register_remote_volume("v.dblock.zst.raw", VolumeType::Blocks, VolumeState::Uploaded)
        .unwrap();
    let dlist = catalog
        .register_remote_volume("v.dlist.zst.raw", VolumeType::Files, VolumeState::Uploaded)
        .unwrap();

    let data = vec![7u8; 1024];
    let tail = vec![8u8; 100];
    let (a, _) = catalog.register_block(&hash(&data), 1024, dblock).unwrap();
    let (b, _) = catalog.register_block(&hash(&tail), 100, dblock).unwrap();
    let full = HashAlgorithm::Sha256.digest(&[data.clone(), tail.clone()].concat());
    let (set, _) = catalog.register_blockset(&full, 1124, &[a, b]).unwrap();

    // Two blocks need one blocklist chunk (32 hashes fit per 1024 B).
    let mut payload = Vec::new();
    payload.extend_from_slice(hash(&data).as_bytes());
    payload.extend_from_slice(hash(&tail).as_bytes());
    let list_hash = HashAlgorithm::Sha256.digest(&payload);
    catalog
        .register_block(&list_hash, payload.len() as i64, dblock)
        .unwrap();
    catalog.register_blocklist_hashes(set, &[list_hash]).unwrap();

    let meta_bytes = br#"{"mode":420}"#.to_vec();
    let (m, _) = catalog
        .register_block(&hash(&meta_bytes), meta_bytes.len() as i64, dblock)
        .unwrap();
    let meta_full = HashAlgorithm::Sha256.digest(&meta_bytes);
    let (meta_set, _) = catalog
        .register_blockset(&meta_full, meta_bytes.len() as i64, &[m])
        .unwrap();
    let metadata_id = catalog.register_metadataset(meta_set).unwrap();

    let file = catalog
        .register_file("/src/file.bin", set, Some(metadata_id))
        .unwrap();
    let folder = catalog
        .register_file("/src/", FOLDER_BLOCKSET_ID, Some(metadata_id))
        .unwrap();
    let fileset = catalog.create_fileset(dlist, 1_700_000_000, true).unwrap();
    catalog.add_fileset_entry(fileset, file, 123).unwrap();
    catalog.add_fileset_entry(fileset, folder, 123).unwrap();

    catalog.verify_consistency(1024, 32, true).unwrap();
}

#[test]
fn verify_consistency_detects_dangling_blockset_entry() {
    let (_dir, catalog) = test_catalog();
    let dblock = catalog
        .register_remote_volume("v.dblock.zst.raw", VolumeType::Blocks, VolumeState::Uploaded)
        .unwrap();
    let (a, _) = catalog.register_block(&hash(b"z"), 1, dblock).unwrap();
    let (set, _) = catalog
        .register_blockset(&hash(b"z"), 1, &[a])
        .unwrap();
    // Simulate corruption: remove the block row behind the entry.
    catalog
        .conn()
        .execute("DELETE FROM block WHERE id = ?1", [a])
        .unwrap();
    let err = catalog.verify_consistency(1024, 32, false).unwrap_err();
    assert!(matches!(err, crate::CairnError::DatabaseConsistency(_)));
    let _ = set;
}

#[test]
fn verify_consistency_detects_length_mismatch() {
    let (_dir, catalog) = test_catalog();
    let dblock = catalog
        .register_remote_volume("v.dblock.zst.raw", VolumeType::Blocks, VolumeState::Uploaded)
        .unwrap();
    let (a, _) = catalog.register_block(&hash(b"q"), 1, dblock).unwrap();
    catalog.register_blockset(&hash(b"q"), 999, &[a]).unwrap();
    let err = catalog.verify_consistency(1024, 32, false).unwrap_err();
    assert!(err.to_string().contains("length"));
}

#[test]
fn change_statistics_counts_kinds() {
    let (_dir, catalog) = test_catalog();
    let dblock = catalog
        .register_remote_volume("v.dblock.zst.raw", VolumeType::Blocks, VolumeState::Uploaded)
        .unwrap();
    let dlist1 = catalog
        .register_remote_volume("v1.dlist.zst.raw", VolumeType::Files, VolumeState::Uploaded)
        .unwrap();
    let dlist2 = catalog
        .register_remote_volume("v2.dlist.zst.raw", VolumeType::Files, VolumeState::Uploaded)
        .unwrap();

    let meta = |payload: &[u8]| {
        let (m, _) = catalog
            .register_block(&hash(payload), payload.len() as i64, dblock)
            .unwrap();
        let (set, _) = catalog
            .register_blockset(
                &HashAlgorithm::Sha256.digest(payload),
                payload.len() as i64,
                &[m],
            )
            .unwrap();
        catalog.register_metadataset(set).unwrap()
    };
    let content = |payload: &[u8]| {
        let (b, _) = catalog
            .register_block(&hash(payload), payload.len() as i64, dblock)
            .unwrap();
        let (set, _) = catalog
            .register_blockset(
                &HashAlgorithm::Sha256.digest(payload),
                payload.len() as i64,
                &[b],
            )
            .unwrap();
        set
    };

    let m1 = meta(b"{\"mode\":1}");
    let m2 = meta(b"{\"mode\":2}");

    // Previous: kept.txt, gone.txt, folder with m1, link.
    let prev = catalog.create_fileset(dlist1, 1_700_000_000, true).unwrap();
    let kept_old = catalog
        .register_file("/s/kept.txt", content(b"old contents"), Some(m1))
        .unwrap();
    let gone = catalog
        .register_file("/s/gone.txt", content(b"bye"), Some(m1))
        .unwrap();
    let folder_old = catalog
        .register_file("/s/dir/", FOLDER_BLOCKSET_ID, Some(m1))
        .unwrap();
    let link = catalog
        .register_file("/s/link", SYMLINK_BLOCKSET_ID, Some(m1))
        .unwrap();
    for id in [kept_old, gone, folder_old, link] {
        catalog.add_fileset_entry(prev, id, 1).unwrap();
    }

    // Current: kept.txt modified (new content), gone.txt deleted,
    // fresh.txt added, folder metadata changed, link unchanged.
    let cur = catalog.create_fileset(dlist2, 1_700_000_100, false).unwrap();
    let kept_new = catalog
        .register_file("/s/kept.txt", content(b"new contents!"), Some(m1))
        .unwrap();
    let fresh = catalog
        .register_file("/s/fresh.txt", content(b"hi"), Some(m1))
        .unwrap();
    let folder_new = catalog
        .register_file("/s/dir/", FOLDER_BLOCKSET_ID, Some(m2))
        .unwrap();
    for id in [kept_new, fresh, folder_new, link] {
        catalog.add_fileset_entry(cur, id, 2).unwrap();
    }

    let stats = catalog.change_statistics(cur, prev).unwrap();
    assert_eq!(stats.added_files, 1);
    assert_eq!(stats.deleted_files, 1);
    assert_eq!(stats.modified_files, 1);
    assert_eq!(stats.modified_folders, 1);
    assert_eq!(stats.modified_symlinks, 0);
    assert_eq!(stats.added_folders, 0);
    assert_eq!(stats.deleted_symlinks, 0);
}

#[test]
fn find_last_incomplete_fileset_volume_finds_interrupted_dlist() {
    let (_dir, catalog) = test_catalog();
    let done = catalog
        .register_remote_volume("done.dlist.zst.raw", VolumeType::Files, VolumeState::Uploaded)
        .unwrap();
    catalog.create_fileset(done, 1_700_000_000, true).unwrap();
    assert!(catalog
        .find_last_incomplete_fileset_volume()
        .unwrap()
        .is_none());

    let stuck = catalog
        .register_remote_volume("stuck.dlist.zst.raw", VolumeType::Files, VolumeState::Temporary)
        .unwrap();
    catalog.create_fileset(stuck, 1_700_000_100, false).unwrap();
    let found = catalog
        .find_last_incomplete_fileset_volume()
        .unwrap()
        .unwrap();
    assert_eq!(found.id, stuck);
    assert_eq!(found.state, VolumeState::Temporary);
}

#[test]
fn partial_recreate_marker_blocks_backup_paths() {
    let (_dir, catalog) = test_catalog();
    assert!(!catalog.is_partially_recreated().unwrap());
    catalog.mark_partially_recreated().unwrap();
    assert!(catalog.is_partially_recreated().unwrap());
    assert!(matches!(
        catalog.require_complete(),
        Err(crate::CairnError::PartialRecreate)
    ));
    catalog.clear_partially_recreated().unwrap();
    catalog.require_complete().unwrap();
}

#[test]
fn fixed_options_mismatch_is_rejected() {
    let (_dir, catalog) = test_catalog();
    let options = crate::testutil::test_options();
    catalog.store_fixed_options(&options).unwrap();
    catalog.check_fixed_options(&options).unwrap();

    let changed = crate::config::Options {
        blocksize: options.blocksize * 2,
        ..options
    };
    assert!(matches!(
        catalog.check_fixed_options(&changed),
        Err(crate::CairnError::UserInformation(_))
    ));
}
