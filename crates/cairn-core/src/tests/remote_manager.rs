use chrono::{TimeZone, Utc};

use cairn_types::volume::{VolumeState, VolumeType};

use crate::crypto::PlaintextEngine;
use crate::error::CairnError;
use crate::storage::StorageBackend;
use crate::testutil::{test_catalog, test_manager, MemoryBackend};

#[test]
fn upload_download_roundtrip_records_size_and_hash() {
    let (_dir, catalog) = test_catalog();
    let backend = MemoryBackend::new();
    let encryption = PlaintextEngine;
    let manager = test_manager(&backend, &encryption);
    let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();

    let (id, name) = manager
        .create_volume(&catalog, "cairn", VolumeType::Blocks, now)
        .unwrap();
    assert_eq!(catalog.volume_by_id(id).unwrap().state, VolumeState::Temporary);

    let payload = vec![0xABu8; 4096];
    let (size, hash) = manager.upload_volume(&catalog, id, &payload).unwrap();

    let row = catalog.volume_by_id(id).unwrap();
    assert_eq!(row.state, VolumeState::Uploaded);
    assert_eq!(row.size, Some(size));
    assert_eq!(row.hash, Some(hash));
    assert!(backend.exists(&name).unwrap());

    let roundtripped = manager.download_volume(&catalog, id).unwrap();
    assert_eq!(roundtripped, payload);
}

#[test]
fn corrupted_remote_volume_fails_integrity() {
    let (_dir, catalog) = test_catalog();
    let backend = MemoryBackend::new();
    let encryption = PlaintextEngine;
    let manager = test_manager(&backend, &encryption);
    let now = Utc::now();

    let (id, name) = manager
        .create_volume(&catalog, "cairn", VolumeType::Blocks, now)
        .unwrap();
    manager.upload_volume(&catalog, id, b"good bytes").unwrap();

    // Same length, different contents: the hash check must catch it.
    let sealed = backend.get(&name).unwrap().unwrap();
    let mut tampered = sealed.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xFF;
    backend.put(&name, &tampered).unwrap();

    let err = manager.download_volume(&catalog, id).unwrap_err();
    assert!(matches!(err, CairnError::Integrity(_)));
}

#[test]
fn delete_confirms_and_clears_state() {
    let (_dir, catalog) = test_catalog();
    let backend = MemoryBackend::new();
    let encryption = PlaintextEngine;
    let manager = test_manager(&backend, &encryption);
    let now = Utc::now();

    let (id, name) = manager
        .create_volume(&catalog, "cairn", VolumeType::Blocks, now)
        .unwrap();
    manager.upload_volume(&catalog, id, b"doomed").unwrap();

    manager.delete_volume(&catalog, id, now).unwrap();
    // The in-memory backend confirms deletion immediately.
    assert_eq!(catalog.volume_by_id(id).unwrap().state, VolumeState::Deleted);
    assert!(!backend.exists(&name).unwrap());
}

#[test]
fn pending_delete_completes_after_grace_expiry() {
    let (_dir, catalog) = test_catalog();
    let backend = MemoryBackend::new();
    let encryption = PlaintextEngine;
    let manager = test_manager(&backend, &encryption);
    let now = Utc::now();

    let (id, name) = manager
        .create_volume(&catalog, "cairn", VolumeType::Blocks, now)
        .unwrap();
    manager.upload_volume(&catalog, id, b"lingering").unwrap();

    // Simulate an eventually-consistent store: mark Deleting with the
    // grace window open and the object still listed.
    catalog.transition_volume(id, VolumeState::Deleting).unwrap();
    catalog
        .set_volume_grace(id, (now + chrono::Duration::hours(2)).timestamp())
        .unwrap();

    // Within grace and still present: stays Deleting.
    assert_eq!(manager.process_pending_deletes(&catalog, now).unwrap(), 0);
    assert_eq!(
        catalog.volume_by_id(id).unwrap().state,
        VolumeState::Deleting
    );

    // Past grace: the delete is re-issued and the row transitions.
    let later = now + chrono::Duration::hours(3);
    assert_eq!(manager.process_pending_deletes(&catalog, later).unwrap(), 1);
    assert_eq!(catalog.volume_by_id(id).unwrap().state, VolumeState::Deleted);
    assert!(!backend.exists(&name).unwrap());
}

#[test]
fn verify_listing_promotes_and_reports() {
    let (_dir, catalog) = test_catalog();
    let backend = MemoryBackend::new();
    let encryption = PlaintextEngine;
    let manager = test_manager(&backend, &encryption);
    let now = Utc::now();

    let (uploaded_id, _) = manager
        .create_volume(&catalog, "cairn", VolumeType::Blocks, now)
        .unwrap();
    manager
        .upload_volume(&catalog, uploaded_id, b"present")
        .unwrap();

    let (missing_id, _) = manager
        .create_volume(&catalog, "cairn", VolumeType::Index, now)
        .unwrap();
    manager
        .upload_volume(&catalog, missing_id, b"will vanish")
        .unwrap();
    let missing_name = catalog.volume_by_id(missing_id).unwrap().name;
    backend.lose(&missing_name);

    // A foreign file and an unknown volume with our prefix.
    backend.put("unrelated.txt", b"x").unwrap();
    backend
        .put("cairn-20260101T000000Z-dead.dblock.zst.raw", b"y")
        .unwrap();

    let report = manager.verify_listing(&catalog, "cairn").unwrap();
    assert_eq!(report.missing, vec![missing_name]);
    assert_eq!(
        report.extra,
        vec!["cairn-20260101T000000Z-dead.dblock.zst.raw".to_string()]
    );
    assert!(report.size_mismatch.is_empty());

    // The present volume advanced to Verified.
    assert_eq!(
        catalog.volume_by_id(uploaded_id).unwrap().state,
        VolumeState::Verified
    );
}

#[test]
fn upload_failure_rolls_back_to_temporary() {
    struct FailingBackend;
    impl StorageBackend for FailingBackend {
        fn get(&self, _: &str) -> crate::Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn put(&self, _: &str, _: &[u8]) -> crate::Result<()> {
            Err(CairnError::Transient("wire down".into()))
        }
        fn delete(&self, _: &str) -> crate::Result<()> {
            Ok(())
        }
        fn exists(&self, _: &str) -> crate::Result<bool> {
            Ok(false)
        }
        fn list(&self) -> crate::Result<Vec<crate::storage::RemoteEntry>> {
            Ok(Vec::new())
        }
    }

    let (_dir, catalog) = test_catalog();
    let backend = FailingBackend;
    let encryption = PlaintextEngine;
    let manager = test_manager(&backend, &encryption);

    let (id, _) = manager
        .create_volume(&catalog, "cairn", VolumeType::Blocks, Utc::now())
        .unwrap();
    let err = manager.upload_volume(&catalog, id, b"payload").unwrap_err();
    assert!(err.is_transient());
    assert_eq!(
        catalog.volume_by_id(id).unwrap().state,
        VolumeState::Temporary
    );
}
