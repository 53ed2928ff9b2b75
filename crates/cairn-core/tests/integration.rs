//! Full-lifecycle integration test against a local-directory backend:
//! backup, incremental backup, delete, compact, repair and restore on
//! real files.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use cairn_core::config::Options;
use cairn_core::ops::{self, OperationContext};
use cairn_core::restore::RestoreRequest;
use cairn_core::storage::local_backend::LocalBackend;

fn options() -> Options {
    Options {
        blocksize: 2048,
        volume_size: 16 * 1024,
        ..Options::default()
    }
}

fn write_tree(root: &Path) {
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(root.join("docs/readme.md"), b"# readme\n\nsome prose\n").unwrap();
    let mut big = vec![0u8; 40 * 1024];
    let mut state = 0x2545F4914F6CDD1Du64;
    for byte in big.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = state as u8;
    }
    std::fs::write(root.join("docs/large.bin"), &big).unwrap();
    std::fs::write(root.join("zeros.dat"), vec![0u8; 8192]).unwrap();
}

fn restore_to(ctx: &OperationContext<'_>, version: usize, dest: &Path) {
    let request = RestoreRequest {
        version: Some(version),
        restore_dir: Some(dest.to_path_buf()),
        ..RestoreRequest::default()
    };
    ops::restore(ctx, &request, &AtomicBool::new(false)).unwrap();
}

fn read_tree(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if entry.file_type().unwrap().is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                files.push((rel, std::fs::read(&path).unwrap()));
            }
        }
    }
    files.sort();
    files
}

#[test]
fn lifecycle_backup_delete_compact_repair_restore() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    write_tree(&source);

    let destination = work.path().join("dest");
    let backend = LocalBackend::new(&destination).unwrap();
    let catalog_path = work.path().join("catalog.sqlite");
    let options = options();
    let ctx = OperationContext::new(&backend, &catalog_path, &options);
    let cancel = AtomicBool::new(false);

    // First backup and byte-for-byte restore.
    let first = ops::backup(&ctx, &[source.clone()], &cancel).unwrap();
    assert!(first.files_added >= 3);
    let r1 = work.path().join("r1");
    restore_to(&ctx, 0, &r1);
    assert_eq!(read_tree(&source), read_tree(&r1));

    // Incremental: change one file, drop another.
    std::fs::write(source.join("docs/readme.md"), b"# readme v2\n").unwrap();
    std::fs::remove_file(source.join("zeros.dat")).unwrap();
    let second = ops::backup(&ctx, &[source.clone()], &cancel).unwrap();
    let stats = second.change_stats.unwrap();
    assert_eq!(stats.modified_files, 1);
    assert_eq!(stats.deleted_files, 1);

    // Both versions restore correctly.
    let r2 = work.path().join("r2");
    restore_to(&ctx, 0, &r2);
    assert_eq!(read_tree(&source), read_tree(&r2));
    let r_old = work.path().join("r_old");
    restore_to(&ctx, 1, &r_old);
    assert!(r_old.join("zeros.dat").exists());

    // Delete the old version; compact; the survivor is untouched.
    ops::delete(&ctx, &[1]).unwrap();
    ops::compact(&ctx, true).unwrap();
    ops::verify(&ctx, true).unwrap();
    let r3 = work.path().join("r3");
    restore_to(&ctx, 0, &r3);
    assert_eq!(read_tree(&source), read_tree(&r3));

    // Lose the catalog; repair; restore once more.
    std::fs::remove_file(&catalog_path).unwrap();
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut os = catalog_path.as_os_str().to_os_string();
        os.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(os));
    }
    let repair = ops::repair(&ctx).unwrap();
    assert!(!repair.partial);
    ops::verify(&ctx, true).unwrap();
    let r4 = work.path().join("r4");
    restore_to(&ctx, 0, &r4);
    assert_eq!(read_tree(&source), read_tree(&r4));
}
