use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

/// Application-unique prefix for temp files, so the sweeper never touches
/// foreign files.
pub const TEMP_PREFIX: &str = "cairn-tmp-";

/// Temp files older than this are considered leaked by a dead process.
const SWEEP_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Resolve the temp directory: explicit option, then the system default.
pub fn temp_dir(override_dir: Option<&Path>) -> PathBuf {
    override_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir)
}

/// Allocate a fresh temp file path (not created) with the app prefix.
pub fn temp_file_path(override_dir: Option<&Path>) -> PathBuf {
    temp_dir(override_dir).join(format!("{TEMP_PREFIX}{:016x}", rand::random::<u64>()))
}

/// Delete app-prefixed temp files older than 30 days. Run at operation
/// startup; failures are logged and ignored.
pub fn sweep_stale_temp_files(override_dir: Option<&Path>) -> usize {
    let dir = temp_dir(override_dir);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(TEMP_PREFIX) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .is_some_and(|age| age > SWEEP_AGE);
        if stale {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(name, "swept stale temp file");
                    removed += 1;
                }
                Err(e) => warn!(name, "failed to sweep temp file: {e}"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_paths_carry_prefix_and_differ() {
        let dir = tempfile::tempdir().unwrap();
        let a = temp_file_path(Some(dir.path()));
        let b = temp_file_path(Some(dir.path()));
        assert_ne!(a, b);
        assert!(a
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with(TEMP_PREFIX));
        assert!(a.starts_with(dir.path()));
    }

    #[test]
    fn sweeper_ignores_fresh_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{TEMP_PREFIX}fresh")), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"y").unwrap();
        assert_eq!(sweep_stale_temp_files(Some(dir.path())), 0);
        assert!(dir.path().join(format!("{TEMP_PREFIX}fresh")).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
