use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CairnError, Result};
use crate::storage::StorageBackend;

/// Name of the advisory lock object at the destination.
const LOCK_NAME: &str = "cairn.lock";

/// Locks older than this are presumed left by a dead process.
const STALE_LOCK_SECS: i64 = 6 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

/// Handle to the destination-scoped operation lock. Released on drop
/// (best effort) or explicitly via [`release`].
pub struct OperationLock<'a> {
    backend: &'a dyn StorageBackend,
    released: bool,
}

/// Acquire the single-operation lock for a destination. A fresh foreign
/// lock fails with `Locked`; a stale one is replaced.
pub fn acquire(backend: &dyn StorageBackend) -> Result<OperationLock<'_>> {
    let now = Utc::now();
    if let Some(raw) = backend.get(LOCK_NAME)? {
        let holder: Option<LockEntry> = serde_json::from_slice(&raw).ok();
        let stale = holder
            .as_ref()
            .and_then(|entry| chrono::DateTime::parse_from_rfc3339(&entry.time).ok())
            .map(|time| (now - time.with_timezone(&Utc)).num_seconds() > STALE_LOCK_SECS)
            // Unreadable lock entries count as stale.
            .unwrap_or(true);
        if !stale {
            let description = holder
                .map(|entry| format!("{}:{}", entry.hostname, entry.pid))
                .unwrap_or_else(|| "unknown".into());
            return Err(CairnError::Locked(description));
        }
        warn!("replacing stale operation lock");
    }

    let entry = LockEntry {
        hostname: hostname(),
        pid: std::process::id(),
        time: now.to_rfc3339(),
    };
    backend.put(LOCK_NAME, &serde_json::to_vec(&entry)?)?;
    debug!("acquired operation lock");
    Ok(OperationLock {
        backend,
        released: false,
    })
}

impl OperationLock<'_> {
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.backend.delete(LOCK_NAME)
    }
}

impl Drop for OperationLock<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.backend.delete(LOCK_NAME) {
                warn!("failed to release operation lock: {e}");
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".into())
}
