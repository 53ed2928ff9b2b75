pub mod local_backend;
pub mod retry;

use crate::error::Result;

/// One entry of a remote listing: name plus size as reported by the
/// destination. Listing is the source of truth for volume verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
}

/// Abstract key-value storage for remote volumes.
///
/// Keys are flat remote filenames (`<prefix>-<ts>-<guid>.<kind>...`). The
/// transport implementations behind this trait (object stores, WebDAV,
/// HTTP) are external collaborators; the engine ships a local-filesystem
/// backend and an in-memory one for tests.
pub trait StorageBackend: Send + Sync {
    /// Read an object by name. Returns `None` if not found.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object. Overwrites if it already exists.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Delete an object. Deleting a missing object is not an error.
    fn delete(&self, name: &str) -> Result<()>;

    /// Check whether an object exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// List all objects with their sizes.
    fn list(&self) -> Result<Vec<RemoteEntry>>;

    /// Size of an object without reading it. Returns `None` if not found.
    fn size(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.list()?.into_iter().find(|e| e.name == name).map(|e| e.size))
    }
}
