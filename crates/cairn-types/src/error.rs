use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    /// Misconfiguration or invalid user input; shown verbatim.
    #[error("{0}")]
    UserInformation(String),

    /// The destination's contents disagree with the catalog.
    #[error("remote listing mismatch: {0}")]
    RemoteList(String),

    /// A catalog invariant failed. Fatal; the surrounding transaction must
    /// roll back.
    #[error("catalog consistency error: {0}")]
    DatabaseConsistency(String),

    /// Compression or encryption transform failure.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("operation cancelled")]
    Cancelled,

    /// The catalog was recreated from an incomplete remote set.
    #[error("catalog is partially recreated; repair against a complete remote first")]
    PartialRecreate,

    /// Network-class failure; retried with backoff by the remote manager.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Hash mismatch on a block or a restored file.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// E.g. cross-OS path-separator reuse of a backup destination.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("destination is locked by another operation (lock: {0})")]
    Locked(String),

    #[error("remote volume not found: '{0}'")]
    VolumeNotFound(String),

    #[error("invalid volume format: {0}")]
    InvalidFormat(String),

    #[error("catalog error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<crate::volume::VolumeNameError> for CairnError {
    fn from(value: crate::volume::VolumeNameError) -> Self {
        CairnError::InvalidFormat(value.to_string())
    }
}

impl CairnError {
    /// True for failures the remote manager retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, CairnError::Transient(_))
    }

    /// Per-file failures the enumerator may skip with a warning
    /// (vanished file, permission denied). Nothing has been committed for
    /// the file when this is raised.
    pub fn is_soft_file_error(&self) -> bool {
        match self {
            CairnError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }

    /// Process exit code: 0 success, 1 warnings, 2 errors, 3 fatal,
    /// 50 user cancel. Success/warnings are decided by the caller from the
    /// operation result; errors map here.
    pub fn exit_code(&self) -> i32 {
        match self {
            CairnError::Cancelled => 50,
            CairnError::DatabaseConsistency(_) | CairnError::PartialRecreate => 3,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CairnError::Transient("down".into()).is_transient());
        assert!(!CairnError::Cancelled.is_transient());
    }

    #[test]
    fn soft_file_errors_are_skippable() {
        let missing = CairnError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(missing.is_soft_file_error());
        let denied =
            CairnError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(denied.is_soft_file_error());
        let other = CairnError::Io(std::io::Error::from(std::io::ErrorKind::InvalidData));
        assert!(!other.is_soft_file_error());
    }

    #[test]
    fn exit_codes_follow_severity() {
        assert_eq!(CairnError::Cancelled.exit_code(), 50);
        assert_eq!(CairnError::DatabaseConsistency("x".into()).exit_code(), 3);
        assert_eq!(CairnError::PartialRecreate.exit_code(), 3);
        assert_eq!(CairnError::UserInformation("x".into()).exit_code(), 2);
        assert_eq!(CairnError::Transient("x".into()).exit_code(), 2);
    }

    #[test]
    fn volume_name_errors_convert() {
        let err: CairnError = crate::volume::VolumeNameError("garbage".into()).into();
        assert!(matches!(err, CairnError::InvalidFormat(_)));
    }
}
