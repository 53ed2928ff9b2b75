use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three kinds of remote volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    /// Fileset manifest (dlist).
    Files,
    /// Packed block payloads (dblock).
    Blocks,
    /// Blocklists and dblock manifests (dindex).
    Index,
}

impl VolumeType {
    /// The `<kind>` component of a remote volume name.
    pub fn suffix(self) -> &'static str {
        match self {
            VolumeType::Files => "dlist",
            VolumeType::Blocks => "dblock",
            VolumeType::Index => "dindex",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "dlist" => Some(VolumeType::Files),
            "dblock" => Some(VolumeType::Blocks),
            "dindex" => Some(VolumeType::Index),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Lifecycle state of a remote volume.
///
/// Temporary → Uploading → Uploaded → Verified → Deleting → Deleted.
/// Every transition is recorded catalog-atomically; backend side effects
/// are bracketed by the surrounding transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    Temporary,
    Uploading,
    Uploaded,
    Verified,
    Deleting,
    Deleted,
}

impl VolumeState {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeState::Temporary => "Temporary",
            VolumeState::Uploading => "Uploading",
            VolumeState::Uploaded => "Uploaded",
            VolumeState::Verified => "Verified",
            VolumeState::Deleting => "Deleting",
            VolumeState::Deleted => "Deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Temporary" => Some(VolumeState::Temporary),
            "Uploading" => Some(VolumeState::Uploading),
            "Uploaded" => Some(VolumeState::Uploaded),
            "Verified" => Some(VolumeState::Verified),
            "Deleting" => Some(VolumeState::Deleting),
            "Deleted" => Some(VolumeState::Deleted),
            _ => None,
        }
    }

    /// Whether a block may legally reside in a volume in this state
    /// (catalog invariant 1).
    pub fn may_hold_blocks(self) -> bool {
        !matches!(self, VolumeState::Deleted)
    }

    /// Legal forward transitions of the state machine.
    pub fn can_transition_to(self, next: VolumeState) -> bool {
        use VolumeState::*;
        matches!(
            (self, next),
            (Temporary, Uploading)
                | (Uploading, Uploaded)
                // Upload failure rolls the row back for reassignment.
                | (Uploading, Temporary)
                | (Uploaded, Verified)
                | (Temporary, Deleting)
                | (Uploading, Deleting)
                | (Uploaded, Deleting)
                | (Verified, Deleting)
                | (Deleting, Deleted)
        )
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid remote volume name '{0}'")]
pub struct VolumeNameError(pub String);

/// Parsed remote volume name:
/// `<prefix>-<yyyyMMddTHHmmssZ>-<guid>.<kind>.<compression>.<encryption>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub prefix: String,
    pub timestamp: DateTime<Utc>,
    pub guid: String,
    pub kind: VolumeType,
    pub compression: String,
    pub encryption: String,
}

impl VolumeName {
    /// Generate a fresh name with a random 128-bit guid.
    pub fn generate(
        prefix: &str,
        kind: VolumeType,
        compression: &str,
        encryption: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let guid = bytes.iter().map(|b| format!("{b:02x}")).collect();
        VolumeName {
            prefix: prefix.to_string(),
            timestamp,
            guid,
            kind,
            compression: compression.to_string(),
            encryption: encryption.to_string(),
        }
    }

    pub fn parse(name: &str) -> Result<Self, VolumeNameError> {
        let err = || VolumeNameError(name.to_string());

        let mut dots = name.rsplitn(4, '.');
        let encryption = dots.next().ok_or_else(err)?;
        let compression = dots.next().ok_or_else(err)?;
        let kind = dots.next().and_then(VolumeType::from_suffix).ok_or_else(err)?;
        let stem = dots.next().ok_or_else(err)?;

        // stem = <prefix>-<timestamp>-<guid>; prefix may itself contain '-'.
        let mut parts = stem.rsplitn(3, '-');
        let guid = parts.next().ok_or_else(err)?;
        let ts_str = parts.next().ok_or_else(err)?;
        let prefix = parts.next().ok_or_else(err)?;
        if prefix.is_empty() || guid.is_empty() {
            return Err(err());
        }

        let naive = chrono::NaiveDateTime::parse_from_str(ts_str, "%Y%m%dT%H%M%SZ")
            .map_err(|_| err())?;
        let timestamp = Utc.from_utc_datetime(&naive);

        Ok(VolumeName {
            prefix: prefix.to_string(),
            timestamp,
            guid: guid.to_string(),
            kind,
            compression: compression.to_string(),
            encryption: encryption.to_string(),
        })
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}.{}.{}.{}",
            self.prefix,
            self.timestamp.format("%Y%m%dT%H%M%SZ"),
            self.guid,
            self.kind.suffix(),
            self.compression,
            self.encryption
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let name = VolumeName::generate("cairn", VolumeType::Blocks, "zst", "raw", ts);
        let formatted = name.to_string();
        let parsed = VolumeName::parse(&formatted).unwrap();
        assert_eq!(parsed, name);
        assert!(formatted.ends_with(".dblock.zst.raw"));
    }

    #[test]
    fn prefix_with_dash_roundtrips() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let mut name = VolumeName::generate("my-backup", VolumeType::Files, "zst", "raw", ts);
        name.guid = "00ff00ff00ff00ff00ff00ff00ff00ff".into();
        let parsed = VolumeName::parse(&name.to_string()).unwrap();
        assert_eq!(parsed.prefix, "my-backup");
        assert_eq!(parsed.guid, name.guid);
    }

    #[test]
    fn reject_malformed() {
        assert!(VolumeName::parse("garbage").is_err());
        assert!(VolumeName::parse("p-20260101T000000Z-abc.dwrong.zst.raw").is_err());
        assert!(VolumeName::parse("p-notatime-abc.dblock.zst.raw").is_err());
        assert!(VolumeName::parse("-20260101T000000Z-abc.dblock.zst.raw").is_err());
    }

    #[test]
    fn state_machine_legal_paths() {
        use VolumeState::*;
        assert!(Temporary.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Uploaded));
        assert!(Uploading.can_transition_to(Temporary));
        assert!(Uploaded.can_transition_to(Verified));
        assert!(Verified.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
        assert!(!Deleted.can_transition_to(Temporary));
        assert!(!Temporary.can_transition_to(Verified));
        assert!(!Uploaded.can_transition_to(Temporary));
    }
}
