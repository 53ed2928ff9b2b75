//! Retention: decide which filesets to drop, then cascade-delete them
//! through the catalog and delete their Files volumes remotely.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use tracing::{info, warn};

use crate::catalog::{Catalog, FilesetRow, RetentionCascade};
use crate::config::{Options, RetentionPolicy};
use crate::error::{CairnError, Result};
use crate::remote::RemoteManager;

/// Parse a duration string like "2d", "48h", "1w", "6m", "1y".
/// Pure numeric values are treated as days.
pub fn parse_duration(s: &str) -> Result<chrono::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CairnError::UserInformation("empty duration string".into()));
    }
    if let Ok(n) = s.parse::<i64>() {
        return Ok(chrono::Duration::days(n));
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| CairnError::UserInformation(format!("invalid duration: '{s}'")))?;
    let (num_str, suffix) = s.split_at(split);
    let n: i64 = num_str
        .parse()
        .map_err(|_| CairnError::UserInformation(format!("invalid duration number: '{num_str}'")))?;
    match suffix {
        "s" | "S" => Ok(chrono::Duration::seconds(n)),
        "h" | "H" => Ok(chrono::Duration::hours(n)),
        "d" | "D" => Ok(chrono::Duration::days(n)),
        "w" | "W" => Ok(chrono::Duration::weeks(n)),
        "m" | "M" => Ok(chrono::Duration::days(n * 30)),
        "y" | "Y" => Ok(chrono::Duration::days(n * 365)),
        _ => Err(CairnError::UserInformation(format!(
            "unknown duration suffix: '{suffix}'"
        ))),
    }
}

fn bucket_rule<K: Eq + std::hash::Hash>(
    ordered: &[&FilesetRow],
    kept: &mut HashSet<i64>,
    max_buckets: usize,
    key_fn: impl Fn(&DateTime<Utc>) -> K,
) {
    let mut seen: HashSet<K> = HashSet::new();
    let mut count = 0usize;
    for fileset in ordered {
        if count >= max_buckets {
            break;
        }
        let time = Utc
            .timestamp_opt(fileset.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now);
        if seen.insert(key_fn(&time)) {
            kept.insert(fileset.id);
            count += 1;
        }
    }
}

fn apply_policy(
    ordered: &[&FilesetRow],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    kept: &mut HashSet<i64>,
) -> Result<()> {
    if let Some(within) = &policy.keep_within {
        let cutoff = (now - parse_duration(within)?).timestamp();
        for fileset in ordered {
            if fileset.timestamp >= cutoff {
                kept.insert(fileset.id);
            }
        }
    }
    if let Some(n) = policy.keep_last {
        for fileset in ordered.iter().take(n) {
            kept.insert(fileset.id);
        }
    }
    if let Some(n) = policy.keep_hourly {
        bucket_rule(ordered, kept, n, |t| (t.year(), t.ordinal(), t.hour()));
    }
    if let Some(n) = policy.keep_daily {
        bucket_rule(ordered, kept, n, |t| (t.year(), t.ordinal()));
    }
    if let Some(n) = policy.keep_weekly {
        bucket_rule(ordered, kept, n, |t| {
            let week = t.iso_week();
            (week.year(), week.week())
        });
    }
    if let Some(n) = policy.keep_monthly {
        bucket_rule(ordered, kept, n, |t| (t.year(), t.month()));
    }
    if let Some(n) = policy.keep_yearly {
        bucket_rule(ordered, kept, n, |t| t.year());
    }
    Ok(())
}

/// Compute the fileset ids the configured rules no longer keep.
/// A fileset survives when any rule keeps it; with no rules configured
/// nothing is deleted.
pub fn filesets_to_delete(
    filesets: &[FilesetRow],
    options: &Options,
    now: DateTime<Utc>,
) -> Result<Vec<i64>> {
    if !options.has_retention() || filesets.is_empty() {
        return Ok(Vec::new());
    }
    // Newest first.
    let mut ordered: Vec<&FilesetRow> = filesets.iter().collect();
    ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut kept: HashSet<i64> = HashSet::new();

    if let Some(keep_time) = &options.keep_time {
        let cutoff = (now - parse_duration(keep_time)?).timestamp();
        for fileset in &ordered {
            if fileset.timestamp >= cutoff {
                kept.insert(fileset.id);
            }
        }
    }
    if let Some(n) = options.keep_versions {
        for fileset in ordered.iter().take(n) {
            kept.insert(fileset.id);
        }
    }
    if let Some(policy) = &options.retention_policy {
        apply_policy(&ordered, policy, now, &mut kept)?;
    }

    let doomed: Vec<i64> = ordered
        .iter()
        .filter(|f| !kept.contains(&f.id))
        .map(|f| f.id)
        .collect();

    if !doomed.is_empty() && doomed.len() == filesets.len() {
        return Err(CairnError::UserInformation(
            "refusing retention: the configured rules would remove every version".into(),
        ));
    }
    Ok(doomed)
}

#[derive(Debug, Default)]
pub struct DeleteStats {
    pub filesets_deleted: usize,
    pub cascade: RetentionCascade,
    pub volumes_deleted: usize,
}

/// Drop a specific set of filesets: catalog cascade, then remote deletion
/// of their Files volumes. Runs inside the caller's transaction.
pub fn delete_filesets(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    ids: &[i64],
    now: DateTime<Utc>,
    dryrun: bool,
) -> Result<DeleteStats> {
    let mut stats = DeleteStats::default();
    if ids.is_empty() {
        return Ok(stats);
    }

    // Capture the dlist volumes before the fileset rows disappear.
    let filesets: HashMap<i64, i64> = catalog
        .list_filesets()?
        .into_iter()
        .map(|f| (f.id, f.volume_id))
        .collect();
    let mut volume_ids = Vec::new();
    for id in ids {
        match filesets.get(id) {
            Some(volume_id) => volume_ids.push(*volume_id),
            None => {
                return Err(CairnError::UserInformation(format!(
                    "version {id} does not exist"
                )))
            }
        }
    }

    if dryrun {
        info!(count = ids.len(), "would delete filesets");
        return Ok(stats);
    }

    stats.cascade = catalog.delete_filesets(ids)?;
    stats.filesets_deleted = ids.len();

    for volume_id in volume_ids {
        match manager.delete_volume(catalog, volume_id, now) {
            Ok(()) => stats.volumes_deleted += 1,
            Err(e) => warn!(volume_id, "dlist deletion deferred: {e}"),
        }
    }
    info!(
        filesets = stats.filesets_deleted,
        blocks_waste = stats.cascade.blocks_marked_deleted,
        "retention delete complete"
    );
    Ok(stats)
}

/// Apply the configured retention rules (keep_time / keep_versions /
/// policy) and delete everything they no longer keep.
pub fn apply_retention(
    catalog: &Catalog,
    manager: &RemoteManager<'_>,
    options: &Options,
    now: DateTime<Utc>,
) -> Result<DeleteStats> {
    let filesets = catalog.list_filesets()?;
    let doomed = filesets_to_delete(&filesets, options, now)?;
    if doomed.is_empty() {
        return Ok(DeleteStats::default());
    }
    delete_filesets(catalog, manager, &doomed, now, options.dryrun)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fileset(id: i64, timestamp: i64) -> FilesetRow {
        FilesetRow {
            id,
            timestamp,
            volume_id: id + 100,
            is_full_backup: false,
            is_partial: false,
        }
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).single().unwrap()
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("2d").unwrap(), chrono::Duration::days(2));
        assert_eq!(parse_duration("48h").unwrap(), chrono::Duration::hours(48));
        assert_eq!(parse_duration("1w").unwrap(), chrono::Duration::weeks(1));
        assert_eq!(parse_duration("7").unwrap(), chrono::Duration::days(7));
        assert!(parse_duration("x2").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn no_rules_deletes_nothing() {
        let filesets = vec![fileset(1, 1000), fileset(2, 2000)];
        let doomed =
            filesets_to_delete(&filesets, &Options::default(), at(1_000_000)).unwrap();
        assert!(doomed.is_empty());
    }

    #[test]
    fn keep_versions_drops_oldest() {
        let filesets = vec![fileset(1, 1000), fileset(2, 2000), fileset(3, 3000)];
        let options = Options {
            keep_versions: Some(2),
            ..Options::default()
        };
        let doomed = filesets_to_delete(&filesets, &options, at(10_000)).unwrap();
        assert_eq!(doomed, vec![1]);
    }

    #[test]
    fn keep_time_drops_expired() {
        let day = 24 * 3600;
        let now = at(100 * day);
        let filesets = vec![
            fileset(1, 10 * day),
            fileset(2, 95 * day),
            fileset(3, 99 * day),
        ];
        let options = Options {
            keep_time: Some("7d".into()),
            ..Options::default()
        };
        let doomed = filesets_to_delete(&filesets, &options, now).unwrap();
        assert_eq!(doomed, vec![1]);
    }

    #[test]
    fn rules_union_keeps_by_any() {
        let day = 24 * 3600;
        let now = at(100 * day);
        let filesets = vec![
            fileset(1, 10 * day),
            fileset(2, 95 * day),
            fileset(3, 99 * day),
        ];
        // keep_time alone would drop 1, but keep_versions=3 saves it.
        let options = Options {
            keep_time: Some("7d".into()),
            keep_versions: Some(3),
            ..Options::default()
        };
        let doomed = filesets_to_delete(&filesets, &options, now).unwrap();
        assert!(doomed.is_empty());
    }

    #[test]
    fn refuses_to_delete_everything() {
        let filesets = vec![fileset(1, 1000), fileset(2, 2000)];
        let options = Options {
            keep_time: Some("1h".into()),
            ..Options::default()
        };
        let err = filesets_to_delete(&filesets, &options, at(10_000_000)).unwrap_err();
        assert!(matches!(err, CairnError::UserInformation(_)));
    }

    #[test]
    fn daily_buckets_keep_newest_per_day() {
        let day = 24 * 3600;
        let filesets = vec![
            fileset(1, 0),
            fileset(2, day / 2),   // same day as 1, newer
            fileset(3, day + 10),  // next day
            fileset(4, 3 * day),
        ];
        let options = Options {
            retention_policy: Some(RetentionPolicy {
                keep_daily: Some(2),
                ..RetentionPolicy::default()
            }),
            ..Options::default()
        };
        let doomed = filesets_to_delete(&filesets, &options, at(4 * day)).unwrap();
        // Keeps newest of the two newest days: 4 and 3. Drops 1 and 2.
        assert_eq!(doomed, vec![2, 1]);
    }
}
