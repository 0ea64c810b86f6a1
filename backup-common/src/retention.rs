//! Retention decisions for remote backups.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::naming::NameCodec;

/// Backups older than this many days are removed by the pruning pass.
pub const RETENTION_DAYS: i64 = 7;

pub fn retention_window() -> Duration {
    Duration::days(RETENTION_DAYS)
}

/// Return true if `candidate` is a backup owned by `owner_id` whose encoded
/// date, taken as UTC midnight, falls strictly before `now - window`.
///
/// Names that do not parse, or that belong to another owner, are never
/// expired. Jobs sharing a bucket therefore only ever prune their own files.
pub fn is_expired(
    codec: &NameCodec,
    owner_id: &str,
    candidate: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    let parsed = match codec.parse(candidate) {
        Ok(p) => p,
        Err(_) => return false,
    };
    if !parsed.is_owned_by(owner_id) {
        return false;
    }
    let Some(midnight) = parsed.date().and_then(|d| d.and_hms_opt(0, 0, 0)) else {
        return false;
    };
    Utc.from_utc_datetime(&midnight) < now - window
}
