//! Snapshot timestamp allocation.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::models::BlobId;

/// Hands out snapshot timestamps that never repeat for one blob.
///
/// Each identity remembers the last instant it issued. A new request returns
/// `now` when that is more than a second past the last issue, otherwise the
/// last issue plus one second. Entries that can no longer affect a result are
/// pruned, and `observe` seeds an identity from snapshots already stored.
#[derive(Default)]
pub struct SnapshotTimeAllocator {
    issued: DashMap<(String, String, String), DateTime<Utc>>,
}

fn key(blob: &BlobId) -> (String, String, String) {
    (
        blob.account.clone(),
        blob.container.clone(),
        blob.name.clone(),
    )
}

impl SnapshotTimeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next snapshot instant for `blob`.
    pub fn allocate(&self, blob: &BlobId, now: DateTime<Utc>) -> DateTime<Utc> {
        // Anything a second or more behind `now` would yield `now` anyway
        self.issued
            .retain(|_, last| now - *last <= Duration::seconds(1));

        let mut next = now;
        self.issued
            .entry(key(blob))
            .and_modify(|last| {
                if now - *last <= Duration::seconds(1) {
                    next = *last + Duration::seconds(1);
                }
                *last = next;
            })
            .or_insert(now);
        next
    }

    /// Records `time` as issued for `blob` unless a later instant already is.
    pub fn observe(&self, blob: &BlobId, time: DateTime<Utc>) {
        self.issued
            .entry(key(blob))
            .and_modify(|last| {
                if time > *last {
                    *last = time;
                }
            })
            .or_insert(time);
    }
}

/// Parses a snapshot stamp produced by `format_snapshot_time`.
pub fn parse_snapshot_time(stamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Renders a snapshot instant in the service's seven-digit fractional format.
pub fn format_snapshot_time(time: DateTime<Utc>) -> String {
    // chrono only renders 3, 6 or 9 fraction digits
    format!(
        "{}.{:07}Z",
        time.format("%Y-%m-%dT%H:%M:%S"),
        time.timestamp_subsec_nanos() / 100
    )
}
