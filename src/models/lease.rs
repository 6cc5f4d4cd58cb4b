//! Lease records embedded in containers and blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lease state for containers and blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LeaseState {
    #[default]
    Available,
    Leased,
    Expired,
    Breaking,
    Broken,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Available => "available",
            LeaseState::Leased => "leased",
            LeaseState::Expired => "expired",
            LeaseState::Breaking => "breaking",
            LeaseState::Broken => "broken",
        }
    }
}

/// Lease status for containers and blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LeaseStatus {
    #[default]
    Unlocked,
    Locked,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Unlocked => "unlocked",
            LeaseStatus::Locked => "locked",
        }
    }
}

/// Lease duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseDuration {
    Infinite,
    /// Fixed duration in seconds.
    Fixed(u32),
}

impl LeaseDuration {
    /// Interprets the wire value, where `-1` means infinite.
    pub fn from_secs(secs: i64) -> Option<Self> {
        match secs {
            -1 => Some(LeaseDuration::Infinite),
            15..=60 => Some(LeaseDuration::Fixed(secs as u32)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseDuration::Infinite => "infinite",
            LeaseDuration::Fixed(_) => "fixed",
        }
    }
}

/// Lease fields of a container or blob.
///
/// Only the last explicit transition is stored. Time-based transitions
/// (`Leased -> Expired`, `Breaking -> Broken`) are never written back; they are
/// derived by [`Lease::state`] each time the lease is inspected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Option<String>,
    /// State recorded by the last lease action.
    pub recorded_state: LeaseState,
    pub duration: Option<LeaseDuration>,
    /// Expiry of a fixed-duration lease.
    pub expires_on: Option<DateTime<Utc>>,
    /// Instant a breaking lease becomes broken.
    pub break_on: Option<DateTime<Utc>>,
    /// ETag of the blob when the lease was acquired (blobs only).
    pub etag: Option<String>,
}

impl Lease {
    /// Returns the effective lease state at `now`.
    pub fn state(&self, now: DateTime<Utc>) -> LeaseState {
        match self.recorded_state {
            LeaseState::Leased => match self.expires_on {
                Some(expiry) if expiry <= now => LeaseState::Expired,
                _ => LeaseState::Leased,
            },
            LeaseState::Breaking => match self.break_on {
                Some(at) if at <= now => LeaseState::Broken,
                _ => LeaseState::Breaking,
            },
            other => other,
        }
    }

    /// Returns the lease status at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> LeaseStatus {
        match self.state(now) {
            LeaseState::Leased | LeaseState::Breaking => LeaseStatus::Locked,
            _ => LeaseStatus::Unlocked,
        }
    }

    /// Returns the lease duration to report, if the lease is held at `now`.
    pub fn reported_duration(&self, now: DateTime<Utc>) -> Option<LeaseDuration> {
        match self.state(now) {
            LeaseState::Leased => self.duration,
            _ => None,
        }
    }

    /// Returns true if `lease_id` names the current lease.
    pub fn matches(&self, lease_id: &str) -> bool {
        self.lease_id.as_deref() == Some(lease_id)
    }
}
